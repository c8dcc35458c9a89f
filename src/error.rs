//! Error taxonomy for the counting model.
//!
//! Three failure classes surface to callers: shape violations on input
//! tensors, structural mismatches between the configuration and what a
//! component receives, and incompatible checkpoint entries. Tensor-engine
//! errors pass through transparently. Degenerate inputs (zero annotations,
//! a single-scale pyramid) are handled by policy and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CfNetError {
    /// Input tensor dimensions violate a component's divisibility or size
    /// contract. Aborts the current forward call.
    #[error("shape error in {component}: {message}")]
    Shape { component: String, message: String },

    /// Structural mismatch between configured hyperparameters and actual
    /// inputs. Raised at construction or on the first forward call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Checkpoint entry is present but incompatible with the current
    /// architecture. Raised at load time, before any parameter is mutated.
    #[error("checkpoint load error for '{key}': expected shape {expected:?}, got {got:?}")]
    Load {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl CfNetError {
    pub fn shape(component: &str, message: impl Into<String>) -> Self {
        Self::Shape {
            component: component.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CfNetError>;
