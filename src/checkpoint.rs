//! Checkpoint save and partial load.
//!
//! Checkpoints are plain safetensors files keyed by the model's stable
//! parameter names (`stem.*`, `stages.{i}.*`, `fusion.*`, `head.*`).
//! Loading is tolerant of missing and unexpected keys so a backbone-only
//! checkpoint can seed a full model, but a key that exists on both sides
//! with a different shape is an error. Validation runs before any parameter
//! is touched, so a failed load leaves the model exactly as it was.

use std::path::Path;

use candle_core::Device;
use candle_nn::VarMap;

use crate::error::{CfNetError, Result};

/// What a partial load actually did.
#[derive(Debug)]
pub struct LoadReport {
    /// Parameters overwritten from the checkpoint.
    pub loaded: Vec<String>,
    /// Model parameters with no counterpart in the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint tensors with no counterpart in the model.
    pub unexpected: Vec<String>,
}

/// Write every parameter of `varmap` to a safetensors file.
pub fn save<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<()> {
    varmap.save(path)?;
    Ok(())
}

/// Load the overlap between a checkpoint and `varmap`.
///
/// All shape checks happen before the first write; on a shape mismatch the
/// varmap is returned unmodified and the offending key is reported in the
/// error.
pub fn load_partial<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    device: &Device,
) -> Result<LoadReport> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().unwrap();

    let mut loaded = Vec::new();
    let mut unexpected = Vec::new();
    for (key, tensor) in &tensors {
        match data.get(key) {
            Some(var) => {
                if var.dims() != tensor.dims() {
                    return Err(CfNetError::Load {
                        key: key.clone(),
                        expected: var.dims().to_vec(),
                        got: tensor.dims().to_vec(),
                    });
                }
                loaded.push(key.clone());
            }
            None => unexpected.push(key.clone()),
        }
    }

    let mut missing: Vec<String> = data
        .keys()
        .filter(|k| !tensors.contains_key(*k))
        .cloned()
        .collect();

    for key in &loaded {
        // Shapes were validated above; set can still fail on dtype.
        data[key].set(&tensors[key])?;
    }

    loaded.sort();
    missing.sort();
    unexpected.sort();
    Ok(LoadReport {
        loaded,
        missing,
        unexpected,
    })
}
