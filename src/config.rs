//! CF-Net model configuration.
//!
//! A configuration describes the stem stride, the per-scale pyramid stages,
//! and the fusion/head dimensions. The named variants (`tiny`, `small`,
//! `base`) are fixed hyperparameter sets that a checkpoint is tied to.

use crate::error::{CfNetError, Result};

/// Configuration for one pyramid stage.
///
/// Stage `s` consumes the feature map of stage `s - 1` (the stem output for
/// `s = 0`), halves the spatial resolution for `s > 0`, and runs `depth`
/// mixer blocks at `dim` channels.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Channel depth of this scale. Must strictly increase with the scale
    /// index.
    pub dim: usize,
    /// Number of mixer blocks.
    pub depth: usize,
    /// Attention heads per block. Must divide `dim`.
    pub num_heads: usize,
    /// Windows per spatial axis for the global-mixing attention; 1 means
    /// full attention over the whole map.
    pub attn_windows: usize,
}

/// Configuration for the full Compare-and-Focus network.
#[derive(Debug, Clone)]
pub struct CfNetConfig {
    /// Stem patch size; the stem convolution uses `kernel = stride = patch_size`.
    pub patch_size: usize,
    /// One entry per scale, finest first.
    pub stages: Vec<StageConfig>,
    /// Channel depth of the fused map produced by the fusion module.
    pub fusion_dim: usize,
    /// Hidden width of the density regression head.
    pub head_dim: usize,
    /// MLP expansion ratio inside mixer blocks.
    pub mlp_ratio: usize,
    /// Layer normalization epsilon.
    pub layer_norm_eps: f64,
    /// Upsample the density map back to input resolution. When false the
    /// map stays at the canonical (stem-stride) resolution.
    pub upsample_to_input: bool,
}

impl Default for CfNetConfig {
    fn default() -> Self {
        Self::small()
    }
}

impl CfNetConfig {
    /// Minimal variant used by the test suite; trains in seconds on CPU.
    pub fn tiny() -> Self {
        Self {
            patch_size: 4,
            stages: vec![
                StageConfig { dim: 16, depth: 1, num_heads: 2, attn_windows: 4 },
                StageConfig { dim: 32, depth: 1, num_heads: 2, attn_windows: 2 },
                StageConfig { dim: 48, depth: 1, num_heads: 4, attn_windows: 1 },
                StageConfig { dim: 64, depth: 1, num_heads: 4, attn_windows: 1 },
            ],
            fusion_dim: 32,
            head_dim: 16,
            mlp_ratio: 2,
            layer_norm_eps: 1e-6,
            upsample_to_input: false,
        }
    }

    pub fn small() -> Self {
        Self {
            patch_size: 4,
            stages: vec![
                StageConfig { dim: 64, depth: 2, num_heads: 2, attn_windows: 8 },
                StageConfig { dim: 128, depth: 2, num_heads: 4, attn_windows: 4 },
                StageConfig { dim: 256, depth: 4, num_heads: 8, attn_windows: 2 },
                StageConfig { dim: 512, depth: 2, num_heads: 16, attn_windows: 1 },
            ],
            fusion_dim: 128,
            head_dim: 64,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
            upsample_to_input: false,
        }
    }

    pub fn base() -> Self {
        Self {
            patch_size: 4,
            stages: vec![
                StageConfig { dim: 96, depth: 2, num_heads: 3, attn_windows: 8 },
                StageConfig { dim: 192, depth: 2, num_heads: 6, attn_windows: 4 },
                StageConfig { dim: 384, depth: 6, num_heads: 12, attn_windows: 2 },
                StageConfig { dim: 768, depth: 2, num_heads: 24, attn_windows: 1 },
            ],
            fusion_dim: 256,
            head_dim: 128,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
            upsample_to_input: false,
        }
    }

    /// Number of scales in the feature pyramid.
    pub fn num_scales(&self) -> usize {
        self.stages.len()
    }

    /// Overall downsampling factor from input resolution to the coarsest
    /// scale. Input height and width must be divisible by this.
    pub fn total_stride(&self) -> usize {
        self.patch_size << (self.num_scales().saturating_sub(1))
    }

    /// Downsampling factor of the density map relative to the input.
    pub fn density_stride(&self) -> usize {
        if self.upsample_to_input {
            1
        } else {
            self.patch_size
        }
    }

    /// Check the structural invariants that cannot be expressed in the type.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(CfNetError::Configuration("patch_size must be > 0".into()));
        }
        if self.stages.is_empty() {
            return Err(CfNetError::Configuration(
                "at least one pyramid stage is required".into(),
            ));
        }
        let mut prev_dim = 0;
        for (s, stage) in self.stages.iter().enumerate() {
            if stage.dim <= prev_dim {
                return Err(CfNetError::Configuration(format!(
                    "stage {s}: channel depth {} does not strictly increase (previous {})",
                    stage.dim, prev_dim
                )));
            }
            if stage.depth == 0 {
                return Err(CfNetError::Configuration(format!(
                    "stage {s}: depth must be > 0"
                )));
            }
            if stage.num_heads == 0 || stage.dim % stage.num_heads != 0 {
                return Err(CfNetError::Configuration(format!(
                    "stage {s}: num_heads {} must divide dim {}",
                    stage.num_heads, stage.dim
                )));
            }
            if stage.attn_windows == 0 {
                return Err(CfNetError::Configuration(format!(
                    "stage {s}: attn_windows must be > 0"
                )));
            }
            prev_dim = stage.dim;
        }
        if self.fusion_dim == 0 || self.head_dim == 0 {
            return Err(CfNetError::Configuration(
                "fusion_dim and head_dim must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for cfg in [CfNetConfig::tiny(), CfNetConfig::small(), CfNetConfig::base()] {
            cfg.validate().unwrap();
            assert_eq!(cfg.num_scales(), 4);
            assert_eq!(cfg.total_stride(), 32);
        }
    }

    #[test]
    fn non_increasing_dims_rejected() {
        let mut cfg = CfNetConfig::tiny();
        cfg.stages[2].dim = cfg.stages[1].dim;
        match cfg.validate() {
            Err(CfNetError::Configuration(_)) => {}
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn heads_must_divide_dim() {
        let mut cfg = CfNetConfig::tiny();
        cfg.stages[0].num_heads = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn single_scale_is_valid() {
        let mut cfg = CfNetConfig::tiny();
        cfg.stages.truncate(1);
        cfg.validate().unwrap();
        assert_eq!(cfg.total_stride(), cfg.patch_size);
    }
}
