//! Patch-embedding stem.
//!
//! Converts a normalized image into the finest-scale feature map with a
//! single convolution whose kernel equals its stride, followed by a
//! channels-last layer norm. The stem is the only component that sees the
//! raw input, so it owns the divisibility check for the whole pyramid.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::config::CfNetConfig;
use crate::error::{CfNetError, Result};
use crate::model::norm::LayerNorm2d;

pub struct PatchEmbed {
    projection: Conv2d,
    norm: LayerNorm2d,
    patch_size: usize,
    /// Overall divisibility requirement (stem stride times the stage
    /// downsampling), checked before any tensor work happens.
    total_stride: usize,
}

impl PatchEmbed {
    pub fn new(vb: VarBuilder, config: &CfNetConfig) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let projection = candle_nn::conv2d(
            3,
            config.stages[0].dim,
            config.patch_size,
            conv_config,
            vb.pp("projection"),
        )?;
        let norm = LayerNorm2d::new(vb.pp("norm"), config.stages[0].dim, config.layer_norm_eps)?;
        Ok(Self {
            projection,
            norm,
            patch_size: config.patch_size,
            total_stride: config.total_stride(),
        })
    }

    /// `[B, 3, H, W]` -> `[B, C0, H / patch, W / patch]`
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let (_b, c, h, w) = images.dims4().map_err(|_| {
            CfNetError::shape(
                "stem",
                format!("expected a [B, 3, H, W] image batch, got {:?}", images.dims()),
            )
        })?;
        if c != 3 {
            return Err(CfNetError::shape(
                "stem",
                format!("expected 3 input channels, got {c}"),
            ));
        }
        if h % self.total_stride != 0 || w % self.total_stride != 0 {
            return Err(CfNetError::shape(
                "stem",
                format!(
                    "input size {h}x{w} is not divisible by the pyramid stride {}",
                    self.total_stride
                ),
            ));
        }
        let x = self.projection.forward(images)?;
        Ok(self.norm.forward(&x)?)
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }
}
