//! Compare-and-Focus fusion.
//!
//! Every scale of the pyramid is projected to a common channel depth and
//! resampled to the finest-scale resolution. A learned score head then rates
//! each scale at every spatial location; the scores are softmax-normalized
//! across the scale axis and used as blending weights. Locations where one
//! scale clearly dominates draw almost all of their signal from it, while
//! ambiguous locations receive a blend. Equal scores split the contribution
//! evenly and a single-scale pyramid gets a constant weight of 1, both by
//! construction of the softmax.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::config::CfNetConfig;
use crate::error::{CfNetError, Result};
use crate::model::norm::LayerNorm2d;

pub struct CompareAndFocus {
    /// 1x1 projection per scale to the fused channel depth.
    proj: Vec<Conv2d>,
    /// 1x1 comparison-score head per scale.
    score: Vec<Conv2d>,
    /// 3x3 refinement of the blended map.
    refine: Conv2d,
    norm: LayerNorm2d,
    num_scales: usize,
}

impl CompareAndFocus {
    pub fn new(vb: VarBuilder, config: &CfNetConfig) -> Result<Self> {
        let mut proj = Vec::with_capacity(config.num_scales());
        let mut score = Vec::with_capacity(config.num_scales());
        for (s, stage) in config.stages.iter().enumerate() {
            proj.push(candle_nn::conv2d(
                stage.dim,
                config.fusion_dim,
                1,
                Conv2dConfig::default(),
                vb.pp(format!("proj.{s}")),
            )?);
            score.push(candle_nn::conv2d(
                config.fusion_dim,
                1,
                1,
                Conv2dConfig::default(),
                vb.pp(format!("score.{s}")),
            )?);
        }
        let refine_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let refine = candle_nn::conv2d(
            config.fusion_dim,
            config.fusion_dim,
            3,
            refine_config,
            vb.pp("refine"),
        )?;
        let norm = LayerNorm2d::new(vb.pp("norm"), config.fusion_dim, config.layer_norm_eps)?;
        Ok(Self {
            proj,
            score,
            refine,
            norm,
            num_scales: config.num_scales(),
        })
    }

    /// Fuse the scale set into one map at the finest-scale resolution.
    pub fn forward(&self, scales: &[Tensor]) -> Result<Tensor> {
        Ok(self.forward_with_weights(scales)?.0)
    }

    /// As [`forward`](Self::forward), additionally returning the per-scale
    /// blending weights `[B, S, H, W]` (softmax-normalized, so they sum to 1
    /// at every location).
    pub fn forward_with_weights(&self, scales: &[Tensor]) -> Result<(Tensor, Tensor)> {
        if scales.len() != self.num_scales {
            return Err(CfNetError::Configuration(format!(
                "fusion configured for {} scales but received {}",
                self.num_scales,
                scales.len()
            )));
        }
        let (_b, _c, h0, w0) = scales[0].dims4()?;

        let mut projected = Vec::with_capacity(self.num_scales);
        let mut score_maps = Vec::with_capacity(self.num_scales);
        for (s, feat) in scales.iter().enumerate() {
            let p = self.proj[s].forward(feat)?;
            // Deterministic resample to the canonical (scale-0) resolution.
            let p = if p.dim(2)? == h0 && p.dim(3)? == w0 {
                p
            } else {
                p.upsample_bilinear2d(h0, w0, false)?
            };
            score_maps.push(self.score[s].forward(&p)?.squeeze(1)?);
            projected.push(p);
        }

        // [B, S, H, W] comparison scores, normalized over the scale axis.
        let scores = Tensor::stack(&score_maps.iter().collect::<Vec<_>>(), 1)?;
        let weights = candle_nn::ops::softmax(&scores, 1)?;

        // [B, S, C, H, W] x [B, S, 1, H, W] -> sum over S -> [B, C, H, W]
        let stacked = Tensor::stack(&projected.iter().collect::<Vec<_>>(), 1)?;
        let fused = stacked.broadcast_mul(&weights.unsqueeze(2)?)?.sum(1)?;

        let fused = self.refine.forward(&fused)?;
        let fused = self.norm.forward(&fused)?;
        Ok((fused, weights))
    }
}
