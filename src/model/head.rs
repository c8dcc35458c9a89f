//! Density regression head.
//!
//! Reduces the fused map to a single-channel density map. The final ReLU
//! makes the output element-wise non-negative, which the integral-equals-
//! count interpretation requires. When configured, the map is resampled to
//! input resolution; the resample divides by the squared stride so the
//! spatial integral is preserved.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::config::CfNetConfig;
use crate::error::Result;

pub struct DensityHead {
    conv1: Conv2d,
    conv2: Conv2d,
    upsample_to_input: bool,
    stride: usize,
}

impl DensityHead {
    pub fn new(vb: VarBuilder, config: &CfNetConfig) -> Result<Self> {
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(
            config.fusion_dim,
            config.head_dim,
            3,
            conv_config,
            vb.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv2d(
            config.head_dim,
            1,
            1,
            Conv2dConfig::default(),
            vb.pp("conv2"),
        )?;
        Ok(Self {
            conv1,
            conv2,
            upsample_to_input: config.upsample_to_input,
            stride: config.patch_size,
        })
    }

    /// `[B, C_f, H, W]` -> `[B, 1, H, W]` (or `[B, 1, H * stride, W * stride]`).
    pub fn forward(&self, fused: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(fused)?.relu()?;
        let density = self.conv2.forward(&x)?.relu()?;
        if !self.upsample_to_input {
            return Ok(density);
        }
        let (_b, _c, h, w) = density.dims4()?;
        // Nearest-neighbor replication multiplies the integral by stride^2;
        // rescale so the count stays the same.
        let up = density.upsample_nearest2d(h * self.stride, w * self.stride)?;
        Ok(up.affine(1.0 / (self.stride * self.stride) as f64, 0.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn head(config: &CfNetConfig) -> DensityHead {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DensityHead::new(vb, config).unwrap()
    }

    #[test]
    fn output_is_non_negative() {
        let config = CfNetConfig::tiny();
        let h = head(&config);
        let fused = Tensor::randn(0.0f32, 5.0, (2, config.fusion_dim, 8, 8), &Device::Cpu).unwrap();
        let density = h.forward(&fused).unwrap();
        assert_eq!(density.dims(), &[2, 1, 8, 8]);

        let min = density
            .flatten_all()
            .unwrap()
            .min(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(min >= 0.0, "density map contains negative value {min}");
    }

    #[test]
    fn upsample_preserves_integral() {
        // Two heads sharing one VarMap have identical weights; only the
        // resample flag differs, so their integrals must agree.
        let mut config_up = CfNetConfig::tiny();
        config_up.upsample_to_input = true;
        let mut config_flat = config_up.clone();
        config_flat.upsample_to_input = false;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head_up = DensityHead::new(vb.clone(), &config_up).unwrap();
        let head_flat = DensityHead::new(vb, &config_flat).unwrap();

        let fused =
            Tensor::randn(0.0f32, 1.0, (1, config_up.fusion_dim, 8, 8), &Device::Cpu).unwrap();
        let fine = head_up.forward(&fused).unwrap();
        let coarse = head_flat.forward(&fused).unwrap();
        assert_eq!(fine.dims(), &[1, 1, 32, 32]);
        assert_eq!(coarse.dims(), &[1, 1, 8, 8]);

        let fine_sum = fine.sum_all().unwrap().to_scalar::<f32>().unwrap();
        let coarse_sum = coarse.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(
            (fine_sum - coarse_sum).abs() < 1e-3 * coarse_sum.abs().max(1.0),
            "integral changed under resampling: {fine_sum} vs {coarse_sum}"
        );
    }
}
