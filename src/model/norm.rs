//! Channels-last layer normalization applied to NCHW feature maps.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// 2D layer normalization over the channel dimension of a `[B, C, H, W]`
/// tensor. The map is permuted to channels-last, normalized over the last
/// axis, scaled/shifted, and permuted back.
#[derive(Debug)]
pub struct LayerNorm2d {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm2d {
    pub fn new(vb: VarBuilder, channels: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.permute((0, 2, 3, 1))?;

        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;

        let scaled = normed.broadcast_mul(&self.weight)?;
        let shifted = scaled.broadcast_add(&self.bias)?;

        shifted.permute((0, 3, 1, 2))?.contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn normalizes_channel_axis() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ln = LayerNorm2d::new(vb, 8, 1e-6).unwrap();

        let x = Tensor::randn(0.0f32, 3.0, (2, 8, 4, 4), &device).unwrap();
        let y = ln.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 8, 4, 4]);

        // With unit weight and zero bias each channel vector has ~zero mean.
        let worst = y
            .mean(1)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(worst < 1e-4, "per-location channel mean too large: {worst}");
    }
}
