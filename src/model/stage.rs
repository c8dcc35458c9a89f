//! Pyramid backbone stages.
//!
//! A stage halves the spatial resolution (except stage 0, which consumes the
//! stem output directly) and runs a sequence of mixer blocks at a fixed
//! channel depth. Each block combines local token mixing (depthwise
//! convolution), long-range token mixing (windowed multi-head
//! self-attention), and a pointwise MLP, all pre-norm residual. Local mixing
//! picks up texture cues in dense regions; the attention path ties together
//! layout cues across the map, which matters for sparse crowds.
//!
//! Stages are strictly sequential: stage `s + 1` sees only the output of
//! stage `s`. Cross-scale connections live in the fusion module.

use candle_core::{IndexOp, Module, Tensor, D};
use candle_nn::{layer_norm, LayerNorm, Linear, VarBuilder};

use crate::config::{CfNetConfig, StageConfig};
use crate::error::{CfNetError, Result};

/// Partition `[B, C, H, W]` into `windows x windows` tiles and flatten each
/// tile to a token sequence: `[B * windows^2, tile_h * tile_w, C]`.
fn window_partition(x: &Tensor, windows: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if h % windows != 0 || w % windows != 0 {
        return Err(CfNetError::shape(
            "stage",
            format!("feature map {h}x{w} is not divisible into {windows}x{windows} attention windows"),
        ));
    }
    let (th, tw) = (h / windows, w / windows);
    // [B, C, nw, th, nw, tw] -> [B, nw, nw, th, tw, C]
    let x = x.reshape((b, c, windows, th, windows, tw))?;
    let x = x.permute((0, 2, 4, 3, 5, 1))?.contiguous()?;
    Ok(x.reshape((b * windows * windows, th * tw, c))?)
}

/// Inverse of [`window_partition`].
fn window_merge(tokens: &Tensor, windows: usize, h: usize, w: usize) -> Result<Tensor> {
    let (bw, _n, c) = tokens.dims3()?;
    let b = bw / (windows * windows);
    let (th, tw) = (h / windows, w / windows);
    let x = tokens.reshape((b, windows, windows, th, tw, c))?;
    // [B, nw, nw, th, tw, C] -> [B, C, nw, th, nw, tw]
    let x = x.permute((0, 5, 1, 3, 2, 4))?.contiguous()?;
    Ok(x.reshape((b, c, h, w))?)
}

/// Multi-head self-attention over a token sequence `[B', N, C]`.
#[derive(Debug)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(vb: VarBuilder, dim: usize, num_heads: usize) -> Result<Self> {
        let qkv = candle_nn::linear(dim, dim * 3, vb.pp("qkv"))?;
        let proj = candle_nn::linear(dim, dim, vb.pp("proj"))?;
        let scale = 1.0 / ((dim / num_heads) as f64).sqrt();
        Ok(Self {
            qkv,
            proj,
            num_heads,
            scale,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .transpose(1, 2)? // b,3,n,h,d
            .transpose(0, 1)? // 3,b,n,h,d
            .transpose(2, 3)?; // 3,b,h,n,d
        let q = (qkv.i(0)? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let attn = candle_nn::ops::softmax(&q.contiguous()?.matmul(&k.t()?)?, D::Minus1)?;
        let attn = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        Ok(self.proj.forward(&attn)?)
    }
}

/// Local token mixing: depthwise 3x3 convolution, channels-last layer norm,
/// pointwise projection, GELU, residual.
struct LocalMix {
    dwconv: candle_nn::Conv2d,
    norm: LayerNorm,
    pwconv: Linear,
}

impl LocalMix {
    fn new(vb: VarBuilder, dim: usize, eps: f64) -> Result<Self> {
        let conv_config = candle_nn::Conv2dConfig {
            padding: 1,
            groups: dim,
            ..Default::default()
        };
        let dwconv = candle_nn::conv2d(dim, dim, 3, conv_config, vb.pp("dwconv"))?;
        let norm = layer_norm(dim, eps, vb.pp("norm"))?;
        let pwconv = candle_nn::linear(dim, dim, vb.pp("pwconv"))?;
        Ok(Self { dwconv, norm, pwconv })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input = x.clone();
        let x = self.dwconv.forward(x)?;
        // (B, C, H, W) -> (B, H, W, C) for the norm and pointwise projection
        let x = x.permute((0, 2, 3, 1))?.contiguous()?;
        let x = self.norm.forward(&x)?;
        let x = self.pwconv.forward(&x)?;
        let x = x.gelu_erf()?;
        let x = x.permute((0, 3, 1, 2))?.contiguous()?;
        Ok((input + x)?)
    }
}

/// Long-range token mixing: pre-norm windowed self-attention with residual.
struct GlobalMix {
    norm: LayerNorm,
    attn: Attention,
    windows: usize,
}

impl GlobalMix {
    fn new(vb: VarBuilder, stage: &StageConfig, eps: f64) -> Result<Self> {
        let norm = layer_norm(stage.dim, eps, vb.pp("norm"))?;
        let attn = Attention::new(vb.pp("attn"), stage.dim, stage.num_heads)?;
        Ok(Self {
            norm,
            attn,
            windows: stage.attn_windows,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = x.dims4()?;
        let tokens = window_partition(x, self.windows)?;
        let attended = self.attn.forward(&self.norm.forward(&tokens)?)?;
        let tokens = (tokens + attended)?;
        window_merge(&tokens, self.windows, h, w)
    }
}

/// Pre-norm pointwise MLP with residual, applied channels-last.
struct Mlp {
    norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(vb: VarBuilder, dim: usize, ratio: usize, eps: f64) -> Result<Self> {
        let hidden = dim * ratio;
        let norm = layer_norm(dim, eps, vb.pp("norm"))?;
        let fc1 = candle_nn::linear(dim, hidden, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden, dim, vb.pp("fc2"))?;
        Ok(Self { norm, fc1, fc2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input = x.clone();
        let x = x.permute((0, 2, 3, 1))?.contiguous()?;
        let x = self.norm.forward(&x)?;
        let x = self.fc1.forward(&x)?;
        let x = x.gelu_erf()?;
        let x = self.fc2.forward(&x)?;
        let x = x.permute((0, 3, 1, 2))?.contiguous()?;
        Ok((input + x)?)
    }
}

struct MixerBlock {
    local: LocalMix,
    global: GlobalMix,
    mlp: Mlp,
}

impl MixerBlock {
    fn new(vb: VarBuilder, stage: &StageConfig, mlp_ratio: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            local: LocalMix::new(vb.pp("local"), stage.dim, eps)?,
            global: GlobalMix::new(vb.pp("global"), stage, eps)?,
            mlp: Mlp::new(vb.pp("mlp"), stage.dim, mlp_ratio, eps)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.local.forward(x)?;
        let x = self.global.forward(&x)?;
        self.mlp.forward(&x)
    }
}

/// One pyramid stage: optional 2x2 strided merge plus mixer blocks.
pub struct Stage {
    merge: Option<candle_nn::Conv2d>,
    blocks: Vec<MixerBlock>,
    dim: usize,
}

impl Stage {
    /// `scale` is the 0-based scale index; `prev_dim` the channel depth of
    /// the incoming map.
    pub fn new(vb: VarBuilder, config: &CfNetConfig, scale: usize, prev_dim: usize) -> Result<Self> {
        let stage_cfg = &config.stages[scale];
        let merge = if scale == 0 {
            None
        } else {
            let conv_config = candle_nn::Conv2dConfig {
                stride: 2,
                ..Default::default()
            };
            Some(candle_nn::conv2d(
                prev_dim,
                stage_cfg.dim,
                2,
                conv_config,
                vb.pp("merge"),
            )?)
        };
        let mut blocks = Vec::with_capacity(stage_cfg.depth);
        for i in 0..stage_cfg.depth {
            blocks.push(MixerBlock::new(
                vb.pp(format!("blocks.{i}")),
                stage_cfg,
                config.mlp_ratio,
                config.layer_norm_eps,
            )?);
        }
        Ok(Self {
            merge,
            blocks,
            dim: stage_cfg.dim,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = match &self.merge {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn window_round_trip() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (2, 6, 8, 8), &device).unwrap();
        let tokens = window_partition(&x, 2).unwrap();
        assert_eq!(tokens.dims(), &[8, 16, 6]);
        let back = window_merge(&tokens, 2, 8, 8).unwrap();
        let diff = (x - back)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn partition_rejects_indivisible_map() {
        let device = Device::Cpu;
        let x = Tensor::zeros((1, 4, 6, 6), DType::F32, &device).unwrap();
        assert!(matches!(
            window_partition(&x, 4),
            Err(CfNetError::Shape { .. })
        ));
    }

    #[test]
    fn stage_halves_resolution_and_widens_channels() {
        let device = Device::Cpu;
        let config = CfNetConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let stage = Stage::new(vb, &config, 1, config.stages[0].dim).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, config.stages[0].dim, 16, 16), &device).unwrap();
        let y = stage.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, config.stages[1].dim, 8, 8]);
    }

    #[test]
    fn stage_zero_keeps_resolution() {
        let device = Device::Cpu;
        let config = CfNetConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let stage = Stage::new(vb, &config, 0, config.stages[0].dim).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, config.stages[0].dim, 16, 16), &device).unwrap();
        let y = stage.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, config.stages[0].dim, 16, 16]);
    }
}
