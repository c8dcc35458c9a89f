pub mod fusion;
pub mod head;
pub mod norm;
pub mod stage;
pub mod stem;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::CfNetConfig;
use crate::error::Result;
use crate::model::fusion::CompareAndFocus;
use crate::model::head::DensityHead;
use crate::model::stage::Stage;
use crate::model::stem::PatchEmbed;

/// Compare-and-Focus multi-scale aggregation network.
///
/// Pipeline: stem -> pyramid stages (one feature map per scale) ->
/// cross-scale fusion -> density regression head. A forward pass owns all
/// intermediate maps; the only persistent state is the parameter set behind
/// the `VarBuilder`, which this type never mutates.
///
/// Parameter naming is stable for checkpointing: `stem.*`, `stages.{i}.*`,
/// `fusion.*`, `head.*` under the builder root.
pub struct CfNet {
    pub config: CfNetConfig,
    stem: PatchEmbed,
    stages: Vec<Stage>,
    fusion: CompareAndFocus,
    head: DensityHead,
}

impl CfNet {
    pub fn new(vb: VarBuilder, config: &CfNetConfig) -> Result<Self> {
        config.validate()?;
        let stem = PatchEmbed::new(vb.pp("stem"), config)?;
        let mut stages = Vec::with_capacity(config.num_scales());
        let mut prev_dim = config.stages[0].dim;
        for s in 0..config.num_scales() {
            let stage = Stage::new(vb.pp(format!("stages.{s}")), config, s, prev_dim)?;
            prev_dim = stage.dim();
            stages.push(stage);
        }
        let fusion = CompareAndFocus::new(vb.pp("fusion"), config)?;
        let head = DensityHead::new(vb.pp("head"), config)?;
        Ok(Self {
            config: config.clone(),
            stem,
            stages,
            fusion,
            head,
        })
    }

    /// Run the full forward pass: `[B, 3, H, W]` image batch to a
    /// non-negative `[B, 1, h, w]` density map.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_weights(images)?.0)
    }

    /// As [`forward`](Self::forward), also returning the fusion module's
    /// per-location scale weights for inspection.
    pub fn forward_with_weights(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut x = self.stem.forward(images)?;
        let mut scale_set = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            x = stage.forward(&x)?;
            scale_set.push(x.clone());
        }
        let (fused, weights) = self.fusion.forward_with_weights(&scale_set)?;
        let density = self.head.forward(&fused)?;
        Ok((density, weights))
    }

    /// Per-image head counts: the spatial integral of each density map.
    pub fn counts(density: &Tensor) -> Result<Vec<f32>> {
        let b = density.dim(0)?;
        let sums = density.reshape((b, ()))?.sum(1)?;
        Ok(sums.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

    use crate::loss::{DensityLoss, KernelPolicy, LossConfig};

    fn tiny_model(device: &Device) -> (CfNet, VarMap) {
        let config = CfNetConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (CfNet::new(vb, &config).unwrap(), varmap)
    }

    #[test]
    fn density_map_is_non_negative_for_random_images() {
        let device = Device::Cpu;
        let (model, _varmap) = tiny_model(&device);
        for seed in 0..3u8 {
            let images =
                Tensor::randn(seed as f32 * 0.1, 1.0, (1, 3, 64, 64), &device).unwrap();
            let density = model.forward(&images).unwrap();
            assert_eq!(density.dims(), &[1, 1, 16, 16]);
            let min = density
                .flatten_all()
                .unwrap()
                .min(0)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(min >= 0.0);
        }
    }

    #[test]
    fn batched_and_individual_forward_agree() {
        let device = Device::Cpu;
        let (model, _varmap) = tiny_model(&device);

        let a = Tensor::randn(0.0f32, 1.0, (1, 3, 64, 64), &device).unwrap();
        let b = Tensor::randn(0.5f32, 1.0, (1, 3, 64, 64), &device).unwrap();
        let batch = Tensor::cat(&[&a, &b], 0).unwrap();

        let da = model.forward(&a).unwrap();
        let db = model.forward(&b).unwrap();
        let dbatch = model.forward(&batch).unwrap();

        let sep = Tensor::cat(&[&da, &db], 0).unwrap();
        let diff = (dbatch - sep)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "cross-image leakage: max deviation {diff}");
    }

    #[test]
    fn training_steps_reduce_count_error_on_single_point() {
        let device = Device::Cpu;
        let config = CfNetConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CfNet::new(vb, &config).unwrap();

        // 256x256 synthetic image with a single annotated head at the center.
        let images = Tensor::randn(0.0f32, 0.3, (1, 3, 256, 256), &device).unwrap();
        let annotations = vec![vec![(128.0f32, 128.0f32)]];
        let loss_fn = DensityLoss::new(
            LossConfig {
                kernel: KernelPolicy::Gaussian { sigma: 2.0 },
                count_weight: 1.0,
                ot: None,
            },
            config.density_stride(),
        );

        let density = model.forward(&images).unwrap();
        let untrained_err = (CfNet::counts(&density).unwrap()[0] - 1.0).abs();

        let params = ParamsAdamW {
            lr: 1e-3,
            ..Default::default()
        };
        let mut opt = AdamW::new(varmap.all_vars(), params).unwrap();
        for _ in 0..5 {
            let density = model.forward(&images).unwrap();
            let loss = loss_fn.forward(&density, &annotations).unwrap();
            opt.backward_step(&loss).unwrap();
        }

        let density = model.forward(&images).unwrap();
        let trained_err = (CfNet::counts(&density).unwrap()[0] - 1.0).abs();
        assert!(
            trained_err < untrained_err,
            "count error did not improve: {untrained_err} -> {trained_err}"
        );
    }

    #[test]
    fn all_black_image_with_zero_annotations() {
        let device = Device::Cpu;
        let (model, _varmap) = tiny_model(&device);
        let images = Tensor::zeros((1, 3, 64, 64), DType::F32, &device).unwrap();
        let annotations: Vec<Vec<(f32, f32)>> = vec![vec![]];

        let loss_fn = DensityLoss::new(
            LossConfig {
                kernel: KernelPolicy::Impulse,
                count_weight: 0.0,
                ot: None,
            },
            model.config.density_stride(),
        );

        let density = model.forward(&images).unwrap();
        let loss = loss_fn
            .forward(&density, &annotations)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        // Zero target: the loss is exactly the mean squared prediction.
        let expected = density
            .sqr()
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn stem_shape_error_propagates_through_forward() {
        let device = Device::Cpu;
        let (model, _varmap) = tiny_model(&device);
        let images = Tensor::zeros((1, 3, 50, 50), DType::F32, &device).unwrap();
        assert!(matches!(
            model.forward(&images),
            Err(crate::error::CfNetError::Shape { .. })
        ));
    }
}
