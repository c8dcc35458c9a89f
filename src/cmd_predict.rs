//! Predict subcommand: density map and head count for a single image.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use image::RgbImage;

use crate::checkpoint;
use crate::config::CfNetConfig;
use crate::model::CfNet;
use crate::preprocess;
use crate::Which;

/// Arguments for the predict subcommand
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Input image to process.
    pub image: String,

    /// Output path for the density heatmap; defaults to `<image>.density.png`.
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Blend factor of the heatmap over the input image, in [0, 1].
    #[arg(long, default_value_t = 0.55)]
    pub alpha: f32,
}

/// Build a model and fill its parameters from a checkpoint.
pub fn load_model(
    model_path: &Path,
    config: &CfNetConfig,
    device: &Device,
) -> anyhow::Result<CfNet> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = CfNet::new(vb, config)?;
    let report = checkpoint::load_partial(&varmap, model_path, device)?;
    println!(
        "  Loaded {} tensors ({} missing, {} unexpected)",
        report.loaded.len(),
        report.missing.len(),
        report.unexpected.len()
    );
    Ok(model)
}

/// Run inference on a single image.
///
/// Returns the density map `[1, 1, h, w]`, the per-scale blending weights
/// `[1, S, h', w']`, and the predicted count.
pub fn predict_image(
    model: &CfNet,
    image_path: &str,
    config: &CfNetConfig,
    device: &Device,
) -> anyhow::Result<(Tensor, Tensor, f32)> {
    println!("Preprocessing image...");
    let (preprocessed, h_orig, w_orig) =
        preprocess::preprocess_image(image_path, config.total_stride(), device)?;
    let batch = preprocess::add_batch_dim(&preprocessed)?;
    println!("  Batch tensor shape: {:?}", batch.dims());
    println!("  Original image size: {}x{}", w_orig, h_orig);

    println!("Running model inference...");
    let (density, weights) = model.forward_with_weights(&batch)?;
    let count = CfNet::counts(&density)?[0];
    Ok((density, weights, count))
}

/// Map a normalized density value to a hot-colormap pixel.
fn colorize(v: f32) -> [u8; 3] {
    let ramp = |x: f32| (x.clamp(0.0, 1.0) * 255.0) as u8;
    [ramp(3.0 * v), ramp(3.0 * v - 1.0), ramp(3.0 * v - 2.0)]
}

/// Render the density map as a heatmap blended over the original image.
fn render_heatmap(
    image_path: &str,
    density: &Tensor,
    alpha: f32,
) -> anyhow::Result<image::DynamicImage> {
    let img = image::ImageReader::open(image_path)?.decode()?.to_rgb8();
    let (img_w, img_h) = img.dimensions();

    let map = density.squeeze(0)?.squeeze(0)?;
    let (map_h, map_w) = map.dims2()?;
    let values: Vec<f32> = map.flatten_all()?.to_vec1()?;
    let peak = values.iter().cloned().fold(0.0f32, f32::max).max(1e-8);

    let mut heat = RgbImage::new(map_w as u32, map_h as u32);
    for (i, &v) in values.iter().enumerate() {
        let [r, g, b] = colorize(v / peak);
        heat.put_pixel((i % map_w) as u32, (i / map_w) as u32, image::Rgb([r, g, b]));
    }
    let heat = image::imageops::resize(&heat, img_w, img_h, image::imageops::FilterType::Triangle);

    let alpha = alpha.clamp(0.0, 1.0);
    let mut blended = RgbImage::new(img_w, img_h);
    for (x, y, pixel) in blended.enumerate_pixels_mut() {
        let base = img.get_pixel(x, y);
        let overlay = heat.get_pixel(x, y);
        for c in 0..3 {
            pixel.0[c] =
                ((1.0 - alpha) * base.0[c] as f32 + alpha * overlay.0[c] as f32) as u8;
        }
    }
    Ok(image::DynamicImage::ImageRgb8(blended))
}

/// Run the predict subcommand
pub fn run(
    args: &PredictArgs,
    which: Which,
    model_path: PathBuf,
    device: &Device,
) -> anyhow::Result<()> {
    let config = which.config();
    println!("Model config: {:?}", which);
    println!("  Patch size: {}", config.patch_size);
    println!("  Scales: {}", config.num_scales());
    println!("  Fusion dim: {}", config.fusion_dim);

    println!("Loading model from: {:?}", model_path);
    let start = Instant::now();
    let model = load_model(&model_path, &config, device)?;
    println!("Model loaded in {:?}", start.elapsed());

    let start = Instant::now();
    let (density, weights, count) = predict_image(&model, &args.image, &config, device)?;
    println!("Inference completed in {:?}", start.elapsed());

    println!("\nPredicted count: {:.1}", count);

    // Mean blending weight per scale, a quick read on which resolutions
    // the fusion trusted for this image.
    let num_scales = weights.dim(1)?;
    let scale_means: Vec<f32> = weights
        .reshape((num_scales, ()))?
        .mean(1)?
        .to_vec1::<f32>()?;
    for (s, m) in scale_means.iter().enumerate() {
        println!("  Scale {} mean weight: {:.3}", s, m);
    }

    let output_path = match &args.output {
        Some(path) => path.clone(),
        None => {
            let mut path = PathBuf::from(&args.image);
            path.set_extension("density.png");
            path
        }
    };
    let heatmap = render_heatmap(&args.image, &density, args.alpha)?;
    heatmap.save(&output_path)?;
    println!("Density heatmap saved to: {:?}", output_path);

    Ok(())
}
