//! Image preprocessing.
//!
//! The pipeline mirrors the usual torchvision recipe:
//! 1. Load image and convert to tensor (RGB, CHW format, values in [0, 1])
//! 2. Normalize using ImageNet mean and std
//! 3. Resize so both sides are divisible by the pyramid stride
//!
//! Counting networks are resolution-agnostic, so instead of a fixed square
//! resolution each image is resized to the nearest stride multiple of its
//! own size, preserving the aspect ratio as closely as possible.

use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::error::Result;

/// ImageNet normalization mean values (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Tensor statistics for debugging and validation
#[derive(Debug)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub sum: f32,
}

impl TensorStats {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?.to_dtype(candle_core::DType::F32)?;
        let data: Vec<f32> = flat.to_vec1()?;

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = data.iter().sum();
        let mean = sum / data.len() as f32;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            sum,
        })
    }

    pub fn print(&self, name: &str) {
        println!(
            "  {}: shape={:?}, min={:.6}, max={:.6}, mean={:.6}, sum={:.6}",
            name, self.shape, self.min, self.max, self.mean, self.sum
        );
    }
}

/// Load an image from disk.
pub fn load_image(path: &str) -> anyhow::Result<DynamicImage> {
    let img = image::open(path)?;
    Ok(img)
}

/// Convert a DynamicImage to a `[3, H, W]` tensor with values in [0, 1].
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let raw_data = img.into_raw();

    let h = height as usize;
    let w = width as usize;

    // Raw bytes are HWC ([R, G, B, R, G, B, ...] row by row); reorder to CHW.
    let mut chw_data = vec![0.0f32; 3 * h * w];
    for y in 0..h {
        for x in 0..w {
            let src_idx = (y * w + x) * 3;
            for c in 0..3 {
                chw_data[c * h * w + y * w + x] = raw_data[src_idx + c] as f32 / 255.0;
            }
        }
    }

    Ok(Tensor::from_vec(chw_data, (3, h, w), device)?)
}

/// Normalize a `[3, H, W]` tensor with the ImageNet mean and std.
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let (_, h, w) = tensor.dims3()?;

    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?.broadcast_as((3, h, w))?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?.broadcast_as((3, h, w))?;

    Ok(tensor.sub(&mean)?.div(&std)?)
}

/// Resize a `[3, H, W]` tensor with bilinear interpolation.
pub fn resize(tensor: &Tensor, target_size: (usize, usize)) -> Result<Tensor> {
    let (target_h, target_w) = target_size;
    let _ = tensor.dims3()?;
    let resized = tensor
        .unsqueeze(0)?
        .upsample_bilinear2d(target_h, target_w, false)?
        .squeeze(0)?;
    Ok(resized)
}

/// Round `size` to the nearest positive multiple of `stride`.
pub fn round_to_stride(size: usize, stride: usize) -> usize {
    let rounded = ((size + stride / 2) / stride) * stride;
    rounded.max(stride)
}

/// Full preprocessing pipeline: load, convert, normalize, and resize so both
/// sides are divisible by `stride`.
///
/// Returns the `[3, h, w]` tensor together with the original image size, so
/// callers can map annotation coordinates into the resized frame.
pub fn preprocess_image(
    image_path: &str,
    stride: usize,
    device: &Device,
) -> anyhow::Result<(Tensor, usize, usize)> {
    let img = load_image(image_path)?;
    let tensor = image_to_tensor(&img, device)?;
    let (_, h_orig, w_orig) = tensor.dims3()?;

    let normalized = normalize(&tensor)?;
    let target = (
        round_to_stride(h_orig, stride),
        round_to_stride(w_orig, stride),
    );
    let resized = if target == (h_orig, w_orig) {
        normalized
    } else {
        resize(&normalized, target)?
    };

    Ok((resized, h_orig, w_orig))
}

/// `[3, H, W]` -> `[1, 3, H, W]`
pub fn add_batch_dim(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn normalization_of_zeros() {
        // For input 0.0: (0.0 - 0.485) / 0.229 ≈ -2.1179 (R channel).
        let device = Device::Cpu;
        let input = Tensor::zeros((3, 2, 2), DType::F32, &device).unwrap();
        let normalized = normalize(&input).unwrap();
        let data: Vec<f32> = normalized.flatten_all().unwrap().to_vec1().unwrap();

        assert!((data[0] - (-2.1179)).abs() < 0.01);
        assert!((data[4] - (-2.0357)).abs() < 0.01);
        assert!((data[8] - (-1.8044)).abs() < 0.01);
    }

    #[test]
    fn normalization_of_midgray() {
        let device = Device::Cpu;
        let pixel_val = 128.0 / 255.0;
        let data = vec![pixel_val; 3 * 4 * 4];
        let input = Tensor::from_vec(data, (3, 4, 4), &device).unwrap();
        let norm_data: Vec<f32> = normalize(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        for c in 0..3 {
            let expected = (pixel_val - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            let got = norm_data[c * 16];
            assert!(
                (got - expected).abs() < 1e-5,
                "channel {c}: got {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn rounding_snaps_to_stride_multiples() {
        assert_eq!(round_to_stride(768, 32), 768);
        assert_eq!(round_to_stride(770, 32), 768);
        assert_eq!(round_to_stride(790, 32), 800);
        // Tiny images are pushed up to a single stride cell.
        assert_eq!(round_to_stride(5, 32), 32);
    }

    #[test]
    fn resize_changes_resolution_only() {
        let device = Device::Cpu;
        let input = Tensor::randn(0.0f32, 1.0, (3, 100, 100), &device).unwrap();
        let resized = resize(&input, (64, 96)).unwrap();
        assert_eq!(resized.dims(), &[3, 64, 96]);
    }

    #[test]
    fn batch_dim_is_prepended() {
        let device = Device::Cpu;
        let input = Tensor::zeros((3, 64, 64), DType::F32, &device).unwrap();
        let batched = add_batch_dim(&input).unwrap();
        assert_eq!(batched.dims(), &[1, 3, 64, 64]);
    }

    #[test]
    fn stats_match_known_values() {
        let device = Device::Cpu;
        let data = vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0];
        let input = Tensor::from_vec(data, (2, 3), &device).unwrap();
        let stats = TensorStats::from_tensor(&input).unwrap();

        assert_eq!(stats.shape, vec![2, 3]);
        assert!((stats.min - 0.0).abs() < 1e-6);
        assert!((stats.max - 5.0).abs() < 1e-6);
        assert!((stats.mean - 2.5).abs() < 1e-6);
        assert!((stats.sum - 15.0).abs() < 1e-6);
    }
}
