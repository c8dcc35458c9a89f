//! Density-map loss against sparse point annotations.
//!
//! Point annotations are rasterized into a target density map whose total
//! mass equals the number of points exactly, at any target resolution. The
//! training loss is a pixel-wise MSE between predicted and target maps plus
//! a count-consistency term, with an optional entropic optimal-transport
//! term (see [`crate::ot`]).
//!
//! The rasterization kernel is a configurable policy: a unit impulse into
//! the containing cell, or a truncated Gaussian renormalized to unit mass.
//! The kernel shapes the loss landscape but never the mass invariant.

use candle_core::{Device, Tensor};

use crate::error::{CfNetError, Result};
use crate::ot::{cost_matrix, ot_loss, OtConfig};

/// How a single annotated point is turned into target density mass.
#[derive(Debug, Clone, Copy)]
pub enum KernelPolicy {
    /// Unit mass into the cell containing the point.
    Impulse,
    /// Truncated Gaussian splat, renormalized to unit mass. `sigma` is in
    /// density-grid cells.
    Gaussian { sigma: f32 },
}

#[derive(Debug, Clone)]
pub struct LossConfig {
    pub kernel: KernelPolicy,
    /// Weight of the `|sum(pred) - sum(target)| / (N + 1)` term.
    pub count_weight: f64,
    /// Optional entropic OT term; `None` disables it.
    pub ot: Option<OtConfig>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kernel: KernelPolicy::Gaussian { sigma: 2.0 },
            count_weight: 1.0,
            ot: None,
        }
    }
}

/// Rasterize one image's point annotations (input pixel coordinates) into a
/// `[map_h, map_w]` density grid at `stride` input pixels per cell.
///
/// The returned grid sums to `points.len()` within floating-point tolerance
/// regardless of resolution or kernel. Points outside the image are clamped
/// to the border cell rather than dropped, so no mass is ever lost.
pub fn rasterize_points(
    points: &[(f32, f32)],
    map_h: usize,
    map_w: usize,
    stride: usize,
    kernel: &KernelPolicy,
    device: &Device,
) -> Result<Tensor> {
    let mut grid = vec![0.0f32; map_h * map_w];
    for &(x, y) in points {
        let gx = x / stride as f32;
        let gy = y / stride as f32;
        match kernel {
            KernelPolicy::Impulse => {
                splat_impulse(&mut grid, map_h, map_w, gx, gy);
            }
            KernelPolicy::Gaussian { sigma } => {
                splat_gaussian(&mut grid, map_h, map_w, gx, gy, *sigma);
            }
        }
    }
    Ok(Tensor::from_vec(grid, (map_h, map_w), device)?)
}

fn splat_impulse(grid: &mut [f32], map_h: usize, map_w: usize, gx: f32, gy: f32) {
    let ix = (gx.floor() as i64).clamp(0, map_w as i64 - 1) as usize;
    let iy = (gy.floor() as i64).clamp(0, map_h as i64 - 1) as usize;
    grid[iy * map_w + ix] += 1.0;
}

fn splat_gaussian(grid: &mut [f32], map_h: usize, map_w: usize, gx: f32, gy: f32, sigma: f32) {
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let cy = gy.floor() as i64;
    let cx = gx.floor() as i64;

    // First pass: window weights and their in-bounds sum, so the final
    // splat can be renormalized to exactly unit mass.
    let mut cells = Vec::new();
    let mut wsum = 0.0f64;
    for iy in (cy - radius)..=(cy + radius) {
        if iy < 0 || iy >= map_h as i64 {
            continue;
        }
        for ix in (cx - radius)..=(cx + radius) {
            if ix < 0 || ix >= map_w as i64 {
                continue;
            }
            let dy = iy as f32 + 0.5 - gy;
            let dx = ix as f32 + 0.5 - gx;
            let w = (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp() as f64;
            cells.push((iy as usize * map_w + ix as usize, w));
            wsum += w;
        }
    }
    if wsum <= f64::MIN_POSITIVE {
        // Window entirely outside or numerically vanished; keep the mass.
        splat_impulse(grid, map_h, map_w, gx, gy);
        return;
    }
    for (idx, w) in cells {
        grid[idx] += (w / wsum) as f32;
    }
}

/// Training loss over a batch of density maps and their annotations.
pub struct DensityLoss {
    config: LossConfig,
    /// Input pixels per density-map cell.
    stride: usize,
}

impl DensityLoss {
    pub fn new(config: LossConfig, stride: usize) -> Self {
        Self { config, stride }
    }

    /// Build the `[B, 1, map_h, map_w]` target batch for `annotations`.
    pub fn target_maps(
        &self,
        map_h: usize,
        map_w: usize,
        annotations: &[Vec<(f32, f32)>],
        device: &Device,
    ) -> Result<Tensor> {
        let mut targets = Vec::with_capacity(annotations.len());
        for points in annotations {
            let t = rasterize_points(points, map_h, map_w, self.stride, &self.config.kernel, device)?;
            targets.push(t.unsqueeze(0)?);
        }
        Ok(Tensor::stack(&targets.iter().collect::<Vec<_>>(), 0)?)
    }

    /// Scalar loss for a predicted `[B, 1, h, w]` density batch.
    pub fn forward(&self, pred: &Tensor, annotations: &[Vec<(f32, f32)>]) -> Result<Tensor> {
        let (b, c, h, w) = pred.dims4()?;
        if c != 1 {
            return Err(CfNetError::shape(
                "loss",
                format!("expected single-channel density maps, got {c} channels"),
            ));
        }
        if b != annotations.len() {
            return Err(CfNetError::Configuration(format!(
                "batch of {b} density maps but {} annotation sets",
                annotations.len()
            )));
        }
        let device = pred.device();
        let target = self.target_maps(h, w, annotations, device)?;

        let mut loss = candle_nn::loss::mse(pred, &target)?;

        if self.config.count_weight > 0.0 {
            let pred_counts = pred.reshape((b, ()))?.sum(1)?;
            let target_counts = target.reshape((b, ()))?.sum(1)?;
            let count_term = (pred_counts - &target_counts)?
                .abs()?
                .div(&(target_counts + 1.0)?)?
                .mean_all()?;
            loss = (loss + (count_term * self.config.count_weight)?)?;
        }

        if let Some(ot) = &self.config.ot {
            let cost = cost_matrix(h, w, device)?;
            let mut ot_sum: Option<Tensor> = None;
            for (i, points) in annotations.iter().enumerate() {
                if points.is_empty() {
                    // No target distribution to transport against.
                    continue;
                }
                let p = pred.narrow(0, i, 1)?.reshape((h, w))?;
                let t = target.narrow(0, i, 1)?.reshape((h, w))?;
                let term = ot_loss(&p, &t, &cost, ot)?;
                ot_sum = Some(match ot_sum {
                    Some(acc) => (acc + term)?,
                    None => term,
                });
            }
            if let Some(acc) = ot_sum {
                loss = (loss + (acc * (ot.weight / b as f64))?)?;
            }
        }

        Ok(loss)
    }
}
