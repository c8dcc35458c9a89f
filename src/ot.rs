//! Entropic optimal transport between density maps.
//!
//! Sinkhorn-Knopp iteration over a squared-Euclidean cost between density
//! grid cells. The scaling vectors are guarded with a small epsilon, rolled
//! back on numerical blow-up, and the marginal error is only evaluated every
//! few iterations. The loss term contracts the dual potential of the
//! (detached) predicted marginal with the live normalized prediction, so
//! gradients flow through the prediction alone.

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Numerical floor used throughout the Sinkhorn iteration.
const M_EPS: f64 = 1e-16;

/// How often (in iterations) the marginal error is evaluated.
const EVAL_FREQ: usize = 10;

#[derive(Debug, Clone)]
pub struct OtConfig {
    /// Weight of the OT term in the total loss.
    pub weight: f64,
    /// Entropic regularization strength.
    pub reg: f64,
    /// Iteration cap.
    pub max_iter: usize,
    /// Convergence threshold on the squared marginal error.
    pub stop_thr: f32,
}

impl Default for OtConfig {
    fn default() -> Self {
        Self {
            weight: 0.1,
            reg: 0.1,
            max_iter: 100,
            stop_thr: 1e-9,
        }
    }
}

/// Output of [`sinkhorn_knopp`].
pub struct SinkhornOutput {
    /// Transport plan `[na, nb]`; its row sums approximate `a` and its
    /// column sums approximate `b`.
    pub plan: Tensor,
    /// Dual potential of the `a` marginal, `reg * ln(u + eps)`.
    pub alpha: Tensor,
    /// Dual potential of the `b` marginal, `reg * ln(v + eps)`.
    pub beta: Tensor,
    /// Last evaluated squared marginal error.
    pub err: f32,
    pub iterations: usize,
}

/// Classic Sinkhorn-Knopp scaling between distributions `a` `[na]` and `b`
/// `[nb]` under cost `[na, nb]`. Inputs are treated as constants; no
/// gradient flows out of this function.
pub fn sinkhorn_knopp(
    a: &Tensor,
    b: &Tensor,
    cost: &Tensor,
    reg: f64,
    max_iter: usize,
    stop_thr: f32,
) -> Result<SinkhornOutput> {
    let (na, nb) = cost.dims2()?;
    let a = a.detach();
    let b = b.detach();
    let device = a.device();

    let mut u = Tensor::full(1.0f32 / na as f32, na, device)?;
    let mut v = Tensor::full(1.0f32 / nb as f32, nb, device)?;
    // K = exp(-C / reg)
    let k = cost.detach().affine(-1.0 / reg, 0.0)?.exp()?;

    let mut err = f32::INFINITY;
    let mut it = 0usize;
    while it < max_iter {
        it += 1;
        let (u_pre, v_pre) = (u.clone(), v.clone());

        // v <- b / (K^T u), u <- a / (K v)
        let ktu = u.unsqueeze(0)?.matmul(&k)?.squeeze(0)?;
        v = b.div(&(ktu + M_EPS)?)?;
        let kv = k.matmul(&v.unsqueeze(1)?)?.squeeze(1)?;
        u = a.div(&(kv + M_EPS)?)?;

        let probe = ((u.sum_all()? + v.sum_all()?)?).to_scalar::<f32>()?;
        if !probe.is_finite() {
            // Numerical blow-up: keep the last finite scaling vectors.
            u = u_pre;
            v = v_pre;
            break;
        }

        if it % EVAL_FREQ == 0 {
            let b_hat = u.unsqueeze(0)?.matmul(&k)?.squeeze(0)?.mul(&v)?;
            err = (&b - b_hat)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
            if err < stop_thr {
                break;
            }
        }
    }

    let alpha = ((&u + M_EPS)?.log()? * reg)?;
    let beta = ((&v + M_EPS)?.log()? * reg)?;
    let plan = u
        .unsqueeze(1)?
        .broadcast_mul(&k)?
        .broadcast_mul(&v.unsqueeze(0)?)?;
    Ok(SinkhornOutput {
        plan,
        alpha,
        beta,
        err,
        iterations: it,
    })
}

/// Squared-Euclidean cost between the cell centers of an `h x w` grid,
/// flattened row-major on both axes and normalized by the grid diagonal so
/// `exp(-C / reg)` stays well-scaled across resolutions.
pub fn cost_matrix(h: usize, w: usize, device: &Device) -> Result<Tensor> {
    let n = h * w;
    let norm = (h * h + w * w) as f32;
    let mut data = vec![0.0f32; n * n];
    for i in 0..n {
        let (yi, xi) = ((i / w) as f32, (i % w) as f32);
        for j in 0..n {
            let (yj, xj) = ((j / w) as f32, (j % w) as f32);
            let dy = yi - yj;
            let dx = xi - xj;
            data[i * n + j] = (dy * dy + dx * dx) / norm;
        }
    }
    Ok(Tensor::from_vec(data, (n, n), device)?)
}

/// Entropic OT loss term between a live predicted density map `[h, w]` and
/// a constant target map of the same shape. Both maps are normalized to
/// probability distributions; the Sinkhorn duals are computed on detached
/// tensors and contracted with the live normalized prediction.
pub fn ot_loss(pred: &Tensor, target: &Tensor, cost: &Tensor, config: &OtConfig) -> Result<Tensor> {
    let pred_flat = pred.flatten_all()?;
    let target_flat = target.flatten_all()?;

    let pred_mass = (pred_flat.sum_all()? + M_EPS)?;
    let pred_prob = pred_flat.broadcast_div(&pred_mass)?;
    let target_mass = (target_flat.sum_all()? + M_EPS)?;
    let target_prob = target_flat.broadcast_div(&target_mass)?;

    let out = sinkhorn_knopp(
        &target_prob,
        &pred_prob.detach(),
        cost,
        config.reg,
        config.max_iter,
        config.stop_thr,
    )?;

    // <beta, live prediction>: the dual gradient of the transport cost with
    // respect to the predicted marginal.
    Ok(out.beta.detach().mul(&pred_prob)?.sum_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn plan_marginals_match_inputs() {
        let device = Device::Cpu;
        let a = Tensor::from_vec(vec![0.5f32, 0.3, 0.2], 3, &device).unwrap();
        let b = Tensor::from_vec(vec![0.25f32, 0.25, 0.25, 0.25], 4, &device).unwrap();
        let cost = Tensor::rand(0.0f32, 1.0, (3, 4), &device).unwrap();

        let out = sinkhorn_knopp(&a, &b, &cost, 0.1, 1000, 1e-10).unwrap();
        let row = out.plan.sum(1).unwrap();
        let col = out.plan.sum(0).unwrap();

        let row_err = (row - a)
            .unwrap()
            .abs()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let col_err = (col - b)
            .unwrap()
            .abs()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(row_err < 1e-3, "row marginal error {row_err}");
        assert!(col_err < 1e-3, "column marginal error {col_err}");
    }

    #[test]
    fn cost_matrix_is_symmetric_with_zero_diagonal() {
        let device = Device::Cpu;
        let c = cost_matrix(3, 4, &device).unwrap();
        let ct = c.t().unwrap();
        let asym = (&c - &ct)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(asym < 1e-7);

        let diag: Vec<f32> = (0..12)
            .map(|i| {
                c.get(i)
                    .unwrap()
                    .get(i)
                    .unwrap()
                    .to_scalar::<f32>()
                    .unwrap()
            })
            .collect();
        assert!(diag.iter().all(|&d| d == 0.0));
    }

    #[test]
    fn ot_loss_is_finite() {
        let device = Device::Cpu;
        let pred = Tensor::rand(0.0f32, 1.0, (4, 4), &device).unwrap();
        let target = Tensor::rand(0.0f32, 1.0, (4, 4), &device).unwrap();
        let cost = cost_matrix(4, 4, &device).unwrap();
        let loss = ot_loss(&pred, &target, &cost, &OtConfig::default()).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
    }
}
