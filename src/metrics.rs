//! Counting metrics over an evaluation set.
//!
//! Crowd counting reports two headline numbers: mean absolute error (MAE)
//! over per-image counts and the root of the mean squared error (RMSE).
//! Both are accumulated incrementally so an evaluation loop never has to
//! hold all predictions in memory.

#[derive(Debug, Default)]
pub struct CountingMetrics {
    abs_sum: f64,
    sq_sum: f64,
    n: usize,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one image's predicted and ground-truth counts.
    pub fn record(&mut self, predicted: f32, ground_truth: f32) {
        let err = (predicted - ground_truth) as f64;
        self.abs_sum += err.abs();
        self.sq_sum += err * err;
        self.n += 1;
    }

    /// Number of images recorded so far.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Mean absolute count error. Zero when nothing was recorded.
    pub fn mae(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.abs_sum / self.n as f64
        }
    }

    /// Root mean squared count error. Zero when nothing was recorded.
    pub fn rmse(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.sq_sum / self.n as f64).sqrt()
        }
    }

    /// Print the standard counting summary.
    pub fn print_summary(&self) {
        println!();
        println!(" Images evaluated = {}", self.n);
        println!(" Mean Absolute Error  (MAE)  = {:.3}", self.mae());
        println!(" Root Mean Sq. Error  (RMSE) = {:.3}", self.rmse());
    }
}
