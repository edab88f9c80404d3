use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::utils::argmax;

/// Scalar-reducing evaluation metric over (prediction, label) batches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Accuracy,
    Mse,
    Mae,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Accuracy => "accuracy",
            Metric::Mse => "mse",
            Metric::Mae => "mae",
        }
    }

    pub fn evaluate(&self, y_hat: &Array2<f64>, y: &Array2<f64>) -> f64 {
        match self {
            Metric::Accuracy => {
                let batch = y.nrows();
                if batch == 0 {
                    return 0.0;
                }
                let hits = y_hat
                    .rows()
                    .into_iter()
                    .zip(y.rows())
                    .filter(|(p, t)| {
                        argmax(p.as_slice().unwrap_or(&[])) == argmax(t.as_slice().unwrap_or(&[]))
                    })
                    .count();
                hits as f64 / batch as f64
            }
            Metric::Mse => {
                let diff = y_hat - y;
                diff.mapv(|d| d * d).sum() / y.len() as f64
            }
            Metric::Mae => {
                let diff = y_hat - y;
                diff.mapv(f64::abs).sum() / y.len() as f64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn accuracy_counts_argmax_hits() {
        let y = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]]);
        let p = arr2(&[[0.9, 0.1], [0.2, 0.8], [0.3, 0.7], [0.4, 0.6]]);
        assert!((Metric::Accuracy.evaluate(&p, &y) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn mse_metric() {
        let y = arr2(&[[0.0, 0.0]]);
        let p = arr2(&[[1.0, 1.0]]);
        assert!((Metric::Mse.evaluate(&p, &y) - 1.0).abs() < 1e-12);
    }
}
