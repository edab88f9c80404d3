use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

const EPSILON: f64 = 1e-15;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Loss {
    Mse,
    Mae,
    CategoricalCrossentropy,
    BinaryCrossentropy,
    Huber(f64),
}

/// Computes the scalar loss and its gradient with respect to the prediction.
///
/// The gradient carries the mean-reduction factor, so layer backward passes
/// never rescale by batch size.
pub fn criteria(y_hat: &Array2<f64>, y: &Array2<f64>, loss_ty: Loss) -> Result<(f64, Array2<f64>)> {
    if y_hat.shape() != y.shape() {
        return Err(ModelError::Shape(format!(
            "prediction shape {:?} doesn't match target shape {:?}",
            y_hat.shape(),
            y.shape()
        )));
    }
    let n = y.len() as f64;
    let batch = y.nrows() as f64;

    let (loss, da) = match loss_ty {
        Loss::Mse => {
            let diff = y_hat - y;
            let loss = 0.5 * diff.mapv(|d| d * d).sum() / n;
            (loss, diff / n)
        }
        Loss::Mae => {
            let diff = y_hat - y;
            let loss = diff.mapv(f64::abs).sum() / n;
            (loss, diff.mapv(|d| sign(d) / n))
        }
        Loss::CategoricalCrossentropy => {
            let p = y_hat.mapv(|p| p.clamp(EPSILON, 1.0 - EPSILON));
            let loss = -(y * &p.mapv(f64::ln)).sum() / batch;
            let da = -(y / &p) / batch;
            (loss, da)
        }
        Loss::BinaryCrossentropy => {
            let p = y_hat.mapv(|p| p.clamp(EPSILON, 1.0 - EPSILON));
            let loss = -(y * &p.mapv(f64::ln)
                + (1.0 - y) * &p.mapv(|p| (1.0 - p).ln()))
            .sum()
                / n;
            let da = -((y / &p) - ((1.0 - y) / (1.0 - &p))) / n;
            (loss, da)
        }
        Loss::Huber(delta) => {
            let diff = y_hat - y;
            let loss = diff
                .mapv(|d| {
                    if d.abs() <= delta {
                        0.5 * d * d
                    } else {
                        delta * (d.abs() - 0.5 * delta)
                    }
                })
                .sum()
                / n;
            let da = diff.mapv(|d| {
                let g = if d.abs() <= delta { d } else { delta * sign(d) };
                g / n
            });
            (loss, da)
        }
    };
    Ok((loss, da))
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn mse_of_exact_prediction_is_zero() {
        let y = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let (loss, da) = criteria(&y, &y, Loss::Mse).unwrap();
        assert_eq!(loss, 0.0);
        assert!(da.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn crossentropy_penalizes_wrong_class() {
        let y = arr2(&[[1.0, 0.0]]);
        let good = arr2(&[[0.9, 0.1]]);
        let bad = arr2(&[[0.1, 0.9]]);
        let (l_good, _) = criteria(&good, &y, Loss::CategoricalCrossentropy).unwrap();
        let (l_bad, _) = criteria(&bad, &y, Loss::CategoricalCrossentropy).unwrap();
        assert!(l_good < l_bad);
    }

    #[test]
    fn crossentropy_survives_hard_zero_prediction() {
        let y = arr2(&[[1.0, 0.0]]);
        let p = arr2(&[[0.0, 1.0]]);
        let (loss, da) = criteria(&p, &y, Loss::CategoricalCrossentropy).unwrap();
        assert!(loss.is_finite());
        assert!(da.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let y = arr2(&[[1.0, 0.0]]);
        let p = arr2(&[[1.0, 0.0, 0.0]]);
        assert!(criteria(&p, &y, Loss::Mse).is_err());
    }

    #[test]
    fn huber_is_quadratic_inside_delta() {
        let y = arr2(&[[0.0]]);
        let p = arr2(&[[0.5]]);
        let (loss, _) = criteria(&p, &y, Loss::Huber(1.0)).unwrap();
        assert!((loss - 0.125).abs() < 1e-12);
    }
}
