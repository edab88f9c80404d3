use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Weight penalty strategy applied to a layer's kernel or bias.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Regularizer {
    None,
    L1(f64),
    L2(f64),
    L1L2 { l1: f64, l2: f64 },
}

impl Regularizer {
    /// Normalizes coefficient pairs: zero coefficients collapse to `None`
    /// instead of producing a zero-cost penalty term.
    pub fn from_l1_l2(l1: f64, l2: f64) -> Self {
        match (l1 != 0.0, l2 != 0.0) {
            (true, true) => Regularizer::L1L2 { l1, l2 },
            (true, false) => Regularizer::L1(l1),
            (false, true) => Regularizer::L2(l2),
            (false, false) => Regularizer::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Regularizer::None)
    }

    pub fn penalty(&self, w: &ArrayD<f64>) -> f64 {
        match self {
            Regularizer::None => 0.0,
            Regularizer::L1(lambda) => lambda * w.mapv(f64::abs).sum(),
            Regularizer::L2(lambda) => 0.5 * lambda * w.mapv(|x| x * x).sum(),
            Regularizer::L1L2 { l1, l2 } => {
                l1 * w.mapv(f64::abs).sum() + 0.5 * l2 * w.mapv(|x| x * x).sum()
            }
        }
    }

    pub fn grad(&self, w: &ArrayD<f64>) -> ArrayD<f64> {
        match self {
            Regularizer::None => ArrayD::zeros(w.raw_dim()),
            Regularizer::L1(lambda) => w.mapv(|x| lambda * sign(x)),
            Regularizer::L2(lambda) => w.mapv(|x| lambda * x),
            Regularizer::L1L2 { l1, l2 } => w.mapv(|x| l1 * sign(x) + l2 * x),
        }
    }
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
    use ndarray::arr1;

    #[test]
    fn zero_coefficients_normalize_to_none() {
        assert_eq!(Regularizer::from_l1_l2(0.0, 0.0), Regularizer::None);
        assert_eq!(Regularizer::from_l1_l2(0.1, 0.0), Regularizer::L1(0.1));
        assert_eq!(Regularizer::from_l1_l2(0.0, 0.2), Regularizer::L2(0.2));
        assert_eq!(
            Regularizer::from_l1_l2(0.1, 0.2),
            Regularizer::L1L2 { l1: 0.1, l2: 0.2 }
        );
    }

    #[test]
    fn penalties() {
        let w = arr1(&[1.0, -2.0]).into_dyn();
        assert_eq!(Regularizer::L1(0.5).penalty(&w), 1.5);
        assert_eq!(Regularizer::L2(0.5).penalty(&w), 1.25);
        assert_eq!(Regularizer::None.penalty(&w), 0.0);
    }

    #[test]
    fn gradients() {
        let w = arr1(&[1.0, -2.0]).into_dyn();
        let g = Regularizer::L1L2 { l1: 0.1, l2: 0.5 }.grad(&w);
        assert!((g[[0]] - 0.6).abs() < 1e-12);
        assert!((g[[1]] + 1.1).abs() < 1e-12);
    }
}
