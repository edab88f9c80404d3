use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::core::activations::Activation;
use crate::core::layers::LayerCache;
use crate::error::Result;

/// Applies a registry activation as a standalone layer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActivationLayer {
    pub activation: Activation,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Self {
        ActivationLayer { activation }
    }

    pub fn forward(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        Ok((self.activation.forward(x)?, None))
    }

    pub fn backward(
        &self,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        Ok((Vec::new(), vec![self.activation.backward(x, grad)?]))
    }
}

/// Parametrized rectifier.
///
/// Values at or above `threshold` pass through, values below it are scaled
/// by `alpha`, and when `max_value` is given the result is clipped after
/// thresholding. With `alpha != 0` and neither `threshold` nor `max_value`
/// set, this degenerates to LeakyReLU behavior.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReLU {
    pub alpha: f64,
    pub max_value: Option<f64>,
    pub threshold: f64,
}

impl Default for ReLU {
    fn default() -> Self {
        ReLU {
            alpha: 0.0,
            max_value: None,
            threshold: 0.0,
        }
    }
}

impl ReLU {
    pub fn forward(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let out = x.mapv(|v| {
            let r = if v >= self.threshold {
                v
            } else {
                self.alpha * (v - self.threshold)
            };
            match self.max_value {
                Some(max) => r.min(max),
                None => r,
            }
        });
        Ok((out, None))
    }

    pub fn backward(
        &self,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let dx = grad
            * &x.mapv(|v| {
                if let Some(max) = self.max_value {
                    if v >= max {
                        return 0.0;
                    }
                }
                if v >= self.threshold {
                    1.0
                } else {
                    self.alpha
                }
            });
        Ok((Vec::new(), vec![dx]))
    }
}

/// Exponential linear unit with configurable `alpha`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Elu {
    pub alpha: f64,
}

impl Default for Elu {
    fn default() -> Self {
        Elu { alpha: 1.0 }
    }
}

impl Elu {
    pub fn forward(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let out = x.mapv(|v| if v > 0.0 { v } else { self.alpha * v.exp_m1() });
        Ok((out, None))
    }

    pub fn backward(
        &self,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let dx = grad * &x.mapv(|v| if v > 0.0 { 1.0 } else { self.alpha * v.exp() });
        Ok((Vec::new(), vec![dx]))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LeakyReLU {
    pub alpha: f64,
}

impl Default for LeakyReLU {
    fn default() -> Self {
        LeakyReLU { alpha: 0.3 }
    }
}

impl LeakyReLU {
    pub fn forward(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let out = x.mapv(|v| if v >= 0.0 { v } else { self.alpha * v });
        Ok((out, None))
    }

    pub fn backward(
        &self,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let dx = grad * &x.mapv(|v| if v >= 0.0 { 1.0 } else { self.alpha });
        Ok((Vec::new(), vec![dx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn relu_threshold_and_clip() {
        let layer = ReLU {
            alpha: 0.5,
            max_value: Some(2.0),
            threshold: 1.0,
        };
        let x = arr1(&[0.0, 1.5, 5.0]).into_dyn();
        let (out, _) = layer.forward(&x).unwrap();
        // below threshold: 0.5 * (0 - 1) = -0.5; passthrough 1.5; clipped 2.0
        assert_eq!(out, arr1(&[-0.5, 1.5, 2.0]).into_dyn());
    }

    #[test]
    fn relu_defaults_to_plain_rectifier() {
        let layer = ReLU::default();
        let x = arr1(&[-1.0, 3.0]).into_dyn();
        let (out, _) = layer.forward(&x).unwrap();
        assert_eq!(out, arr1(&[0.0, 3.0]).into_dyn());
    }

    #[test]
    fn relu_with_alpha_only_is_leaky() {
        let relu = ReLU {
            alpha: 0.1,
            max_value: None,
            threshold: 0.0,
        };
        let leaky = LeakyReLU { alpha: 0.1 };
        let x = arr1(&[-2.0, -0.5, 0.0, 1.0]).into_dyn();
        assert_eq!(relu.forward(&x).unwrap().0, leaky.forward(&x).unwrap().0);
    }
}
