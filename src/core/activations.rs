use fastapprox::fast::tanh as faster_tanh;
use ndarray::{ArrayD, Axis};

use crate::error::Result;
use serde::{Deserialize, Serialize};

const SELU_ALPHA: f64 = 1.6732632423543772;
const SELU_LAMBDA: f64 = 1.0507009873554805;

/// Elementwise (or, for the softmax family, last-axis-reducing) nonlinearity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    LogSoftmax,
    Elu,
    Selu,
    Softplus,
    Softsign,
    Exponential,
    HardSigmoid,
    Swish,
    Mish,
}

impl Activation {
    pub fn forward(&self, z: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        Ok(match self {
            Self::Linear => z.clone(),
            Self::Relu => z.mapv(|z| if z >= 0.0 { z } else { 0.0 }),
            Self::Sigmoid => z.mapv(sigmoid),
            Self::Tanh => z.mapv(f64::tanh),
            Self::Softmax => softmax_forward(z),
            Self::LogSoftmax => log_softmax_forward(z),
            Self::Elu => z.mapv(|z| if z > 0.0 { z } else { z.exp_m1() }),
            Self::Selu => {
                z.mapv(|z| SELU_LAMBDA * if z > 0.0 { z } else { SELU_ALPHA * z.exp_m1() })
            }
            Self::Softplus => z.mapv(|z| z.exp().ln_1p()),
            Self::Softsign => z.mapv(|z| z / (1.0 + z.abs())),
            Self::Exponential => z.mapv(f64::exp),
            Self::HardSigmoid => z.mapv(|z| (0.2 * z + 0.5).clamp(0.0, 1.0)),
            Self::Swish => z.mapv(|z| z * sigmoid(z)),
            Self::Mish => z.mapv(|z| z * z.exp().ln_1p().tanh()),
        })
    }

    /// Gradient with respect to the pre-activation `z`, given the upstream
    /// gradient `da`.
    pub fn backward(&self, z: &ArrayD<f64>, da: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        Ok(match self {
            Self::Linear => da.clone(),
            Self::Relu => da * &z.mapv(|z| if z >= 0.0 { 1.0 } else { 0.0 }),
            Self::Sigmoid => {
                da * &z.mapv(|z| {
                    let s = sigmoid(z);
                    s * (1.0 - s)
                })
            }
            Self::Tanh => {
                da * &z.mapv(|z| {
                    let t = faster_tanh(z as f32) as f64;
                    1.0 - t * t
                })
            }
            Self::Softmax => softmax_backward(z, da),
            Self::LogSoftmax => log_softmax_backward(z, da),
            Self::Elu => da * &z.mapv(|z| if z > 0.0 { 1.0 } else { z.exp() }),
            Self::Selu => {
                da * &z.mapv(|z| SELU_LAMBDA * if z > 0.0 { 1.0 } else { SELU_ALPHA * z.exp() })
            }
            Self::Softplus => da * &z.mapv(sigmoid),
            Self::Softsign => {
                da * &z.mapv(|z| {
                    let d = 1.0 + z.abs();
                    1.0 / (d * d)
                })
            }
            Self::Exponential => da * &z.mapv(f64::exp),
            Self::HardSigmoid => {
                da * &z.mapv(|z| if (-2.5..2.5).contains(&z) { 0.2 } else { 0.0 })
            }
            Self::Swish => {
                da * &z.mapv(|z| {
                    let s = sigmoid(z);
                    s + z * s * (1.0 - s)
                })
            }
            Self::Mish => {
                da * &z.mapv(|z| {
                    let t = z.exp().ln_1p().tanh();
                    t + z * (1.0 - t * t) * sigmoid(z)
                })
            }
        })
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Row-stable softmax over the last axis.
fn softmax_forward(z: &ArrayD<f64>) -> ArrayD<f64> {
    let axis = Axis(z.ndim() - 1);
    let mut a = z.clone();
    for mut lane in a.lanes_mut(axis) {
        let max = lane.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    a
}

fn log_softmax_forward(z: &ArrayD<f64>) -> ArrayD<f64> {
    let axis = Axis(z.ndim() - 1);
    let mut a = z.clone();
    for mut lane in a.lanes_mut(axis) {
        let max = lane.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let log_sum = lane.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
        lane.mapv_inplace(|v| v - max - log_sum);
    }
    a
}

/// dz_i = a_i * (da_i - sum_j da_j a_j), per lane of the last axis.
fn softmax_backward(z: &ArrayD<f64>, da: &ArrayD<f64>) -> ArrayD<f64> {
    let axis = Axis(z.ndim() - 1);
    let a = softmax_forward(z);
    let mut dz = da.clone();
    for (mut dlane, alane) in dz.lanes_mut(axis).into_iter().zip(a.lanes(axis)) {
        let dot: f64 = dlane.iter().zip(alane.iter()).map(|(d, a)| d * a).sum();
        for (d, a) in dlane.iter_mut().zip(alane.iter()) {
            *d = a * (*d - dot);
        }
    }
    dz
}

/// dz_i = da_i - softmax(z)_i * sum_j da_j, per lane of the last axis.
fn log_softmax_backward(z: &ArrayD<f64>, da: &ArrayD<f64>) -> ArrayD<f64> {
    let axis = Axis(z.ndim() - 1);
    let a = softmax_forward(z);
    let mut dz = da.clone();
    for (mut dlane, alane) in dz.lanes_mut(axis).into_iter().zip(a.lanes(axis)) {
        let total: f64 = dlane.iter().sum();
        for (d, a) in dlane.iter_mut().zip(alane.iter()) {
            *d -= a * total;
        }
    }
    dz
}
