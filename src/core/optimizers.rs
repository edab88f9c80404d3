use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::core::graph::{GraphContainer, OPTIMIZER_PREFIX};
use crate::error::Result;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum ClipValue {
    None,
    Value(f64),
}

/// Parameter-update strategy. State slots (momentum buffers, moment
/// estimates) live in the [`GraphContainer`] as optimizer variables so they
/// persist alongside layer parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Optimizer {
    pub kind: OptimizerKind,
    pub clip: ClipValue,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum OptimizerKind {
    Sgd {
        learning_rate: f64,
        momentum: f64,
    },
    Adam {
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
    RmsProp {
        learning_rate: f64,
        rho: f64,
        epsilon: f64,
    },
}

impl Optimizer {
    pub fn sgd(learning_rate: f64) -> Self {
        Optimizer {
            kind: OptimizerKind::Sgd {
                learning_rate,
                momentum: 0.0,
            },
            clip: ClipValue::None,
        }
    }

    pub fn sgd_momentum(learning_rate: f64, momentum: f64) -> Self {
        Optimizer {
            kind: OptimizerKind::Sgd {
                learning_rate,
                momentum,
            },
            clip: ClipValue::None,
        }
    }

    pub fn adam(learning_rate: f64) -> Self {
        Optimizer {
            kind: OptimizerKind::Adam {
                learning_rate,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-7,
            },
            clip: ClipValue::None,
        }
    }

    pub fn rmsprop(learning_rate: f64) -> Self {
        Optimizer {
            kind: OptimizerKind::RmsProp {
                learning_rate,
                rho: 0.9,
                epsilon: 1e-7,
            },
            clip: ClipValue::None,
        }
    }

    /// Names of the state slots this optimizer keeps per layer variable.
    pub fn state_slots(&self, var: &str) -> Vec<String> {
        match &self.kind {
            OptimizerKind::Sgd { momentum, .. } => {
                if *momentum != 0.0 {
                    vec![format!("{}momentum_{}", OPTIMIZER_PREFIX, var)]
                } else {
                    Vec::new()
                }
            }
            OptimizerKind::Adam { .. } => vec![
                format!("{}adam_m_{}", OPTIMIZER_PREFIX, var),
                format!("{}adam_v_{}", OPTIMIZER_PREFIX, var),
            ],
            OptimizerKind::RmsProp { .. } => {
                vec![format!("{}rms_{}", OPTIMIZER_PREFIX, var)]
            }
        }
    }

    /// Applies one update to `var` from its gradient. `step` is the 1-based
    /// global update count, used for Adam bias correction.
    pub fn apply(
        &self,
        step: usize,
        vars: &mut GraphContainer,
        var: &str,
        mut grad: ArrayD<f64>,
    ) -> Result<()> {
        if let ClipValue::Value(clip) = self.clip {
            clip_gradients(&mut grad, clip);
        }
        match &self.kind {
            OptimizerKind::Sgd {
                learning_rate,
                momentum,
            } => {
                let w = vars.data(var)?;
                if *momentum == 0.0 {
                    let next = w - &(grad * *learning_rate);
                    vars.set_data(var, next)?;
                } else {
                    let slot = format!("{}momentum_{}", OPTIMIZER_PREFIX, var);
                    let v = vars.data(&slot)?;
                    let v_next = v * *momentum - &(grad * *learning_rate);
                    let next = w + &v_next;
                    vars.set_data(var, next)?;
                    vars.set_data(&slot, v_next)?;
                }
            }
            OptimizerKind::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                let m_slot = format!("{}adam_m_{}", OPTIMIZER_PREFIX, var);
                let v_slot = format!("{}adam_v_{}", OPTIMIZER_PREFIX, var);
                let m = vars.data(&m_slot)?;
                let v = vars.data(&v_slot)?;
                let m_next = m * *beta1 + &(&grad * (1.0 - beta1));
                let v_next = v * *beta2 + &(grad.mapv(|g| g * g) * (1.0 - beta2));
                let t = step as i32;
                let m_hat = &m_next / (1.0 - beta1.powi(t));
                let v_hat = &v_next / (1.0 - beta2.powi(t));
                let w = vars.data(var)?;
                let update = m_hat / &v_hat.mapv(|v| v.sqrt() + epsilon) * *learning_rate;
                let next = w - &update;
                vars.set_data(var, next)?;
                vars.set_data(&m_slot, m_next)?;
                vars.set_data(&v_slot, v_next)?;
            }
            OptimizerKind::RmsProp {
                learning_rate,
                rho,
                epsilon,
            } => {
                let slot = format!("{}rms_{}", OPTIMIZER_PREFIX, var);
                let s = vars.data(&slot)?;
                let s_next = s * *rho + &(grad.mapv(|g| g * g) * (1.0 - rho));
                let w = vars.data(var)?;
                let update = &grad / &s_next.mapv(|s| s.sqrt() + epsilon) * *learning_rate;
                let next = w - &update;
                vars.set_data(var, next)?;
                vars.set_data(&slot, s_next)?;
            }
        }
        Ok(())
    }
}

fn clip_gradients(grad: &mut ArrayD<f64>, clip_value: f64) {
    grad.mapv_inplace(|g| g.clamp(-clip_value, clip_value));
}
