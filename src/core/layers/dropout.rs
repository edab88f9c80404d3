use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::layers::{LayerCache, Mode};
use crate::error::{ModelError, Result};

/// Inverted dropout: surviving units are rescaled by `1/(1-rate)` so the
/// inference path is an identity.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Dropout {
    pub rate: f64,
}

impl Dropout {
    pub fn new(rate: f64) -> Self {
        Dropout { rate }
    }

    pub fn forward(
        &self,
        x: &ArrayD<f64>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        if !(0.0..1.0).contains(&self.rate) {
            return Err(ModelError::Config(format!(
                "dropout rate must be in [0, 1), got {}",
                self.rate
            )));
        }
        match mode {
            Mode::Infer => Ok((x.clone(), None)),
            Mode::Train => {
                let keep = 1.0 - self.rate;
                let mask = ArrayD::from_shape_simple_fn(x.raw_dim(), || {
                    if rng.gen::<f64>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                });
                Ok((x * &mask, Some(LayerCache::Mask(mask))))
            }
        }
    }

    pub fn backward(
        &self,
        cache: Option<&LayerCache>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        match cache {
            Some(LayerCache::Mask(mask)) => Ok((Vec::new(), vec![grad * mask])),
            // inference-mode backward is an identity (no mask was drawn)
            None => Ok((Vec::new(), vec![grad.clone()])),
            _ => Err(ModelError::Internal("dropout backward with foreign cache")),
        }
    }
}
