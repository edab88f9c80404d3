use ndarray::{Array1, Array2, ArrayD, Axis, Ix2};
use serde::{Deserialize, Serialize};

use crate::core::graph::{GraphContainer, VariableSpec};
use crate::core::initializers::Initializer;
use crate::core::layers::{reshape, LayerCache, Mode};
use crate::core::shape::Shape;
use crate::error::{ModelError, Result};

/// Batch normalization over the channel (last) axis.
///
/// Training normalizes with the current batch's statistics and reports them
/// in the layer cache; inference uses the accumulated moving statistics.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchNorm {
    pub axis: isize,
    pub momentum: f64,
    pub epsilon: f64,
    pub center: bool,
    pub scale: bool,
    pub beta_initializer: Initializer,
    pub gamma_initializer: Initializer,
    pub moving_mean_initializer: Initializer,
    pub moving_variance_initializer: Initializer,
}

impl Default for BatchNorm {
    fn default() -> Self {
        BatchNorm {
            axis: -1,
            momentum: 0.99,
            epsilon: 1e-3,
            center: true,
            scale: true,
            beta_initializer: Initializer::Zeros,
            gamma_initializer: Initializer::Ones,
            moving_mean_initializer: Initializer::Zeros,
            moving_variance_initializer: Initializer::Ones,
        }
    }
}

fn gamma_name(layer: &str) -> String {
    format!("{}_gamma", layer)
}

fn beta_name(layer: &str) -> String {
    format!("{}_beta", layer)
}

fn moving_mean_name(layer: &str) -> String {
    format!("{}_moving_mean", layer)
}

fn moving_variance_name(layer: &str) -> String {
    format!("{}_moving_variance", layer)
}

impl BatchNorm {
    fn channels(&self, input: &Shape) -> Result<usize> {
        let resolved = input.resolve_axis(self.axis)?;
        if resolved != input.rank() - 1 {
            return Err(ModelError::Config(format!(
                "batch normalization over axis {} is unsupported; only the channel (last) axis",
                self.axis
            )));
        }
        input.dim(resolved)
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.channels(input)?;
        Ok(input.clone())
    }

    pub fn specs(&self, name: &str, input: &Shape) -> Result<Vec<VariableSpec>> {
        let channels = self.channels(input)?;
        let mut specs = Vec::new();
        if self.scale {
            specs.push(VariableSpec {
                name: gamma_name(name),
                shape: vec![channels],
                init: self.gamma_initializer.clone(),
                trainable: true,
                fan_in: channels,
                fan_out: channels,
            });
        }
        if self.center {
            specs.push(VariableSpec {
                name: beta_name(name),
                shape: vec![channels],
                init: self.beta_initializer.clone(),
                trainable: true,
                fan_in: channels,
                fan_out: channels,
            });
        }
        // moving statistics are layer state, never gradient targets
        specs.push(VariableSpec {
            name: moving_mean_name(name),
            shape: vec![channels],
            init: self.moving_mean_initializer.clone(),
            trainable: false,
            fan_in: channels,
            fan_out: channels,
        });
        specs.push(VariableSpec {
            name: moving_variance_name(name),
            shape: vec![channels],
            init: self.moving_variance_initializer.clone(),
            trainable: false,
            fan_in: channels,
            fan_out: channels,
        });
        Ok(specs)
    }

    fn as_channel_matrix(&self, x: &ArrayD<f64>) -> Result<Array2<f64>> {
        let channels = *x.shape().last().ok_or(ModelError::Internal(
            "batch normalization on a rank-0 tensor",
        ))?;
        let m = x.len() / channels;
        Ok(reshape(x, &[m, channels])?
            .into_dimensionality::<Ix2>()
            .map_err(|e| ModelError::Shape(e.to_string()))?)
    }

    pub fn forward(
        &self,
        name: &str,
        vars: &GraphContainer,
        x: &ArrayD<f64>,
        mode: Mode,
    ) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let x2 = self.as_channel_matrix(x)?;
        let m = x2.nrows() as f64;

        let (mean, variance, cache) = match mode {
            Mode::Train => {
                let mean = x2.sum_axis(Axis(0)) / m;
                let centered = &x2 - &mean;
                let variance = centered.mapv(|v| v * v).sum_axis(Axis(0)) / m;
                let cache = LayerCache::BatchStats {
                    mean: mean.clone(),
                    variance: variance.clone(),
                };
                (mean, variance, Some(cache))
            }
            Mode::Infer => {
                let mean = to_1d(vars.data(&moving_mean_name(name))?)?;
                let variance = to_1d(vars.data(&moving_variance_name(name))?)?;
                (mean, variance, None)
            }
        };

        let denom = variance.mapv(|v| (v + self.epsilon).sqrt());
        let mut out = (&x2 - &mean) / &denom;
        if self.scale {
            let gamma = to_1d(vars.data(&gamma_name(name))?)?;
            out = out * &gamma;
        }
        if self.center {
            let beta = to_1d(vars.data(&beta_name(name))?)?;
            out = out + &beta;
        }
        Ok((reshape(&out.into_dyn(), x.shape())?, cache))
    }

    pub fn backward(
        &self,
        name: &str,
        vars: &GraphContainer,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let x2 = self.as_channel_matrix(x)?;
        let dy = self.as_channel_matrix(grad)?;
        let m = x2.nrows() as f64;

        let mean = x2.sum_axis(Axis(0)) / m;
        let centered = &x2 - &mean;
        let variance = centered.mapv(|v| v * v).sum_axis(Axis(0)) / m;
        let denom = variance.mapv(|v| (v + self.epsilon).sqrt());
        let x_hat = &centered / &denom;

        let dbeta = dy.sum_axis(Axis(0));
        let dgamma = (&dy * &x_hat).sum_axis(Axis(0));
        let mean_dy = &dbeta / m;
        let mean_dy_xhat = &dgamma / m;

        let gamma = if self.scale {
            to_1d(vars.data(&gamma_name(name))?)?
        } else {
            Array1::ones(x_hat.ncols())
        };
        let dx2 = (&dy - &mean_dy - &(&x_hat * &mean_dy_xhat)) * &(&gamma / &denom);
        let dx = reshape(&dx2.into_dyn(), x.shape())?;

        let mut grads = Vec::new();
        if self.scale {
            grads.push((gamma_name(name), dgamma.into_dyn()));
        }
        if self.center {
            grads.push((beta_name(name), dbeta.into_dyn()));
        }
        Ok((grads, vec![dx]))
    }

    /// Folds a training batch's statistics into the moving averages:
    /// `moving = momentum * moving + (1 - momentum) * batch`.
    pub fn fold_batch_stats(
        &self,
        name: &str,
        vars: &mut GraphContainer,
        cache: &LayerCache,
    ) -> Result<()> {
        let LayerCache::BatchStats { mean, variance } = cache else {
            return Err(ModelError::Internal("batch-norm stat fold with foreign cache"));
        };
        let mm = to_1d(vars.data(&moving_mean_name(name))?)?;
        let mv = to_1d(vars.data(&moving_variance_name(name))?)?;
        let new_mean = &mm * self.momentum + mean * (1.0 - self.momentum);
        let new_var = &mv * self.momentum + variance * (1.0 - self.momentum);
        vars.set_data(&moving_mean_name(name), new_mean.into_dyn())?;
        vars.set_data(&moving_variance_name(name), new_var.into_dyn())?;
        Ok(())
    }
}

fn to_1d(x: &ArrayD<f64>) -> Result<Array1<f64>> {
    x.view()
        .into_dimensionality::<ndarray::Ix1>()
        .map(|v| v.to_owned())
        .map_err(|e| ModelError::Shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn built(layer: &str, bn: &BatchNorm, input: &Shape) -> GraphContainer {
        let mut g = GraphContainer::new();
        for spec in bn.specs(layer, input).unwrap() {
            g.add_variable(spec, layer).unwrap();
        }
        g.initialize_variables();
        g
    }

    #[test]
    fn training_forward_normalizes_batch() {
        let bn = BatchNorm::default();
        let input = Shape::feature(&[2]);
        let vars = built("bn", &bn, &input);
        let x = arr2(&[[1.0, 10.0], [3.0, 30.0]]).into_dyn();
        let (out, cache) = bn.forward("bn", &vars, &x, Mode::Train).unwrap();
        let out2 = out.into_dimensionality::<Ix2>().unwrap();
        // per-channel mean of the normalized batch is ~0
        for col in out2.columns() {
            assert!(col.sum().abs() < 1e-9);
        }
        assert!(matches!(cache, Some(LayerCache::BatchStats { .. })));
    }

    #[test]
    fn inference_uses_moving_statistics() {
        let bn = BatchNorm::default();
        let input = Shape::feature(&[2]);
        let vars = built("bn", &bn, &input);
        // fresh moving stats are mean 0 / variance 1, so inference is close
        // to identity
        let x = arr2(&[[0.5, -0.5]]).into_dyn();
        let (out, cache) = bn.forward("bn", &vars, &x, Mode::Infer).unwrap();
        assert!(cache.is_none());
        let out2 = out.into_dimensionality::<Ix2>().unwrap();
        assert!((out2[[0, 0]] - 0.5 / (1.0f64 + 1e-3).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn fold_moves_statistics_toward_batch() {
        let bn = BatchNorm {
            momentum: 0.5,
            ..BatchNorm::default()
        };
        let input = Shape::feature(&[1]);
        let mut vars = built("bn", &bn, &input);
        let cache = LayerCache::BatchStats {
            mean: Array1::from_vec(vec![4.0]),
            variance: Array1::from_vec(vec![9.0]),
        };
        bn.fold_batch_stats("bn", &mut vars, &cache).unwrap();
        assert!((vars.data("bn_moving_mean").unwrap()[[0]] - 2.0).abs() < 1e-12);
        assert!((vars.data("bn_moving_variance").unwrap()[[0]] - 5.0).abs() < 1e-12);
    }
}
