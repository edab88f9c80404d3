use ndarray::{ArrayD, Axis, Ix1, Ix2};
use serde::{Deserialize, Serialize};

use crate::core::activations::Activation;
use crate::core::graph::{GraphContainer, VariableSpec};
use crate::core::initializers::Initializer;
use crate::core::layers::{bias_name, kernel_name, LayerCache};
use crate::core::regularizers::Regularizer;
use crate::core::shape::Shape;
use crate::error::{ModelError, Result};

/// Fully connected layer with an optional fused activation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Dense {
    pub units: usize,
    pub activation: Activation,
    pub use_bias: bool,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub kernel_regularizer: Regularizer,
    pub bias_regularizer: Regularizer,
}

impl Dense {
    pub fn new(units: usize, activation: Activation) -> Self {
        Dense {
            units,
            activation,
            use_bias: true,
            kernel_initializer: Initializer::glorot_uniform(),
            bias_initializer: Initializer::Zeros,
            kernel_regularizer: Regularizer::None,
            bias_regularizer: Regularizer::None,
        }
    }

    fn input_units(&self, input: &Shape) -> Result<usize> {
        if input.rank() != 2 {
            return Err(ModelError::Shape(format!(
                "dense layer expects a rank-2 input, got {}",
                input
            )));
        }
        input.dim(1)
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if self.units == 0 {
            return Err(ModelError::Shape("dense units must be positive".into()));
        }
        self.input_units(input)?;
        Ok(Shape::feature(&[self.units]))
    }

    pub fn specs(&self, name: &str, input: &Shape) -> Result<Vec<VariableSpec>> {
        let fan_in = self.input_units(input)?;
        let mut specs = vec![VariableSpec {
            name: kernel_name(name),
            shape: vec![fan_in, self.units],
            init: self.kernel_initializer.clone(),
            trainable: true,
            fan_in,
            fan_out: self.units,
        }];
        if self.use_bias {
            specs.push(VariableSpec {
                name: bias_name(name),
                shape: vec![self.units],
                init: self.bias_initializer.clone(),
                trainable: true,
                fan_in,
                fan_out: self.units,
            });
        }
        Ok(specs)
    }

    pub fn forward(
        &self,
        name: &str,
        vars: &GraphContainer,
        x: &ArrayD<f64>,
    ) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let x = as_2d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = as_2d(w)?;
        let mut z = x.dot(&w);
        if self.use_bias {
            let b = vars.data(&bias_name(name))?;
            let b = b
                .view()
                .into_dimensionality::<Ix1>()
                .map_err(|e| ModelError::Shape(e.to_string()))?;
            z += &b;
        }
        let z = z.into_dyn();
        let a = self.activation.forward(&z)?;
        Ok((a, Some(LayerCache::PreAct(z))))
    }

    pub fn backward(
        &self,
        name: &str,
        vars: &GraphContainer,
        x: &ArrayD<f64>,
        cache: Option<&LayerCache>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let Some(LayerCache::PreAct(z)) = cache else {
            return Err(ModelError::Internal("dense backward without cached pre-activation"));
        };
        let dz = self.activation.backward(z, grad)?;
        let dz = as_2d(&dz)?.to_owned();
        let x = as_2d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = as_2d(w)?;

        let dw = x.t().dot(&dz);
        let dx = dz.dot(&w.t());

        let mut grads = vec![(kernel_name(name), dw.into_dyn())];
        if self.use_bias {
            let db = dz.sum_axis(Axis(0));
            grads.push((bias_name(name), db.into_dyn()));
        }
        Ok((grads, vec![dx.into_dyn()]))
    }
}

fn as_2d(x: &ArrayD<f64>) -> Result<ndarray::ArrayView2<'_, f64>> {
    x.view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| ModelError::Shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn built(layer: &str, dense: &Dense, input: &Shape) -> GraphContainer {
        let mut vars = GraphContainer::new();
        for spec in dense.specs(layer, input).unwrap() {
            vars.add_variable(spec, layer).unwrap();
        }
        vars.initialize_variables();
        vars
    }

    #[test]
    fn unit_kernel_sums_features() {
        let mut dense = Dense::new(2, Activation::Linear);
        dense.kernel_initializer = Initializer::Ones;
        let input = Shape::feature(&[3]);
        let vars = built("dense_1", &dense, &input);
        let x = arr2(&[[1.0, 2.0, 3.0]]).into_dyn();
        let (out, _) = dense.forward("dense_1", &vars, &x).unwrap();
        assert_eq!(out, arr2(&[[6.0, 6.0]]).into_dyn());
    }

    #[test]
    fn backward_produces_kernel_bias_and_input_gradients() {
        let mut dense = Dense::new(2, Activation::Linear);
        dense.kernel_initializer = Initializer::Ones;
        let input = Shape::feature(&[3]);
        let vars = built("dense_1", &dense, &input);
        let x = arr2(&[[1.0, 2.0, 3.0]]).into_dyn();
        let (_, cache) = dense.forward("dense_1", &vars, &x).unwrap();
        let grad = arr2(&[[1.0, 1.0]]).into_dyn();
        let (pgrads, igrads) = dense
            .backward("dense_1", &vars, &x, cache.as_ref(), &grad)
            .unwrap();
        assert_eq!(pgrads[0].0, "dense_1_kernel");
        assert_eq!(pgrads[0].1.shape(), &[3, 2]);
        assert_eq!(pgrads[0].1[[0, 0]], 1.0);
        assert_eq!(pgrads[1].0, "dense_1_bias");
        assert_eq!(pgrads[1].1[[0]], 2.0);
        // dL/dx = grad . Wᵀ with a unit kernel sums the two output grads
        assert_eq!(igrads[0], arr2(&[[2.0, 2.0, 2.0]]).into_dyn());
    }

    #[test]
    fn rejects_higher_rank_input() {
        let dense = Dense::new(2, Activation::Linear);
        assert!(dense.output_shape(&Shape::feature(&[3, 3])).is_err());
    }

    #[test]
    fn zero_units_is_a_shape_error() {
        let dense = Dense::new(0, Activation::Linear);
        assert!(dense.output_shape(&Shape::feature(&[3])).is_err());
    }
}
