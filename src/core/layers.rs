pub mod activation;
pub mod conv;
pub mod dense;
pub mod dropout;
pub mod input;
pub mod merge;
pub mod norm;
pub mod pool;
pub mod reshape;

use ndarray::{Array1, ArrayD, IxDyn};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::core::activations::Activation;
use crate::core::graph::{GraphContainer, VariableSpec};
use crate::core::regularizers::Regularizer;
use crate::core::shape::Shape;
use crate::error::{ModelError, Result};

pub use activation::{ActivationLayer, Elu, LeakyReLU, ReLU};
pub use conv::{Conv1D, Conv2D, Conv2DTranspose};
pub use dense::Dense;
pub use dropout::Dropout;
pub use input::Input;
pub use merge::{Merge, MergeOp};
pub use norm::BatchNorm;
pub use pool::{GlobalAvgPool2D, Pool2D};
pub use reshape::{Reshape, ZeroPadding2D};

/// Whether a forward pass runs with training semantics (batch statistics,
/// dropout masks) or inference semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Infer,
}

/// Per-batch state a layer's forward pass hands to its backward pass (and,
/// for batch statistics, to the training loop).
#[derive(Debug, Clone)]
pub enum LayerCache {
    /// Pre-activation tensor of a layer with a fused activation.
    PreAct(ArrayD<f64>),
    /// Inverted dropout mask.
    Mask(ArrayD<f64>),
    /// Batch mean/variance of a normalization layer.
    BatchStats { mean: Array1<f64>, variance: Array1<f64> },
}

/// A named unit of parametric computation: one node of the model graph.
///
/// The struct is the immutable "declared" state; output shape and variable
/// handles produced by the build step live in the [`GraphContainer`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub trainable: bool,
    pub kind: LayerKind,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum LayerKind {
    Input(Input),
    Dense(Dense),
    Conv1D(Conv1D),
    Conv2D(Conv2D),
    Conv2DTranspose(Conv2DTranspose),
    MaxPool2D(Pool2D),
    AvgPool2D(Pool2D),
    GlobalAvgPool2D(GlobalAvgPool2D),
    BatchNorm(BatchNorm),
    Dropout(Dropout),
    Flatten,
    Reshape(Reshape),
    ZeroPadding2D(ZeroPadding2D),
    Activation(ActivationLayer),
    ReLU(ReLU),
    Elu(Elu),
    LeakyReLU(LeakyReLU),
    Merge(Merge),
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Layer {
            name: name.into(),
            trainable: true,
            kind,
        }
    }

    pub fn input(name: impl Into<String>, dims: &[usize]) -> Self {
        Layer::new(name, LayerKind::Input(Input::new(dims)))
    }

    pub fn dense(name: impl Into<String>, units: usize, activation: Activation) -> Self {
        Layer::new(name, LayerKind::Dense(Dense::new(units, activation)))
    }

    pub fn flatten(name: impl Into<String>) -> Self {
        Layer::new(name, LayerKind::Flatten)
    }

    pub fn dropout(name: impl Into<String>, rate: f64) -> Self {
        Layer::new(name, LayerKind::Dropout(Dropout::new(rate)))
    }

    /// The external class tag this kind maps to in declarative configs.
    pub fn kind_tag(&self) -> &'static str {
        match &self.kind {
            LayerKind::Input(_) => "InputLayer",
            LayerKind::Dense(_) => "Dense",
            LayerKind::Conv1D(_) => "Conv1D",
            LayerKind::Conv2D(_) => "Conv2D",
            LayerKind::Conv2DTranspose(_) => "Conv2DTranspose",
            LayerKind::MaxPool2D(_) => "MaxPooling2D",
            LayerKind::AvgPool2D(_) => "AveragePooling2D",
            LayerKind::GlobalAvgPool2D(_) => "GlobalAveragePooling2D",
            LayerKind::BatchNorm(_) => "BatchNormalization",
            LayerKind::Dropout(_) => "Dropout",
            LayerKind::Flatten => "Flatten",
            LayerKind::Reshape(_) => "Reshape",
            LayerKind::ZeroPadding2D(_) => "ZeroPadding2D",
            LayerKind::Activation(_) => "Activation",
            LayerKind::ReLU(_) => "ReLU",
            LayerKind::Elu(_) => "ELU",
            LayerKind::LeakyReLU(_) => "LeakyReLU",
            LayerKind::Merge(m) => m.op.tag(),
        }
    }

    pub fn has_activation(&self) -> bool {
        match &self.kind {
            LayerKind::Dense(_)
            | LayerKind::Conv1D(_)
            | LayerKind::Conv2D(_)
            | LayerKind::Conv2DTranspose(_)
            | LayerKind::Activation(_)
            | LayerKind::ReLU(_)
            | LayerKind::Elu(_)
            | LayerKind::LeakyReLU(_) => true,
            _ => false,
        }
    }

    /// Parameter declarations for the build step, sized from the inbound
    /// shapes.
    pub fn variable_specs(&self, inputs: &[Shape]) -> Result<Vec<VariableSpec>> {
        match &self.kind {
            LayerKind::Dense(d) => d.specs(&self.name, single_shape(&self.name, inputs)?),
            LayerKind::Conv1D(c) => c.specs(&self.name, single_shape(&self.name, inputs)?),
            LayerKind::Conv2D(c) => c.specs(&self.name, single_shape(&self.name, inputs)?),
            LayerKind::Conv2DTranspose(c) => {
                c.specs(&self.name, single_shape(&self.name, inputs)?)
            }
            LayerKind::BatchNorm(b) => b.specs(&self.name, single_shape(&self.name, inputs)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Pure shape inference against concrete inbound shapes.
    pub fn compute_output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        match &self.kind {
            LayerKind::Input(i) => i.output_shape(),
            LayerKind::Dense(d) => d.output_shape(single_shape(&self.name, inputs)?),
            LayerKind::Conv1D(c) => c.output_shape(single_shape(&self.name, inputs)?),
            LayerKind::Conv2D(c) => c.output_shape(single_shape(&self.name, inputs)?),
            LayerKind::Conv2DTranspose(c) => c.output_shape(single_shape(&self.name, inputs)?),
            LayerKind::MaxPool2D(p) | LayerKind::AvgPool2D(p) => {
                p.output_shape(single_shape(&self.name, inputs)?)
            }
            LayerKind::GlobalAvgPool2D(g) => g.output_shape(single_shape(&self.name, inputs)?),
            LayerKind::BatchNorm(b) => b.output_shape(single_shape(&self.name, inputs)?),
            LayerKind::Dropout(_)
            | LayerKind::Activation(_)
            | LayerKind::ReLU(_)
            | LayerKind::Elu(_)
            | LayerKind::LeakyReLU(_) => Ok(single_shape(&self.name, inputs)?.clone()),
            LayerKind::Flatten => {
                let s = single_shape(&self.name, inputs)?;
                Ok(Shape::feature(&[s.elements()]))
            }
            LayerKind::Reshape(r) => r.output_shape(&self.name, single_shape(&self.name, inputs)?),
            LayerKind::ZeroPadding2D(z) => z.output_shape(single_shape(&self.name, inputs)?),
            LayerKind::Merge(m) => m.output_shape(&self.name, inputs),
        }
    }

    /// Applies the layer's transformation to the inbound tensors.
    pub fn forward(
        &self,
        vars: &GraphContainer,
        inputs: &[&ArrayD<f64>],
        mode: Mode,
        rng: &mut StdRng,
    ) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        match &self.kind {
            LayerKind::Input(_) => Ok((single_input(&self.name, inputs)?.clone(), None)),
            LayerKind::Dense(d) => d.forward(&self.name, vars, single_input(&self.name, inputs)?),
            LayerKind::Conv1D(c) => c.forward(&self.name, vars, single_input(&self.name, inputs)?),
            LayerKind::Conv2D(c) => c.forward(&self.name, vars, single_input(&self.name, inputs)?),
            LayerKind::Conv2DTranspose(c) => {
                c.forward(&self.name, vars, single_input(&self.name, inputs)?)
            }
            LayerKind::MaxPool2D(p) => p.forward_max(single_input(&self.name, inputs)?),
            LayerKind::AvgPool2D(p) => p.forward_avg(single_input(&self.name, inputs)?),
            LayerKind::GlobalAvgPool2D(g) => g.forward(single_input(&self.name, inputs)?),
            LayerKind::BatchNorm(b) => {
                b.forward(&self.name, vars, single_input(&self.name, inputs)?, mode)
            }
            LayerKind::Dropout(d) => d.forward(single_input(&self.name, inputs)?, mode, rng),
            LayerKind::Flatten => {
                let x = single_input(&self.name, inputs)?;
                let flat: usize = x.shape()[1..].iter().product();
                Ok((reshape(x, &[x.shape()[0], flat])?, None))
            }
            LayerKind::Reshape(r) => r.forward(single_input(&self.name, inputs)?),
            LayerKind::ZeroPadding2D(z) => z.forward(single_input(&self.name, inputs)?),
            LayerKind::Activation(a) => a.forward(single_input(&self.name, inputs)?),
            LayerKind::ReLU(r) => r.forward(single_input(&self.name, inputs)?),
            LayerKind::Elu(e) => e.forward(single_input(&self.name, inputs)?),
            LayerKind::LeakyReLU(l) => l.forward(single_input(&self.name, inputs)?),
            LayerKind::Merge(m) => m.forward(&self.name, inputs),
        }
    }

    /// Gradients for this layer's variables (by name) and for each inbound
    /// tensor, given the upstream gradient.
    pub fn backward(
        &self,
        vars: &GraphContainer,
        inputs: &[&ArrayD<f64>],
        output: &ArrayD<f64>,
        cache: Option<&LayerCache>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        match &self.kind {
            LayerKind::Input(_) => Ok((Vec::new(), Vec::new())),
            LayerKind::Dense(d) => {
                d.backward(&self.name, vars, single_input(&self.name, inputs)?, cache, grad)
            }
            LayerKind::Conv1D(c) => {
                c.backward(&self.name, vars, single_input(&self.name, inputs)?, cache, grad)
            }
            LayerKind::Conv2D(c) => {
                c.backward(&self.name, vars, single_input(&self.name, inputs)?, cache, grad)
            }
            LayerKind::Conv2DTranspose(c) => {
                c.backward(&self.name, vars, single_input(&self.name, inputs)?, cache, grad)
            }
            LayerKind::MaxPool2D(p) => {
                p.backward_max(single_input(&self.name, inputs)?, output, grad)
            }
            LayerKind::AvgPool2D(p) => p.backward_avg(single_input(&self.name, inputs)?, grad),
            LayerKind::GlobalAvgPool2D(g) => g.backward(single_input(&self.name, inputs)?, grad),
            LayerKind::BatchNorm(b) => {
                b.backward(&self.name, vars, single_input(&self.name, inputs)?, grad)
            }
            LayerKind::Dropout(d) => d.backward(cache, grad),
            LayerKind::Flatten => {
                let x = single_input(&self.name, inputs)?;
                Ok((Vec::new(), vec![reshape(grad, x.shape())?]))
            }
            LayerKind::Reshape(_) => {
                let x = single_input(&self.name, inputs)?;
                Ok((Vec::new(), vec![reshape(grad, x.shape())?]))
            }
            LayerKind::ZeroPadding2D(z) => {
                z.backward(single_input(&self.name, inputs)?, grad)
            }
            LayerKind::Activation(a) => a.backward(single_input(&self.name, inputs)?, grad),
            LayerKind::ReLU(r) => r.backward(single_input(&self.name, inputs)?, grad),
            LayerKind::Elu(e) => e.backward(single_input(&self.name, inputs)?, grad),
            LayerKind::LeakyReLU(l) => l.backward(single_input(&self.name, inputs)?, grad),
            LayerKind::Merge(m) => m.backward(inputs, output, grad),
        }
    }

    /// Kernel/bias variables carrying a non-trivial regularizer.
    pub fn regularized_variables(&self) -> Vec<(String, Regularizer)> {
        let (kernel_reg, bias_reg) = match &self.kind {
            LayerKind::Dense(d) => (d.kernel_regularizer, d.bias_regularizer),
            LayerKind::Conv1D(c) => (c.kernel_regularizer, c.bias_regularizer),
            LayerKind::Conv2D(c) => (c.kernel_regularizer, c.bias_regularizer),
            LayerKind::Conv2DTranspose(c) => (c.kernel_regularizer, c.bias_regularizer),
            _ => return Vec::new(),
        };
        let mut out = Vec::new();
        if !kernel_reg.is_none() {
            out.push((kernel_name(&self.name), kernel_reg));
        }
        if !bias_reg.is_none() {
            out.push((bias_name(&self.name), bias_reg));
        }
        out
    }

    /// Accumulated weight penalty of this layer's regularized variables.
    pub fn regularization_penalty(&self, vars: &GraphContainer) -> Result<f64> {
        let mut total = 0.0;
        for (name, reg) in self.regularized_variables() {
            total += reg.penalty(vars.data(&name)?);
        }
        Ok(total)
    }

    /// Folds a training batch's statistics into the layer's moving averages.
    pub fn fold_batch_stats(
        &self,
        vars: &mut GraphContainer,
        cache: &LayerCache,
    ) -> Result<()> {
        if let LayerKind::BatchNorm(b) = &self.kind {
            b.fold_batch_stats(&self.name, vars, cache)
        } else {
            Ok(())
        }
    }
}

pub(crate) fn kernel_name(layer: &str) -> String {
    format!("{}_kernel", layer)
}

pub(crate) fn bias_name(layer: &str) -> String {
    format!("{}_bias", layer)
}

pub(crate) fn single_shape<'a>(layer: &str, inputs: &'a [Shape]) -> Result<&'a Shape> {
    match inputs {
        [s] => Ok(s),
        _ => Err(ModelError::Shape(format!(
            "layer {} expects exactly one inbound tensor, got {}",
            layer,
            inputs.len()
        ))),
    }
}

pub(crate) fn single_input<'a>(layer: &str, inputs: &[&'a ArrayD<f64>]) -> Result<&'a ArrayD<f64>> {
    match inputs {
        [x] => Ok(x),
        _ => Err(ModelError::Shape(format!(
            "layer {} expects exactly one inbound tensor, got {}",
            layer,
            inputs.len()
        ))),
    }
}

pub(crate) fn reshape(x: &ArrayD<f64>, dims: &[usize]) -> Result<ArrayD<f64>> {
    x.to_shape(IxDyn(dims))
        .map(|v| v.to_owned())
        .map_err(|e| ModelError::Shape(e.to_string()))
}
