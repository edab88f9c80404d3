use ndarray::{Array3, Array4, ArrayD, ArrayView3, ArrayView4, Axis, Ix1, Ix3, Ix4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::activations::Activation;
use crate::core::graph::{GraphContainer, VariableSpec};
use crate::core::initializers::Initializer;
use crate::core::layers::{bias_name, kernel_name, LayerCache};
use crate::core::regularizers::Regularizer;
use crate::core::shape::{conv_axis_padding, conv_output_extent, deconv_output_extent, ConvPadding, Shape};
use crate::error::{ModelError, Result};

/// 1-D convolution over `(batch, steps, channels)` input.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv1D {
    pub filters: usize,
    pub kernel_size: usize,
    pub strides: usize,
    pub dilations: usize,
    pub padding: ConvPadding,
    pub activation: Activation,
    pub use_bias: bool,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub kernel_regularizer: Regularizer,
    pub bias_regularizer: Regularizer,
}

impl Conv1D {
    pub fn new(filters: usize, kernel_size: usize, activation: Activation) -> Self {
        Conv1D {
            filters,
            kernel_size,
            strides: 1,
            dilations: 1,
            padding: ConvPadding::Valid,
            activation,
            use_bias: true,
            kernel_initializer: Initializer::glorot_uniform(),
            bias_initializer: Initializer::Zeros,
            kernel_regularizer: Regularizer::None,
            bias_regularizer: Regularizer::None,
        }
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if input.rank() != 3 {
            return Err(ModelError::Shape(format!(
                "1-D convolution expects a rank-3 input, got {}",
                input
            )));
        }
        let steps = conv_output_extent(
            input.dim(1)?,
            self.kernel_size,
            self.padding,
            self.strides,
            self.dilations,
        )?;
        Ok(Shape::feature(&[steps, self.filters]))
    }

    pub fn specs(&self, name: &str, input: &Shape) -> Result<Vec<VariableSpec>> {
        let channels = input.dim(2)?;
        let fan_in = channels * self.kernel_size;
        let fan_out = self.filters * self.kernel_size;
        let mut specs = vec![VariableSpec {
            name: kernel_name(name),
            shape: vec![self.kernel_size, channels, self.filters],
            init: self.kernel_initializer.clone(),
            trainable: true,
            fan_in,
            fan_out,
        }];
        if self.use_bias {
            specs.push(VariableSpec {
                name: bias_name(name),
                shape: vec![self.filters],
                init: self.bias_initializer.clone(),
                trainable: true,
                fan_in,
                fan_out,
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
        let x = as_3d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = w
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let (batch, steps, channels) = x.dim();
        let out_steps =
            conv_output_extent(steps, self.kernel_size, self.padding, self.strides, self.dilations)?;
        let (pad_before, _) =
            conv_axis_padding(steps, self.kernel_size, self.padding, self.strides, self.dilations)?;

        let mut z = Array3::<f64>::zeros((batch, out_steps, self.filters));
        for bi in 0..batch {
            for oi in 0..out_steps {
                for ki in 0..self.kernel_size {
                    let ii = (oi * self.strides + ki * self.dilations) as isize - pad_before as isize;
                    if ii < 0 || ii >= steps as isize {
                        continue;
                    }
                    for ci in 0..channels {
                        let xv = x[[bi, ii as usize, ci]];
                        for fi in 0..self.filters {
                            z[[bi, oi, fi]] += xv * w[[ki, ci, fi]];
                        }
                    }
                }
            }
        }
        if self.use_bias {
            let b = bias_view(vars, name)?;
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
            return Err(ModelError::Internal("conv backward without cached pre-activation"));
        };
        let dz = self.activation.backward(z, grad)?;
        let dz = dz
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let x = as_3d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = w
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let (batch, steps, channels) = x.dim();
        let out_steps = dz.dim().1;
        let (pad_before, _) =
            conv_axis_padding(steps, self.kernel_size, self.padding, self.strides, self.dilations)?;

        let mut dw = Array3::<f64>::zeros(w.dim());
        let mut dx = Array3::<f64>::zeros(x.dim());
        for bi in 0..batch {
            for oi in 0..out_steps {
                for ki in 0..self.kernel_size {
                    let ii = (oi * self.strides + ki * self.dilations) as isize - pad_before as isize;
                    if ii < 0 || ii >= steps as isize {
                        continue;
                    }
                    for ci in 0..channels {
                        let xv = x[[bi, ii as usize, ci]];
                        for fi in 0..self.filters {
                            let d = dz[[bi, oi, fi]];
                            dw[[ki, ci, fi]] += xv * d;
                            dx[[bi, ii as usize, ci]] += w[[ki, ci, fi]] * d;
                        }
                    }
                }
            }
        }

        let mut grads = vec![(kernel_name(name), dw.into_dyn())];
        if self.use_bias {
            let db = dz.sum_axis(Axis(0)).sum_axis(Axis(0));
            grads.push((bias_name(name), db.into_dyn()));
        }
        Ok((grads, vec![dx.into_dyn()]))
    }
}

/// 2-D convolution over `(batch, rows, cols, channels)` input.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2D {
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub strides: (usize, usize),
    pub dilations: (usize, usize),
    pub padding: ConvPadding,
    pub activation: Activation,
    pub use_bias: bool,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub kernel_regularizer: Regularizer,
    pub bias_regularizer: Regularizer,
}

impl Conv2D {
    pub fn new(filters: usize, kernel_size: (usize, usize), activation: Activation) -> Self {
        Conv2D {
            filters,
            kernel_size,
            strides: (1, 1),
            dilations: (1, 1),
            padding: ConvPadding::Valid,
            activation,
            use_bias: true,
            kernel_initializer: Initializer::glorot_uniform(),
            bias_initializer: Initializer::Zeros,
            kernel_regularizer: Regularizer::None,
            bias_regularizer: Regularizer::None,
        }
    }

    fn spatial(&self, input: &Shape) -> Result<(usize, usize, usize)> {
        if input.rank() != 4 {
            return Err(ModelError::Shape(format!(
                "2-D convolution expects a rank-4 input, got {}",
                input
            )));
        }
        Ok((input.dim(1)?, input.dim(2)?, input.dim(3)?))
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let (rows, cols, _) = self.spatial(input)?;
        let out_rows = conv_output_extent(
            rows,
            self.kernel_size.0,
            self.padding,
            self.strides.0,
            self.dilations.0,
        )?;
        let out_cols = conv_output_extent(
            cols,
            self.kernel_size.1,
            self.padding,
            self.strides.1,
            self.dilations.1,
        )?;
        Ok(Shape::feature(&[out_rows, out_cols, self.filters]))
    }

    pub fn specs(&self, name: &str, input: &Shape) -> Result<Vec<VariableSpec>> {
        let (_, _, channels) = self.spatial(input)?;
        let receptive = self.kernel_size.0 * self.kernel_size.1;
        let fan_in = channels * receptive;
        let fan_out = self.filters * receptive;
        let mut specs = vec![VariableSpec {
            name: kernel_name(name),
            shape: vec![self.kernel_size.0, self.kernel_size.1, channels, self.filters],
            init: self.kernel_initializer.clone(),
            trainable: true,
            fan_in,
            fan_out,
        }];
        if self.use_bias {
            specs.push(VariableSpec {
                name: bias_name(name),
                shape: vec![self.filters],
                init: self.bias_initializer.clone(),
                trainable: true,
                fan_in,
                fan_out,
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
        let x = as_4d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = as_kernel_4d(w)?;
        let (batch, rows, cols, _) = x.dim();
        let out_rows = conv_output_extent(
            rows,
            self.kernel_size.0,
            self.padding,
            self.strides.0,
            self.dilations.0,
        )?;
        let out_cols = conv_output_extent(
            cols,
            self.kernel_size.1,
            self.padding,
            self.strides.1,
            self.dilations.1,
        )?;
        let (pad_rows, _) = conv_axis_padding(
            rows,
            self.kernel_size.0,
            self.padding,
            self.strides.0,
            self.dilations.0,
        )?;
        let (pad_cols, _) = conv_axis_padding(
            cols,
            self.kernel_size.1,
            self.padding,
            self.strides.1,
            self.dilations.1,
        )?;

        // each sample is independent; the engine is invoked once per batch,
        // so parallelism stays inside this single call
        let samples: Vec<Array3<f64>> = (0..batch)
            .into_par_iter()
            .map(|bi| {
                self.forward_sample(
                    &x.index_axis(Axis(0), bi),
                    &w,
                    (out_rows, out_cols),
                    (pad_rows, pad_cols),
                )
            })
            .collect();
        let views: Vec<_> = samples.iter().map(|s| s.view()).collect();
        let mut z = ndarray::stack(Axis(0), &views).map_err(|e| ModelError::Shape(e.to_string()))?;
        if self.use_bias {
            let b = bias_view(vars, name)?;
            z += &b;
        }
        let z = z.into_dyn();
        let a = self.activation.forward(&z)?;
        Ok((a, Some(LayerCache::PreAct(z))))
    }

    fn forward_sample(
        &self,
        x: &ArrayView3<f64>,
        w: &ArrayView4<f64>,
        (out_rows, out_cols): (usize, usize),
        (pad_rows, pad_cols): (usize, usize),
    ) -> Array3<f64> {
        let (rows, cols, channels) = x.dim();
        let mut z = Array3::<f64>::zeros((out_rows, out_cols, self.filters));
        for oi in 0..out_rows {
            for oj in 0..out_cols {
                for ki in 0..self.kernel_size.0 {
                    let ii =
                        (oi * self.strides.0 + ki * self.dilations.0) as isize - pad_rows as isize;
                    if ii < 0 || ii >= rows as isize {
                        continue;
                    }
                    for kj in 0..self.kernel_size.1 {
                        let jj = (oj * self.strides.1 + kj * self.dilations.1) as isize
                            - pad_cols as isize;
                        if jj < 0 || jj >= cols as isize {
                            continue;
                        }
                        for ci in 0..channels {
                            let xv = x[[ii as usize, jj as usize, ci]];
                            for fi in 0..self.filters {
                                z[[oi, oj, fi]] += xv * w[[ki, kj, ci, fi]];
                            }
                        }
                    }
                }
            }
        }
        z
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
            return Err(ModelError::Internal("conv backward without cached pre-activation"));
        };
        let dz = self.activation.backward(z, grad)?;
        let dz = dz
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let x = as_4d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = as_kernel_4d(w)?;
        let (batch, rows, cols, channels) = x.dim();
        let (_, out_rows, out_cols, _) = dz.dim();
        let (pad_rows, _) = conv_axis_padding(
            rows,
            self.kernel_size.0,
            self.padding,
            self.strides.0,
            self.dilations.0,
        )?;
        let (pad_cols, _) = conv_axis_padding(
            cols,
            self.kernel_size.1,
            self.padding,
            self.strides.1,
            self.dilations.1,
        )?;

        let mut dw = Array4::<f64>::zeros(w.dim());
        let mut dx = Array4::<f64>::zeros(x.dim());
        for bi in 0..batch {
            for oi in 0..out_rows {
                for oj in 0..out_cols {
                    for ki in 0..self.kernel_size.0 {
                        let ii = (oi * self.strides.0 + ki * self.dilations.0) as isize
                            - pad_rows as isize;
                        if ii < 0 || ii >= rows as isize {
                            continue;
                        }
                        for kj in 0..self.kernel_size.1 {
                            let jj = (oj * self.strides.1 + kj * self.dilations.1) as isize
                                - pad_cols as isize;
                            if jj < 0 || jj >= cols as isize {
                                continue;
                            }
                            for ci in 0..channels {
                                let xv = x[[bi, ii as usize, jj as usize, ci]];
                                for fi in 0..self.filters {
                                    let d = dz[[bi, oi, oj, fi]];
                                    dw[[ki, kj, ci, fi]] += xv * d;
                                    dx[[bi, ii as usize, jj as usize, ci]] +=
                                        w[[ki, kj, ci, fi]] * d;
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut grads = vec![(kernel_name(name), dw.into_dyn())];
        if self.use_bias {
            let db = dz.sum_axis(Axis(0)).sum_axis(Axis(0)).sum_axis(Axis(0));
            grads.push((bias_name(name), db.into_dyn()));
        }
        Ok((grads, vec![dx.into_dyn()]))
    }
}

/// Transposed 2-D convolution: solves the pre-image of [`Conv2D`] shape
/// inference, scattering each input cell across the output.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2DTranspose {
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub strides: (usize, usize),
    pub dilations: (usize, usize),
    pub padding: ConvPadding,
    pub output_padding: Option<(usize, usize)>,
    pub activation: Activation,
    pub use_bias: bool,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub kernel_regularizer: Regularizer,
    pub bias_regularizer: Regularizer,
}

impl Conv2DTranspose {
    pub fn new(filters: usize, kernel_size: (usize, usize), activation: Activation) -> Self {
        Conv2DTranspose {
            filters,
            kernel_size,
            strides: (1, 1),
            dilations: (1, 1),
            padding: ConvPadding::Valid,
            output_padding: None,
            activation,
            use_bias: true,
            kernel_initializer: Initializer::glorot_uniform(),
            bias_initializer: Initializer::Zeros,
            kernel_regularizer: Regularizer::None,
            bias_regularizer: Regularizer::None,
        }
    }

    fn spatial(&self, input: &Shape) -> Result<(usize, usize, usize)> {
        if input.rank() != 4 {
            return Err(ModelError::Shape(format!(
                "transposed convolution expects a rank-4 input, got {}",
                input
            )));
        }
        Ok((input.dim(1)?, input.dim(2)?, input.dim(3)?))
    }

    fn out_extents(&self, rows: usize, cols: usize) -> Result<(usize, usize)> {
        let out_rows = deconv_output_extent(
            rows,
            self.kernel_size.0,
            self.padding,
            self.strides.0,
            self.dilations.0,
            self.output_padding.map(|p| p.0),
        )?;
        let out_cols = deconv_output_extent(
            cols,
            self.kernel_size.1,
            self.padding,
            self.strides.1,
            self.dilations.1,
            self.output_padding.map(|p| p.1),
        )?;
        Ok((out_rows, out_cols))
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let (rows, cols, _) = self.spatial(input)?;
        let (out_rows, out_cols) = self.out_extents(rows, cols)?;
        Ok(Shape::feature(&[out_rows, out_cols, self.filters]))
    }

    pub fn specs(&self, name: &str, input: &Shape) -> Result<Vec<VariableSpec>> {
        let (_, _, channels) = self.spatial(input)?;
        let receptive = self.kernel_size.0 * self.kernel_size.1;
        let fan_in = channels * receptive;
        let fan_out = self.filters * receptive;
        // transposed kernels store (rows, cols, out_channels, in_channels)
        let mut specs = vec![VariableSpec {
            name: kernel_name(name),
            shape: vec![self.kernel_size.0, self.kernel_size.1, self.filters, channels],
            init: self.kernel_initializer.clone(),
            trainable: true,
            fan_in,
            fan_out,
        }];
        if self.use_bias {
            specs.push(VariableSpec {
                name: bias_name(name),
                shape: vec![self.filters],
                init: self.bias_initializer.clone(),
                trainable: true,
                fan_in,
                fan_out,
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
        let x = as_4d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = as_kernel_4d(w)?;
        let (batch, rows, cols, channels) = x.dim();
        let (out_rows, out_cols) = self.out_extents(rows, cols)?;
        // padding of the forward conv mapping output back to input
        let (pad_rows, _) = conv_axis_padding(
            out_rows,
            self.kernel_size.0,
            self.padding,
            self.strides.0,
            self.dilations.0,
        )?;
        let (pad_cols, _) = conv_axis_padding(
            out_cols,
            self.kernel_size.1,
            self.padding,
            self.strides.1,
            self.dilations.1,
        )?;

        let mut z = Array4::<f64>::zeros((batch, out_rows, out_cols, self.filters));
        for bi in 0..batch {
            for ii in 0..rows {
                for jj in 0..cols {
                    for ki in 0..self.kernel_size.0 {
                        let oi = (ii * self.strides.0 + ki * self.dilations.0) as isize
                            - pad_rows as isize;
                        if oi < 0 || oi >= out_rows as isize {
                            continue;
                        }
                        for kj in 0..self.kernel_size.1 {
                            let oj = (jj * self.strides.1 + kj * self.dilations.1) as isize
                                - pad_cols as isize;
                            if oj < 0 || oj >= out_cols as isize {
                                continue;
                            }
                            for ci in 0..channels {
                                let xv = x[[bi, ii, jj, ci]];
                                for fi in 0..self.filters {
                                    z[[bi, oi as usize, oj as usize, fi]] +=
                                        xv * w[[ki, kj, fi, ci]];
                                }
                            }
                        }
                    }
                }
            }
        }
        if self.use_bias {
            let b = bias_view(vars, name)?;
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
            return Err(ModelError::Internal("conv backward without cached pre-activation"));
        };
        let dz = self.activation.backward(z, grad)?;
        let dz = dz
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let x = as_4d(x)?;
        let w = vars.data(&kernel_name(name))?;
        let w = as_kernel_4d(w)?;
        let (batch, rows, cols, channels) = x.dim();
        let (_, out_rows, out_cols, _) = dz.dim();
        let (pad_rows, _) = conv_axis_padding(
            out_rows,
            self.kernel_size.0,
            self.padding,
            self.strides.0,
            self.dilations.0,
        )?;
        let (pad_cols, _) = conv_axis_padding(
            out_cols,
            self.kernel_size.1,
            self.padding,
            self.strides.1,
            self.dilations.1,
        )?;

        let mut dw = Array4::<f64>::zeros(w.dim());
        let mut dx = Array4::<f64>::zeros(x.dim());
        for bi in 0..batch {
            for ii in 0..rows {
                for jj in 0..cols {
                    for ki in 0..self.kernel_size.0 {
                        let oi = (ii * self.strides.0 + ki * self.dilations.0) as isize
                            - pad_rows as isize;
                        if oi < 0 || oi >= out_rows as isize {
                            continue;
                        }
                        for kj in 0..self.kernel_size.1 {
                            let oj = (jj * self.strides.1 + kj * self.dilations.1) as isize
                                - pad_cols as isize;
                            if oj < 0 || oj >= out_cols as isize {
                                continue;
                            }
                            for ci in 0..channels {
                                let xv = x[[bi, ii, jj, ci]];
                                for fi in 0..self.filters {
                                    let d = dz[[bi, oi as usize, oj as usize, fi]];
                                    dw[[ki, kj, fi, ci]] += xv * d;
                                    dx[[bi, ii, jj, ci]] += w[[ki, kj, fi, ci]] * d;
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut grads = vec![(kernel_name(name), dw.into_dyn())];
        if self.use_bias {
            let db = dz.sum_axis(Axis(0)).sum_axis(Axis(0)).sum_axis(Axis(0));
            grads.push((bias_name(name), db.into_dyn()));
        }
        Ok((grads, vec![dx.into_dyn()]))
    }
}

fn as_3d(x: &ArrayD<f64>) -> Result<ndarray::ArrayView3<'_, f64>> {
    x.view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| ModelError::Shape(e.to_string()))
}

fn as_4d(x: &ArrayD<f64>) -> Result<ArrayView4<'_, f64>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| ModelError::Shape(e.to_string()))
}

fn as_kernel_4d(w: &ArrayD<f64>) -> Result<ArrayView4<'_, f64>> {
    w.view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| ModelError::Shape(e.to_string()))
}

fn bias_view<'a>(vars: &'a GraphContainer, name: &str) -> Result<ndarray::ArrayView1<'a, f64>> {
    vars.data(&bias_name(name))?
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| ModelError::Shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::GraphContainer;

    fn build(layer: &str, specs: Vec<crate::core::graph::VariableSpec>) -> GraphContainer {
        let mut vars = GraphContainer::new();
        for spec in specs {
            vars.add_variable(spec, layer).unwrap();
        }
        vars.initialize_variables();
        vars
    }

    #[test]
    fn valid_conv_sums_windows_with_unit_kernel() {
        let mut conv = Conv2D::new(1, (2, 2), Activation::Linear);
        conv.kernel_initializer = Initializer::Ones;
        let input = Shape::feature(&[3, 3, 1]);
        let vars = build("conv_1", conv.specs("conv_1", &input).unwrap());
        let x = Array4::from_shape_vec((1, 3, 3, 1), (1..=9).map(|v| v as f64).collect())
            .unwrap()
            .into_dyn();
        let (out, cache) = conv.forward("conv_1", &vars, &x).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 1]);
        assert_eq!(out[[0, 0, 0, 0]], 12.0);
        assert_eq!(out[[0, 0, 1, 0]], 16.0);
        assert_eq!(out[[0, 1, 0, 0]], 24.0);
        assert_eq!(out[[0, 1, 1, 0]], 28.0);
        assert!(matches!(cache, Some(LayerCache::PreAct(_))));
    }

    #[test]
    fn same_padding_preserves_spatial_extents() {
        let mut conv = Conv2D::new(2, (3, 3), Activation::Relu);
        conv.padding = ConvPadding::Same;
        let input = Shape::feature(&[5, 5, 3]);
        assert_eq!(
            conv.output_shape(&input).unwrap(),
            Shape::feature(&[5, 5, 2])
        );
        let vars = build("conv_1", conv.specs("conv_1", &input).unwrap());
        let x = Array4::<f64>::ones((2, 5, 5, 3)).into_dyn();
        let (out, _) = conv.forward("conv_1", &vars, &x).unwrap();
        assert_eq!(out.shape(), &[2, 5, 5, 2]);
    }

    #[test]
    fn conv_backward_matches_input_and_kernel_shapes() {
        let conv = Conv2D::new(2, (2, 2), Activation::Linear);
        let input = Shape::feature(&[4, 4, 1]);
        let vars = build("conv_1", conv.specs("conv_1", &input).unwrap());
        let x = Array4::<f64>::ones((1, 4, 4, 1)).into_dyn();
        let (out, cache) = conv.forward("conv_1", &vars, &x).unwrap();
        let grad = ArrayD::ones(out.raw_dim());
        let (pgrads, igrads) = conv
            .backward("conv_1", &vars, &x, cache.as_ref(), &grad)
            .unwrap();
        assert_eq!(pgrads.len(), 2);
        assert_eq!(pgrads[0].1.shape(), &[2, 2, 1, 2]);
        assert_eq!(pgrads[1].1.shape(), &[2]);
        assert_eq!(igrads[0].shape(), x.shape());
    }

    #[test]
    fn transpose_scatters_unit_kernel() {
        let mut conv = Conv2DTranspose::new(1, (2, 2), Activation::Linear);
        conv.kernel_initializer = Initializer::Ones;
        let input = Shape::feature(&[2, 2, 1]);
        assert_eq!(
            conv.output_shape(&input).unwrap(),
            Shape::feature(&[3, 3, 1])
        );
        let vars = build("deconv_1", conv.specs("deconv_1", &input).unwrap());
        let x = Array4::<f64>::ones((1, 2, 2, 1)).into_dyn();
        let (out, _) = conv.forward("deconv_1", &vars, &x).unwrap();
        assert_eq!(out.shape(), &[1, 3, 3, 1]);
        assert_eq!(out[[0, 0, 0, 0]], 1.0);
        assert_eq!(out[[0, 0, 1, 0]], 2.0);
        assert_eq!(out[[0, 1, 1, 0]], 4.0);
        assert_eq!(out.sum(), 16.0);
    }

    #[test]
    fn conv1d_shapes() {
        let conv = Conv1D::new(4, 3, Activation::Linear);
        let input = Shape::feature(&[10, 2]);
        assert_eq!(
            conv.output_shape(&input).unwrap(),
            Shape::feature(&[8, 4])
        );
        let vars = build("conv1d_1", conv.specs("conv1d_1", &input).unwrap());
        let x = ndarray::Array3::<f64>::ones((1, 10, 2)).into_dyn();
        let (out, _) = conv.forward("conv1d_1", &vars, &x).unwrap();
        assert_eq!(out.shape(), &[1, 8, 4]);
    }
}
