use ndarray::{Array2, Array4, ArrayD, Ix4};
use serde::{Deserialize, Serialize};

use crate::core::layers::LayerCache;
use crate::core::shape::{conv_axis_padding, conv_output_extent, ConvPadding, Shape};
use crate::error::{ModelError, Result};

/// Window pooling over `(batch, rows, cols, channels)` input; the max/avg
/// reduction is picked by the layer kind.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Pool2D {
    pub pool_size: (usize, usize),
    pub strides: (usize, usize),
    pub padding: ConvPadding,
}

impl Pool2D {
    pub fn new(pool_size: (usize, usize), strides: (usize, usize)) -> Self {
        Pool2D {
            pool_size,
            strides,
            padding: ConvPadding::Valid,
        }
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if input.rank() != 4 {
            return Err(ModelError::Shape(format!(
                "2-D pooling expects a rank-4 input, got {}",
                input
            )));
        }
        let out_rows =
            conv_output_extent(input.dim(1)?, self.pool_size.0, self.padding, self.strides.0, 1)?;
        let out_cols =
            conv_output_extent(input.dim(2)?, self.pool_size.1, self.padding, self.strides.1, 1)?;
        Ok(Shape::feature(&[out_rows, out_cols, input.dim(3)?]))
    }

    fn geometry(&self, rows: usize, cols: usize) -> Result<(usize, usize, usize, usize)> {
        let out_rows = conv_output_extent(rows, self.pool_size.0, self.padding, self.strides.0, 1)?;
        let out_cols = conv_output_extent(cols, self.pool_size.1, self.padding, self.strides.1, 1)?;
        let (pad_rows, _) = conv_axis_padding(rows, self.pool_size.0, self.padding, self.strides.0, 1)?;
        let (pad_cols, _) = conv_axis_padding(cols, self.pool_size.1, self.padding, self.strides.1, 1)?;
        Ok((out_rows, out_cols, pad_rows, pad_cols))
    }

    pub fn forward_max(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let x = as_4d(x)?;
        let (batch, rows, cols, channels) = x.dim();
        let (out_rows, out_cols, pad_rows, pad_cols) = self.geometry(rows, cols)?;
        let mut out = Array4::<f64>::zeros((batch, out_rows, out_cols, channels));
        for bi in 0..batch {
            for oi in 0..out_rows {
                for oj in 0..out_cols {
                    for ci in 0..channels {
                        let mut best = f64::NEG_INFINITY;
                        for ki in 0..self.pool_size.0 {
                            let ii = (oi * self.strides.0 + ki) as isize - pad_rows as isize;
                            if ii < 0 || ii >= rows as isize {
                                continue;
                            }
                            for kj in 0..self.pool_size.1 {
                                let jj = (oj * self.strides.1 + kj) as isize - pad_cols as isize;
                                if jj < 0 || jj >= cols as isize {
                                    continue;
                                }
                                best = best.max(x[[bi, ii as usize, jj as usize, ci]]);
                            }
                        }
                        out[[bi, oi, oj, ci]] = best;
                    }
                }
            }
        }
        Ok((out.into_dyn(), None))
    }

    /// Routes the gradient to the first window cell matching the pooled
    /// maximum.
    pub fn backward_max(
        &self,
        x: &ArrayD<f64>,
        output: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let x = as_4d(x)?;
        let out = output
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let g = grad
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let (batch, rows, cols, channels) = x.dim();
        let (out_rows, out_cols, pad_rows, pad_cols) = self.geometry(rows, cols)?;
        let mut dx = Array4::<f64>::zeros(x.dim());
        for bi in 0..batch {
            for oi in 0..out_rows {
                for oj in 0..out_cols {
                    for ci in 0..channels {
                        let target = out[[bi, oi, oj, ci]];
                        'window: for ki in 0..self.pool_size.0 {
                            let ii = (oi * self.strides.0 + ki) as isize - pad_rows as isize;
                            if ii < 0 || ii >= rows as isize {
                                continue;
                            }
                            for kj in 0..self.pool_size.1 {
                                let jj = (oj * self.strides.1 + kj) as isize - pad_cols as isize;
                                if jj < 0 || jj >= cols as isize {
                                    continue;
                                }
                                if x[[bi, ii as usize, jj as usize, ci]] == target {
                                    dx[[bi, ii as usize, jj as usize, ci]] += g[[bi, oi, oj, ci]];
                                    break 'window;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok((Vec::new(), vec![dx.into_dyn()]))
    }

    pub fn forward_avg(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let x = as_4d(x)?;
        let (batch, rows, cols, channels) = x.dim();
        let (out_rows, out_cols, pad_rows, pad_cols) = self.geometry(rows, cols)?;
        let mut out = Array4::<f64>::zeros((batch, out_rows, out_cols, channels));
        for bi in 0..batch {
            for oi in 0..out_rows {
                for oj in 0..out_cols {
                    for ci in 0..channels {
                        let mut sum = 0.0;
                        let mut count = 0usize;
                        for ki in 0..self.pool_size.0 {
                            let ii = (oi * self.strides.0 + ki) as isize - pad_rows as isize;
                            if ii < 0 || ii >= rows as isize {
                                continue;
                            }
                            for kj in 0..self.pool_size.1 {
                                let jj = (oj * self.strides.1 + kj) as isize - pad_cols as isize;
                                if jj < 0 || jj >= cols as isize {
                                    continue;
                                }
                                sum += x[[bi, ii as usize, jj as usize, ci]];
                                count += 1;
                            }
                        }
                        out[[bi, oi, oj, ci]] = sum / count.max(1) as f64;
                    }
                }
            }
        }
        Ok((out.into_dyn(), None))
    }

    /// Distributes the gradient evenly over the cells each window covered.
    pub fn backward_avg(
        &self,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let x = as_4d(x)?;
        let g = grad
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let (batch, rows, cols, channels) = x.dim();
        let (out_rows, out_cols, pad_rows, pad_cols) = self.geometry(rows, cols)?;
        let mut dx = Array4::<f64>::zeros(x.dim());
        for bi in 0..batch {
            for oi in 0..out_rows {
                for oj in 0..out_cols {
                    let mut cells: Vec<(usize, usize)> = Vec::new();
                    for ki in 0..self.pool_size.0 {
                        let ii = (oi * self.strides.0 + ki) as isize - pad_rows as isize;
                        if ii < 0 || ii >= rows as isize {
                            continue;
                        }
                        for kj in 0..self.pool_size.1 {
                            let jj = (oj * self.strides.1 + kj) as isize - pad_cols as isize;
                            if jj < 0 || jj >= cols as isize {
                                continue;
                            }
                            cells.push((ii as usize, jj as usize));
                        }
                    }
                    if cells.is_empty() {
                        continue;
                    }
                    let share = 1.0 / cells.len() as f64;
                    for ci in 0..channels {
                        let d = g[[bi, oi, oj, ci]] * share;
                        for &(ii, jj) in &cells {
                            dx[[bi, ii, jj, ci]] += d;
                        }
                    }
                }
            }
        }
        Ok((Vec::new(), vec![dx.into_dyn()]))
    }
}

/// Collapses the spatial axes to their mean, `(batch, rows, cols, channels)`
/// to `(batch, channels)`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GlobalAvgPool2D;

impl GlobalAvgPool2D {
    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if input.rank() != 4 {
            return Err(ModelError::Shape(format!(
                "global pooling expects a rank-4 input, got {}",
                input
            )));
        }
        Ok(Shape::feature(&[input.dim(3)?]))
    }

    pub fn forward(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let x = as_4d(x)?;
        let (batch, rows, cols, channels) = x.dim();
        let area = (rows * cols) as f64;
        let mut out = Array2::<f64>::zeros((batch, channels));
        for bi in 0..batch {
            for ii in 0..rows {
                for jj in 0..cols {
                    for ci in 0..channels {
                        out[[bi, ci]] += x[[bi, ii, jj, ci]];
                    }
                }
            }
        }
        out /= area;
        Ok((out.into_dyn(), None))
    }

    pub fn backward(
        &self,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let x = as_4d(x)?;
        let g = grad
            .view()
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let (batch, rows, cols, channels) = x.dim();
        let area = (rows * cols) as f64;
        let mut dx = Array4::<f64>::zeros(x.dim());
        for bi in 0..batch {
            for ii in 0..rows {
                for jj in 0..cols {
                    for ci in 0..channels {
                        dx[[bi, ii, jj, ci]] = g[[bi, ci]] / area;
                    }
                }
            }
        }
        Ok((Vec::new(), vec![dx.into_dyn()]))
    }
}

fn as_4d(x: &ArrayD<f64>) -> Result<ndarray::ArrayView4<'_, f64>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| ModelError::Shape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn max_pool_picks_window_maxima() {
        let pool = Pool2D::new((2, 2), (2, 2));
        let x = Array4::from_shape_vec(
            (1, 2, 4, 1),
            vec![1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0],
        )
        .unwrap()
        .into_dyn();
        let (out, _) = pool.forward_max(&x).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 1]);
        assert_eq!(out[[0, 0, 0, 0]], 4.0);
        assert_eq!(out[[0, 0, 1, 0]], 8.0);
    }

    #[test]
    fn max_pool_backward_routes_to_the_argmax() {
        let pool = Pool2D::new((2, 2), (2, 2));
        let x = Array4::from_shape_vec(
            (1, 2, 2, 1),
            vec![1.0, 2.0, 3.0, 4.0],
        )
        .unwrap()
        .into_dyn();
        let (out, _) = pool.forward_max(&x).unwrap();
        let grad = ArrayD::ones(out.raw_dim());
        let (_, grads) = pool.backward_max(&x, &out, &grad).unwrap();
        assert_eq!(grads[0][[0, 0, 0, 0]], 0.0);
        assert_eq!(grads[0][[0, 1, 1, 0]], 1.0);
    }

    #[test]
    fn avg_pool_means_windows() {
        let pool = Pool2D::new((2, 2), (2, 2));
        let x = Array4::from_shape_vec(
            (1, 2, 2, 1),
            vec![1.0, 2.0, 3.0, 4.0],
        )
        .unwrap()
        .into_dyn();
        let (out, _) = pool.forward_avg(&x).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 2.5);
        let grad = ArrayD::ones(out.raw_dim());
        let (_, grads) = pool.backward_avg(&x, &grad).unwrap();
        assert!(grads[0].iter().all(|&v| (v - 0.25).abs() < 1e-12));
    }

    #[test]
    fn global_average_collapses_spatial_axes() {
        let g = GlobalAvgPool2D;
        assert_eq!(
            g.output_shape(&Shape::feature(&[4, 4, 3])).unwrap(),
            Shape::feature(&[3])
        );
        let x = Array4::<f64>::from_elem((2, 4, 4, 3), 2.0).into_dyn();
        let (out, _) = g.forward(&x).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert!(out.iter().all(|&v| (v - 2.0).abs() < 1e-12));
    }
}
