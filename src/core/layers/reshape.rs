use ndarray::{s, Array4, ArrayD, Ix4};
use serde::{Deserialize, Serialize};

use crate::core::layers::{reshape, LayerCache};
use crate::core::shape::Shape;
use crate::error::{ModelError, Result};

/// Reinterprets each example as `target` without touching values.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Reshape {
    pub target: Vec<usize>,
}

impl Reshape {
    pub fn new(target: &[usize]) -> Self {
        Reshape { target: target.to_vec() }
    }

    pub fn output_shape(&self, name: &str, input: &Shape) -> Result<Shape> {
        let target_elements: usize = self.target.iter().product();
        if self.target.is_empty() || target_elements != input.elements() {
            return Err(ModelError::ShapeMismatch {
                layer: name.to_string(),
                detail: format!(
                    "cannot reshape {} ({} elements) into {:?} ({} elements)",
                    input,
                    input.elements(),
                    self.target,
                    target_elements
                ),
            });
        }
        Ok(Shape::feature(&self.target))
    }

    pub fn forward(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let mut dims = Vec::with_capacity(self.target.len() + 1);
        dims.push(x.shape()[0]);
        dims.extend_from_slice(&self.target);
        Ok((reshape(x, &dims)?, None))
    }
}

/// Pads the spatial axes of `(batch, rows, cols, channels)` input with
/// zeros: `((top, bottom), (left, right))`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ZeroPadding2D {
    pub padding: ((usize, usize), (usize, usize)),
}

impl ZeroPadding2D {
    pub fn new(padding: ((usize, usize), (usize, usize))) -> Self {
        ZeroPadding2D { padding }
    }

    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        if input.rank() != 4 {
            return Err(ModelError::Shape(format!(
                "2-D zero padding expects a rank-4 input, got {}",
                input
            )));
        }
        let ((top, bottom), (left, right)) = self.padding;
        Ok(Shape::feature(&[
            input.dim(1)? + top + bottom,
            input.dim(2)? + left + right,
            input.dim(3)?,
        ]))
    }

    pub fn forward(&self, x: &ArrayD<f64>) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        let x = x
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let (batch, rows, cols, channels) = x.dim();
        let ((top, bottom), (left, right)) = self.padding;
        let mut out =
            Array4::<f64>::zeros((batch, rows + top + bottom, cols + left + right, channels));
        out.slice_mut(s![.., top..top + rows, left..left + cols, ..])
            .assign(&x);
        Ok((out.into_dyn(), None))
    }

    pub fn backward(
        &self,
        x: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let g = grad
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let rows = x.shape()[1];
        let cols = x.shape()[2];
        let ((top, _), (left, _)) = self.padding;
        let dx = g
            .slice(s![.., top..top + rows, left..left + cols, ..])
            .to_owned();
        Ok((Vec::new(), vec![dx.into_dyn()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_validates_element_count() {
        let r = Reshape::new(&[2, 2]);
        assert!(r.output_shape("reshape_1", &Shape::feature(&[4])).is_ok());
        let err = r.output_shape("reshape_1", &Shape::feature(&[5]));
        assert!(matches!(err, Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn zero_padding_grows_spatial_axes() {
        let z = ZeroPadding2D::new(((1, 1), (2, 0)));
        let out = z.output_shape(&Shape::feature(&[4, 4, 3])).unwrap();
        assert_eq!(out, Shape::feature(&[6, 6, 3]));
    }

    #[test]
    fn padding_round_trips_through_backward() {
        let z = ZeroPadding2D::new(((1, 0), (0, 1)));
        let x = Array4::<f64>::from_elem((1, 2, 2, 1), 3.0).into_dyn();
        let (out, _) = z.forward(&x).unwrap();
        assert_eq!(out.shape(), &[1, 3, 3, 1]);
        assert_eq!(out.sum(), 12.0);
        let (_, grads) = z.backward(&x, &out).unwrap();
        assert_eq!(grads[0], x);
    }
}
