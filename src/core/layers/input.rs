use serde::{Deserialize, Serialize};

use crate::core::shape::Shape;
use crate::error::{ModelError, Result};

/// Root of the layer graph: declares the per-example feature extents the
/// model is fed with.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Input {
    pub dims: Vec<usize>,
}

impl Input {
    pub fn new(dims: &[usize]) -> Self {
        Input { dims: dims.to_vec() }
    }

    pub fn output_shape(&self) -> Result<Shape> {
        if self.dims.is_empty() || self.dims.contains(&0) {
            return Err(ModelError::Shape(format!(
                "input dims must be positive, got {:?}",
                self.dims
            )));
        }
        Ok(Shape::feature(&self.dims))
    }
}
