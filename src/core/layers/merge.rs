use ndarray::{ArrayD, Axis, Slice};
use serde::{Deserialize, Serialize};

use crate::core::layers::LayerCache;
use crate::core::shape::Shape;
use crate::error::{ModelError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOp {
    Add,
    Subtract,
    Multiply,
    Average,
    Maximum,
    Minimum,
    Concatenate,
}

impl MergeOp {
    pub fn tag(&self) -> &'static str {
        match self {
            MergeOp::Add => "Add",
            MergeOp::Subtract => "Subtract",
            MergeOp::Multiply => "Multiply",
            MergeOp::Average => "Average",
            MergeOp::Maximum => "Maximum",
            MergeOp::Minimum => "Minimum",
            MergeOp::Concatenate => "Concatenate",
        }
    }
}

/// Combines two or more inbound tensors elementwise, or stacks them along
/// `axis` for the concatenate variant.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Merge {
    pub op: MergeOp,
    pub axis: isize,
}

impl Merge {
    pub fn new(op: MergeOp) -> Self {
        Merge { op, axis: -1 }
    }

    pub fn output_shape(&self, name: &str, inputs: &[Shape]) -> Result<Shape> {
        if inputs.len() < 2 {
            return Err(ModelError::Shape(format!(
                "merge layer {} needs at least two inbound tensors, got {}",
                name,
                inputs.len()
            )));
        }
        if self.op == MergeOp::Subtract && inputs.len() != 2 {
            return Err(ModelError::Shape(format!(
                "subtract layer {} takes exactly two inbound tensors, got {}",
                name,
                inputs.len()
            )));
        }
        if self.op == MergeOp::Concatenate {
            let axis = inputs[0].resolve_axis(self.axis)?;
            if axis == 0 {
                return Err(ModelError::Shape(format!(
                    "concatenate layer {} cannot stack along the batch axis",
                    name
                )));
            }
            let mut total = 0;
            for s in inputs {
                for d in 1..s.rank() {
                    if d != axis && s.dims().get(d) != inputs[0].dims().get(d) {
                        return Err(ModelError::ShapeMismatch {
                            layer: name.to_string(),
                            detail: format!(
                                "inbound shapes {} and {} disagree off the concatenation axis",
                                inputs[0], s
                            ),
                        });
                    }
                }
                total += s.dim(axis)?;
            }
            let mut out = inputs[0].clone();
            out.set_dim(axis, total);
            return Ok(out);
        }
        for s in &inputs[1..] {
            if s != &inputs[0] {
                return Err(ModelError::ShapeMismatch {
                    layer: name.to_string(),
                    detail: format!("inbound shapes {} and {} are incompatible", inputs[0], s),
                });
            }
        }
        Ok(inputs[0].clone())
    }

    pub fn forward(
        &self,
        name: &str,
        inputs: &[&ArrayD<f64>],
    ) -> Result<(ArrayD<f64>, Option<LayerCache>)> {
        if inputs.len() < 2 {
            return Err(ModelError::Shape(format!(
                "merge layer {} needs at least two inbound tensors",
                name
            )));
        }
        let out = match self.op {
            MergeOp::Add => {
                let mut acc = inputs[0].clone();
                for x in &inputs[1..] {
                    acc += *x;
                }
                acc
            }
            MergeOp::Subtract => inputs[0] - inputs[1],
            MergeOp::Multiply => {
                let mut acc = inputs[0].clone();
                for x in &inputs[1..] {
                    acc *= *x;
                }
                acc
            }
            MergeOp::Average => {
                let mut acc = inputs[0].clone();
                for x in &inputs[1..] {
                    acc += *x;
                }
                acc / inputs.len() as f64
            }
            MergeOp::Maximum => {
                let mut acc = inputs[0].clone();
                for x in &inputs[1..] {
                    acc.zip_mut_with(x, |a, &b| *a = a.max(b));
                }
                acc
            }
            MergeOp::Minimum => {
                let mut acc = inputs[0].clone();
                for x in &inputs[1..] {
                    acc.zip_mut_with(x, |a, &b| *a = a.min(b));
                }
                acc
            }
            MergeOp::Concatenate => {
                let rank = inputs[0].ndim() as isize;
                let axis = if self.axis < 0 { rank + self.axis } else { self.axis };
                if axis <= 0 || axis >= rank {
                    return Err(ModelError::Shape(format!(
                        "concatenate layer {}: axis {} out of range for rank {}",
                        name, self.axis, rank
                    )));
                }
                let views: Vec<_> = inputs.iter().map(|x| x.view()).collect();
                ndarray::concatenate(Axis(axis as usize), &views)
                    .map_err(|e| ModelError::Shape(e.to_string()))?
            }
        };
        Ok((out, None))
    }

    pub fn backward(
        &self,
        inputs: &[&ArrayD<f64>],
        output: &ArrayD<f64>,
        grad: &ArrayD<f64>,
    ) -> Result<(Vec<(String, ArrayD<f64>)>, Vec<ArrayD<f64>>)> {
        let k = inputs.len();
        let input_grads = match self.op {
            MergeOp::Add => vec![grad.clone(); k],
            MergeOp::Subtract => vec![grad.clone(), -grad.clone()],
            MergeOp::Average => vec![grad / k as f64; k],
            MergeOp::Multiply => {
                let mut grads = Vec::with_capacity(k);
                for i in 0..k {
                    let mut others = grad.clone();
                    for (j, x) in inputs.iter().enumerate() {
                        if j != i {
                            others *= *x;
                        }
                    }
                    grads.push(others);
                }
                grads
            }
            MergeOp::Maximum | MergeOp::Minimum => inputs
                .iter()
                .map(|x| {
                    let mut masked = grad.clone();
                    ndarray::Zip::from(&mut masked).and(*x).and(output).for_each(
                        |g, &xv, &ov| {
                            if xv != ov {
                                *g = 0.0;
                            }
                        },
                    );
                    masked
                })
                .collect(),
            MergeOp::Concatenate => {
                let rank = grad.ndim() as isize;
                let axis = if self.axis < 0 { rank + self.axis } else { self.axis };
                let axis = axis as usize;
                let mut grads = Vec::with_capacity(k);
                let mut start = 0isize;
                for x in inputs {
                    let extent = x.shape()[axis] as isize;
                    let slice = grad
                        .slice_axis(Axis(axis), Slice::new(start, Some(start + extent), 1))
                        .to_owned();
                    grads.push(slice);
                    start += extent;
                }
                grads
            }
        };
        Ok((Vec::new(), input_grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn shapes(dims: &[&[usize]]) -> Vec<Shape> {
        dims.iter().map(|d| Shape::feature(d)).collect()
    }

    #[test]
    fn elementwise_merge_requires_equal_shapes() {
        let m = Merge::new(MergeOp::Add);
        assert!(m.output_shape("add_1", &shapes(&[&[4], &[4]])).is_ok());
        let err = m.output_shape("add_1", &shapes(&[&[4], &[5]]));
        assert!(matches!(err, Err(ModelError::ShapeMismatch { layer, .. }) if layer == "add_1"));
    }

    #[test]
    fn concatenate_sums_the_axis() {
        let m = Merge::new(MergeOp::Concatenate);
        let out = m.output_shape("cat", &shapes(&[&[4], &[3]])).unwrap();
        assert_eq!(out, Shape::feature(&[7]));
    }

    #[test]
    fn concatenate_rejects_off_axis_mismatch() {
        let m = Merge::new(MergeOp::Concatenate);
        let err = m.output_shape("cat", &shapes(&[&[2, 4], &[3, 3]]));
        assert!(matches!(err, Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn add_and_subtract_forward() {
        let a = arr2(&[[1.0, 2.0]]).into_dyn();
        let b = arr2(&[[10.0, 20.0]]).into_dyn();
        let (sum, _) = Merge::new(MergeOp::Add).forward("add", &[&a, &b]).unwrap();
        assert_eq!(sum, arr2(&[[11.0, 22.0]]).into_dyn());
        let (diff, _) = Merge::new(MergeOp::Subtract)
            .forward("sub", &[&a, &b])
            .unwrap();
        assert_eq!(diff, arr2(&[[-9.0, -18.0]]).into_dyn());
    }

    #[test]
    fn maximum_backward_routes_to_winners() {
        let a = arr2(&[[1.0, 5.0]]).into_dyn();
        let b = arr2(&[[3.0, 2.0]]).into_dyn();
        let m = Merge::new(MergeOp::Maximum);
        let (out, _) = m.forward("max", &[&a, &b]).unwrap();
        let grad = arr2(&[[1.0, 1.0]]).into_dyn();
        let (_, grads) = m.backward(&[&a, &b], &out, &grad).unwrap();
        assert_eq!(grads[0], arr2(&[[0.0, 1.0]]).into_dyn());
        assert_eq!(grads[1], arr2(&[[1.0, 0.0]]).into_dyn());
    }

    #[test]
    fn concatenate_backward_splits_gradient() {
        let a = arr2(&[[1.0, 2.0]]).into_dyn();
        let b = arr2(&[[3.0]]).into_dyn();
        let m = Merge::new(MergeOp::Concatenate);
        let (out, _) = m.forward("cat", &[&a, &b]).unwrap();
        let grad = arr2(&[[0.1, 0.2, 0.3]]).into_dyn();
        let (_, grads) = m.backward(&[&a, &b], &out, &grad).unwrap();
        assert_eq!(grads[0], arr2(&[[0.1, 0.2]]).into_dyn());
        assert_eq!(grads[1], arr2(&[[0.3]]).into_dyn());
    }
}
