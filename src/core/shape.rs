use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Padding scheme for convolution and pooling windows.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvPadding {
    Valid,
    Same,
    Full,
}

/// Tensor shape with the leading batch dimension left open.
///
/// The batch axis is `None` and every feature axis is a fixed extent, so a
/// dense layer with 3 units reports `(None, 3)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Shape(Vec<Option<usize>>);

impl Shape {
    /// Builds a shape from per-example feature extents, prepending the open
    /// batch axis.
    pub fn feature(dims: &[usize]) -> Self {
        let mut v: Vec<Option<usize>> = Vec::with_capacity(dims.len() + 1);
        v.push(None);
        v.extend(dims.iter().map(|&d| Some(d)));
        Shape(v)
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    /// Fixed extents of the feature axes (everything after batch).
    pub fn feature_dims(&self) -> Vec<usize> {
        self.0.iter().skip(1).map(|d| d.unwrap_or(0)).collect()
    }

    /// Element count of one example (product of feature extents).
    pub fn elements(&self) -> usize {
        self.0.iter().skip(1).map(|d| d.unwrap_or(0)).product()
    }

    /// Fixed extent of axis `i` (batch axis is 0).
    pub fn dim(&self, i: usize) -> Result<usize> {
        match self.0.get(i) {
            Some(Some(d)) => Ok(*d),
            Some(None) => Err(ModelError::Shape(format!(
                "axis {} of {} has no fixed extent",
                i, self
            ))),
            None => Err(ModelError::Shape(format!(
                "axis {} out of range for {}",
                i, self
            ))),
        }
    }

    pub fn set_dim(&mut self, i: usize, d: usize) {
        if i < self.0.len() {
            self.0[i] = Some(d);
        }
    }

    /// Resolves a possibly-negative axis index against this shape's rank.
    pub fn resolve_axis(&self, axis: isize) -> Result<usize> {
        let rank = self.rank() as isize;
        let idx = if axis < 0 { rank + axis } else { axis };
        if idx < 0 || idx >= rank {
            return Err(ModelError::Shape(format!(
                "axis {} out of range for {}",
                axis, self
            )));
        }
        Ok(idx as usize)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match d {
                Some(d) => write!(f, "{}", d)?,
                None => write!(f, "None")?,
            }
        }
        write!(f, ")")
    }
}

fn effective_window(window: usize, dilation: usize) -> usize {
    (window - 1) * dilation + 1
}

fn check_extent_args(input: usize, window: usize, stride: usize, dilation: usize) -> Result<()> {
    if input == 0 {
        return Err(ModelError::Shape("input extent must be positive".into()));
    }
    if window == 0 || stride == 0 || dilation == 0 {
        return Err(ModelError::Shape(format!(
            "window {}, stride {} and dilation {} must all be positive",
            window, stride, dilation
        )));
    }
    Ok(())
}

/// Output extent of a convolution or pooling window along one spatial axis.
pub fn conv_output_extent(
    input: usize,
    window: usize,
    padding: ConvPadding,
    stride: usize,
    dilation: usize,
) -> Result<usize> {
    check_extent_args(input, window, stride, dilation)?;
    let eff = effective_window(window, dilation);
    match padding {
        ConvPadding::Valid => {
            if eff > input {
                return Err(ModelError::Shape(format!(
                    "effective window {} exceeds input extent {} under VALID padding",
                    eff, input
                )));
            }
            Ok((input - eff) / stride + 1)
        }
        ConvPadding::Same => Ok((input + stride - 1) / stride),
        ConvPadding::Full => Ok((input + eff - 2) / stride + 1),
    }
}

/// Pre-image extent for a transposed (backprop-input) convolution along one
/// spatial axis.
///
/// Inverts [`conv_output_extent`]; `output_padding` picks among the extents
/// consistent with the forward formula, absent it picks the smallest one.
pub fn deconv_output_extent(
    output: usize,
    window: usize,
    padding: ConvPadding,
    stride: usize,
    dilation: usize,
    output_padding: Option<usize>,
) -> Result<usize> {
    check_extent_args(output, window, stride, dilation)?;
    let extra = output_padding.unwrap_or(0);
    if extra >= stride {
        return Err(ModelError::Shape(format!(
            "output padding {} must be smaller than stride {}",
            extra, stride
        )));
    }
    let eff = effective_window(window, dilation);
    let base = match padding {
        ConvPadding::Valid => (output - 1) * stride + eff,
        ConvPadding::Same => (output - 1) * stride + 1,
        ConvPadding::Full => {
            let span = (output - 1) * stride + 2;
            if span <= eff {
                return Err(ModelError::Shape(format!(
                    "output extent {} too small to invert FULL padding with window {}",
                    output, eff
                )));
            }
            span - eff
        }
    };
    Ok(base + extra)
}

/// Zero-padding applied before and after one spatial axis for the given
/// padding scheme.
pub fn conv_axis_padding(
    input: usize,
    window: usize,
    padding: ConvPadding,
    stride: usize,
    dilation: usize,
) -> Result<(usize, usize)> {
    check_extent_args(input, window, stride, dilation)?;
    let eff = effective_window(window, dilation);
    match padding {
        ConvPadding::Valid => Ok((0, 0)),
        ConvPadding::Same => {
            let output = (input + stride - 1) / stride;
            let needed = (output - 1) * stride + eff;
            let total = needed.saturating_sub(input);
            Ok((total / 2, total - total / 2))
        }
        ConvPadding::Full => Ok((eff - 1, eff - 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_extent() {
        assert_eq!(
            conv_output_extent(28, 3, ConvPadding::Valid, 1, 1).unwrap(),
            26
        );
        assert_eq!(
            conv_output_extent(28, 3, ConvPadding::Valid, 2, 1).unwrap(),
            13
        );
        assert_eq!(
            conv_output_extent(28, 3, ConvPadding::Valid, 1, 2).unwrap(),
            24
        );
    }

    #[test]
    fn same_extent() {
        assert_eq!(
            conv_output_extent(28, 3, ConvPadding::Same, 1, 1).unwrap(),
            28
        );
        assert_eq!(
            conv_output_extent(28, 3, ConvPadding::Same, 2, 1).unwrap(),
            14
        );
        assert_eq!(
            conv_output_extent(27, 3, ConvPadding::Same, 2, 1).unwrap(),
            14
        );
    }

    #[test]
    fn full_extent() {
        assert_eq!(
            conv_output_extent(28, 3, ConvPadding::Full, 1, 1).unwrap(),
            30
        );
    }

    #[test]
    fn window_exceeding_input_fails() {
        assert!(conv_output_extent(2, 3, ConvPadding::Valid, 1, 1).is_err());
        assert!(conv_output_extent(5, 3, ConvPadding::Valid, 1, 3).is_err());
    }

    #[test]
    fn zero_extent_fails() {
        assert!(conv_output_extent(0, 3, ConvPadding::Valid, 1, 1).is_err());
        assert!(conv_output_extent(4, 3, ConvPadding::Valid, 0, 1).is_err());
    }

    #[test]
    fn valid_round_trip_with_remainder() {
        for input in 3..40usize {
            for window in 1..=3usize {
                for stride in 1..=3usize {
                    for dilation in 1..=2usize {
                        let eff = (window - 1) * dilation + 1;
                        if eff > input {
                            continue;
                        }
                        let out =
                            conv_output_extent(input, window, ConvPadding::Valid, stride, dilation)
                                .unwrap();
                        let smallest = (out - 1) * stride + eff;
                        let remainder = input - smallest;
                        let back = deconv_output_extent(
                            out,
                            window,
                            ConvPadding::Valid,
                            stride,
                            dilation,
                            Some(remainder),
                        )
                        .unwrap();
                        assert_eq!(back, input);
                    }
                }
            }
        }
    }

    #[test]
    fn deconv_defaults_to_smallest() {
        assert_eq!(
            deconv_output_extent(13, 3, ConvPadding::Valid, 2, 1, None).unwrap(),
            27
        );
        assert_eq!(
            deconv_output_extent(14, 3, ConvPadding::Same, 2, 1, None).unwrap(),
            27
        );
    }

    #[test]
    fn output_padding_must_stay_below_stride() {
        assert!(deconv_output_extent(13, 3, ConvPadding::Valid, 2, 1, Some(2)).is_err());
    }

    #[test]
    fn same_axis_padding_splits_unevenly() {
        // window 2: one spare cell lands after the data
        assert_eq!(
            conv_axis_padding(4, 2, ConvPadding::Same, 1, 1).unwrap(),
            (0, 1)
        );
        assert_eq!(
            conv_axis_padding(5, 3, ConvPadding::Same, 1, 1).unwrap(),
            (1, 1)
        );
    }

    #[test]
    fn shape_display() {
        assert_eq!(Shape::feature(&[4]).to_string(), "(None, 4)");
        assert_eq!(Shape::feature(&[28, 28, 1]).to_string(), "(None, 28, 28, 1)");
    }

    #[test]
    fn shape_accessors() {
        let s = Shape::feature(&[28, 28, 3]);
        assert_eq!(s.rank(), 4);
        assert_eq!(s.elements(), 28 * 28 * 3);
        assert_eq!(s.dim(3).unwrap(), 3);
        assert!(s.dim(0).is_err());
        assert_eq!(s.resolve_axis(-1).unwrap(), 3);
        assert!(s.resolve_axis(4).is_err());
    }
}
