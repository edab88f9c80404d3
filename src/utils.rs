use ndarray::Array2;

/// Index of the largest value; ties resolve to the first occurrence.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// One-hot encodes class indices into a `(labels.len(), classes)` buffer.
pub fn one_hot(labels: &[usize], classes: usize) -> Array2<f64> {
    let mut out = Array2::zeros((labels.len(), classes));
    for (row, &label) in labels.iter().enumerate() {
        if label < classes {
            out[[row, label]] = 1.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_first_of_ties() {
        assert_eq!(argmax(&[0.1, 0.5, 0.5, 0.2]), 1);
        assert_eq!(argmax(&[3.0]), 0);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn one_hot_rows() {
        let oh = one_hot(&[2, 0], 3);
        assert_eq!(oh[[0, 2]], 1.0);
        assert_eq!(oh[[1, 0]], 1.0);
        assert_eq!(oh.sum(), 2.0);
    }
}
