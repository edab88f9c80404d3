use ndarray::{Array2, ArrayView1};

use crate::error::{ModelError, Result};

/// Collaborator interface the training loop consumes: indexed access to
/// feature and one-hot label rows. Decoding/augmentation happen upstream.
pub trait Dataset {
    fn size(&self) -> usize;
    fn x(&self, index: usize) -> ArrayView1<'_, f64>;
    fn y(&self, index: usize) -> ArrayView1<'_, f64>;
}

/// In-memory dataset over pre-decoded buffers; features are flattened
/// row-major per example.
pub struct TensorDataset {
    x: Array2<f64>,
    y: Array2<f64>,
}

impl TensorDataset {
    pub fn new(x: Array2<f64>, y: Array2<f64>) -> Result<Self> {
        if x.nrows() != y.nrows() {
            return Err(ModelError::Shape(format!(
                "feature rows {} don't match label rows {}",
                x.nrows(),
                y.nrows()
            )));
        }
        Ok(TensorDataset { x, y })
    }
}

impl Dataset for TensorDataset {
    fn size(&self) -> usize {
        self.x.nrows()
    }

    fn x(&self, index: usize) -> ArrayView1<'_, f64> {
        self.x.row(index)
    }

    fn y(&self, index: usize) -> ArrayView1<'_, f64> {
        self.y.row(index)
    }
}

/// Fixed-size slice of a dataset, fed through the graph in one step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Array2<f64>,
    pub y: Array2<f64>,
    pub size: usize,
}

impl Batch {
    /// Buffer element counts must match the declared shapes; checked before
    /// every feed into the graph.
    pub fn check(&self, input_elements: usize, label_elements: usize) -> Result<()> {
        if self.x.len() != self.size * input_elements {
            return Err(ModelError::Shape(format!(
                "batch feature buffer holds {} values, expected {} ({} x {})",
                self.x.len(),
                self.size * input_elements,
                self.size,
                input_elements
            )));
        }
        if self.y.len() != self.size * label_elements {
            return Err(ModelError::Shape(format!(
                "batch label buffer holds {} values, expected {} ({} x {})",
                self.y.len(),
                self.size * label_elements,
                self.size,
                label_elements
            )));
        }
        Ok(())
    }
}

/// Finite, one-shot batch iterator; restart by requesting a new one. Yields
/// exactly `floor(size / batch_size)` batches, dropping a trailing partial
/// batch.
pub struct Batches<'a> {
    data: &'a dyn Dataset,
    batch_size: usize,
    cursor: usize,
}

impl<'a> Batches<'a> {
    pub fn new(data: &'a dyn Dataset, batch_size: usize) -> Self {
        Batches {
            data,
            batch_size,
            cursor: 0,
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.batch_size == 0 || self.cursor + self.batch_size > self.data.size() {
            return None;
        }
        let x_width = self.data.x(self.cursor).len();
        let y_width = self.data.y(self.cursor).len();
        let mut x = Array2::zeros((self.batch_size, x_width));
        let mut y = Array2::zeros((self.batch_size, y_width));
        for row in 0..self.batch_size {
            x.row_mut(row).assign(&self.data.x(self.cursor + row));
            y.row_mut(row).assign(&self.data.y(self.cursor + row));
        }
        self.cursor += self.batch_size;
        Some(Batch {
            x,
            y,
            size: self.batch_size,
        })
    }
}
