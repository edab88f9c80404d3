pub use ndarray::*;

pub use crate::error::*;

pub use crate::config::{
    functional_from_json, load_functional_config, load_sequential_config, model_to_json,
    sequential_from_json,
};
pub use crate::core::{
    Activation, ClipValue, ConvPadding, Initializer, Layer, LayerKind, Loss, Metric, Optimizer,
    OptimizerKind, Regularizer, Shape,
};
pub use crate::dataset::{Batch, Batches, Dataset, TensorDataset};
pub use crate::history::{EvaluationResult, TrainingHistory};
pub use crate::models::{Model, ModelState, SaveFormat, WritingMode};
pub use crate::utils::{argmax, one_hot};
