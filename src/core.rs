// src/core.rs
pub mod activations;
pub mod graph;
pub mod initializers;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod optimizers;
pub mod regularizers;
pub mod shape;

// Re-export commonly used items
pub use activations::Activation;
pub use graph::{BuiltLayer, GraphContainer, VarKind, Variable, VariableSpec};
pub use initializers::{FanMode, Initializer, VarianceDistribution};
pub use layers::{Layer, LayerKind, Mode};
pub use losses::{criteria, Loss};
pub use metrics::Metric;
pub use optimizers::{ClipValue, Optimizer, OptimizerKind};
pub use regularizers::Regularizer;
pub use shape::{conv_output_extent, deconv_output_extent, ConvPadding, Shape};
