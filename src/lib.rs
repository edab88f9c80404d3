pub mod config;
pub mod core;
pub mod dataset;
pub mod error;
pub mod history;
pub mod models;
pub mod prelude;
pub mod utils;

// Re-export types
pub use crate::core::{Activation, Initializer, Layer, LayerKind, Loss, Metric, Optimizer, Shape};
pub use crate::error::{ModelError, Result};
pub use crate::models::{Model, ModelState, SaveFormat, WritingMode};
