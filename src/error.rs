use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use crate::models::ModelState;

#[derive(Debug)]
pub enum ModelError {
    // Config deserialization errors
    Config(String),
    UnsupportedLayer(String),
    UnsupportedActivation(String),
    UnsupportedInitializer(String),
    UnsupportedRegularizer(String),
    UnresolvedInbound { layer: String, wanted: String },

    // Shape errors
    Shape(String),
    ShapeMismatch { layer: String, detail: String },

    // Lifecycle errors
    Lifecycle { expected: ModelState, actual: ModelState, op: &'static str },

    // Persistence errors
    Persistence { path: PathBuf, detail: String },
    NameConflict(String),

    // Contract bugs that should never occur in correct calling code
    Internal(&'static str),

    // Wrapped external errors
    IoError(std::io::Error),
    JsonError(serde_json::Error),
    CsvError(csv::Error),
    GraphEncodeError(Box<bincode::ErrorKind>),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelError::Config(msg) => write!(f, "Invalid model configuration: {}", msg),
            ModelError::UnsupportedLayer(tag) => write!(f, "Unsupported layer class: {}", tag),
            ModelError::UnsupportedActivation(id) => write!(f, "Unsupported activation: {}", id),
            ModelError::UnsupportedInitializer(tag) => write!(f, "Unsupported initializer: {}", tag),
            ModelError::UnsupportedRegularizer(tag) => write!(f, "Unsupported regularizer: {}", tag),
            ModelError::UnresolvedInbound { layer, wanted } => write!(
                f,
                "Layer {} references undeclared inbound layer {}",
                layer, wanted
            ),
            ModelError::Shape(msg) => write!(f, "Shape error: {}", msg),
            ModelError::ShapeMismatch { layer, detail } => {
                write!(f, "Shape mismatch at layer {}: {}", layer, detail)
            }
            ModelError::Lifecycle { expected, actual, op } => write!(
                f,
                "Cannot {} in state {:?}: requires state {:?}",
                op, actual, expected
            ),
            ModelError::Persistence { path, detail } => {
                write!(f, "Persistence error at {}: {}", path.display(), detail)
            }
            ModelError::NameConflict(name) => {
                write!(f, "Name already registered: {}", name)
            }
            ModelError::Internal(msg) => write!(f, "Internal invariant violated: {}", msg),
            ModelError::IoError(err) => write!(f, "I/O error: {}", err),
            ModelError::JsonError(err) => write!(f, "JSON error: {}", err),
            ModelError::CsvError(err) => write!(f, "CSV error: {}", err),
            ModelError::GraphEncodeError(err) => write!(f, "Graph encoding error: {}", err),
        }
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> ModelError {
        ModelError::IoError(err)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> ModelError {
        ModelError::JsonError(err)
    }
}

impl From<csv::Error> for ModelError {
    fn from(err: csv::Error) -> ModelError {
        ModelError::CsvError(err)
    }
}

impl From<Box<bincode::ErrorKind>> for ModelError {
    fn from(err: Box<bincode::ErrorKind>) -> ModelError {
        ModelError::GraphEncodeError(err)
    }
}

impl Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
