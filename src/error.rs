use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnakeError {
    #[error("replay memory holds {available} transitions, batch needs {requested}")]
    InsufficientData { requested: usize, available: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("layer {layer} shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        layer: usize,
        expected: String,
        got: String,
    },

    #[error("non-finite value detected after learning step {step}: {what}")]
    NumericalInstability { step: u64, what: &'static str },

    #[error("checkpoint {path:?} is invalid: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SnakeError>;
