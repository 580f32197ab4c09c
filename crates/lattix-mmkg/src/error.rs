use thiserror::Error;

/// Errors that can occur in lattix-mmkg.
#[derive(Error, Debug)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Malformed benchmark file.
    #[error("parse error in {path} (line {line}): {message}")]
    Parse {
        /// File being read.
        path: String,
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },
    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Entity id outside the vocabulary.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    /// Relation id outside the vocabulary.
    #[error("Relation not found: {0}")]
    RelationNotFound(String),
    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Training error.
    #[error("training error: {0}")]
    Training(String),
}

/// Result type alias for lattix-mmkg.
pub type Result<T> = std::result::Result<T, Error>;
