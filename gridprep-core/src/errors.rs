use thiserror::Error;

/// Error type for invalid operations in the processing pipeline.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("{0}")]
    Error(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialisation(#[from] serde_json::Error),
}

/// Convenience type for `Result<T, ProcessingError>`.
pub type ProcResult<T> = Result<T, ProcessingError>;
