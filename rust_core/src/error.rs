use thiserror::Error;

/// Errors surfaced by the experiment pipeline.
#[derive(Debug, Error)]
pub enum SlogError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{0} is not positive definite")]
    NotPositiveDefinite(&'static str),

    #[error("no finite initial point found for chain {chain} after {attempts} attempts")]
    InitializationFailed { chain: usize, attempts: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SlogError>;
