use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("model unavailable: model not trained")]
    ModelUnavailable,

    #[error(
        "shape mismatch for {what}: expected {expected_rows}x{expected_cols}, got {actual_rows}x{actual_cols}"
    )]
    ShapeMismatch {
        what: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    #[error("normalizer fitted on {expected} channels applied to {actual} channels")]
    NormalizerMismatch { expected: usize, actual: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("vocabulary mismatch: expected {expected:?}, got {actual:?}")]
    VocabularyMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("empty dataset")]
    EmptyDataset,

    #[error("training diverged: {0}")]
    Diverged(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForecastError>;

impl ForecastError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }
}
