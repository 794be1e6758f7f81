use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperatorError {
    #[error("shape error: {0}")]
    Shape(String),

    #[error("ragged batch: {0}")]
    RaggedBatch(String),

    #[error("incompatible shapes: {0}")]
    IncompatibleShape(String),

    #[error("coordinate mismatch: {0}")]
    CoordinateMismatch(String),

    #[error("numeric failure at step {step}: loss={loss}")]
    NumericFailure { step: usize, loss: f64 },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, OperatorError>;
