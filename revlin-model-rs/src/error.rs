//! Error types for the reversible linear-attention model.

use thiserror::Error;

/// Result type for model, loader and trainer operations.
pub type RevlinResult<T> = Result<T, RevlinError>;

/// Errors that can occur while building, feeding or training the model.
#[derive(Debug, Error)]
pub enum RevlinError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    /// Token id outside the embedding table
    #[error("Token id {token} out of range for {num_classes} classes")]
    TokenOutOfRange { token: i64, num_classes: usize },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Training error
    #[error("Training error: {0}")]
    Training(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Gradient not computed
    #[error("Gradients not computed - call loss_and_grads() first")]
    NoGradients,

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),
}

impl RevlinError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = RevlinError::shape_mismatch("[2, 16]", "[2, 15]");
        assert_eq!(
            err.to_string(),
            "Shape mismatch: expected [2, 16], got [2, 15]"
        );
    }

    #[test]
    fn test_token_out_of_range_message() {
        let err = RevlinError::TokenOutOfRange {
            token: 120,
            num_classes: 100,
        };
        assert!(err.to_string().contains("120"));
        assert!(err.to_string().contains("100"));
    }
}
