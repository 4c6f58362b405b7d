//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or parsing wire documents.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("invalid UTF-8 in document")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("'task' must be a not empty string")]
    TaskMissing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::DocumentTooLarge {
            size: 300000,
            max: 262144,
        };
        assert!(err.to_string().contains("300000"));
        assert!(err.to_string().contains("262144"));

        assert!(ProtocolError::TaskMissing.to_string().contains("task"));
    }
}
