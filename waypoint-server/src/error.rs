//! Server error types.

use thiserror::Error;

/// Errors scoped to one connection; none of them are process-fatal.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] waypoint_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("stream is not readable, remote address: '{0}'")]
    StreamNotReadable(String),

    #[error("stream is not writable, remote address: '{0}'")]
    StreamNotWritable(String),

    #[error("missing 'task' in payload")]
    TaskMissing,

    #[error("unknown 'task': '{0}' in payload")]
    TaskUnknown(String),

    #[error("exceeds wait timeout: {0}s")]
    WaitTimeout(f64),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(ServerError::TaskMissing.to_string().contains("task"));
        assert!(ServerError::TaskUnknown("bogus".to_string())
            .to_string()
            .contains("bogus"));
        assert!(ServerError::WaitTimeout(3.0).to_string().contains("3"));
        assert!(ServerError::StreamNotWritable("1.2.3.4:5".to_string())
            .to_string()
            .contains("1.2.3.4:5"));
    }
}
