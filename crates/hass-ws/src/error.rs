//! Error types for the WebSocket client

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::messages::ErrorInfo;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by client operations
///
/// Failures local to one command or subscription call are returned only to
/// that caller; transport failures additionally drive the reconnection
/// machinery.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid arguments detected before any I/O was performed
    #[error("invalid argument: {0}")]
    Configuration(String),

    /// The operation is not allowed in the current connection state
    #[error("operation not allowed while {0}")]
    InvalidState(ConnectionState),

    /// The hub rejected the access token; never retried automatically
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// WebSocket-level failure
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The hub answered a specific exchange with an unexpected message shape
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Structured rejection returned by the hub for a command
    #[error("command rejected by hub: {0}")]
    Server(ErrorInfo),

    /// The operation was abandoned through its cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// The client has been disposed and accepts no further operations
    #[error("client has been disposed")]
    Disposed,
}

impl ClientError {
    /// Whether a connect attempt failing with this error may be retried
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}
