//! Error types for the printer bridge

use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Socket-level failures. Absorbed by the connection manager and turned into
/// backoff transitions, never surfaced to command callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("no frame received within liveness window")]
    Stale,
}

/// A frame that could not be decoded as a telemetry object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty frame")]
    Empty,

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Failures surfaced synchronously to a command caller. Never retried here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("printer is not connected")]
    NotConnected,

    #[error("no acknowledgement within {0:?}")]
    Timeout(std::time::Duration),

    #[error("command rejected: {0}")]
    Rejected(String),
}
