// src/error.rs
use thiserror::Error;

/// Errors raised by a transport while connecting, sending or receiving.
///
/// None of these are surfaced to callers of the connection manager; they
/// feed the reconnection policy and the logs.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection refused by {endpoint}: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    #[error("Handshake with {endpoint} timed out after {timeout_ms} ms")]
    HandshakeTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Failed to receive frame: {0}")]
    ReceiveFailed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors returned at the library boundary.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Invalid realtime configuration: {0}")]
    Config(String),

    #[error("start() must be called from within a tokio runtime")]
    NoRuntime,

    #[error("Failed to read credential store {path}: {reason}")]
    CredentialStore { path: String, reason: String },
}

pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;
