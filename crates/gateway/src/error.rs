//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Socket or listener error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device protocol error.
    #[error("GT06 protocol error: {0}")]
    Protocol(#[from] gt06::Gt06Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid environment configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Observer ingress payload missing or malformed.
    #[error("invalid observer payload: {0}")]
    ObserverPayload(String),

    /// Channel send error (observer went away).
    #[error("channel send error")]
    ChannelSend,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
