//! Protocol error types.

use thiserror::Error;

/// GT06 protocol error type.
#[derive(Debug, Error)]
pub enum Gt06Error {
    /// Transport error surfaced through the framed codec.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload shorter than the protocol number requires.
    #[error("truncated payload for protocol 0x{protocol:02X}: {len} bytes")]
    TruncatedPayload { protocol: u8, len: usize },

    /// BCD IMEI did not decode to 15 decimal digits.
    #[error("invalid IMEI: {0}")]
    InvalidImei(String),

    /// Date-time bytes do not form a valid UTC instant.
    #[error("invalid timestamp in location payload")]
    InvalidTimestamp,
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Gt06Error>;
