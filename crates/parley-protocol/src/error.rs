//! Error types for parley-protocol.

use thiserror::Error;

/// Result type for decoding operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding a wire message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The payload was JSON but not a message object with a string `type`.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `type` discriminator names no known message.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}
