//! Error types for the relay.
//!
//! The `Display` text of the room errors is what clients receive in an
//! `error` notification, so it must not change.

use thiserror::Error;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while serving relay requests.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No room has the requested code.
    #[error("Room does not exist")]
    RoomNotFound,

    /// The room already holds the maximum number of participants.
    #[error("Room is full")]
    RoomFull,

    /// Another live connection already uses this username.
    #[error("Username is already taken")]
    UsernameTaken,

    /// The connection is already a member of the room it asked to join.
    #[error("Already in this room")]
    AlreadyInRoom,

    /// The request decoded but its contents are unusable.
    #[error("Invalid message format: {0}")]
    Malformed(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
