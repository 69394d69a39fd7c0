//! Error types for parley-mesh.

use thiserror::Error;

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Failure reported by a transport or negotiation primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Errors that can occur in the mesh synchronizer.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The negotiation primitive rejected a descriptor or candidate.
    #[error("handshake with {peer} failed: {reason}")]
    HandshakeFailure { peer: String, reason: TransportError },

    /// No link exists for the peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Sending on a channel failed.
    #[error("channel to {peer} closed: {reason}")]
    ChannelClosed { peer: String, reason: TransportError },

    /// The action is reserved for the room host.
    #[error("only the host can {0}")]
    NotHost(&'static str),

    /// The action requires being in a room.
    #[error("not in a room")]
    NotInRoom,

    /// A data-channel payload could not be decoded.
    #[error("parse failure: {0}")]
    Parse(#[from] parley_protocol::ProtocolError),

    /// The relay link is gone; room requests cannot be sent.
    #[error("relay connection closed")]
    RelayClosed,

    /// The synchronizer task is gone.
    #[error("synchronizer stopped")]
    ActorStopped,
}
