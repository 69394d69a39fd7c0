//! Relay wire protocol.
//!
//! [`ClientMessage`] flows from a browser to the relay, [`ServerMessage`]
//! from the relay to a browser. Handshake messages (`offer`, `answer`,
//! `ice-candidate`) appear in both directions: the relay forwards them
//! verbatim to `peerId`, so the descriptor payloads stay opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{decode_tagged, encode};
use crate::error::Result;

/// Request sent by a browser to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create a new room with the sender as host.
    CreateRoom { username: String },
    /// Join an existing room by code.
    JoinRoom { room_id: String, username: String },
    /// Connection offer for `peer_id`.
    Offer {
        offer: Value,
        peer_id: String,
        from: String,
    },
    /// Connection answer for `peer_id`.
    Answer {
        answer: Value,
        peer_id: String,
        from: String,
    },
    /// Network path candidate for `peer_id`.
    IceCandidate {
        candidate: Value,
        peer_id: String,
        from: String,
    },
}

impl ClientMessage {
    const TYPES: &'static [&'static str] =
        &["create-room", "join-room", "offer", "answer", "ice-candidate"];

    /// Decode a request, distinguishing unknown types from malformed ones.
    pub fn decode(text: &str) -> Result<Self> {
        decode_tagged(text, Self::TYPES)
    }

    pub fn encode(&self) -> Result<String> {
        encode(self)
    }

    /// Forwarding target for handshake messages.
    pub fn forward_target(&self) -> Option<&str> {
        match self {
            Self::Offer { peer_id, .. }
            | Self::Answer { peer_id, .. }
            | Self::IceCandidate { peer_id, .. } => Some(peer_id),
            Self::CreateRoom { .. } | Self::JoinRoom { .. } => None,
        }
    }
}

/// Reply or notification sent by the relay to a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Room created; the creator is host.
    RoomCreated { room_id: String, is_host: bool },
    /// Room joined. `participants` excludes the joiner.
    RoomJoined {
        room_id: String,
        participants: Vec<String>,
        is_host: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    /// Another participant joined the room.
    NewPeer { username: String },
    /// A participant's relay connection closed.
    PeerDisconnected { username: String },
    /// Sent only to a participant promoted to host.
    HostAssigned { is_host: bool },
    /// Sent to the remaining participants after a promotion.
    HostChanged { new_host: String },
    /// Forwarded connection offer.
    Offer {
        offer: Value,
        peer_id: String,
        from: String,
    },
    /// Forwarded connection answer.
    Answer {
        answer: Value,
        peer_id: String,
        from: String,
    },
    /// Forwarded network path candidate.
    IceCandidate {
        candidate: Value,
        peer_id: String,
        from: String,
    },
    /// Typed failure for the receiving client.
    Error { message: String },
}

impl ServerMessage {
    const TYPES: &'static [&'static str] = &[
        "room-created",
        "room-joined",
        "new-peer",
        "peer-disconnected",
        "host-assigned",
        "host-changed",
        "offer",
        "answer",
        "ice-candidate",
        "error",
    ];

    pub fn decode(text: &str) -> Result<Self> {
        decode_tagged(text, Self::TYPES)
    }

    pub fn encode(&self) -> Result<String> {
        encode(self)
    }

    /// Build an `error` notification.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
