//! Mesh data-channel protocol.
//!
//! Messages exchanged directly between peers once a channel is open. Unknown
//! `type` values decode to `None` so newer peers can extend the protocol
//! without breaking older ones.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::card::PokerCard;
use crate::codec::{decode_tagged, encode};
use crate::error::{ProtocolError, Result};
use crate::participant::Participant;

/// A room-state message sent peer to peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DataMessage {
    /// Legacy join announcement. Decoded but not acted upon.
    Join { username: String },
    /// The sender of this message is in the room.
    ParticipantJoined { username: String },
    /// `username` left the room.
    ParticipantLeft { username: String },
    /// `username` changed their vote.
    Vote {
        username: String,
        has_voted: bool,
        #[serde(default)]
        vote: Option<PokerCard>,
    },
    /// Show everyone's votes.
    Reveal,
    /// Clear all votes and hide them.
    NewRound,
    /// Snapshot of the sender's replica, sent once after the channel opens.
    State {
        participants: BTreeMap<String, Participant>,
        revealed_votes: bool,
    },
}

impl DataMessage {
    const TYPES: &'static [&'static str] = &[
        "join",
        "participantJoined",
        "participantLeft",
        "vote",
        "reveal",
        "newRound",
        "state",
    ];

    /// Decode a data-channel payload. Unknown types yield `Ok(None)`.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("payload is not UTF-8: {e}")))?;
        match decode_tagged(text, Self::TYPES) {
            Ok(msg) => Ok(Some(msg)),
            Err(ProtocolError::UnknownType(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Encode as UTF-8 JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self).map(String::into_bytes)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::ParticipantJoined { .. } => "participantJoined",
            Self::ParticipantLeft { .. } => "participantLeft",
            Self::Vote { .. } => "vote",
            Self::Reveal => "reveal",
            Self::NewRound => "newRound",
            Self::State { .. } => "state",
        }
    }
}
