//! Participant record shared by the mesh protocol and local replicas.

use serde::{Deserialize, Serialize};

use crate::card::PokerCard;

/// One participant as seen by a peer's local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Display name, unique within a room and used as the mesh address.
    pub username: String,
    pub is_host: bool,
    pub has_voted: bool,
    #[serde(default)]
    pub vote: Option<PokerCard>,
}

impl Participant {
    /// A fresh non-host participant that has not voted.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_host: false,
            has_voted: false,
            vote: None,
        }
    }

    /// A fresh participant holding the host role.
    pub fn host(username: impl Into<String>) -> Self {
        Self {
            is_host: true,
            ..Self::new(username)
        }
    }

    /// Forget this round's vote.
    pub fn reset_vote(&mut self) {
        self.has_voted = false;
        self.vote = None;
    }
}
