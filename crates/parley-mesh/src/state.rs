//! Local Room State - one peer's replica of the room.
//!
//! Every mutation goes through the reconciliation rules here. The rules are
//! chosen so that peers which observe the same join/leave/vote events
//! converge, without any global commit:
//!
//! - `participantJoined` is idempotent
//! - `state` snapshots are a union merge: known participants are never
//!   overwritten, so a peer's own live edits beat a stale snapshot
//! - votes for unknown participants are dropped, never synthesized
//! - `newRound` resets every vote regardless of prior values
//!
//! Host flags follow the relay: at most one participant is host, and host
//! changes only arrive as relay notifications.

use std::collections::BTreeMap;

use parley_protocol::{DataMessage, Participant, PokerCard};
use serde::Serialize;

use crate::error::{MeshError, Result};

/// What applying a message did to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The replica changed.
    Applied,
    /// The message was valid but changed nothing.
    Unchanged,
    /// The message was discarded.
    Dropped(&'static str),
}

/// A peer's private replica of room state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRoomState {
    pub room_id: Option<String>,
    pub username: String,
    pub is_host: bool,
    /// Everyone known to be in the room, including self.
    pub participants: BTreeMap<String, Participant>,
    pub current_vote: Option<PokerCard>,
    pub revealed_votes: bool,
}

impl LocalRoomState {
    /// Empty replica for a peer that is not yet in a room.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            room_id: None,
            username: username.into(),
            is_host: false,
            participants: BTreeMap::new(),
            current_vote: None,
            revealed_votes: false,
        }
    }

    pub fn in_room(&self) -> bool {
        self.room_id.is_some()
    }

    pub fn participant(&self, username: &str) -> Option<&Participant> {
        self.participants.get(username)
    }

    /// Username of the current host, if known.
    pub fn host(&self) -> Option<&str> {
        self.participants
            .values()
            .find(|p| p.is_host)
            .map(|p| p.username.as_str())
    }

    /// Start a fresh room we created; we are host.
    pub fn enter_created_room(&mut self, room_id: impl Into<String>) {
        self.reset(room_id.into());
        self.is_host = true;
        self.participants
            .insert(self.username.clone(), Participant::host(self.username.clone()));
    }

    /// Start a room we joined, seeded from the relay's member list.
    pub fn enter_joined_room(
        &mut self,
        room_id: impl Into<String>,
        members: &[String],
        host: Option<&str>,
    ) {
        self.reset(room_id.into());
        self.participants
            .insert(self.username.clone(), Participant::new(self.username.clone()));
        for member in members {
            self.add_participant(member);
        }
        if let Some(host) = host {
            self.set_host(host);
        }
    }

    fn reset(&mut self, room_id: String) {
        self.room_id = Some(room_id);
        self.is_host = false;
        self.participants.clear();
        self.current_vote = None;
        self.revealed_votes = false;
    }

    /// Insert a participant with default fields. Idempotent.
    pub fn add_participant(&mut self, username: &str) -> ApplyOutcome {
        if username.is_empty() {
            return ApplyOutcome::Dropped("empty username");
        }
        if self.participants.contains_key(username) {
            return ApplyOutcome::Unchanged;
        }
        self.participants
            .insert(username.to_string(), Participant::new(username));
        ApplyOutcome::Applied
    }

    /// Remove a participant. Self is never removed.
    pub fn remove_participant(&mut self, username: &str) -> ApplyOutcome {
        if username == self.username {
            return ApplyOutcome::Dropped("cannot remove local identity");
        }
        match self.participants.remove(username) {
            Some(_) => ApplyOutcome::Applied,
            None => ApplyOutcome::Unchanged,
        }
    }

    /// Make `new_host` the only host.
    ///
    /// Clears the flag from whoever held it. If `new_host` is not known
    /// locally nobody holds the flag until it arrives.
    pub fn set_host(&mut self, new_host: &str) -> ApplyOutcome {
        let before = self.host().map(str::to_string);
        for p in self.participants.values_mut() {
            p.is_host = p.username == new_host;
        }
        self.is_host = new_host == self.username;
        if before.as_deref() == Some(new_host) {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::Applied
        }
    }

    /// Apply a message received from a peer.
    pub fn apply(&mut self, message: &DataMessage) -> ApplyOutcome {
        match message {
            DataMessage::Join { .. } => ApplyOutcome::Dropped("legacy join message"),

            DataMessage::ParticipantJoined { username } => self.add_participant(username),

            DataMessage::ParticipantLeft { username } => self.remove_participant(username),

            DataMessage::Vote {
                username,
                has_voted,
                vote,
            } => {
                if *username == self.username {
                    return ApplyOutcome::Dropped("vote for local identity");
                }
                match self.participants.get_mut(username) {
                    Some(p) => {
                        p.has_voted = *has_voted;
                        p.vote = *vote;
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Dropped("vote from unknown participant"),
                }
            }

            DataMessage::Reveal => {
                self.revealed_votes = true;
                ApplyOutcome::Applied
            }

            DataMessage::NewRound => {
                self.start_new_round();
                ApplyOutcome::Applied
            }

            DataMessage::State {
                participants,
                revealed_votes,
            } => {
                self.merge_snapshot(participants);
                self.revealed_votes = *revealed_votes;
                ApplyOutcome::Applied
            }
        }
    }

    /// Union-merge a snapshot's participants.
    ///
    /// Only identities missing locally are inserted. A snapshot never
    /// introduces a second host.
    fn merge_snapshot(&mut self, incoming: &BTreeMap<String, Participant>) {
        let mut has_host = self.host().is_some();
        for (username, participant) in incoming {
            if username.is_empty() || self.participants.contains_key(username) {
                continue;
            }
            let mut participant = participant.clone();
            participant.username = username.clone();
            if participant.is_host {
                if has_host {
                    participant.is_host = false;
                } else {
                    has_host = true;
                }
            }
            self.participants.insert(username.clone(), participant);
        }
    }

    fn start_new_round(&mut self) {
        self.revealed_votes = false;
        self.current_vote = None;
        for p in self.participants.values_mut() {
            p.reset_vote();
        }
    }

    /// Snapshot of this replica for a newly connected peer.
    pub fn snapshot(&self) -> DataMessage {
        DataMessage::State {
            participants: self.participants.clone(),
            revealed_votes: self.revealed_votes,
        }
    }

    /// Record our own vote and build the broadcast.
    pub fn cast_vote(&mut self, card: PokerCard) -> Result<DataMessage> {
        self.set_own_vote(Some(card))
    }

    /// Withdraw our vote and build the broadcast.
    pub fn clear_vote(&mut self) -> Result<DataMessage> {
        self.set_own_vote(None)
    }

    fn set_own_vote(&mut self, card: Option<PokerCard>) -> Result<DataMessage> {
        if !self.in_room() {
            return Err(MeshError::NotInRoom);
        }
        self.current_vote = card;
        let me = self
            .participants
            .entry(self.username.clone())
            .or_insert_with(|| Participant::new(self.username.clone()));
        me.has_voted = card.is_some();
        me.vote = card;
        Ok(DataMessage::Vote {
            username: self.username.clone(),
            has_voted: card.is_some(),
            vote: card,
        })
    }

    /// Reveal votes (host only) and build the broadcast.
    pub fn reveal(&mut self) -> Result<DataMessage> {
        self.check_host("reveal votes")?;
        self.revealed_votes = true;
        Ok(DataMessage::Reveal)
    }

    /// Start a new round (host only) and build the broadcast.
    pub fn new_round(&mut self) -> Result<DataMessage> {
        self.check_host("start a new round")?;
        self.start_new_round();
        Ok(DataMessage::NewRound)
    }

    fn check_host(&self, action: &'static str) -> Result<()> {
        if !self.in_room() {
            return Err(MeshError::NotInRoom);
        }
        if !self.is_host {
            return Err(MeshError::NotHost(action));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn joined(username: &str, members: &[&str], host: &str) -> LocalRoomState {
        let mut state = LocalRoomState::new(username);
        let members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        state.enter_joined_room("abc123", &members, Some(host));
        state
    }

    fn host_count(state: &LocalRoomState) -> usize {
        state.participants.values().filter(|p| p.is_host).count()
    }

    #[test]
    fn created_room_has_self_as_host() {
        let mut state = LocalRoomState::new("alice");
        state.enter_created_room("abc123");
        assert!(state.is_host);
        assert_eq!(state.host(), Some("alice"));
        assert_eq!(state.participants.len(), 1);
    }

    #[test]
    fn joined_room_seeds_members_with_defaults() {
        let state = joined("bob", &["alice"], "alice");
        let alice = state.participant("alice").unwrap();
        assert!(alice.is_host);
        assert!(!alice.has_voted);
        assert_eq!(alice.vote, None);
        assert!(!state.is_host);
        assert_eq!(host_count(&state), 1);
    }

    #[test]
    fn participant_joined_is_idempotent() {
        let mut state = joined("alice", &[], "alice");
        let msg = DataMessage::ParticipantJoined {
            username: "bob".into(),
        };
        assert_eq!(state.apply(&msg), ApplyOutcome::Applied);
        let once = state.clone();
        assert_eq!(state.apply(&msg), ApplyOutcome::Unchanged);
        assert_eq!(state, once);
    }

    #[test]
    fn participant_joined_ignores_empty_name() {
        let mut state = joined("alice", &[], "alice");
        let before = state.clone();
        let outcome = state.apply(&DataMessage::ParticipantJoined {
            username: String::new(),
        });
        assert!(matches!(outcome, ApplyOutcome::Dropped(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn participant_joined_does_not_reset_existing_vote() {
        let mut state = joined("alice", &["bob"], "alice");
        state.apply(&DataMessage::Vote {
            username: "bob".into(),
            has_voted: true,
            vote: Some(PokerCard::Eight),
        });
        state.apply(&DataMessage::ParticipantJoined {
            username: "bob".into(),
        });
        assert_eq!(state.participant("bob").unwrap().vote, Some(PokerCard::Eight));
    }

    #[test]
    fn snapshot_merge_never_overwrites_known_participant() {
        let mut state = joined("alice", &["bob"], "alice");
        state.apply(&DataMessage::Vote {
            username: "bob".into(),
            has_voted: true,
            vote: Some(PokerCard::Three),
        });

        let mut stale = BTreeMap::new();
        stale.insert("bob".to_string(), Participant::new("bob"));
        stale.insert("carol".to_string(), Participant::new("carol"));
        state.apply(&DataMessage::State {
            participants: stale,
            revealed_votes: false,
        });

        let bob = state.participant("bob").unwrap();
        assert!(bob.has_voted);
        assert_eq!(bob.vote, Some(PokerCard::Three));
        assert!(state.participant("carol").is_some());
    }

    #[test]
    fn snapshot_revealed_flag_is_last_writer_wins() {
        let mut state = joined("bob", &["alice"], "alice");
        state.apply(&DataMessage::State {
            participants: BTreeMap::new(),
            revealed_votes: true,
        });
        assert!(state.revealed_votes);
        state.apply(&DataMessage::State {
            participants: BTreeMap::new(),
            revealed_votes: false,
        });
        assert!(!state.revealed_votes);
    }

    #[test]
    fn snapshot_cannot_add_second_host() {
        let mut state = joined("bob", &["alice"], "alice");
        let mut incoming = BTreeMap::new();
        incoming.insert("mallory".to_string(), Participant::host("mallory"));
        state.apply(&DataMessage::State {
            participants: incoming,
            revealed_votes: false,
        });
        assert_eq!(host_count(&state), 1);
        assert_eq!(state.host(), Some("alice"));
    }

    #[test]
    fn snapshot_supplies_host_when_unknown() {
        let mut state = LocalRoomState::new("bob");
        state.enter_joined_room("abc123", &[], None);
        let mut incoming = BTreeMap::new();
        incoming.insert("alice".to_string(), Participant::host("alice"));
        state.apply(&DataMessage::State {
            participants: incoming,
            revealed_votes: false,
        });
        assert_eq!(state.host(), Some("alice"));
    }

    #[test]
    fn vote_for_unknown_participant_is_dropped() {
        let mut state = joined("alice", &[], "alice");
        let outcome = state.apply(&DataMessage::Vote {
            username: "ghost".into(),
            has_voted: true,
            vote: Some(PokerCard::One),
        });
        assert!(matches!(outcome, ApplyOutcome::Dropped(_)));
        assert!(state.participant("ghost").is_none());
    }

    #[test]
    fn vote_updates_known_participant() {
        let mut state = joined("bob", &["alice"], "alice");
        state.apply(&DataMessage::Vote {
            username: "alice".into(),
            has_voted: true,
            vote: Some(PokerCard::Five),
        });
        assert_eq!(state.participant("alice").unwrap().vote, Some(PokerCard::Five));
    }

    #[test]
    fn remote_vote_for_self_is_ignored() {
        let mut state = joined("bob", &["alice"], "alice");
        state.cast_vote(PokerCard::Two).unwrap();
        state.apply(&DataMessage::Vote {
            username: "bob".into(),
            has_voted: false,
            vote: None,
        });
        assert_eq!(state.participant("bob").unwrap().vote, Some(PokerCard::Two));
    }

    #[test]
    fn reveal_sets_flag() {
        let mut state = joined("bob", &["alice"], "alice");
        state.apply(&DataMessage::Reveal);
        assert!(state.revealed_votes);
    }

    #[test]
    fn participant_left_removes_but_never_self() {
        let mut state = joined("bob", &["alice", "carol"], "alice");
        state.apply(&DataMessage::ParticipantLeft {
            username: "carol".into(),
        });
        assert!(state.participant("carol").is_none());
        let outcome = state.apply(&DataMessage::ParticipantLeft {
            username: "bob".into(),
        });
        assert!(matches!(outcome, ApplyOutcome::Dropped(_)));
        assert!(state.participant("bob").is_some());
    }

    #[test]
    fn host_change_moves_the_single_flag() {
        let mut state = joined("carol", &["alice", "bob"], "alice");
        state.set_host("bob");
        assert_eq!(state.host(), Some("bob"));
        assert_eq!(host_count(&state), 1);
        assert!(!state.is_host);

        state.set_host("carol");
        assert!(state.is_host);
        assert_eq!(host_count(&state), 1);
    }

    #[test]
    fn only_host_reveals_or_starts_rounds() {
        let mut guest = joined("bob", &["alice"], "alice");
        assert!(matches!(guest.reveal(), Err(MeshError::NotHost(_))));
        assert!(matches!(guest.new_round(), Err(MeshError::NotHost(_))));

        let mut host = LocalRoomState::new("alice");
        host.enter_created_room("abc123");
        assert_eq!(host.reveal().unwrap(), DataMessage::Reveal);
        assert!(host.revealed_votes);
    }

    #[test]
    fn voting_outside_room_fails() {
        let mut state = LocalRoomState::new("alice");
        assert!(matches!(state.cast_vote(PokerCard::One), Err(MeshError::NotInRoom)));
    }

    #[test]
    fn cast_vote_builds_broadcast() {
        let mut state = LocalRoomState::new("alice");
        state.enter_created_room("abc123");
        let msg = state.cast_vote(PokerCard::Five).unwrap();
        assert_eq!(
            msg,
            DataMessage::Vote {
                username: "alice".into(),
                has_voted: true,
                vote: Some(PokerCard::Five),
            }
        );
        assert_eq!(state.current_vote, Some(PokerCard::Five));

        let msg = state.clear_vote().unwrap();
        assert!(matches!(msg, DataMessage::Vote { has_voted: false, vote: None, .. }));
        assert!(!state.participant("alice").unwrap().has_voted);
    }

    fn card() -> impl Strategy<Value = Option<PokerCard>> {
        proptest::option::of(proptest::sample::select(PokerCard::ALL.to_vec()))
    }

    proptest! {
        #[test]
        fn new_round_resets_everything(
            votes in proptest::collection::vec((0usize..4, any::<bool>(), card()), 0..20),
            revealed in any::<bool>(),
            own in card(),
        ) {
            let names = ["alice", "carol", "dave", "erin"];
            let mut state = joined("bob", &names, "alice");
            if let Some(card) = own {
                state.cast_vote(card).unwrap();
            }
            for (who, has_voted, vote) in votes {
                state.apply(&DataMessage::Vote { username: names[who].into(), has_voted, vote });
            }
            if revealed {
                state.apply(&DataMessage::Reveal);
            }

            state.apply(&DataMessage::NewRound);

            prop_assert!(!state.revealed_votes);
            prop_assert_eq!(state.current_vote, None);
            for p in state.participants.values() {
                prop_assert!(!p.has_voted);
                prop_assert_eq!(p.vote, None);
            }
        }

        #[test]
        fn participant_joined_twice_equals_once(name in "[a-z]{1,8}") {
            let mut once = joined("bob", &["alice"], "alice");
            once.apply(&DataMessage::ParticipantJoined { username: name.clone() });
            let mut twice = once.clone();
            twice.apply(&DataMessage::ParticipantJoined { username: name });
            prop_assert_eq!(once, twice);
        }
    }
}
