//! Collaborator contracts for direct peer channels.
//!
//! The synchronizer never talks to a network stack itself. A [`Negotiator`]
//! produces and consumes handshake descriptors, and once a channel is
//! confirmed open the negotiator's side delivers a [`DataChannel`] into the
//! synchronizer's event queue as [`SyncEvent::ChannelOpened`].
//!
//! Implementations report asynchronous happenings (channel open, inbound
//! bytes, channel close, locally discovered candidates) by pushing
//! [`SyncEvent`]s into the queue they were given, never by calling back
//! into the synchronizer. Channel events carry the [`LinkId`] passed to
//! [`Negotiator::open`], so events from a replaced channel can be told
//! apart from the current one.
//!
//! [`SyncEvent`]: crate::events::SyncEvent
//! [`SyncEvent::ChannelOpened`]: crate::events::SyncEvent::ChannelOpened

use serde_json::Value;

use crate::error::TransportError;
use crate::link::LinkId;

/// An open, ordered, message-oriented channel to one peer.
pub trait DataChannel: Send {
    /// Send one message.
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Close the channel. Calling this more than once has no further effect.
    fn close(&mut self);
}

/// The handshake primitive (offer/answer/candidate exchange).
///
/// Descriptors and candidates are opaque JSON values carried verbatim by
/// the relay.
pub trait Negotiator: Send {
    /// Prepare a connection object for `peer`. Channel events for this
    /// connection must carry `link`.
    fn open(&mut self, peer: &str, link: LinkId, initiator: bool) -> Result<(), TransportError>;

    /// Create the local descriptor: an offer when initiating, an answer
    /// after a remote offer was accepted.
    fn create_local_descriptor(&mut self, peer: &str) -> Result<Value, TransportError>;

    /// Accept the remote side's offer or answer.
    fn accept_remote_descriptor(&mut self, peer: &str, descriptor: Value)
        -> Result<(), TransportError>;

    /// Add a connectivity candidate received from `peer`.
    fn add_remote_candidate(&mut self, peer: &str, candidate: Value)
        -> Result<(), TransportError>;

    /// Release everything held for `peer`.
    fn close_peer(&mut self, _peer: &str) {}
}
