//! Events consumed by the synchronizer's single inbound queue.

use std::fmt;

use parley_protocol::{PokerCard, ServerMessage};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::link::LinkId;
use crate::transport::DataChannel;

/// Something the local user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAction {
    CreateRoom,
    JoinRoom { room_id: String },
    CastVote(PokerCard),
    ClearVote,
    Reveal,
    NewRound,
}

/// Everything the synchronizer reacts to, in receipt order.
pub enum SyncEvent {
    /// A message from the signalling relay.
    Relay(ServerMessage),
    /// The transport confirmed a direct channel to `peer`.
    ChannelOpened {
        peer: String,
        link: LinkId,
        channel: Box<dyn DataChannel>,
    },
    /// Bytes arrived on the channel from `peer`.
    ChannelMessage {
        peer: String,
        link: LinkId,
        payload: Vec<u8>,
    },
    /// The channel to `peer` went away.
    ChannelClosed { peer: String, link: LinkId },
    /// The negotiator discovered a local candidate for `peer`.
    LocalCandidate { peer: String, candidate: Value },
    /// A local action, optionally with a reply slot.
    Command {
        action: LocalAction,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Periodic handshake-timeout sweep.
    Tick,
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Relay(_) => "relay",
            SyncEvent::ChannelOpened { .. } => "channel-opened",
            SyncEvent::ChannelMessage { .. } => "channel-message",
            SyncEvent::ChannelClosed { .. } => "channel-closed",
            SyncEvent::LocalCandidate { .. } => "local-candidate",
            SyncEvent::Command { .. } => "command",
            SyncEvent::Tick => "tick",
        }
    }
}

impl fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::Relay(msg) => f.debug_tuple("Relay").field(msg).finish(),
            SyncEvent::ChannelOpened { peer, link, .. } => f
                .debug_struct("ChannelOpened")
                .field("peer", peer)
                .field("link", link)
                .finish(),
            SyncEvent::ChannelMessage {
                peer,
                link,
                payload,
            } => f
                .debug_struct("ChannelMessage")
                .field("peer", peer)
                .field("link", link)
                .field("len", &payload.len())
                .finish(),
            SyncEvent::ChannelClosed { peer, link } => f
                .debug_struct("ChannelClosed")
                .field("peer", peer)
                .field("link", link)
                .finish(),
            SyncEvent::LocalCandidate { peer, .. } => {
                f.debug_struct("LocalCandidate").field("peer", peer).finish()
            }
            SyncEvent::Command { action, .. } => {
                f.debug_struct("Command").field("action", action).finish()
            }
            SyncEvent::Tick => f.write_str("Tick"),
        }
    }
}
