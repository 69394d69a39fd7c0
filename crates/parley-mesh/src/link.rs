//! Per-peer link state machine.
//!
//! ```text
//! Negotiating ──channel opened──▶ ChannelOpen ──channel closed──▶ Closed
//!      │
//!      └──handshake failure / timeout──▶ Failed
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{MeshError, Result, TransportError};
use crate::transport::DataChannel;

/// Identifies one attempt at a link to a peer.
///
/// Every new link gets a fresh id, and the transport stamps it on the
/// channel events it reports. An event carrying an older id belongs to a
/// channel that has already been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Where a link is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake descriptors are being exchanged through the relay.
    Negotiating { initiator: bool, since: Instant },
    /// The direct channel is usable.
    ChannelOpen,
    /// The channel was closed.
    Closed,
    /// The handshake failed or timed out. There is no automatic retry.
    Failed { reason: String },
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Negotiating { .. } => "negotiating",
            LinkState::ChannelOpen => "channel-open",
            LinkState::Closed => "closed",
            LinkState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Serializable summary of a link for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&LinkState> for LinkStatus {
    fn from(state: &LinkState) -> Self {
        let (initiator, reason) = match state {
            LinkState::Negotiating { initiator, .. } => (Some(*initiator), None),
            LinkState::Failed { reason } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        Self {
            state: state.name(),
            initiator,
            reason,
        }
    }
}

/// Connection to one other participant.
pub struct PeerLink {
    peer: String,
    id: LinkId,
    state: LinkState,
    channel: Option<Box<dyn DataChannel>>,
}

impl PeerLink {
    /// A link where we send the offer.
    pub fn initiator(peer: impl Into<String>, id: LinkId, now: Instant) -> Self {
        Self::negotiating(peer.into(), id, true, now)
    }

    /// A link where we wait for the peer's offer.
    pub fn responder(peer: impl Into<String>, id: LinkId, now: Instant) -> Self {
        Self::negotiating(peer.into(), id, false, now)
    }

    fn negotiating(peer: String, id: LinkId, initiator: bool, since: Instant) -> Self {
        Self {
            peer,
            id,
            state: LinkState::Negotiating { initiator, since },
            channel: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Whether a channel may still be attached. A closed or failed link
    /// has already released its negotiator state.
    pub fn accepts_channel(&self) -> bool {
        !matches!(self.state, LinkState::Closed | LinkState::Failed { .. })
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::ChannelOpen
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self.state, LinkState::Negotiating { .. })
    }

    /// Attach a confirmed-open channel.
    pub fn open(&mut self, channel: Box<dyn DataChannel>) {
        if let Some(mut old) = self.channel.replace(channel) {
            old.close();
        }
        self.state = LinkState::ChannelOpen;
    }

    /// Send on the open channel.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        match (&self.state, self.channel.as_mut()) {
            (LinkState::ChannelOpen, Some(channel)) => {
                channel.send(payload).map_err(|reason| MeshError::ChannelClosed {
                    peer: self.peer.clone(),
                    reason,
                })
            }
            _ => Err(MeshError::ChannelClosed {
                peer: self.peer.clone(),
                reason: TransportError::new(format!("link is {}", self.state)),
            }),
        }
    }

    /// Mark the handshake as failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.state = LinkState::Failed {
            reason: reason.into(),
        };
    }

    /// Close the channel, if any.
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.state = LinkState::Closed;
    }

    /// True when the handshake has been pending longer than `timeout`.
    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        match self.state {
            LinkState::Negotiating { since, .. } => now.saturating_duration_since(since) >= timeout,
            _ => false,
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}
