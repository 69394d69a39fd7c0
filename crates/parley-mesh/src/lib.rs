//! Parley Mesh - peer-to-peer room state synchronization
//!
//! Every participant keeps a private replica of the room ([`LocalRoomState`])
//! and converges with the others by exchanging [`DataMessage`]s over direct
//! channels. The relay is only used to find peers and to carry handshake
//! descriptors; once a channel is open, synchronization does not depend on
//! it.
//!
//! # Architecture
//!
//! ```text
//!   relay notifications ─┐
//!   channel open/msg/close ─┤   ┌──────────────┐    ┌────────────────┐
//!   local candidates ──────┼──▶│ Synchronizer │───▶│ LocalRoomState │
//!   user actions ──────────┤   └──────┬───────┘    └────────────────┘
//!   timer ticks ───────────┘          │
//!                             PeerLink per participant
//!                          (Negotiating → ChannelOpen → Closed)
//! ```
//!
//! All inputs share one ordered queue, so a `newRound` racing a late `vote`
//! is applied in receipt order.
//!
//! The transport is pluggable through [`Negotiator`] and [`DataChannel`];
//! [`memory`] provides an in-process implementation.
//!
//! [`DataMessage`]: parley_protocol::DataMessage

pub mod error;
pub mod events;
pub mod link;
pub mod memory;
pub mod state;
pub mod synchronizer;
pub mod transport;

pub use error::{MeshError, Result, TransportError};
pub use events::{LocalAction, SyncEvent};
pub use link::{LinkId, LinkState, LinkStatus, PeerLink};
pub use memory::{MemoryChannel, MemoryNegotiator, Switchboard};
pub use state::{ApplyOutcome, LocalRoomState};
pub use synchronizer::{RoomView, SyncConfig, Synchronizer, SynchronizerHandle};
pub use transport::{DataChannel, Negotiator};
