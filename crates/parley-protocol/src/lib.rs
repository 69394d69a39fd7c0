//! Parley Protocol - wire messages for signalling and mesh sync
//!
//! Two JSON protocols share this crate:
//!
//! - **Relay protocol** ([`relay`]): browsers talk to the signalling relay to
//!   create or join a room and to exchange connection handshake descriptors.
//! - **Mesh protocol** ([`data`]): once a direct channel is open, peers
//!   replicate room state (joins, leaves, votes, reveals, new rounds) to each
//!   other without the relay.
//!
//! Every message is a JSON object discriminated by a `type` field.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐  ClientMessage   ┌─────────┐  ServerMessage   ┌─────────┐
//! │  alice  │ ───────────────→ │  Relay  │ ───────────────→ │   bob   │
//! └────┬────┘                  └─────────┘                  └────┬────┘
//!      │                    DataMessage (direct)                 │
//!      └─────────────────────────────────────────────────────────┘
//! ```

pub mod card;
pub mod codec;
pub mod data;
pub mod error;
pub mod participant;
pub mod relay;

pub use card::PokerCard;
pub use data::DataMessage;
pub use error::{ProtocolError, Result};
pub use participant::Participant;
pub use relay::{ClientMessage, ServerMessage};

/// Maximum number of participants a room may hold.
pub const MAX_ROOM_SIZE: usize = 10;

/// Length of a generated room code.
pub const ROOM_CODE_LEN: usize = 6;
