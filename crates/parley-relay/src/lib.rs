//! Parley Relay - signalling for planning poker meshes
//!
//! Helps browsers find each other and exchange connection handshakes. After
//! that, all room state flows peer to peer and the relay is only consulted
//! again when someone's relay connection drops.
//!
//! # Architecture
//!
//! - **Registry**: room codes → ordered members, usernames → connections
//! - **Relay**: decodes requests, drives the registry, fans out notifications
//! - **Server**: axum WebSocket endpoint feeding the relay
//! - **Config**: environment-driven listen address and room capacity
//!
//! # Example
//!
//! ```no_run
//! use parley_relay::{RelayConfig, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::from_env()?;
//!     let server = RelayServer::new(config);
//!     server.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use registry::{ConnectionId, Departure, JoinOutcome, RelayClient, Registry, Room, RoomCode};
pub use relay::{Outbox, RelayStats, SignallingRelay};
pub use server::RelayServer;
