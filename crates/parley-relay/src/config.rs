//! Relay configuration.

use std::net::SocketAddr;

use parley_protocol::MAX_ROOM_SIZE;

use crate::error::{RelayError, Result};

/// Port used when neither `PARLEY_RELAY_ADDR` nor `PORT` is set.
pub const DEFAULT_PORT: u16 = 3000;

/// Configuration for the relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// WebSocket/HTTP listen address
    pub listen_addr: SocketAddr,

    /// Maximum participants per room
    pub max_room_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_room_size: MAX_ROOM_SIZE,
        }
    }
}

impl RelayConfig {
    /// Create config from environment variables with sensible defaults.
    ///
    /// - `PARLEY_RELAY_ADDR`: full listen address, e.g. `127.0.0.1:4000`
    /// - `PORT`: port on `0.0.0.0`, used when `PARLEY_RELAY_ADDR` is unset
    /// - `PARLEY_MAX_ROOM_SIZE`: participants per room
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("PARLEY_RELAY_ADDR") {
            config.listen_addr = addr
                .trim()
                .parse()
                .map_err(|e| RelayError::Config(format!("PARLEY_RELAY_ADDR={addr:?}: {e}")))?;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| RelayError::Config(format!("PORT={port:?}: {e}")))?;
            config.listen_addr.set_port(port);
        }

        if let Some(size) = lookup("PARLEY_MAX_ROOM_SIZE") {
            config.max_room_size = match size.trim().parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    return Err(RelayError::Config(format!(
                        "PARLEY_MAX_ROOM_SIZE={size:?}: expected a positive integer"
                    )))
                }
            };
        }

        Ok(config)
    }
}
