//! Test harness wiring an in-process relay to several synchronizers.
//!
//! Each peer gets a relay connection (two pump tasks translating between the
//! relay's text frames and the synchronizer's typed messages) and a
//! [`MemoryNegotiator`] on a shared [`Switchboard`], so the whole
//! create/join/handshake/sync flow runs exactly as it would over a network.
//!
//! [`MemoryNegotiator`]: parley_mesh::MemoryNegotiator

use std::collections::BTreeMap;
use std::ops::Index;
use std::sync::Arc;
use std::time::Duration;

use parley_mesh::{
    MeshError, RoomView, SyncConfig, SyncEvent, Synchronizer, SynchronizerHandle, Switchboard,
};
use parley_protocol::{ClientMessage, ServerMessage};
use parley_relay::{ConnectionId, Registry, SignallingRelay};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long any single wait may take before a test fails.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("no peer named {0}")]
    NoSuchPeer(String),

    #[error(transparent)]
    Mesh(#[from] MeshError),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

struct Peer {
    handle: SynchronizerHandle,
    connection: ConnectionId,
    pumps: Vec<JoinHandle<()>>,
}

/// A relay plus any number of peers.
pub struct Cluster {
    relay: Arc<SignallingRelay>,
    switchboard: Switchboard,
    config: SyncConfig,
    peers: BTreeMap<String, Peer>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_registry(Registry::default(), SyncConfig::default())
    }

    pub fn with_registry(registry: Registry, config: SyncConfig) -> Self {
        parley_logging::init_for_tests();
        Self {
            relay: Arc::new(SignallingRelay::new(registry)),
            switchboard: Switchboard::new(),
            config,
            peers: BTreeMap::new(),
        }
    }

    pub fn relay(&self) -> &Arc<SignallingRelay> {
        &self.relay
    }

    pub fn peer(&self, name: &str) -> Result<&SynchronizerHandle> {
        self.peers
            .get(name)
            .map(|p| &p.handle)
            .ok_or_else(|| HarnessError::NoSuchPeer(name.to_string()))
    }

    /// Start a synchronizer for `name` with its own relay connection.
    pub async fn add_peer(&mut self, name: &str) -> &SynchronizerHandle {
        let (outbox, mut inbound) = mpsc::unbounded_channel::<String>();
        let connection = self.relay.connect(outbox).await;

        let (events, receiver) = Synchronizer::channel();
        self.switchboard.attach(name, events.clone());

        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let sync = Synchronizer::new(
            name,
            Box::new(self.switchboard.negotiator(name)),
            relay_tx,
            self.config.clone(),
        );
        let handle = sync.spawn(events.clone(), receiver);

        let down = tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                match ServerMessage::decode(&text) {
                    Ok(msg) => {
                        if events.send(SyncEvent::Relay(msg)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("undecodable relay frame {:?}: {}", text, e),
                }
            }
        });

        let relay = Arc::clone(&self.relay);
        let up = tokio::spawn(async move {
            while let Some(msg) = relay_rx.recv().await {
                match msg.encode() {
                    Ok(text) => relay.handle_text(connection, &text).await,
                    Err(e) => warn!("cannot encode {:?}: {}", msg, e),
                }
            }
        });

        debug!("harness: added peer {} on {}", name, connection);
        let peer = Peer {
            handle,
            connection,
            pumps: vec![down, up],
        };
        &self.peers.entry(name.to_string()).or_insert(peer).handle
    }

    /// Wait until `name`'s view satisfies `predicate`.
    pub async fn wait_for(
        &self,
        name: &str,
        what: &str,
        predicate: impl Fn(&RoomView) -> bool,
    ) -> Result<RoomView> {
        let handle = self.peer(name)?;
        match tokio::time::timeout(WAIT, handle.wait_for(predicate)).await {
            Ok(view) => Ok(view?),
            Err(_) => Err(HarnessError::Timeout(format!("{name}: {what}"))),
        }
    }

    /// Wait until every live peer's view satisfies `predicate`.
    pub async fn wait_all(&self, what: &str, predicate: impl Fn(&RoomView) -> bool) -> Result<()> {
        for name in self.peers.keys() {
            self.wait_for(name, what, &predicate).await?;
        }
        Ok(())
    }

    /// Create a room as `host` and return its code.
    pub async fn create_room(&self, host: &str) -> Result<String> {
        self.peer(host)?.create_room().await?;
        let view = self
            .wait_for(host, "room created", |v| v.state.room_id.is_some())
            .await?;
        view.state
            .room_id
            .ok_or_else(|| HarnessError::Timeout(format!("{host}: room id")))
    }

    /// Join `code` as `name` and wait for the relay's reply.
    pub async fn join_room(&self, name: &str, code: &str) -> Result<RoomView> {
        self.peer(name)?.join_room(code).await?;
        self.wait_for(name, "room joined or rejected", |v| {
            v.state.room_id.as_deref() == Some(code) || v.last_error.is_some()
        })
        .await
    }

    /// Wait until `name` has an open channel to each of `peers`.
    pub async fn wait_linked(&self, name: &str, peers: &[&str]) -> Result<RoomView> {
        self.wait_for(name, "channels open", |v| {
            peers
                .iter()
                .all(|p| v.open_peers().contains(p) && v.state.participants.contains_key(*p))
        })
        .await
    }

    /// Kill `name`: its relay connection drops, its channels close and its
    /// actor stops without saying goodbye.
    pub async fn crash(&mut self, name: &str) -> Result<()> {
        let peer = self
            .peers
            .remove(name)
            .ok_or_else(|| HarnessError::NoSuchPeer(name.to_string()))?;
        peer.handle.abort();
        for pump in &peer.pumps {
            pump.abort();
        }
        self.switchboard.disconnect(name);
        self.relay.disconnect(peer.connection).await;
        debug!("harness: crashed {}", name);
        Ok(())
    }
}

impl Index<&str> for Cluster {
    type Output = SynchronizerHandle;

    fn index(&self, name: &str) -> &SynchronizerHandle {
        &self.peers[name].handle
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for peer in self.peers.values() {
            peer.handle.abort();
            for pump in &peer.pumps {
                pump.abort();
            }
        }
    }
}
