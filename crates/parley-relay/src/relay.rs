//! Signalling Relay - request handling and notification fan-out.
//!
//! Transport-agnostic: a connection registers an outbox (an unbounded
//! channel of JSON text frames), then feeds its inbound frames to
//! [`SignallingRelay::handle_text`] and finally calls
//! [`SignallingRelay::disconnect`].
//!
//! Every inbound frame is applied to the [`Registry`] under one lock, and
//! the resulting notifications are queued before the lock is released, so
//! no client ever observes a half-applied room change.
//!
//! Handshake messages (`offer`, `answer`, `ice-candidate`) are forwarded as
//! the exact text received. A missing target is logged and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parley_protocol::{ClientMessage, ProtocolError, ServerMessage};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{ConnectionId, Departure, Registry};

/// Outbound frame queue for one connection.
pub type Outbox = mpsc::UnboundedSender<String>;

/// Counters exposed on the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub rooms: usize,
    pub clients: usize,
    pub connections: usize,
}

struct RelayInner {
    registry: Registry,
    connections: HashMap<ConnectionId, Outbox>,
}

impl RelayInner {
    fn send_raw(&self, connection: ConnectionId, text: String) {
        match self.connections.get(&connection) {
            Some(outbox) => {
                if outbox.send(text).is_err() {
                    debug!("Outbox for {} already closed, dropping frame", connection);
                }
            }
            None => debug!("No outbox for {}, dropping frame", connection),
        }
    }

    fn send(&self, connection: ConnectionId, message: &ServerMessage) {
        match message.encode() {
            Ok(text) => self.send_raw(connection, text),
            Err(e) => warn!("Failed to encode {:?}: {}", message, e),
        }
    }

    fn send_to_user(&self, username: &str, message: &ServerMessage) {
        if let Some(client) = self.registry.client(username) {
            self.send(client.connection, message);
        }
    }

    /// Queue the notifications that follow a client's removal.
    fn announce_departure(&self, departure: &Departure) {
        if departure.room_removed {
            return;
        }

        if let Some(new_host) = &departure.new_host {
            self.send_to_user(new_host, &ServerMessage::HostAssigned { is_host: true });
            let changed = ServerMessage::HostChanged {
                new_host: new_host.clone(),
            };
            for member in departure.remaining.iter().filter(|m| *m != new_host) {
                self.send_to_user(member, &changed);
            }
        }

        let disconnected = ServerMessage::PeerDisconnected {
            username: departure.username.clone(),
        };
        for member in &departure.remaining {
            self.send_to_user(member, &disconnected);
        }
    }

    /// Remove whatever client this connection was registered as.
    fn release_connection(&mut self, connection: ConnectionId) -> Option<Departure> {
        let username = self.registry.client_by_connection(connection)?.username.clone();
        let departure = self.registry.remove_client(&username)?;
        self.announce_departure(&departure);
        Some(departure)
    }
}

/// The signalling relay.
pub struct SignallingRelay {
    inner: Mutex<RelayInner>,
    next_connection: AtomicU64,
}

impl Default for SignallingRelay {
    fn default() -> Self {
        Self::new(Registry::default())
    }
}

impl SignallingRelay {
    /// Create a relay that owns `registry`.
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Mutex::new(RelayInner {
                registry,
                connections: HashMap::new(),
            }),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Register a new connection and its outbox.
    pub async fn connect(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().await.connections.insert(id, outbox);
        debug!("Client connected as {}", id);
        id
    }

    /// Handle one inbound binary frame.
    pub async fn handle_bytes(&self, connection: ConnectionId, bytes: &[u8]) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.handle_text(connection, text).await,
            Err(e) => {
                warn!("Non UTF-8 frame from {}: {}", connection, e);
                let inner = self.inner.lock().await;
                inner.send(connection, &ServerMessage::error("Invalid message format"));
            }
        }
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, connection: ConnectionId, text: &str) {
        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!("Unknown message type from {}: {}", connection, kind);
                let inner = self.inner.lock().await;
                inner.send(connection, &ServerMessage::error("Unknown message type"));
                return;
            }
            Err(e) => {
                warn!("Error parsing message from {}: {}", connection, e);
                let inner = self.inner.lock().await;
                inner.send(connection, &ServerMessage::error("Invalid message format"));
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        if let Err(e) = Self::apply(&mut inner, connection, message, text) {
            debug!("Request from {} failed: {}", connection, e);
            inner.send(connection, &ServerMessage::error(e.to_string()));
        }
    }

    fn apply(
        inner: &mut RelayInner,
        connection: ConnectionId,
        message: ClientMessage,
        raw: &str,
    ) -> Result<()> {
        match message {
            ClientMessage::CreateRoom { username } => {
                inner.registry.check_create(&username, connection)?;
                inner.release_connection(connection);

                let code = inner.registry.create_room(&username, connection)?;
                inner.send(
                    connection,
                    &ServerMessage::RoomCreated {
                        room_id: code.to_string(),
                        is_host: true,
                    },
                );
            }

            ClientMessage::JoinRoom { room_id, username } => {
                inner.registry.check_join(&room_id, &username, connection)?;
                inner.release_connection(connection);

                let outcome = inner.registry.join_room(&room_id, &username, connection)?;
                inner.send(
                    connection,
                    &ServerMessage::RoomJoined {
                        room_id: outcome.room.to_string(),
                        participants: outcome.participants.clone(),
                        is_host: false,
                        host: Some(outcome.host.clone()),
                    },
                );

                let new_peer = ServerMessage::NewPeer {
                    username: username.clone(),
                };
                for member in &outcome.participants {
                    inner.send_to_user(member, &new_peer);
                }
            }

            ClientMessage::Offer { .. }
            | ClientMessage::Answer { .. }
            | ClientMessage::IceCandidate { .. } => {
                let Some(peer_id) = message.forward_target() else {
                    return Ok(());
                };
                match inner.registry.client(peer_id) {
                    Some(target) => inner.send_raw(target.connection, raw.to_string()),
                    None => warn!("Target client {} not found", peer_id),
                }
            }
        }
        Ok(())
    }

    /// Tear down a connection and notify its room.
    pub async fn disconnect(&self, connection: ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&connection);
        match inner.release_connection(connection) {
            Some(departure) => info!(
                "User {} disconnected from room {}",
                departure.username, departure.room
            ),
            None => debug!("Unregistered connection {} closed", connection),
        }
    }

    /// Snapshot of the relay's tables.
    pub async fn stats(&self) -> RelayStats {
        let inner = self.inner.lock().await;
        RelayStats {
            rooms: inner.registry.room_count(),
            clients: inner.registry.client_count(),
            connections: inner.connections.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::MAX_ROOM_SIZE;
    use serde_json::{json, Value};

    struct TestClient {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl TestClient {
        async fn connect(relay: &SignallingRelay) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = relay.connect(tx).await;
            Self { id, rx }
        }

        fn next(&mut self) -> ServerMessage {
            let text = self.rx.try_recv().expect("expected a queued frame");
            ServerMessage::decode(&text).unwrap()
        }

        fn next_raw(&mut self) -> String {
            self.rx.try_recv().expect("expected a queued frame")
        }

        fn assert_idle(&mut self) {
            assert!(self.rx.try_recv().is_err(), "unexpected frame queued");
        }
    }

    async fn create(relay: &SignallingRelay, client: &mut TestClient, name: &str) -> String {
        relay
            .handle_text(client.id, &json!({"type": "create-room", "username": name}).to_string())
            .await;
        match client.next() {
            ServerMessage::RoomCreated { room_id, is_host } => {
                assert!(is_host);
                room_id
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn join(relay: &SignallingRelay, client: &mut TestClient, room: &str, name: &str) -> ServerMessage {
        relay
            .handle_text(
                client.id,
                &json!({"type": "join-room", "roomId": room, "username": name}).to_string(),
            )
            .await;
        client.next()
    }

    #[tokio::test]
    async fn create_then_join_notifies_existing_members() {
        let relay = SignallingRelay::default();
        let mut alice = TestClient::connect(&relay).await;
        let mut bob = TestClient::connect(&relay).await;

        let room = create(&relay, &mut alice, "alice").await;
        let reply = join(&relay, &mut bob, &room, "bob").await;

        assert_eq!(
            reply,
            ServerMessage::RoomJoined {
                room_id: room.clone(),
                participants: vec!["alice".into()],
                is_host: false,
                host: Some("alice".into()),
            }
        );
        assert_eq!(alice.next(), ServerMessage::NewPeer { username: "bob".into() });
        bob.assert_idle();
    }

    #[tokio::test]
    async fn join_failures_are_typed_errors() {
        let relay = SignallingRelay::default();
        let mut host = TestClient::connect(&relay).await;
        let room = create(&relay, &mut host, "u0").await;

        let mut stranger = TestClient::connect(&relay).await;
        assert_eq!(
            join(&relay, &mut stranger, "zzzzzz", "s").await,
            ServerMessage::error("Room does not exist")
        );

        let mut members = Vec::new();
        for i in 1..MAX_ROOM_SIZE {
            let mut c = TestClient::connect(&relay).await;
            join(&relay, &mut c, &room, &format!("u{i}")).await;
            members.push(c);
        }
        assert_eq!(
            join(&relay, &mut stranger, &room, "late").await,
            ServerMessage::error("Room is full")
        );
    }

    #[tokio::test]
    async fn failed_join_keeps_current_membership() {
        let relay = SignallingRelay::default();
        let mut alice = TestClient::connect(&relay).await;
        let mut bob = TestClient::connect(&relay).await;
        let room = create(&relay, &mut alice, "alice").await;
        join(&relay, &mut bob, &room, "bob").await;
        alice.next();

        assert_eq!(
            join(&relay, &mut bob, "zzzzzz", "bob").await,
            ServerMessage::error("Room does not exist")
        );
        assert_eq!(
            join(&relay, &mut bob, &room, "bob").await,
            ServerMessage::error("Already in this room")
        );
        alice.assert_idle();
        bob.assert_idle();

        assert_eq!(relay.stats().await, RelayStats { rooms: 1, clients: 2, connections: 2 });
        let inner = relay.inner.lock().await;
        assert_eq!(inner.registry.room(&room).unwrap().participants(), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn failed_join_to_full_room_keeps_host() {
        let relay = SignallingRelay::new(Registry::new(1));
        let mut alice = TestClient::connect(&relay).await;
        let mut bob = TestClient::connect(&relay).await;
        let full = create(&relay, &mut alice, "alice").await;
        let own = create(&relay, &mut bob, "bob").await;

        assert_eq!(
            join(&relay, &mut bob, &full, "bob").await,
            ServerMessage::error("Room is full")
        );
        alice.assert_idle();
        bob.assert_idle();

        let inner = relay.inner.lock().await;
        assert_eq!(inner.registry.room(&own).unwrap().host(), "bob");
        assert_eq!(inner.registry.room_count(), 2);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames() {
        let relay = SignallingRelay::default();
        let mut c = TestClient::connect(&relay).await;

        relay.handle_text(c.id, "not json").await;
        assert_eq!(c.next(), ServerMessage::error("Invalid message format"));

        relay.handle_text(c.id, r#"{"type":"dance"}"#).await;
        assert_eq!(c.next(), ServerMessage::error("Unknown message type"));

        relay.handle_text(c.id, r#"{"type":"join-room","username":"x"}"#).await;
        assert_eq!(c.next(), ServerMessage::error("Invalid message format"));

        relay.handle_bytes(c.id, &[0xff, 0xfe]).await;
        assert_eq!(c.next(), ServerMessage::error("Invalid message format"));
    }

    #[tokio::test]
    async fn handshake_forwarded_verbatim() {
        let relay = SignallingRelay::default();
        let mut alice = TestClient::connect(&relay).await;
        let mut bob = TestClient::connect(&relay).await;
        let room = create(&relay, &mut alice, "alice").await;
        join(&relay, &mut bob, &room, "bob").await;
        alice.next();

        let offer = r#"{"type":"offer","offer":{"type":"offer","sdp":"v=0"},"peerId":"alice","from":"bob","extra":1}"#;
        relay.handle_text(bob.id, offer).await;
        assert_eq!(alice.next_raw(), offer);
        bob.assert_idle();
    }

    #[tokio::test]
    async fn forward_to_unknown_peer_is_dropped_silently() {
        let relay = SignallingRelay::default();
        let mut bob = TestClient::connect(&relay).await;
        relay
            .handle_text(
                bob.id,
                r#"{"type":"answer","answer":{},"peerId":"nobody","from":"bob"}"#,
            )
            .await;
        bob.assert_idle();
    }

    #[tokio::test]
    async fn host_disconnect_promotes_first_remaining() {
        let relay = SignallingRelay::default();
        let mut alice = TestClient::connect(&relay).await;
        let mut bob = TestClient::connect(&relay).await;
        let mut carol = TestClient::connect(&relay).await;

        let room = create(&relay, &mut alice, "alice").await;
        join(&relay, &mut bob, &room, "bob").await;
        join(&relay, &mut carol, &room, "carol").await;
        alice.next();
        alice.next();
        bob.next();

        relay.disconnect(alice.id).await;

        assert_eq!(bob.next(), ServerMessage::HostAssigned { is_host: true });
        assert_eq!(bob.next(), ServerMessage::PeerDisconnected { username: "alice".into() });
        bob.assert_idle();

        assert_eq!(carol.next(), ServerMessage::HostChanged { new_host: "bob".into() });
        assert_eq!(carol.next(), ServerMessage::PeerDisconnected { username: "alice".into() });
        carol.assert_idle();

        let stats = relay.stats().await;
        assert_eq!(stats, RelayStats { rooms: 1, clients: 2, connections: 2 });
    }

    #[tokio::test]
    async fn last_disconnect_removes_room() {
        let relay = SignallingRelay::default();
        let mut alice = TestClient::connect(&relay).await;
        create(&relay, &mut alice, "alice").await;

        relay.disconnect(alice.id).await;
        assert_eq!(relay.stats().await, RelayStats { rooms: 0, clients: 0, connections: 0 });
    }

    #[tokio::test]
    async fn username_held_by_other_connection_is_rejected() {
        let relay = SignallingRelay::default();
        let mut alice = TestClient::connect(&relay).await;
        let mut imposter = TestClient::connect(&relay).await;
        let room = create(&relay, &mut alice, "alice").await;

        assert_eq!(
            join(&relay, &mut imposter, &room, "alice").await,
            ServerMessage::error("Username is already taken")
        );
        alice.assert_idle();
    }

    #[tokio::test]
    async fn rejoin_from_same_connection_leaves_previous_room() {
        let relay = SignallingRelay::default();
        let mut alice = TestClient::connect(&relay).await;
        let mut bob = TestClient::connect(&relay).await;
        let first = create(&relay, &mut alice, "alice").await;
        join(&relay, &mut bob, &first, "bob").await;
        alice.next();

        let second = create(&relay, &mut bob, "bob").await;
        assert_ne!(first, second);
        assert_eq!(alice.next(), ServerMessage::PeerDisconnected { username: "bob".into() });
        assert_eq!(relay.stats().await.rooms, 2);
    }

    #[tokio::test]
    async fn error_text_matches_wire_contract() {
        let relay = SignallingRelay::default();
        let mut c = TestClient::connect(&relay).await;
        relay
            .handle_text(c.id, r#"{"type":"join-room","roomId":"000000","username":"x"}"#)
            .await;
        let value: Value = serde_json::from_str(&c.next_raw()).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "Room does not exist"}));
    }
}
