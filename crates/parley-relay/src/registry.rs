//! Relay Registry - room membership and client bookkeeping.
//!
//! Maps room codes to ordered participant lists and usernames to their relay
//! connection. The registry knows nothing about the mesh: it only answers
//! "who is in which room, who hosts it, and how do I reach them".
//!
//! # Host failover
//!
//! Participants are kept in join order. When the host leaves, the first
//! remaining participant becomes host, so failover is deterministic.

use std::collections::HashMap;
use std::fmt;

use parley_protocol::{MAX_ROOM_SIZE, ROOM_CODE_LEN};
use tracing::{debug, info};

use crate::error::{RelayError, Result};

/// Opaque handle for one relay-facing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Short room code handed out on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Derive a fresh code from 128 random bits.
    pub fn generate() -> Self {
        let seed: [u8; 16] = rand::random();
        let digest = blake3::hash(&seed);
        let mut code = hex::encode(digest.as_bytes());
        code.truncate(ROOM_CODE_LEN);
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A room and its members in join order.
#[derive(Debug, Clone)]
pub struct Room {
    pub code: RoomCode,
    participants: Vec<String>,
    host: String,
}

impl Room {
    fn new(code: RoomCode, host: &str) -> Self {
        Self {
            code,
            participants: vec![host.to_string()],
            host: host.to_string(),
        }
    }

    /// Members in join order.
    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.participants.iter().any(|p| p == username)
    }
}

/// Binds a username to its live relay connection and room.
///
/// Holds only the connection's id; the connection's lifetime belongs to the
/// transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayClient {
    pub username: String,
    pub room: RoomCode,
    pub connection: ConnectionId,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: RoomCode,
    /// Everyone already in the room, excluding the joiner.
    pub participants: Vec<String>,
    pub host: String,
}

/// What happened to a room when a client was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub username: String,
    pub room: RoomCode,
    /// Members still in the room, in join order.
    pub remaining: Vec<String>,
    /// Set when the departing client was host and someone was promoted.
    pub new_host: Option<String>,
    /// The room was deleted because it became empty.
    pub room_removed: bool,
}

/// Room and client tables.
#[derive(Debug)]
pub struct Registry {
    rooms: HashMap<RoomCode, Room>,
    clients: HashMap<String, RelayClient>,
    max_room_size: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(MAX_ROOM_SIZE)
    }
}

impl Registry {
    /// Create an empty registry with the given room capacity.
    pub fn new(max_room_size: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            clients: HashMap::new(),
            max_room_size: max_room_size.max(1),
        }
    }

    /// Create a room holding only `username`, who becomes host.
    pub fn create_room(&mut self, username: &str, connection: ConnectionId) -> Result<RoomCode> {
        self.check_username(username)?;

        let code = loop {
            let candidate = RoomCode::generate();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
            debug!("Room code collision on {}, regenerating", candidate);
        };

        self.rooms.insert(code.clone(), Room::new(code.clone(), username));
        self.clients.insert(
            username.to_string(),
            RelayClient {
                username: username.to_string(),
                room: code.clone(),
                connection,
            },
        );

        info!("Room {} created by {}", code, username);
        Ok(code)
    }

    /// Add `username` to an existing room.
    pub fn join_room(
        &mut self,
        code: &str,
        username: &str,
        connection: ConnectionId,
    ) -> Result<JoinOutcome> {
        let code = RoomCode::new(code);
        let room = self.rooms.get(&code).ok_or(RelayError::RoomNotFound)?;
        if room.len() >= self.max_room_size {
            return Err(RelayError::RoomFull);
        }
        self.check_username(username)?;

        let room = self.rooms.get_mut(&code).ok_or(RelayError::RoomNotFound)?;

        let participants = room.participants.clone();
        room.participants.push(username.to_string());
        let host = room.host.clone();

        self.clients.insert(
            username.to_string(),
            RelayClient {
                username: username.to_string(),
                room: code.clone(),
                connection,
            },
        );

        info!("User {} joined room {}", username, code);
        Ok(JoinOutcome {
            room: code,
            participants,
            host,
        })
    }

    /// Check whether `connection` may create a room as `username` once its
    /// current membership is released. Changes nothing.
    pub fn check_create(&self, username: &str, connection: ConnectionId) -> Result<()> {
        self.check_claim(username, connection)
    }

    /// Check whether `connection` may join `code` as `username` once its
    /// current membership is released. Changes nothing.
    ///
    /// Errors come in the same precedence as [`Registry::join_room`]: a
    /// missing room, then a full one, then an unusable username.
    pub fn check_join(&self, code: &str, username: &str, connection: ConnectionId) -> Result<()> {
        let room = self.room(code).ok_or(RelayError::RoomNotFound)?;
        if self
            .client_by_connection(connection)
            .is_some_and(|c| c.room == room.code)
        {
            return Err(RelayError::AlreadyInRoom);
        }
        if room.len() >= self.max_room_size {
            return Err(RelayError::RoomFull);
        }
        self.check_claim(username, connection)
    }

    /// Remove a client and update its room.
    ///
    /// Deletes the room when it becomes empty; otherwise promotes the first
    /// remaining participant if the host left. Returns `None` for unknown
    /// usernames.
    pub fn remove_client(&mut self, username: &str) -> Option<Departure> {
        let client = self.clients.remove(username)?;

        let Some(room) = self.rooms.get_mut(&client.room) else {
            return Some(Departure {
                username: client.username,
                room: client.room,
                remaining: Vec::new(),
                new_host: None,
                room_removed: true,
            });
        };

        room.participants.retain(|p| p != username);

        if room.is_empty() {
            self.rooms.remove(&client.room);
            info!("Room {} removed (empty)", client.room);
            return Some(Departure {
                username: client.username,
                room: client.room,
                remaining: Vec::new(),
                new_host: None,
                room_removed: true,
            });
        }

        let mut new_host = None;
        if room.host == username {
            room.host = room.participants[0].clone();
            info!("Promoted {} to host of room {}", room.host, client.room);
            new_host = Some(room.host.clone());
        }

        info!("User {} left room {}", username, client.room);
        Some(Departure {
            username: client.username,
            room: client.room,
            remaining: room.participants.clone(),
            new_host,
            room_removed: false,
        })
    }

    /// Look up a client by username.
    pub fn client(&self, username: &str) -> Option<&RelayClient> {
        self.clients.get(username)
    }

    /// Find the client bound to a connection.
    ///
    /// Linear scan; rooms are small and connections close rarely.
    pub fn client_by_connection(&self, connection: ConnectionId) -> Option<&RelayClient> {
        self.clients.values().find(|c| c.connection == connection)
    }

    pub fn room(&self, code: &str) -> Option<&Room> {
        self.rooms.get(&RoomCode::new(code))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn max_room_size(&self) -> usize {
        self.max_room_size
    }

    /// Like `check_username`, but a name held by `connection` itself is
    /// free because releasing the connection gives it up.
    fn check_claim(&self, username: &str, connection: ConnectionId) -> Result<()> {
        if username.trim().is_empty() {
            return Err(RelayError::Malformed("username must not be empty".into()));
        }
        match self.clients.get(username) {
            Some(existing) if existing.connection != connection => Err(RelayError::UsernameTaken),
            _ => Ok(()),
        }
    }

    fn check_username(&self, username: &str) -> Result<()> {
        if username.trim().is_empty() {
            return Err(RelayError::Malformed("username must not be empty".into()));
        }
        if self.clients.contains_key(username) {
            return Err(RelayError::UsernameTaken);
        }
        Ok(())
    }
}
