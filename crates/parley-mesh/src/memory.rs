//! In-process transport.
//!
//! A [`Switchboard`] connects synchronizers running in the same process.
//! Each synchronizer attaches its event queue under its username and gets a
//! [`MemoryNegotiator`]. Descriptors are small JSON objects naming the
//! sender and its link id; when an initiator accepts an answer the
//! switchboard wires a [`MemoryChannel`] pair and delivers `ChannelOpened`
//! to both queues, each stamped with the receiving side's link id.
//!
//! Used by the integration tests and for local demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::events::SyncEvent;
use crate::link::LinkId;
use crate::transport::{DataChannel, Negotiator};

type EventTx = mpsc::UnboundedSender<SyncEvent>;

#[derive(Default)]
struct Board {
    peers: HashMap<String, EventTx>,
    wires: Vec<Wire>,
}

struct Wire {
    a: String,
    a_link: LinkId,
    b: String,
    b_link: LinkId,
    closed: Arc<AtomicBool>,
}

/// Shared routing table for in-memory channels.
#[derive(Clone, Default)]
pub struct Switchboard {
    board: Arc<Mutex<Board>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `username`'s event queue.
    pub fn attach(&self, username: impl Into<String>, events: EventTx) {
        self.lock().peers.insert(username.into(), events);
    }

    /// A negotiator speaking for `username`.
    pub fn negotiator(&self, username: impl Into<String>) -> MemoryNegotiator {
        MemoryNegotiator {
            me: username.into(),
            switchboard: self.clone(),
            roles: HashMap::new(),
        }
    }

    /// Drop `username` as if its process died: every channel it held is
    /// reported closed to the other end.
    pub fn disconnect(&self, username: &str) {
        let mut board = self.lock();
        board.peers.remove(username);
        let (gone, kept): (Vec<Wire>, Vec<Wire>) = std::mem::take(&mut board.wires)
            .into_iter()
            .partition(|w| w.a == username || w.b == username);
        board.wires = kept;
        for wire in gone {
            if wire.closed.swap(true, Ordering::SeqCst) {
                continue;
            }
            let (other, link) = if wire.a == username {
                (&wire.b, wire.b_link)
            } else {
                (&wire.a, wire.a_link)
            };
            if let Some(tx) = board.peers.get(other) {
                let _ = tx.send(SyncEvent::ChannelClosed {
                    peer: username.to_string(),
                    link,
                });
            }
        }
        debug!("switchboard: {} disconnected", username);
    }

    /// Number of live channel pairs.
    pub fn open_channels(&self) -> usize {
        self.lock()
            .wires
            .iter()
            .filter(|w| !w.closed.load(Ordering::SeqCst))
            .count()
    }

    fn sender(&self, username: &str) -> Option<EventTx> {
        self.lock().peers.get(username).cloned()
    }

    fn connect(
        &self,
        local: &str,
        local_link: LinkId,
        remote: &str,
        remote_link: LinkId,
    ) -> Result<(), TransportError> {
        let mut board = self.lock();
        let (Some(local_tx), Some(remote_tx)) =
            (board.peers.get(local).cloned(), board.peers.get(remote).cloned())
        else {
            return Err(TransportError::new(format!("{remote} is unreachable")));
        };

        let closed = Arc::new(AtomicBool::new(false));
        board.wires.push(Wire {
            a: local.to_string(),
            a_link: local_link,
            b: remote.to_string(),
            b_link: remote_link,
            closed: Arc::clone(&closed),
        });

        let ours = MemoryChannel {
            local: local.to_string(),
            link: local_link,
            remote: remote.to_string(),
            remote_link,
            to_local: local_tx.clone(),
            to_remote: remote_tx.clone(),
            closed: Arc::clone(&closed),
        };
        let theirs = MemoryChannel {
            local: remote.to_string(),
            link: remote_link,
            remote: local.to_string(),
            remote_link: local_link,
            to_local: remote_tx.clone(),
            to_remote: local_tx.clone(),
            closed,
        };

        let opened = local_tx
            .send(SyncEvent::ChannelOpened {
                peer: remote.to_string(),
                link: local_link,
                channel: Box::new(ours),
            })
            .and_then(|()| {
                remote_tx.send(SyncEvent::ChannelOpened {
                    peer: local.to_string(),
                    link: remote_link,
                    channel: Box::new(theirs),
                })
            });
        opened.map_err(|_| TransportError::new("event queue closed"))
    }
}

/// One end of an in-memory channel.
pub struct MemoryChannel {
    local: String,
    link: LinkId,
    remote: String,
    remote_link: LinkId,
    to_local: EventTx,
    to_remote: EventTx,
    closed: Arc<AtomicBool>,
}

impl DataChannel for MemoryChannel {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::new("channel closed"));
        }
        self.to_remote
            .send(SyncEvent::ChannelMessage {
                peer: self.local.clone(),
                link: self.remote_link,
                payload: payload.to_vec(),
            })
            .map_err(|_| TransportError::new(format!("{} is gone", self.remote)))
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.to_remote.send(SyncEvent::ChannelClosed {
            peer: self.local.clone(),
            link: self.remote_link,
        });
        let _ = self.to_local.send(SyncEvent::ChannelClosed {
            peer: self.remote.clone(),
            link: self.link,
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct Role {
    link: LinkId,
    initiator: bool,
    remote_accepted: bool,
}

/// Negotiator backed by a [`Switchboard`].
pub struct MemoryNegotiator {
    me: String,
    switchboard: Switchboard,
    roles: HashMap<String, Role>,
}

impl MemoryNegotiator {
    fn role(&self, peer: &str) -> Result<Role, TransportError> {
        self.roles
            .get(peer)
            .copied()
            .ok_or_else(|| TransportError::new(format!("no connection prepared for {peer}")))
    }

    fn descriptor(&self, kind: &str, link: LinkId) -> Value {
        json!({ "type": kind, "from": self.me, "link": link.0 })
    }
}

impl Negotiator for MemoryNegotiator {
    fn open(&mut self, peer: &str, link: LinkId, initiator: bool) -> Result<(), TransportError> {
        let own = self
            .switchboard
            .sender(&self.me)
            .ok_or_else(|| TransportError::new(format!("{} is not attached", self.me)))?;
        self.roles.insert(
            peer.to_string(),
            Role {
                link,
                initiator,
                remote_accepted: false,
            },
        );
        let _ = own.send(SyncEvent::LocalCandidate {
            peer: peer.to_string(),
            candidate: json!({ "candidate": format!("memory:{}", self.me) }),
        });
        Ok(())
    }

    fn create_local_descriptor(&mut self, peer: &str) -> Result<Value, TransportError> {
        let role = self.role(peer)?;
        if role.initiator {
            Ok(self.descriptor("offer", role.link))
        } else if role.remote_accepted {
            Ok(self.descriptor("answer", role.link))
        } else {
            Err(TransportError::new("cannot answer before an offer"))
        }
    }

    fn accept_remote_descriptor(&mut self, peer: &str, descriptor: Value) -> Result<(), TransportError> {
        let role = self.role(peer)?;
        let expected = if role.initiator { "answer" } else { "offer" };
        if descriptor["type"] != expected || descriptor["from"] != peer {
            return Err(TransportError::new(format!(
                "expected {expected} from {peer}, got {descriptor}"
            )));
        }
        let remote_link = descriptor["link"]
            .as_u64()
            .map(LinkId)
            .ok_or_else(|| TransportError::new(format!("descriptor without link id: {descriptor}")))?;
        if role.remote_accepted {
            return Err(TransportError::new("remote descriptor already set"));
        }
        if let Some(role) = self.roles.get_mut(peer) {
            role.remote_accepted = true;
        }
        if role.initiator {
            self.switchboard.connect(&self.me, role.link, peer, remote_link)?;
        }
        Ok(())
    }

    fn add_remote_candidate(&mut self, peer: &str, candidate: Value) -> Result<(), TransportError> {
        self.role(peer)?;
        match candidate["candidate"].as_str() {
            Some(_) => Ok(()),
            None => Err(TransportError::new(format!("invalid candidate {candidate}"))),
        }
    }

    fn close_peer(&mut self, peer: &str) {
        self.roles.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(board: &Switchboard, name: &str) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        board.attach(name, tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn take_channel(events: Vec<SyncEvent>) -> Box<dyn DataChannel> {
        events
            .into_iter()
            .find_map(|ev| match ev {
                SyncEvent::ChannelOpened { channel, .. } => Some(channel),
                _ => None,
            })
            .expect("channel opened")
    }

    #[test]
    fn offer_answer_opens_both_ends() {
        let board = Switchboard::new();
        let mut alice_rx = attach(&board, "alice");
        let mut bob_rx = attach(&board, "bob");
        let mut alice = board.negotiator("alice");
        let mut bob = board.negotiator("bob");

        alice.open("bob", LinkId(1), false).unwrap();
        bob.open("alice", LinkId(2), true).unwrap();
        let offer = bob.create_local_descriptor("alice").unwrap();
        alice.accept_remote_descriptor("bob", offer).unwrap();
        let answer = alice.create_local_descriptor("bob").unwrap();
        bob.accept_remote_descriptor("alice", answer).unwrap();

        let alice_events = drain(&mut alice_rx);
        let bob_events = drain(&mut bob_rx);
        assert!(alice_events
            .iter()
            .any(|ev| matches!(ev, SyncEvent::ChannelOpened { peer, link, .. } if peer == "bob" && *link == LinkId(1))));
        assert!(bob_events
            .iter()
            .any(|ev| matches!(ev, SyncEvent::LocalCandidate { peer, .. } if peer == "alice")));

        let mut to_alice = take_channel(bob_events);
        to_alice.send(b"hi").unwrap();
        match drain(&mut alice_rx).pop() {
            Some(SyncEvent::ChannelMessage { peer, link, payload }) => {
                assert_eq!(peer, "bob");
                assert_eq!(link, LinkId(1));
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(board.open_channels(), 1);
    }

    #[test]
    fn responder_cannot_answer_without_offer() {
        let board = Switchboard::new();
        let _rx = attach(&board, "alice");
        let mut alice = board.negotiator("alice");
        alice.open("bob", LinkId(1), false).unwrap();
        assert!(alice.create_local_descriptor("bob").is_err());
    }

    #[test]
    fn wrong_descriptor_is_rejected() {
        let board = Switchboard::new();
        let _rx = attach(&board, "alice");
        let mut alice = board.negotiator("alice");
        alice.open("bob", LinkId(1), false).unwrap();
        let err = alice
            .accept_remote_descriptor("bob", json!({"type": "answer", "from": "bob", "link": 2}))
            .unwrap_err();
        assert!(err.0.contains("expected offer"));

        let err = alice
            .accept_remote_descriptor("bob", json!({"type": "offer", "from": "bob"}))
            .unwrap_err();
        assert!(err.0.contains("without link id"));
    }

    #[test]
    fn disconnect_reports_close_to_survivors() {
        let board = Switchboard::new();
        let mut alice_rx = attach(&board, "alice");
        let _bob_rx = attach(&board, "bob");
        board.connect("bob", LinkId(1), "alice", LinkId(2)).unwrap();
        drain(&mut alice_rx);

        board.disconnect("bob");
        let events = drain(&mut alice_rx);
        assert!(matches!(
            events.as_slice(),
            [SyncEvent::ChannelClosed { peer, link }] if peer == "bob" && *link == LinkId(2)
        ));
        assert_eq!(board.open_channels(), 0);
    }

    #[test]
    fn closing_twice_notifies_once() {
        let board = Switchboard::new();
        let mut alice_rx = attach(&board, "alice");
        let mut bob_rx = attach(&board, "bob");
        board.connect("alice", LinkId(3), "bob", LinkId(4)).unwrap();
        let mut ours = take_channel(drain(&mut alice_rx));
        drain(&mut bob_rx);

        ours.close();
        ours.close();
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [SyncEvent::ChannelClosed { peer, link }] if peer == "alice" && *link == LinkId(4)
        ));
        // The closing side hears about it too, under its own link id.
        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [SyncEvent::ChannelClosed { peer, link }] if peer == "bob" && *link == LinkId(3)
        ));
        assert!(ours.send(b"late").is_err());
    }
}
