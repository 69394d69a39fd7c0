//! Mesh Synchronizer - one actor per local peer.
//!
//! The actor owns the peer's [`LocalRoomState`], its links to every other
//! participant and the [`Negotiator`]. Relay notifications, channel events,
//! locally discovered candidates, user actions and timer ticks all arrive
//! through one ordered queue, so state mutations are applied strictly in
//! receipt order.
//!
//! # Handshake roles
//!
//! The joiner initiates toward every participant listed in `room-joined`.
//! Existing members create a responder link on `new-peer` and wait for the
//! joiner's offer.
//!
//! # Channel open
//!
//! When a channel is confirmed open the actor sends, in order,
//! `participantJoined{self}` and then a `state` snapshot.
//!
//! Each link is created with a fresh [`LinkId`]. Channel events whose id
//! is not the current link's are leftovers from a replaced channel and
//! are ignored.

use std::collections::BTreeMap;
use std::time::Duration;

use parley_protocol::{ClientMessage, DataMessage, PokerCard, ServerMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{MeshError, Result, TransportError};
use crate::events::{LocalAction, SyncEvent};
use crate::link::{LinkId, LinkState, LinkStatus, PeerLink};
use crate::state::{ApplyOutcome, LocalRoomState};
use crate::transport::{DataChannel, Negotiator};

/// Synchronizer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a link may stay `Negotiating` before it is marked failed.
    /// `None` disables the sweep.
    pub handshake_timeout: Option<Duration>,

    /// How often pending handshakes are checked.
    pub sweep_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Immutable picture of a synchronizer, published after every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub state: LocalRoomState,
    pub links: BTreeMap<String, LinkStatus>,
    pub last_error: Option<String>,
}

impl RoomView {
    /// Peers whose channel is open.
    pub fn open_peers(&self) -> Vec<&str> {
        self.links
            .iter()
            .filter(|(_, status)| status.state == "channel-open")
            .map(|(peer, _)| peer.as_str())
            .collect()
    }
}

/// The per-peer actor.
pub struct Synchronizer {
    state: LocalRoomState,
    links: BTreeMap<String, PeerLink>,
    negotiator: Box<dyn Negotiator>,
    relay: mpsc::UnboundedSender<ClientMessage>,
    config: SyncConfig,
    view: watch::Sender<RoomView>,
    last_error: Option<String>,
    next_link: u64,
}

impl Synchronizer {
    /// Create a synchronizer for `username`.
    ///
    /// Outbound relay requests are written to `relay`; whoever owns the
    /// relay connection drains it.
    pub fn new(
        username: impl Into<String>,
        negotiator: Box<dyn Negotiator>,
        relay: mpsc::UnboundedSender<ClientMessage>,
        config: SyncConfig,
    ) -> Self {
        let state = LocalRoomState::new(username);
        let (view, _) = watch::channel(RoomView {
            state: state.clone(),
            links: BTreeMap::new(),
            last_error: None,
        });
        Self {
            state,
            links: BTreeMap::new(),
            negotiator,
            relay,
            config,
            view,
            last_error: None,
            next_link: 1,
        }
    }

    /// A fresh inbound queue for [`Synchronizer::spawn`].
    pub fn channel() -> (
        mpsc::UnboundedSender<SyncEvent>,
        mpsc::UnboundedReceiver<SyncEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    pub fn username(&self) -> &str {
        &self.state.username
    }

    pub fn state(&self) -> &LocalRoomState {
        &self.state
    }

    pub fn link_state(&self, peer: &str) -> Option<&LinkState> {
        self.links.get(peer).map(PeerLink::state)
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomView> {
        self.view.subscribe()
    }

    /// Process one event and publish the resulting view.
    pub fn handle(&mut self, event: SyncEvent) {
        self.handle_at(event, Instant::now());
    }

    /// Process one event as if it arrived at `now`.
    pub fn handle_at(&mut self, event: SyncEvent, now: Instant) {
        debug!("{} handling {}", self.username(), event.kind());
        let mut pending_reply = None;
        match event {
            SyncEvent::Relay(msg) => self.on_relay(msg, now),
            SyncEvent::ChannelOpened {
                peer,
                link,
                channel,
            } => self.on_channel_opened(peer, link, channel),
            SyncEvent::ChannelMessage {
                peer,
                link,
                payload,
            } => self.on_channel_message(&peer, link, &payload),
            SyncEvent::ChannelClosed { peer, link } => self.on_channel_closed(&peer, link),
            SyncEvent::LocalCandidate { peer, candidate } => {
                self.on_local_candidate(peer, candidate)
            }
            SyncEvent::Command { action, reply } => {
                let result = self.perform(action);
                match reply {
                    Some(reply) => pending_reply = Some((reply, result)),
                    None => {
                        if let Err(e) = result {
                            warn!("{}: local action failed: {}", self.username(), e);
                        }
                    }
                }
            }
            SyncEvent::Tick => self.sweep(now),
        }
        self.publish();
        if let Some((reply, result)) = pending_reply {
            let _ = reply.send(result);
        }
    }

    fn publish(&self) {
        let links = self
            .links
            .iter()
            .map(|(peer, link)| (peer.clone(), LinkStatus::from(link.state())))
            .collect();
        self.view.send_replace(RoomView {
            state: self.state.clone(),
            links,
            last_error: self.last_error.clone(),
        });
    }

    // ----- relay -----

    fn on_relay(&mut self, msg: ServerMessage, now: Instant) {
        match msg {
            ServerMessage::RoomCreated { room_id, .. } => {
                info!("{} created room {}", self.username(), room_id);
                self.close_all_links();
                self.last_error = None;
                self.state.enter_created_room(room_id);
            }
            ServerMessage::RoomJoined {
                room_id,
                participants,
                host,
                ..
            } => {
                info!(
                    "{} joined room {} with {} existing participant(s)",
                    self.username(),
                    room_id,
                    participants.len()
                );
                self.close_all_links();
                self.last_error = None;
                self.state
                    .enter_joined_room(room_id, &participants, host.as_deref());
                for peer in participants {
                    if peer != self.state.username {
                        self.start_initiator(peer, now);
                    }
                }
            }
            ServerMessage::NewPeer { username } => {
                if username == self.state.username {
                    return;
                }
                self.state.add_participant(&username);
                self.start_responder(username, now);
            }
            ServerMessage::PeerDisconnected { username } => {
                self.state.remove_participant(&username);
                if let Some(mut link) = self.links.remove(&username) {
                    link.close();
                    self.negotiator.close_peer(&username);
                    debug!("{} dropped link to {}", self.username(), username);
                }
            }
            ServerMessage::HostAssigned { is_host } => {
                if is_host {
                    info!("{} is now host", self.username());
                    let me = self.state.username.clone();
                    self.state.set_host(&me);
                }
            }
            ServerMessage::HostChanged { new_host } => {
                info!("{} sees new host {}", self.username(), new_host);
                self.state.set_host(&new_host);
            }
            ServerMessage::Offer { offer, from, .. } => self.on_offer(from, offer, now),
            ServerMessage::Answer { answer, from, .. } => self.on_answer(from, answer),
            ServerMessage::IceCandidate {
                candidate, from, ..
            } => self.on_remote_candidate(from, candidate),
            ServerMessage::Error { message } => {
                warn!("{}: relay error: {}", self.username(), message);
                self.last_error = Some(message);
            }
        }
    }

    fn allocate_link(&mut self) -> LinkId {
        let id = LinkId(self.next_link);
        self.next_link += 1;
        id
    }

    /// True when `link` is the id of the current link to `peer`.
    fn is_current(&self, peer: &str, link: LinkId) -> bool {
        self.links.get(peer).is_some_and(|l| l.id() == link)
    }

    fn start_initiator(&mut self, peer: String, now: Instant) {
        let id = self.allocate_link();
        self.replace_link(PeerLink::initiator(peer.clone(), id, now));
        info!("{} initiating {} to {}", self.username(), id, peer);

        let offer = self
            .negotiator
            .open(&peer, id, true)
            .and_then(|()| self.negotiator.create_local_descriptor(&peer));
        match offer {
            Ok(offer) => {
                let from = self.state.username.clone();
                self.send_relay(ClientMessage::Offer {
                    offer,
                    peer_id: peer,
                    from,
                });
            }
            Err(reason) => self.fail_handshake(&peer, reason),
        }
    }

    fn start_responder(&mut self, peer: String, now: Instant) {
        let id = self.allocate_link();
        self.replace_link(PeerLink::responder(peer.clone(), id, now));
        info!("{} waiting for offer from {} on {}", self.username(), peer, id);
        if let Err(reason) = self.negotiator.open(&peer, id, false) {
            self.fail_handshake(&peer, reason);
        }
    }

    fn replace_link(&mut self, link: PeerLink) {
        let peer = link.peer().to_string();
        if let Some(mut old) = self.links.insert(peer.clone(), link) {
            old.close();
            self.negotiator.close_peer(&peer);
        }
    }

    fn on_offer(&mut self, from: String, offer: Value, now: Instant) {
        let fresh = match self.links.get(&from) {
            Some(link) => !link.is_negotiating(),
            None => true,
        };
        if fresh {
            // Offer overtook new-peer, or the peer is restarting its handshake.
            self.start_responder(from.clone(), now);
        }

        let answer = self
            .negotiator
            .accept_remote_descriptor(&from, offer)
            .and_then(|()| self.negotiator.create_local_descriptor(&from));
        match answer {
            Ok(answer) => {
                let me = self.state.username.clone();
                self.send_relay(ClientMessage::Answer {
                    answer,
                    peer_id: from,
                    from: me,
                });
            }
            Err(reason) => self.fail_handshake(&from, reason),
        }
    }

    fn on_answer(&mut self, from: String, answer: Value) {
        if !self.links.get(&from).is_some_and(PeerLink::is_negotiating) {
            warn!("{}: {}", self.username(), MeshError::UnknownPeer(from));
            return;
        }
        if let Err(reason) = self.negotiator.accept_remote_descriptor(&from, answer) {
            self.fail_handshake(&from, reason);
        }
    }

    fn on_remote_candidate(&mut self, from: String, candidate: Value) {
        if !self.links.contains_key(&from) {
            debug!("{}: candidate for {} without a link", self.username(), from);
            return;
        }
        if let Err(reason) = self.negotiator.add_remote_candidate(&from, candidate) {
            self.fail_handshake(&from, reason);
        }
    }

    fn fail_handshake(&mut self, peer: &str, reason: TransportError) {
        let err = MeshError::HandshakeFailure {
            peer: peer.to_string(),
            reason,
        };
        warn!("{}: {}", self.username(), err);
        if let Some(link) = self.links.get_mut(peer) {
            link.fail(err.to_string());
        }
    }

    fn send_relay(&self, msg: ClientMessage) -> bool {
        if self.relay.send(msg).is_err() {
            warn!("{}: relay connection closed, request dropped", self.username());
            return false;
        }
        true
    }

    // ----- channels -----

    fn on_channel_opened(&mut self, peer: String, link: LinkId, mut channel: Box<dyn DataChannel>) {
        if !self.is_current(&peer, link) {
            debug!("{}: channel from {} on unknown {}, closing", self.username(), peer, link);
            channel.close();
            return;
        }
        let Some(current) = self.links.get_mut(&peer).filter(|l| l.accepts_channel()) else {
            debug!("{}: {} to {} already finished, closing late channel", self.username(), link, peer);
            channel.close();
            return;
        };
        current.open(channel);
        info!("{} channel open to {}", self.username(), peer);
        self.state.add_participant(&peer);

        let announce = DataMessage::ParticipantJoined {
            username: self.state.username.clone(),
        };
        let snapshot = self.state.snapshot();
        for msg in [announce, snapshot] {
            if let Err(e) = self.send_to(&peer, &msg) {
                warn!("{}: failed to send {} to {}: {}", self.username(), msg.kind(), peer, e);
            }
        }
    }

    fn on_channel_message(&mut self, peer: &str, link: LinkId, payload: &[u8]) {
        if !self.is_current(peer, link) {
            debug!("{}: message from {} on stale {}, ignoring", self.username(), peer, link);
            return;
        }
        let msg = match DataMessage::decode(payload) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("{}: ignoring unknown message type from {}", self.username(), peer);
                return;
            }
            Err(e) => {
                warn!("{}: {} (from {})", self.username(), MeshError::Parse(e), peer);
                return;
            }
        };
        match self.state.apply(&msg) {
            ApplyOutcome::Dropped(reason) => {
                debug!("{}: dropped {} from {}: {}", self.username(), msg.kind(), peer, reason);
            }
            outcome => {
                debug!("{}: {} from {}: {:?}", self.username(), msg.kind(), peer, outcome);
            }
        }
    }

    fn on_channel_closed(&mut self, peer: &str, link: LinkId) {
        if !self.is_current(peer, link) {
            debug!("{}: close of stale {} to {}, ignoring", self.username(), link, peer);
            return;
        }
        let Some(mut link) = self.links.remove(peer) else {
            return;
        };
        link.close();
        self.negotiator.close_peer(peer);
        info!("{} channel closed to {}", self.username(), peer);

        let left = DataMessage::ParticipantLeft {
            username: peer.to_string(),
        };
        self.broadcast(&left);
        self.state.remove_participant(peer);
    }

    fn on_local_candidate(&mut self, peer: String, candidate: Value) {
        if !self.links.contains_key(&peer) {
            debug!("{}: local candidate for {} without a link", self.username(), peer);
            return;
        }
        let from = self.state.username.clone();
        self.send_relay(ClientMessage::IceCandidate {
            candidate,
            peer_id: peer,
            from,
        });
    }

    fn send_to(&mut self, peer: &str, msg: &DataMessage) -> Result<()> {
        let bytes = msg.to_bytes()?;
        let link = self
            .links
            .get_mut(peer)
            .ok_or_else(|| MeshError::UnknownPeer(peer.to_string()))?;
        link.send(&bytes)
    }

    /// Best-effort fan-out to every open channel.
    fn broadcast(&mut self, msg: &DataMessage) {
        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: cannot encode {}: {}", self.username(), msg.kind(), e);
                return;
            }
        };
        let me = self.state.username.clone();
        for link in self.links.values_mut().filter(|l| l.is_open()) {
            if let Err(e) = link.send(&bytes) {
                warn!("{}: broadcast of {} failed: {}", me, msg.kind(), e);
            }
        }
    }

    // ----- local actions -----

    fn perform(&mut self, action: LocalAction) -> Result<()> {
        let msg = match action {
            LocalAction::CreateRoom => {
                let username = self.state.username.clone();
                return self.request(ClientMessage::CreateRoom { username });
            }
            LocalAction::JoinRoom { room_id } => {
                let username = self.state.username.clone();
                return self.request(ClientMessage::JoinRoom { room_id, username });
            }
            LocalAction::CastVote(card) => self.state.cast_vote(card)?,
            LocalAction::ClearVote => self.state.clear_vote()?,
            LocalAction::Reveal => self.state.reveal()?,
            LocalAction::NewRound => self.state.new_round()?,
        };
        self.broadcast(&msg);
        Ok(())
    }

    fn request(&self, msg: ClientMessage) -> Result<()> {
        if self.send_relay(msg) {
            Ok(())
        } else {
            Err(MeshError::RelayClosed)
        }
    }

    // ----- lifecycle -----

    fn sweep(&mut self, now: Instant) {
        let Some(timeout) = self.config.handshake_timeout else {
            return;
        };
        let expired: Vec<String> = self
            .links
            .values()
            .filter(|link| link.handshake_expired(now, timeout))
            .map(|link| link.peer().to_string())
            .collect();
        for peer in expired {
            warn!(
                "{}: handshake with {} timed out after {:?}",
                self.username(),
                peer,
                timeout
            );
            if let Some(link) = self.links.get_mut(&peer) {
                link.fail(format!("handshake timed out after {timeout:?}"));
            }
            self.negotiator.close_peer(&peer);
        }
    }

    fn close_all_links(&mut self) {
        for (peer, mut link) in std::mem::take(&mut self.links) {
            link.close();
            self.negotiator.close_peer(&peer);
        }
    }

    /// Drain `events` until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SyncEvent>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sweep.tick() => self.handle(SyncEvent::Tick),
            }
        }

        self.close_all_links();
        self.publish();
        debug!("{} synchronizer stopped", self.username());
    }

    /// Run on a new task.
    ///
    /// `events` must be the sender half of `receiver`; transports that were
    /// built before the actor hold further clones of it.
    pub fn spawn(
        self,
        events: mpsc::UnboundedSender<SyncEvent>,
        receiver: mpsc::UnboundedReceiver<SyncEvent>,
    ) -> SynchronizerHandle {
        let view = self.subscribe();
        let username = self.state.username.clone();
        let task = tokio::spawn(self.run(receiver));
        SynchronizerHandle {
            username,
            events,
            view,
            task,
        }
    }
}

/// Client side of a spawned [`Synchronizer`].
pub struct SynchronizerHandle {
    username: String,
    events: mpsc::UnboundedSender<SyncEvent>,
    view: watch::Receiver<RoomView>,
    task: JoinHandle<()>,
}

impl SynchronizerHandle {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Sender for transports and the relay pump.
    pub fn events(&self) -> mpsc::UnboundedSender<SyncEvent> {
        self.events.clone()
    }

    /// Latest published view.
    pub fn view(&self) -> RoomView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomView> {
        self.view.clone()
    }

    /// Feed a relay message into the queue.
    pub fn relay(&self, msg: ServerMessage) -> Result<()> {
        self.events
            .send(SyncEvent::Relay(msg))
            .map_err(|_| MeshError::ActorStopped)
    }

    /// Run a local action and wait for its result.
    pub async fn command(&self, action: LocalAction) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(SyncEvent::Command {
                action,
                reply: Some(tx),
            })
            .map_err(|_| MeshError::ActorStopped)?;
        rx.await.map_err(|_| MeshError::ActorStopped)?
    }

    pub async fn create_room(&self) -> Result<()> {
        self.command(LocalAction::CreateRoom).await
    }

    pub async fn join_room(&self, room_id: impl Into<String>) -> Result<()> {
        self.command(LocalAction::JoinRoom {
            room_id: room_id.into(),
        })
        .await
    }

    pub async fn cast_vote(&self, card: PokerCard) -> Result<()> {
        self.command(LocalAction::CastVote(card)).await
    }

    pub async fn clear_vote(&self) -> Result<()> {
        self.command(LocalAction::ClearVote).await
    }

    pub async fn reveal(&self) -> Result<()> {
        self.command(LocalAction::Reveal).await
    }

    pub async fn new_round(&self) -> Result<()> {
        self.command(LocalAction::NewRound).await
    }

    /// Wait until the published view satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&RoomView) -> bool) -> Result<RoomView> {
        let mut view = self.view.clone();
        loop {
            {
                let current = view.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            view.changed().await.map_err(|_| MeshError::ActorStopped)?;
        }
    }

    /// Stop the actor without closing its channels, like a crashed peer.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
