//! Peer connection manager: the session registry. Owns one transport and one sub-channel per
//! remote peer, runs offer/answer/candidate negotiation through the signaling outbox, and
//! schedules reconnects when a transport fails.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backoff::Backoff;
use crate::candidates::CandidateQueue;
use crate::crypto::EncryptionState;
use crate::identity::PeerId;
use crate::signaling::{ClientSignal, IceCandidate, SessionDescription, SignalingClient};
use crate::transport::{
    ChannelHandle, ConnectionState, TransportError, TransportEvent, TransportHandle,
    TransportProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Connection state toward one remote peer.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub transport: TransportHandle,
    pub channel: Option<ChannelHandle>,
    pub state: ConnectionState,
    pub encryption: EncryptionState,
    pub role: Role,
    remote_description_set: bool,
    channel_open: bool,
    /// Set once key agreement has started; application frames may flow after this.
    channel_ready: bool,
}

impl PeerSession {
    fn new(peer_id: PeerId, transport: TransportHandle, role: Role) -> Self {
        Self {
            peer_id,
            transport,
            channel: None,
            state: ConnectionState::New,
            encryption: EncryptionState::None,
            role,
            remote_description_set: false,
            channel_open: false,
            channel_ready: false,
        }
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    pub fn is_channel_ready(&self) -> bool {
        self.channel_open && self.channel_ready
    }

    fn is_live(&self) -> bool {
        !matches!(
            self.state,
            ConnectionState::Failed | ConnectionState::Disconnected
        )
    }
}

/// What the manager reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged(PeerId, ConnectionState),
    /// Sub-channel is open; key agreement should start before handing it over.
    ChannelOpen(PeerId),
    ChannelClosed(PeerId),
    Message(PeerId, String),
    /// The session was dropped or replaced; per-session state (keys) must be reset.
    SessionReset(PeerId),
    ReconnectScheduled { peer_id: PeerId, attempt: u32 },
    Reconnecting { peer_id: PeerId, attempt: u32 },
    /// Reconnect attempts are exhausted; the host should use its relay path.
    RelayFallback(PeerId),
}

pub struct PeerConnectionManager {
    local_id: PeerId,
    transport: Box<dyn TransportProvider>,
    sessions: HashMap<PeerId, PeerSession>,
    candidates: CandidateQueue,
    reconnects: HashMap<PeerId, Backoff>,
    channel_label: String,
    reconnect_base: Duration,
    max_reconnect_attempts: u32,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: PeerId,
        transport: Box<dyn TransportProvider>,
        channel_label: impl Into<String>,
        reconnect_base: Duration,
        max_reconnect_attempts: u32,
    ) -> Self {
        Self {
            local_id,
            transport,
            sessions: HashMap::new(),
            candidates: CandidateQueue::new(),
            reconnects: HashMap::new(),
            channel_label: channel_label.into(),
            reconnect_base,
            max_reconnect_attempts,
        }
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Candidates buffered for a peer whose transport is not ready for them yet.
    pub fn queued_candidates(&self, peer_id: &PeerId) -> usize {
        self.candidates.len(peer_id)
    }

    /// Keep the live session for `peer_id`, or create one as initiator: build the
    /// transport, open the sub-channel and send an offer. Replacing a dead session
    /// reports `SessionReset` so its key material goes with it.
    pub fn open(
        &mut self,
        peer_id: &PeerId,
        signaling: &mut SignalingClient,
    ) -> Result<Vec<PeerEvent>, PeerError> {
        let mut events = Vec::new();
        match self.sessions.get(peer_id).map(PeerSession::is_live) {
            Some(true) => return Ok(events),
            Some(false) => {
                debug!("replacing dead session with {}", peer_id);
                self.close_session(peer_id);
                self.reconnects.remove(peer_id);
                events.push(PeerEvent::SessionReset(peer_id.clone()));
            }
            None => {}
        }
        self.create_initiator(peer_id, signaling)?;
        Ok(events)
    }

    fn create_initiator(
        &mut self,
        peer_id: &PeerId,
        signaling: &mut SignalingClient,
    ) -> Result<(), PeerError> {
        let handle = self.transport.create(peer_id)?;
        let setup = self
            .transport
            .open_channel(handle, &self.channel_label)
            .and_then(|channel| Ok((channel, self.transport.create_offer(handle)?)));
        let (channel, offer) = match setup {
            Ok(x) => x,
            Err(e) => {
                self.transport.close(handle);
                return Err(e.into());
            }
        };
        let mut session = PeerSession::new(peer_id.clone(), handle, Role::Initiator);
        session.channel = Some(channel);
        session.state = ConnectionState::Connecting;
        self.sessions.insert(peer_id.clone(), session);
        info!("opening session to {}", peer_id);
        signaling.send(ClientSignal::Offer {
            to: peer_id.clone(),
            sdp: offer,
        });
        Ok(())
    }

    /// Handle a remote offer: create the responder session, apply buffered candidates in
    /// arrival order and send the answer. Returns the events produced (session resets).
    pub fn on_remote_offer(
        &mut self,
        peer_id: &PeerId,
        offer: &SessionDescription,
        signaling: &mut SignalingClient,
    ) -> Result<Vec<PeerEvent>, PeerError> {
        let mut events = Vec::new();
        if let Some(existing) = self.sessions.get(peer_id) {
            let glare = existing.role == Role::Initiator && !existing.remote_description_set;
            if glare && self.local_id > *peer_id {
                debug!("offer glare with {}: keeping our offer", peer_id);
                return Ok(events);
            }
            debug!("replacing session with {} for a new remote offer", peer_id);
            self.close_session(peer_id);
            events.push(PeerEvent::SessionReset(peer_id.clone()));
        }

        let handle = self.transport.create(peer_id)?;
        let answer = match self.transport.accept_offer(handle, offer) {
            Ok(a) => a,
            Err(e) => {
                self.transport.close(handle);
                return Err(e.into());
            }
        };
        let mut session = PeerSession::new(peer_id.clone(), handle, Role::Responder);
        session.remote_description_set = true;
        session.state = ConnectionState::Connecting;
        self.sessions.insert(peer_id.clone(), session);
        self.flush_candidates(peer_id);

        match self.transport.open_channel(handle, &self.channel_label) {
            Ok(channel) => {
                if let Some(s) = self.sessions.get_mut(peer_id) {
                    s.channel = Some(channel);
                }
            }
            Err(e) => warn!("could not open channel to {}: {}", peer_id, e),
        }
        info!("answering offer from {}", peer_id);
        signaling.send(ClientSignal::Answer {
            to: peer_id.clone(),
            sdp: answer,
        });
        Ok(events)
    }

    pub fn on_remote_answer(
        &mut self,
        peer_id: &PeerId,
        answer: &SessionDescription,
    ) -> Result<(), PeerError> {
        let session = self
            .sessions
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::TransportUnavailable(peer_id.clone()))?;
        if session.role != Role::Initiator || session.remote_description_set {
            debug!("ignoring duplicate or unexpected answer from {}", peer_id);
            return Ok(());
        }
        self.transport.accept_answer(session.transport, answer)?;
        session.remote_description_set = true;
        self.flush_candidates(peer_id);
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the transport exists and has its
    /// remote description.
    pub fn on_remote_candidate(&mut self, peer_id: &PeerId, candidate: IceCandidate) {
        match self.sessions.get(peer_id) {
            Some(s) if s.remote_description_set => {
                if let Err(e) = self.transport.add_candidate(s.transport, &candidate) {
                    warn!("candidate from {} rejected: {}", peer_id, e);
                }
            }
            _ => {
                debug!("buffering candidate from {}", peer_id);
                self.candidates.push(peer_id, candidate);
            }
        }
    }

    fn flush_candidates(&mut self, peer_id: &PeerId) {
        let Some(handle) = self.sessions.get(peer_id).map(|s| s.transport) else {
            return;
        };
        for candidate in self.candidates.take(peer_id) {
            if let Err(e) = self.transport.add_candidate(handle, &candidate) {
                warn!("buffered candidate from {} rejected: {}", peer_id, e);
            }
        }
    }

    pub fn on_transport_event(
        &mut self,
        event: TransportEvent,
        signaling: &mut SignalingClient,
    ) -> Vec<PeerEvent> {
        self.on_transport_event_at(event, signaling, Instant::now())
    }

    pub fn on_transport_event_at(
        &mut self,
        event: TransportEvent,
        signaling: &mut SignalingClient,
        now: Instant,
    ) -> Vec<PeerEvent> {
        let peer_id = event.peer_id().clone();
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            debug!("transport event for unknown peer {}", peer_id);
            return Vec::new();
        };
        let mut events = Vec::new();
        match event {
            TransportEvent::LocalCandidate { candidate, .. } => {
                signaling.send(ClientSignal::IceCandidate {
                    to: peer_id,
                    candidate,
                });
            }
            TransportEvent::StateChanged { state, .. } => {
                if session.state == state {
                    return events;
                }
                session.state = state;
                info!("session with {} is now {:?}", peer_id, state);
                events.push(PeerEvent::StateChanged(peer_id.clone(), state));
                match state {
                    ConnectionState::Connected => {
                        self.reconnects.remove(&peer_id);
                    }
                    ConnectionState::Failed => {
                        session.channel_open = false;
                        session.channel_ready = false;
                        events.push(self.schedule_reconnect(&peer_id, now));
                    }
                    ConnectionState::Disconnected => {
                        session.channel_open = false;
                        session.channel_ready = false;
                    }
                    _ => {}
                }
            }
            TransportEvent::ChannelOpen { channel, .. } => {
                session.channel = Some(channel);
                session.channel_open = true;
                events.push(PeerEvent::ChannelOpen(peer_id));
            }
            TransportEvent::ChannelClosed { .. } => {
                session.channel_open = false;
                session.channel_ready = false;
                events.push(PeerEvent::ChannelClosed(peer_id));
            }
            TransportEvent::ChannelMessage { data, .. } => {
                events.push(PeerEvent::Message(peer_id, data));
            }
        }
        events
    }

    fn schedule_reconnect(&mut self, peer_id: &PeerId, now: Instant) -> PeerEvent {
        let backoff = self
            .reconnects
            .entry(peer_id.clone())
            .or_insert_with(|| Backoff::new(self.reconnect_base, self.max_reconnect_attempts));
        if backoff.schedule(now) {
            PeerEvent::ReconnectScheduled {
                peer_id: peer_id.clone(),
                attempt: backoff.attempt(),
            }
        } else {
            warn!("reconnect attempts to {} exhausted", peer_id);
            self.reconnects.remove(peer_id);
            PeerEvent::RelayFallback(peer_id.clone())
        }
    }

    /// Run due reconnect attempts. A reconnect drops the failed session and opens a new one.
    pub fn tick_at(&mut self, now: Instant, signaling: &mut SignalingClient) -> Vec<PeerEvent> {
        let due: Vec<(PeerId, u32)> = self
            .reconnects
            .iter_mut()
            .filter_map(|(p, b)| b.due(now).then(|| (p.clone(), b.attempt())))
            .collect();
        let mut events = Vec::new();
        for (peer_id, attempt) in due {
            info!("reconnecting to {} (attempt {})", peer_id, attempt);
            self.close_session(&peer_id);
            events.push(PeerEvent::SessionReset(peer_id.clone()));
            events.push(PeerEvent::Reconnecting {
                peer_id: peer_id.clone(),
                attempt,
            });
            if let Err(e) = self.create_initiator(&peer_id, signaling) {
                warn!("reconnect to {} failed: {}", peer_id, e);
                events.push(self.schedule_reconnect(&peer_id, now));
            }
        }
        events
    }

    /// Hand the sub-channel to the message protocol. Refused unless key agreement has at
    /// least started.
    pub fn hand_over_channel(&mut self, peer_id: &PeerId, encryption: EncryptionState) -> bool {
        match self.sessions.get_mut(peer_id) {
            Some(s) if s.channel_open && encryption.allows_channel() => {
                s.encryption = encryption;
                s.channel_ready = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_encryption(&mut self, peer_id: &PeerId, encryption: EncryptionState) {
        if let Some(s) = self.sessions.get_mut(peer_id) {
            s.encryption = encryption;
        }
    }

    /// Send on a handed-over sub-channel.
    pub fn send(&mut self, peer_id: &PeerId, data: &str) -> Result<(), PeerError> {
        let session = self
            .sessions
            .get(peer_id)
            .ok_or_else(|| PeerError::TransportUnavailable(peer_id.clone()))?;
        if !session.is_channel_ready() {
            return Err(PeerError::ChannelUnavailable(peer_id.clone()));
        }
        self.send_on(peer_id, data)
    }

    /// Send on an open sub-channel before it is handed over (key agreement only).
    pub fn send_handshake(&mut self, peer_id: &PeerId, data: &str) -> Result<(), PeerError> {
        let session = self
            .sessions
            .get(peer_id)
            .ok_or_else(|| PeerError::TransportUnavailable(peer_id.clone()))?;
        if !session.channel_open {
            return Err(PeerError::ChannelUnavailable(peer_id.clone()));
        }
        self.send_on(peer_id, data)
    }

    fn send_on(&mut self, peer_id: &PeerId, data: &str) -> Result<(), PeerError> {
        let channel = self
            .sessions
            .get(peer_id)
            .and_then(|s| s.channel)
            .ok_or_else(|| PeerError::ChannelUnavailable(peer_id.clone()))?;
        self.transport.send(channel, data).map_err(|e| match e {
            TransportError::ChannelClosed => PeerError::ChannelUnavailable(peer_id.clone()),
            other => PeerError::Transport(other),
        })
    }

    /// Close the transport and forget everything about the peer, including pending
    /// reconnects. Returns whether a session existed.
    pub fn teardown(&mut self, peer_id: &PeerId) -> bool {
        self.reconnects.remove(peer_id);
        let existed = self.close_session(peer_id);
        self.candidates.clear(peer_id);
        existed
    }

    fn close_session(&mut self, peer_id: &PeerId) -> bool {
        match self.sessions.remove(peer_id) {
            Some(s) => {
                self.transport.close(s.transport);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("no transport session with {0}")]
    TransportUnavailable(PeerId),
    #[error("sub-channel to {0} is not open")]
    ChannelUnavailable(PeerId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockTransport, TransportCall};

    fn manager(local: &str) -> (PeerConnectionManager, MockTransport) {
        let mock = MockTransport::new();
        let m = PeerConnectionManager::new(
            PeerId::from(local),
            Box::new(mock.clone()),
            "chat",
            Duration::from_millis(100),
            2,
        );
        (m, mock)
    }

    #[test]
    fn open_is_idempotent() {
        let (mut m, mock) = manager("alice");
        let mut sig = SignalingClient::new();
        let bob = PeerId::from("bob");
        m.open(&bob, &mut sig).unwrap();
        let first = m.session(&bob).unwrap().transport;
        assert!(m.open(&bob, &mut sig).unwrap().is_empty());
        let second = m.session(&bob).unwrap().transport;
        assert_eq!(first, second);
        assert_eq!(mock.created(), 1);
        let offers = sig
            .drain()
            .into_iter()
            .filter(|s| matches!(s, ClientSignal::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
    }

    #[test]
    fn early_candidates_flush_in_order_on_offer() {
        let (mut m, mock) = manager("bob");
        let mut sig = SignalingClient::new();
        let alice = PeerId::from("alice");
        for i in 0..4 {
            m.on_remote_candidate(&alice, IceCandidate::new(format!("cand-{}", i)));
        }
        assert_eq!(m.queued_candidates(&alice), 4);
        assert!(mock.candidates().is_empty());

        m.on_remote_offer(&alice, &SessionDescription::offer("o"), &mut sig)
            .unwrap();
        assert_eq!(m.queued_candidates(&alice), 0);
        assert_eq!(
            mock.candidates(),
            vec!["cand-0", "cand-1", "cand-2", "cand-3"]
        );
        assert!(sig
            .drain()
            .iter()
            .any(|s| matches!(s, ClientSignal::Answer { to, .. } if *to == alice)));

        m.on_remote_candidate(&alice, IceCandidate::new("cand-4"));
        assert_eq!(mock.candidates().last().map(String::as_str), Some("cand-4"));
    }

    #[test]
    fn initiator_buffers_candidates_until_answer() {
        let (mut m, mock) = manager("alice");
        let mut sig = SignalingClient::new();
        let bob = PeerId::from("bob");
        m.open(&bob, &mut sig).unwrap();
        m.on_remote_candidate(&bob, IceCandidate::new("early"));
        assert!(mock.candidates().is_empty());
        m.on_remote_answer(&bob, &SessionDescription::answer("a"))
            .unwrap();
        assert_eq!(mock.candidates(), vec!["early"]);
        assert!(mock
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::AcceptAnswer(_))));
    }

    #[test]
    fn channel_not_usable_before_hand_over() {
        let (mut m, _mock) = manager("alice");
        let mut sig = SignalingClient::new();
        let bob = PeerId::from("bob");
        assert_eq!(
            m.send(&bob, "x"),
            Err(PeerError::TransportUnavailable(bob.clone()))
        );
        m.open(&bob, &mut sig).unwrap();
        let channel = m.session(&bob).unwrap().channel.unwrap();
        m.on_transport_event(
            TransportEvent::ChannelOpen {
                peer_id: bob.clone(),
                channel,
            },
            &mut sig,
        );
        assert_eq!(
            m.send(&bob, "x"),
            Err(PeerError::ChannelUnavailable(bob.clone()))
        );
        assert!(m.send_handshake(&bob, "key").is_ok());
        assert!(!m.hand_over_channel(&bob, EncryptionState::None));
        assert!(m.hand_over_channel(&bob, EncryptionState::Pending));
        assert!(m.send(&bob, "x").is_ok());
    }

    #[test]
    fn glare_smaller_id_yields() {
        let (mut m, _mock) = manager("alice");
        let mut sig = SignalingClient::new();
        let bob = PeerId::from("bob");
        m.open(&bob, &mut sig).unwrap();
        let events = m
            .on_remote_offer(&bob, &SessionDescription::offer("o"), &mut sig)
            .unwrap();
        assert_eq!(events, vec![PeerEvent::SessionReset(bob.clone())]);
        assert_eq!(m.session(&bob).unwrap().role, Role::Responder);

        let (mut z, _mock) = manager("zed");
        z.open(&bob, &mut sig).unwrap();
        let events = z
            .on_remote_offer(&bob, &SessionDescription::offer("o"), &mut sig)
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(z.session(&bob).unwrap().role, Role::Initiator);
    }

    #[test]
    fn failure_reconnects_with_backoff_then_falls_back() {
        let (mut m, mock) = manager("alice");
        let mut sig = SignalingClient::new();
        let bob = PeerId::from("bob");
        m.open(&bob, &mut sig).unwrap();
        let now = Instant::now();
        let fail = |m: &mut PeerConnectionManager, sig: &mut SignalingClient| {
            m.on_transport_event_at(
                TransportEvent::StateChanged {
                    peer_id: PeerId::from("bob"),
                    state: ConnectionState::Failed,
                },
                sig,
                now,
            )
        };

        let events = fail(&mut m, &mut sig);
        assert!(events.contains(&PeerEvent::ReconnectScheduled {
            peer_id: bob.clone(),
            attempt: 1
        }));
        assert!(m.tick_at(now + Duration::from_millis(50), &mut sig).is_empty());
        let events = m.tick_at(now + Duration::from_millis(100), &mut sig);
        assert!(events.contains(&PeerEvent::Reconnecting {
            peer_id: bob.clone(),
            attempt: 1
        }));
        assert_eq!(mock.created(), 2);

        let events = fail(&mut m, &mut sig);
        assert!(events.contains(&PeerEvent::ReconnectScheduled {
            peer_id: bob.clone(),
            attempt: 2
        }));
        m.tick_at(now + Duration::from_millis(200), &mut sig);
        assert_eq!(mock.created(), 3);

        let events = fail(&mut m, &mut sig);
        assert!(events.contains(&PeerEvent::RelayFallback(bob.clone())));
        assert!(m.tick_at(now + Duration::from_secs(10), &mut sig).is_empty());
    }

    #[test]
    fn teardown_closes_transport() {
        let (mut m, mock) = manager("alice");
        let mut sig = SignalingClient::new();
        let bob = PeerId::from("bob");
        m.open(&bob, &mut sig).unwrap();
        assert!(m.teardown(&bob));
        assert!(m.session(&bob).is_none());
        assert!(mock
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Close(_))));
        assert!(!m.teardown(&bob));
    }
}
