//! Conversation authorization gate: inbound messages from a peer are only surfaced once the
//! local user has consented to the conversation.
//!
//! Per peer: `unauthorized --accept--> authorized`. `reject` discards what is held and
//! leaves the peer unauthorized, so later messages are gated again.
//!
//! A local send to a peer authorizes that peer.

use std::collections::HashMap;

use log::info;

use crate::identity::PeerId;
use crate::message::Message;
use crate::protocol::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthorized,
    Authorized,
}

/// Outcome of passing an inbound message through the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Peer is authorized: surface and acknowledge.
    Deliver(Message),
    /// Held pending authorization: not surfaced, not acknowledged.
    Held,
}

#[derive(Default)]
pub struct AuthorizationGate {
    states: HashMap<PeerId, AuthState>,
    pending: HashMap<PeerId, Vec<Message>>,
}

impl AuthorizationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, peer_id: &PeerId) -> AuthState {
        self.states
            .get(peer_id)
            .copied()
            .unwrap_or(AuthState::Unauthorized)
    }

    pub fn is_authorized(&self, peer_id: &PeerId) -> bool {
        self.state(peer_id) == AuthState::Authorized
    }

    /// Authorize without notifying the peer (e.g. a conversation that already exists in storage).
    pub fn authorize(&mut self, peer_id: &PeerId) {
        self.states.insert(peer_id.clone(), AuthState::Authorized);
    }

    /// A local message is being sent to `peer_id`. Returns true if this flipped the peer
    /// to authorized.
    pub fn on_local_send(&mut self, peer_id: &PeerId) -> bool {
        if self.is_authorized(peer_id) {
            return false;
        }
        info!("replying to {} authorizes the conversation", peer_id);
        self.authorize(peer_id);
        true
    }

    pub fn admit(&mut self, peer_id: &PeerId, mut message: Message) -> Admission {
        if self.is_authorized(peer_id) {
            return Admission::Deliver(message);
        }
        message.pending_authorization = true;
        self.pending.entry(peer_id.clone()).or_default().push(message);
        Admission::Held
    }

    /// Accept the conversation. Returns the `auth_accepted` frame and the held messages in
    /// arrival order, no longer flagged pending.
    pub fn accept(&mut self, peer_id: &PeerId) -> (Frame, Vec<Message>) {
        self.authorize(peer_id);
        (Frame::AuthAccepted, self.release(peer_id))
    }

    /// Take held messages for an authorized peer, in arrival order. Used after an
    /// implicit authorization by local send.
    pub fn release(&mut self, peer_id: &PeerId) -> Vec<Message> {
        if !self.is_authorized(peer_id) {
            return Vec::new();
        }
        self.pending
            .remove(peer_id)
            .unwrap_or_default()
            .into_iter()
            .map(|mut m| {
                m.pending_authorization = false;
                m
            })
            .collect()
    }

    /// Reject what is held. Returns the `auth_refused` frame and how many messages were dropped.
    pub fn reject(&mut self, peer_id: &PeerId) -> (Frame, usize) {
        let dropped = self.pending.remove(peer_id).map(|v| v.len()).unwrap_or(0);
        self.states.insert(peer_id.clone(), AuthState::Unauthorized);
        (Frame::AuthRefused, dropped)
    }

    pub fn pending(&self, peer_id: &PeerId) -> &[Message] {
        self.pending.get(peer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Peers with messages waiting for a decision.
    pub fn pending_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(id: &str, from: &PeerId) -> Message {
        Message::incoming(id.into(), from.clone(), format!("body {}", id), Utc::now(), true)
    }

    #[test]
    fn unauthorized_messages_are_held() {
        let mut gate = AuthorizationGate::new();
        let p = PeerId::from("stranger");
        assert_eq!(gate.admit(&p, msg("1", &p)), Admission::Held);
        assert_eq!(gate.pending(&p).len(), 1);
        assert!(gate.pending(&p)[0].pending_authorization);
        assert_eq!(gate.pending_peers(), vec![p]);
    }

    #[test]
    fn accept_releases_in_arrival_order() {
        let mut gate = AuthorizationGate::new();
        let p = PeerId::from("stranger");
        for id in ["a", "b", "c"] {
            gate.admit(&p, msg(id, &p));
        }
        let (frame, released) = gate.accept(&p);
        assert_eq!(frame, Frame::AuthAccepted);
        let ids: Vec<&str> = released.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(released.iter().all(|m| !m.pending_authorization));
        assert!(gate.is_authorized(&p));
        assert!(matches!(gate.admit(&p, msg("d", &p)), Admission::Deliver(_)));
    }

    #[test]
    fn reject_discards_and_keeps_gating() {
        let mut gate = AuthorizationGate::new();
        let p = PeerId::from("spammer");
        gate.admit(&p, msg("1", &p));
        gate.admit(&p, msg("2", &p));
        let (frame, dropped) = gate.reject(&p);
        assert_eq!(frame, Frame::AuthRefused);
        assert_eq!(dropped, 2);
        assert!(gate.pending(&p).is_empty());
        assert_eq!(gate.admit(&p, msg("3", &p)), Admission::Held);
        let (_, released) = gate.accept(&p);
        let ids: Vec<&str> = released.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["3"]);
    }

    #[test]
    fn local_send_establishes_trust() {
        let mut gate = AuthorizationGate::new();
        let p = PeerId::from("friend");
        gate.admit(&p, msg("0", &p));
        assert!(gate.release(&p).is_empty());
        assert!(gate.on_local_send(&p));
        assert_eq!(gate.release(&p).len(), 1);
        assert!(!gate.on_local_send(&p));
        assert!(matches!(gate.admit(&p, msg("1", &p)), Admission::Deliver(_)));
    }
}
