//! Message protocol: the outbound send path and the per-peer delivery ledger driven by
//! acknowledgement frames.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::error::Error;
use crate::identity::PeerId;
use crate::message::{DeliveryStatus, Message};
use crate::peer::PeerConnectionManager;
use crate::protocol::Frame;

/// A delivery status that actually moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub peer_id: PeerId,
    pub message_id: String,
    pub status: DeliveryStatus,
}

#[derive(Default)]
pub struct MessageProtocol {
    outbound: HashMap<PeerId, Vec<Message>>,
    seen: HashMap<PeerId, HashSet<String>>,
}

impl MessageProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `frame` and put it on the peer's handed-over sub-channel. No retry.
    pub fn send(
        peers: &mut PeerConnectionManager,
        peer_id: &PeerId,
        frame: &Frame,
    ) -> Result<(), Error> {
        let text = frame.encode()?;
        debug!("frame out to {}: {}", peer_id, frame.kind());
        peers.send(peer_id, &text).map_err(Error::from)
    }

    pub fn record_outbound(&mut self, peer_id: &PeerId, message: Message) {
        self.outbound.entry(peer_id.clone()).or_default().push(message);
    }

    pub fn message(&self, peer_id: &PeerId, message_id: &str) -> Option<&Message> {
        self.outbound
            .get(peer_id)
            .and_then(|v| v.iter().find(|m| m.id == message_id))
    }

    pub fn outbound(&self, peer_id: &PeerId) -> &[Message] {
        self.outbound.get(peer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn mark_sent(&mut self, peer_id: &PeerId, message_id: &str) -> Option<StatusChange> {
        self.advance(peer_id, message_id, DeliveryStatus::Sent)
    }

    fn advance(
        &mut self,
        peer_id: &PeerId,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Option<StatusChange> {
        let message = self
            .outbound
            .get_mut(peer_id)?
            .iter_mut()
            .find(|m| m.id == message_id)?;
        message.status.advance(status).then(|| StatusChange {
            peer_id: peer_id.clone(),
            message_id: message_id.to_string(),
            status,
        })
    }

    /// Apply `message_received` / `message_read` from `peer_id`. Stale, duplicate or
    /// unknown acknowledgements change nothing.
    pub fn on_ack(&mut self, peer_id: &PeerId, frame: &Frame) -> Vec<StatusChange> {
        match frame {
            Frame::MessageReceived { message_id } => self
                .advance(peer_id, message_id, DeliveryStatus::Delivered)
                .into_iter()
                .collect(),
            Frame::MessageRead {
                message_id: Some(id),
            } => self
                .advance(peer_id, id, DeliveryStatus::Read)
                .into_iter()
                .collect(),
            Frame::MessageRead { message_id: None } => {
                self.advance_all(peer_id, DeliveryStatus::Read)
            }
            other => {
                warn!("{} is not an acknowledgement", other.kind());
                Vec::new()
            }
        }
    }

    /// Mark every outbound message to `peer_id` still below delivered as refused.
    pub fn refuse_all(&mut self, peer_id: &PeerId) -> Vec<StatusChange> {
        self.advance_all(peer_id, DeliveryStatus::Refused)
    }

    /// Bulk move. Only a refusal touches messages that never left (`pending`).
    fn advance_all(&mut self, peer_id: &PeerId, status: DeliveryStatus) -> Vec<StatusChange> {
        let Some(messages) = self.outbound.get_mut(peer_id) else {
            return Vec::new();
        };
        messages
            .iter_mut()
            .filter(|m| status == DeliveryStatus::Refused || m.status != DeliveryStatus::Pending)
            .filter_map(|m| {
                m.status.advance(status).then(|| StatusChange {
                    peer_id: peer_id.clone(),
                    message_id: m.id.clone(),
                    status,
                })
            })
            .collect()
    }

    /// Record an inbound message id. Returns false if it was already seen from this peer.
    pub fn first_sighting(&mut self, peer_id: &PeerId, message_id: &str) -> bool {
        self.seen
            .entry(peer_id.clone())
            .or_default()
            .insert(message_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn ledger_with(peer: &PeerId, n: usize) -> (MessageProtocol, Vec<String>) {
        let mut p = MessageProtocol::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let m = Message::outgoing(format!("m{}", i), MessageKind::Text);
            ids.push(m.id.clone());
            p.record_outbound(peer, m);
        }
        (p, ids)
    }

    #[test]
    fn acks_move_status_forward_only() {
        let bob = PeerId::from("bob");
        let (mut p, ids) = ledger_with(&bob, 1);
        assert!(p.mark_sent(&bob, &ids[0]).is_some());
        let received = Frame::MessageReceived {
            message_id: ids[0].clone(),
        };
        assert_eq!(p.on_ack(&bob, &received).len(), 1);
        assert!(p.on_ack(&bob, &received).is_empty());
        let read = Frame::MessageRead {
            message_id: Some(ids[0].clone()),
        };
        assert_eq!(p.on_ack(&bob, &read)[0].status, DeliveryStatus::Read);
        assert!(p.on_ack(&bob, &received).is_empty());
        assert_eq!(p.message(&bob, &ids[0]).unwrap().status, DeliveryStatus::Read);
    }

    #[test]
    fn read_without_id_marks_everything() {
        let bob = PeerId::from("bob");
        let (mut p, ids) = ledger_with(&bob, 3);
        for id in &ids {
            p.mark_sent(&bob, id);
        }
        let changes = p.on_ack(&bob, &Frame::MessageRead { message_id: None });
        assert_eq!(changes.len(), 3);
        assert!(p
            .outbound(&bob)
            .iter()
            .all(|m| m.status == DeliveryStatus::Read));
    }

    #[test]
    fn read_without_id_skips_unsent() {
        let bob = PeerId::from("bob");
        let (mut p, ids) = ledger_with(&bob, 2);
        p.mark_sent(&bob, &ids[0]);
        let changes = p.on_ack(&bob, &Frame::MessageRead { message_id: None });
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].message_id, ids[0]);
        assert_eq!(
            p.message(&bob, &ids[1]).unwrap().status,
            DeliveryStatus::Pending
        );
    }

    #[test]
    fn ack_from_wrong_peer_is_ignored() {
        let bob = PeerId::from("bob");
        let (mut p, ids) = ledger_with(&bob, 1);
        let frame = Frame::MessageReceived {
            message_id: ids[0].clone(),
        };
        assert!(p.on_ack(&PeerId::from("mallory"), &frame).is_empty());
    }

    #[test]
    fn refusal_spares_delivered_messages() {
        let bob = PeerId::from("bob");
        let (mut p, ids) = ledger_with(&bob, 2);
        p.mark_sent(&bob, &ids[0]);
        p.mark_sent(&bob, &ids[1]);
        p.on_ack(
            &bob,
            &Frame::MessageReceived {
                message_id: ids[0].clone(),
            },
        );
        let changes = p.refuse_all(&bob);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].message_id, ids[1]);
        assert_eq!(
            p.message(&bob, &ids[0]).unwrap().status,
            DeliveryStatus::Delivered
        );
    }

    #[test]
    fn inbound_duplicates_detected() {
        let mut p = MessageProtocol::new();
        let bob = PeerId::from("bob");
        assert!(p.first_sighting(&bob, "x"));
        assert!(!p.first_sighting(&bob, "x"));
        assert!(p.first_sighting(&PeerId::from("carol"), "x"));
    }
}
