//! Chat messages and their delivery status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The local user.
    Local,
    Peer(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    System,
}

/// `pending → sent → delivered → read`, or terminal `refused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Refused,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Refused => u8::MAX,
        }
    }

    /// Move forward to `next`. Backward moves, repeats and anything after `refused` are
    /// no-ops; `refused` only applies to messages not yet delivered. Returns whether the
    /// status changed.
    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        if *self == DeliveryStatus::Refused {
            return false;
        }
        if next == DeliveryStatus::Refused {
            if self.rank() < DeliveryStatus::Delivered.rank() {
                *self = next;
                return true;
            }
            return false;
        }
        if next.rank() > self.rank() {
            *self = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    pub pending_authorization: bool,
    /// False when the message went over the unencrypted fallback path.
    pub encrypted: bool,
}

impl Message {
    /// A message the local user is about to send.
    pub fn outgoing(content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            sender: Sender::Local,
            timestamp: Utc::now(),
            kind,
            status: DeliveryStatus::Pending,
            pending_authorization: false,
            encrypted: false,
        }
    }

    /// A message received from `peer_id`.
    pub fn incoming(
        id: String,
        peer_id: PeerId,
        content: String,
        timestamp: DateTime<Utc>,
        encrypted: bool,
    ) -> Self {
        Self {
            id,
            content,
            sender: Sender::Peer(peer_id),
            timestamp,
            kind: MessageKind::Text,
            status: DeliveryStatus::Delivered,
            pending_authorization: false,
            encrypted,
        }
    }
}
