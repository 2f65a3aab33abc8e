//! Transport capability: the host's real-time transport stack behind a narrow trait.
//!
//! Calls return immediately. Anything that completes later (candidate gathering,
//! connectivity, channel open, inbound data) comes back as a [`TransportEvent`].

use crate::identity::PeerId;
use crate::signaling::{IceCandidate, SessionDescription};

/// Host-assigned handle for one transport (peer connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// Host-assigned handle for one ordered, reliable sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Connection state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

pub trait TransportProvider {
    /// Create a transport for `peer_id`.
    fn create(&mut self, peer_id: &PeerId) -> Result<TransportHandle, TransportError>;
    /// Create the local offer (initiator side).
    fn create_offer(&mut self, handle: TransportHandle)
        -> Result<SessionDescription, TransportError>;
    /// Apply the remote offer and produce the local answer (responder side).
    fn accept_offer(
        &mut self,
        handle: TransportHandle,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;
    /// Apply the remote answer (initiator side).
    fn accept_answer(
        &mut self,
        handle: TransportHandle,
        answer: &SessionDescription,
    ) -> Result<(), TransportError>;
    fn add_candidate(
        &mut self,
        handle: TransportHandle,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError>;
    /// Open (or register interest in) the ordered reliable sub-channel. Readiness is
    /// reported with [`TransportEvent::ChannelOpen`].
    fn open_channel(
        &mut self,
        handle: TransportHandle,
        label: &str,
    ) -> Result<ChannelHandle, TransportError>;
    fn send(&mut self, channel: ChannelHandle, data: &str) -> Result<(), TransportError>;
    fn close(&mut self, handle: TransportHandle);
}

/// Completion events reported by the host transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    StateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },
    ChannelOpen {
        peer_id: PeerId,
        channel: ChannelHandle,
    },
    ChannelClosed {
        peer_id: PeerId,
    },
    ChannelMessage {
        peer_id: PeerId,
        data: String,
    },
}

impl TransportEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            TransportEvent::LocalCandidate { peer_id, .. }
            | TransportEvent::StateChanged { peer_id, .. }
            | TransportEvent::ChannelOpen { peer_id, .. }
            | TransportEvent::ChannelClosed { peer_id }
            | TransportEvent::ChannelMessage { peer_id, .. } => peer_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("unknown transport handle")]
    UnknownHandle,
    #[error("channel not open")]
    ChannelClosed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("transport failure: {0}")]
    Other(String),
}
