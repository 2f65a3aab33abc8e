//! Media capability for calls: local device acquisition and the media transport.

use crate::identity::PeerId;
use crate::signaling::{IceCandidate, MediaKind, SessionDescription};
use crate::transport::ConnectionState;

/// Handle to acquired local media (microphone, camera).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaStreamHandle(pub u64);

/// Replacement source for an outgoing track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSource {
    Camera(String),
    Screen,
    Microphone(String),
}

pub trait MediaProvider {
    fn acquire(&mut self, kind: MediaKind) -> Result<MediaStreamHandle, MediaAcquisitionError>;
    fn release(&mut self, stream: MediaStreamHandle);
    fn create_offer(
        &mut self,
        peer_id: &PeerId,
        stream: MediaStreamHandle,
    ) -> Result<SessionDescription, MediaError>;
    fn accept_offer(
        &mut self,
        peer_id: &PeerId,
        stream: MediaStreamHandle,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError>;
    fn accept_answer(
        &mut self,
        peer_id: &PeerId,
        answer: &SessionDescription,
    ) -> Result<(), MediaError>;
    fn add_candidate(&mut self, peer_id: &PeerId, candidate: &IceCandidate)
        -> Result<(), MediaError>;
    /// Swap the outgoing track in place; must not renegotiate.
    fn replace_track(&mut self, peer_id: &PeerId, source: &TrackSource) -> Result<(), MediaError>;
    fn close(&mut self, peer_id: &PeerId);
}

/// Completion events from the host media stack.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    LocalCandidate {
        peer_id: PeerId,
        candidate: IceCandidate,
    },
    StateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },
}

/// Why local media could not be acquired. Each case needs different user remediation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaAcquisitionError {
    #[error("permission to use the microphone or camera was denied")]
    PermissionDenied,
    #[error("no microphone or camera was found")]
    DeviceNotFound,
    #[error("could not start media: {0}")]
    Other(String),
}

impl MediaAcquisitionError {
    /// Reason string sent in `call-reject`.
    pub fn reject_reason(&self) -> &'static str {
        match self {
            MediaAcquisitionError::PermissionDenied => "permission-denied",
            MediaAcquisitionError::DeviceNotFound => "device-not-found",
            MediaAcquisitionError::Other(_) => "media-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("no media session for peer")]
    NoSession,
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
}
