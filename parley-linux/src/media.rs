//! Media capability for a headless daemon: there are no capture devices, so calls fail
//! at acquisition with a specific cause.

use parley_core::media::{
    MediaAcquisitionError, MediaError, MediaProvider, MediaStreamHandle, TrackSource,
};
use parley_core::signaling::{IceCandidate, MediaKind, SessionDescription};
use parley_core::PeerId;

pub struct NoDevices;

impl MediaProvider for NoDevices {
    fn acquire(&mut self, kind: MediaKind) -> Result<MediaStreamHandle, MediaAcquisitionError> {
        log::debug!("no {:?} capture device on this host", kind);
        Err(MediaAcquisitionError::DeviceNotFound)
    }

    fn release(&mut self, _stream: MediaStreamHandle) {}

    fn create_offer(
        &mut self,
        _peer_id: &PeerId,
        _stream: MediaStreamHandle,
    ) -> Result<SessionDescription, MediaError> {
        Err(MediaError::NoSession)
    }

    fn accept_offer(
        &mut self,
        _peer_id: &PeerId,
        _stream: MediaStreamHandle,
        _offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        Err(MediaError::NoSession)
    }

    fn accept_answer(
        &mut self,
        _peer_id: &PeerId,
        _answer: &SessionDescription,
    ) -> Result<(), MediaError> {
        Err(MediaError::NoSession)
    }

    fn add_candidate(
        &mut self,
        _peer_id: &PeerId,
        _candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        Err(MediaError::NoSession)
    }

    fn replace_track(&mut self, _peer_id: &PeerId, _source: &TrackSource) -> Result<(), MediaError> {
        Err(MediaError::NoSession)
    }

    fn close(&mut self, _peer_id: &PeerId) {}
}
