//! Recording transport and media providers for tests and host bring-up.
//!
//! Both are cheap `Clone` handles over shared state, so a test can box one into the core
//! and keep the other to inspect calls or pull out sent data.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::identity::PeerId;
use crate::media::{
    MediaAcquisitionError, MediaError, MediaProvider, MediaStreamHandle, TrackSource,
};
use crate::signaling::{IceCandidate, MediaKind, SessionDescription};
use crate::transport::{ChannelHandle, TransportError, TransportHandle, TransportProvider};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Create(PeerId),
    CreateOffer(TransportHandle),
    AcceptOffer(TransportHandle),
    AcceptAnswer(TransportHandle),
    AddCandidate(TransportHandle, String),
    OpenChannel(TransportHandle),
    Send(ChannelHandle, String),
    Close(TransportHandle),
}

#[derive(Default)]
struct TransportInner {
    next: u64,
    peers: HashMap<u64, PeerId>,
    calls: Vec<TransportCall>,
    outbox: Vec<(PeerId, String)>,
    fail_sends: bool,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Rc<RefCell<TransportInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.borrow().calls.clone()
    }

    /// Number of transports ever created.
    pub fn created(&self) -> usize {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Create(_)))
            .count()
    }

    /// Candidates applied, in order.
    pub fn candidates(&self) -> Vec<String> {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::AddCandidate(_, s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Data sent since the last call, with the peer it was addressed to.
    pub fn take_sent(&self) -> Vec<(PeerId, String)> {
        std::mem::take(&mut self.inner.borrow_mut().outbox)
    }

    /// Make every subsequent `send` fail as if the channel had closed.
    pub fn fail_sends(&self, fail: bool) {
        self.inner.borrow_mut().fail_sends = fail;
    }

    /// The handle most recently created for `peer_id`.
    pub fn handle_for(&self, peer_id: &PeerId) -> Option<TransportHandle> {
        self.inner
            .borrow()
            .peers
            .iter()
            .filter(|(_, p)| *p == peer_id)
            .map(|(h, _)| *h)
            .max()
            .map(TransportHandle)
    }
}

impl TransportProvider for MockTransport {
    fn create(&mut self, peer_id: &PeerId) -> Result<TransportHandle, TransportError> {
        let mut inner = self.inner.borrow_mut();
        inner.next += 1;
        let id = inner.next;
        inner.peers.insert(id, peer_id.clone());
        inner.calls.push(TransportCall::Create(peer_id.clone()));
        Ok(TransportHandle(id))
    }

    fn create_offer(
        &mut self,
        handle: TransportHandle,
    ) -> Result<SessionDescription, TransportError> {
        self.inner
            .borrow_mut()
            .calls
            .push(TransportCall::CreateOffer(handle));
        Ok(SessionDescription::offer(format!("mock-offer-{}", handle.0)))
    }

    fn accept_offer(
        &mut self,
        handle: TransportHandle,
        _offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.inner
            .borrow_mut()
            .calls
            .push(TransportCall::AcceptOffer(handle));
        Ok(SessionDescription::answer(format!("mock-answer-{}", handle.0)))
    }

    fn accept_answer(
        &mut self,
        handle: TransportHandle,
        _answer: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.inner
            .borrow_mut()
            .calls
            .push(TransportCall::AcceptAnswer(handle));
        Ok(())
    }

    fn add_candidate(
        &mut self,
        handle: TransportHandle,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        self.inner
            .borrow_mut()
            .calls
            .push(TransportCall::AddCandidate(handle, candidate.candidate.clone()));
        Ok(())
    }

    fn open_channel(
        &mut self,
        handle: TransportHandle,
        _label: &str,
    ) -> Result<ChannelHandle, TransportError> {
        self.inner
            .borrow_mut()
            .calls
            .push(TransportCall::OpenChannel(handle));
        Ok(ChannelHandle(handle.0))
    }

    fn send(&mut self, channel: ChannelHandle, data: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_sends {
            return Err(TransportError::ChannelClosed);
        }
        let peer = inner
            .peers
            .get(&channel.0)
            .cloned()
            .ok_or(TransportError::UnknownHandle)?;
        inner.calls.push(TransportCall::Send(channel, data.to_string()));
        inner.outbox.push((peer, data.to_string()));
        Ok(())
    }

    fn close(&mut self, handle: TransportHandle) {
        self.inner
            .borrow_mut()
            .calls
            .push(TransportCall::Close(handle));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaCall {
    Acquire(MediaKind),
    Release(MediaStreamHandle),
    CreateOffer(PeerId),
    AcceptOffer(PeerId),
    AcceptAnswer(PeerId),
    AddCandidate(PeerId, String),
    ReplaceTrack(PeerId, TrackSource),
    Close(PeerId),
}

#[derive(Default)]
struct MediaInner {
    next: u64,
    calls: Vec<MediaCall>,
    acquire_error: Option<MediaAcquisitionError>,
}

#[derive(Clone, Default)]
pub struct MockMedia {
    inner: Rc<RefCell<MediaInner>>,
}

impl MockMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `acquire` fail with `err` until cleared with `None`.
    pub fn fail_acquire(&self, err: Option<MediaAcquisitionError>) {
        self.inner.borrow_mut().acquire_error = err;
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.inner.borrow().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&MediaCall) -> bool) -> usize {
        self.inner.borrow().calls.iter().filter(|c| pred(c)).count()
    }
}

impl MediaProvider for MockMedia {
    fn acquire(&mut self, kind: MediaKind) -> Result<MediaStreamHandle, MediaAcquisitionError> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push(MediaCall::Acquire(kind));
        if let Some(err) = inner.acquire_error.clone() {
            return Err(err);
        }
        inner.next += 1;
        Ok(MediaStreamHandle(inner.next))
    }

    fn release(&mut self, stream: MediaStreamHandle) {
        self.inner.borrow_mut().calls.push(MediaCall::Release(stream));
    }

    fn create_offer(
        &mut self,
        peer_id: &PeerId,
        _stream: MediaStreamHandle,
    ) -> Result<SessionDescription, MediaError> {
        self.inner
            .borrow_mut()
            .calls
            .push(MediaCall::CreateOffer(peer_id.clone()));
        Ok(SessionDescription::offer("mock-media-offer"))
    }

    fn accept_offer(
        &mut self,
        peer_id: &PeerId,
        _stream: MediaStreamHandle,
        _offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        self.inner
            .borrow_mut()
            .calls
            .push(MediaCall::AcceptOffer(peer_id.clone()));
        Ok(SessionDescription::answer("mock-media-answer"))
    }

    fn accept_answer(
        &mut self,
        peer_id: &PeerId,
        _answer: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.inner
            .borrow_mut()
            .calls
            .push(MediaCall::AcceptAnswer(peer_id.clone()));
        Ok(())
    }

    fn add_candidate(
        &mut self,
        peer_id: &PeerId,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        self.inner.borrow_mut().calls.push(MediaCall::AddCandidate(
            peer_id.clone(),
            candidate.candidate.clone(),
        ));
        Ok(())
    }

    fn replace_track(&mut self, peer_id: &PeerId, source: &TrackSource) -> Result<(), MediaError> {
        self.inner
            .borrow_mut()
            .calls
            .push(MediaCall::ReplaceTrack(peer_id.clone(), source.clone()));
        Ok(())
    }

    fn close(&mut self, peer_id: &PeerId) {
        self.inner
            .borrow_mut()
            .calls
            .push(MediaCall::Close(peer_id.clone()));
    }
}
