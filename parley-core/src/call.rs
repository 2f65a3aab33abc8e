//! Call session manager: audio/video call signaling over the rendezvous server, with the
//! local media stack behind [`MediaProvider`].
//!
//! `idle -> connecting(outgoing|incoming) -> active -> ended`, and `failed` from connecting
//! or active. At most one call is non-terminal at a time; finished calls move to history.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::backoff::Backoff;
use crate::candidates::CandidateQueue;
use crate::identity::PeerId;
use crate::media::{
    MediaAcquisitionError, MediaError, MediaEvent, MediaProvider, MediaStreamHandle, TrackSource,
};
use crate::signaling::{ClientSignal, IceCandidate, MediaKind, SessionDescription, SignalingClient};
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Connecting,
    Active,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    RemoteHangup,
    Rejected,
    Busy,
    NoAnswer,
    MediaError,
    TransportFailed,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::Rejected => "rejected",
            EndReason::Busy => "busy",
            EndReason::NoAnswer => "no_answer",
            EndReason::MediaError => "media_error",
            EndReason::TransportFailed => "transport_failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CallTransition {
    RemoteAnswered,
    LocalAnswered,
    Ended(EndReason),
    Failed(EndReason),
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    stream: Option<MediaStreamHandle>,
    remote_offer: Option<SessionDescription>,
    remote_description_set: bool,
    /// Ring deadline of an unanswered outgoing call.
    deadline: Option<Instant>,
    reoffer: Option<Backoff>,
    awaiting_reanswer: bool,
}

impl CallSession {
    fn new(peer_id: PeerId, kind: MediaKind, direction: CallDirection) -> Self {
        Self {
            peer_id,
            kind,
            direction,
            status: CallStatus::Connecting,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
            stream: None,
            remote_offer: None,
            remote_description_set: false,
            deadline: None,
            reoffer: None,
            awaiting_reanswer: false,
        }
    }

    fn apply(&mut self, transition: CallTransition) -> Result<(), CallError> {
        let next = match (self.status, transition) {
            (CallStatus::Connecting, CallTransition::RemoteAnswered)
                if self.direction == CallDirection::Outgoing =>
            {
                CallStatus::Active
            }
            (CallStatus::Connecting, CallTransition::LocalAnswered)
                if self.direction == CallDirection::Incoming =>
            {
                CallStatus::Active
            }
            (CallStatus::Connecting | CallStatus::Active, CallTransition::Ended(reason)) => {
                self.end_reason = Some(reason);
                CallStatus::Ended
            }
            (CallStatus::Connecting | CallStatus::Active, CallTransition::Failed(reason)) => {
                self.end_reason = Some(reason);
                CallStatus::Failed
            }
            (status, _) => return Err(CallError::InvalidState(status)),
        };
        match next {
            CallStatus::Active => {
                self.connected_at = Some(Utc::now());
                self.deadline = None;
            }
            CallStatus::Ended | CallStatus::Failed => self.ended_at = Some(Utc::now()),
            CallStatus::Connecting => {}
        }
        self.status = next;
        Ok(())
    }

    /// Seconds between connect and end, for calls that were answered.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.connected_at, self.ended_at) {
            (Some(c), Some(e)) => Some(e.signed_duration_since(c).num_seconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Incoming { peer_id: PeerId, kind: MediaKind },
    Active(PeerId),
    Ended { peer_id: PeerId, reason: EndReason },
    Failed { peer_id: PeerId, reason: EndReason },
    /// An offer arrived during another call and was answered `busy`.
    MissedWhileBusy(PeerId),
    /// The outgoing call was not answered in time.
    SignalingTimeout(PeerId),
    Reoffering { peer_id: PeerId, attempt: u32 },
    RelayFallback(PeerId),
}

pub struct CallSessionManager {
    media: Box<dyn MediaProvider>,
    current: Option<CallSession>,
    history: Vec<CallSession>,
    candidates: CandidateQueue,
    timeout: Duration,
    reconnect_base: Duration,
    max_attempts: u32,
}

impl CallSessionManager {
    pub fn new(
        media: Box<dyn MediaProvider>,
        timeout: Duration,
        reconnect_base: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            media,
            current: None,
            history: Vec::new(),
            candidates: CandidateQueue::new(),
            timeout,
            reconnect_base,
            max_attempts,
        }
    }

    pub fn current(&self) -> Option<&CallSession> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &[CallSession] {
        &self.history
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    fn current_with(&mut self, peer_id: &PeerId) -> Option<&mut CallSession> {
        self.current.as_mut().filter(|c| c.peer_id == *peer_id)
    }

    /// Place a call: acquire local media, send `call-offer` and start the ring timer.
    pub fn start_call(
        &mut self,
        peer_id: &PeerId,
        kind: MediaKind,
        now: Instant,
        signaling: &mut SignalingClient,
    ) -> Result<(), CallError> {
        if self.is_busy() {
            return Err(CallError::Busy);
        }
        let stream = self.media.acquire(kind)?;
        let offer = match self.media.create_offer(peer_id, stream) {
            Ok(o) => o,
            Err(e) => {
                self.media.release(stream);
                self.media.close(peer_id);
                return Err(e.into());
            }
        };
        self.candidates.clear(peer_id);
        let mut call = CallSession::new(peer_id.clone(), kind, CallDirection::Outgoing);
        call.stream = Some(stream);
        call.deadline = Some(now + self.timeout);
        self.current = Some(call);
        info!("calling {} ({:?})", peer_id, kind);
        signaling.send(ClientSignal::CallOffer {
            to: peer_id.clone(),
            sdp: offer,
            media_kind: kind,
        });
        Ok(())
    }

    /// Remote `call-offer`. During another call the offer is answered `busy`; from the peer
    /// of the active call it is a media renegotiation.
    pub fn on_call_offer(
        &mut self,
        peer_id: &PeerId,
        offer: SessionDescription,
        kind: MediaKind,
        signaling: &mut SignalingClient,
    ) -> Vec<CallEvent> {
        if let Some(call) = &self.current {
            if call.peer_id == *peer_id && call.status == CallStatus::Active {
                return self.renegotiate(peer_id, &offer, signaling);
            }
            info!("{} called during another call; replying busy", peer_id);
            signaling.send(ClientSignal::CallReject {
                to: peer_id.clone(),
                reason: EndReason::Busy.as_str().to_string(),
            });
            return vec![CallEvent::MissedWhileBusy(peer_id.clone())];
        }
        let mut call = CallSession::new(peer_id.clone(), kind, CallDirection::Incoming);
        call.remote_offer = Some(offer);
        self.current = Some(call);
        info!("incoming {:?} call from {}", kind, peer_id);
        vec![CallEvent::Incoming {
            peer_id: peer_id.clone(),
            kind,
        }]
    }

    fn renegotiate(
        &mut self,
        peer_id: &PeerId,
        offer: &SessionDescription,
        signaling: &mut SignalingClient,
    ) -> Vec<CallEvent> {
        let Some(stream) = self.current.as_ref().and_then(|c| c.stream) else {
            return Vec::new();
        };
        match self.media.accept_offer(peer_id, stream, offer) {
            Ok(answer) => {
                debug!("renegotiated media with {}", peer_id);
                signaling.send(ClientSignal::CallAnswer {
                    to: peer_id.clone(),
                    sdp: answer,
                });
                Vec::new()
            }
            Err(e) => {
                warn!("renegotiation with {} failed: {}", peer_id, e);
                Vec::new()
            }
        }
    }

    /// Answer the ringing incoming call. Media is acquired before the answer is built; if
    /// that fails the caller gets `call-reject` with the reason and the call fails.
    pub fn accept_call(
        &mut self,
        signaling: &mut SignalingClient,
    ) -> Result<Vec<CallEvent>, CallError> {
        let call = self.current.as_ref().ok_or(CallError::NoCall)?;
        if call.direction != CallDirection::Incoming || call.status != CallStatus::Connecting {
            return Err(CallError::InvalidState(call.status));
        }
        let peer_id = call.peer_id.clone();
        let kind = call.kind;
        let offer = call.remote_offer.clone().ok_or(CallError::NoCall)?;

        let stream = match self.media.acquire(kind) {
            Ok(s) => s,
            Err(e) => {
                warn!("could not acquire media to answer {}: {}", peer_id, e);
                signaling.send(ClientSignal::CallReject {
                    to: peer_id.clone(),
                    reason: e.reject_reason().to_string(),
                });
                self.finish(CallTransition::Failed(EndReason::MediaError));
                return Err(e.into());
            }
        };
        if let Some(c) = self.current.as_mut() {
            c.stream = Some(stream);
        }
        let answer = match self.media.accept_offer(&peer_id, stream, &offer) {
            Ok(a) => a,
            Err(e) => {
                signaling.send(ClientSignal::CallReject {
                    to: peer_id.clone(),
                    reason: "media-error".to_string(),
                });
                self.finish(CallTransition::Failed(EndReason::MediaError));
                return Err(e.into());
            }
        };
        signaling.send(ClientSignal::CallAnswer {
            to: peer_id.clone(),
            sdp: answer,
        });
        if let Some(c) = self.current.as_mut() {
            c.remote_description_set = true;
            c.apply(CallTransition::LocalAnswered)?;
        }
        self.flush_candidates(&peer_id);
        info!("call with {} is active", peer_id);
        Ok(vec![CallEvent::Active(peer_id)])
    }

    pub fn reject_call(
        &mut self,
        signaling: &mut SignalingClient,
    ) -> Result<Vec<CallEvent>, CallError> {
        let call = self.current.as_ref().ok_or(CallError::NoCall)?;
        if call.direction != CallDirection::Incoming || call.status != CallStatus::Connecting {
            return Err(CallError::InvalidState(call.status));
        }
        signaling.send(ClientSignal::CallReject {
            to: call.peer_id.clone(),
            reason: EndReason::Rejected.as_str().to_string(),
        });
        Ok(self.finish(CallTransition::Ended(EndReason::Rejected)))
    }

    /// End the current call locally, whatever its state.
    pub fn hangup(&mut self, signaling: &mut SignalingClient) -> Result<Vec<CallEvent>, CallError> {
        let call = self.current.as_ref().ok_or(CallError::NoCall)?;
        signaling.send(ClientSignal::CallEnd {
            to: call.peer_id.clone(),
        });
        Ok(self.finish(CallTransition::Ended(EndReason::Hangup)))
    }

    pub fn on_call_answer(&mut self, peer_id: &PeerId, answer: &SessionDescription) -> Vec<CallEvent> {
        let Some(call) = self.current_with(peer_id) else {
            debug!("answer from {} matches no call", peer_id);
            return Vec::new();
        };
        let renegotiating = call.status == CallStatus::Active && call.awaiting_reanswer;
        let answering = call.status == CallStatus::Connecting
            && call.direction == CallDirection::Outgoing
            && !call.remote_description_set;
        if !renegotiating && !answering {
            debug!("ignoring duplicate call answer from {}", peer_id);
            return Vec::new();
        }
        if let Err(e) = self.media.accept_answer(peer_id, answer) {
            warn!("call answer from {} unusable: {}", peer_id, e);
            return self.finish(CallTransition::Failed(EndReason::TransportFailed));
        }
        let Some(call) = self.current_with(peer_id) else {
            return Vec::new();
        };
        call.remote_description_set = true;
        if renegotiating {
            call.awaiting_reanswer = false;
            return Vec::new();
        }
        if let Err(e) = call.apply(CallTransition::RemoteAnswered) {
            warn!("{}", e);
            return Vec::new();
        }
        self.flush_candidates(peer_id);
        info!("call with {} is active", peer_id);
        vec![CallEvent::Active(peer_id.clone())]
    }

    pub fn on_call_end(&mut self, peer_id: &PeerId) -> Vec<CallEvent> {
        if self.current_with(peer_id).is_none() {
            return Vec::new();
        }
        self.finish(CallTransition::Ended(EndReason::RemoteHangup))
    }

    pub fn on_call_reject(&mut self, peer_id: &PeerId, reason: &str) -> Vec<CallEvent> {
        match self.current_with(peer_id) {
            Some(c) if c.direction == CallDirection::Outgoing && c.status == CallStatus::Connecting => {}
            _ => return Vec::new(),
        }
        let reason = if reason == EndReason::Busy.as_str() {
            EndReason::Busy
        } else {
            EndReason::Rejected
        };
        self.finish(CallTransition::Ended(reason))
    }

    /// Remote call candidate: applied once the remote description is set, buffered in
    /// arrival order before that.
    pub fn on_call_candidate(&mut self, peer_id: &PeerId, candidate: IceCandidate) {
        let ready = self
            .current_with(peer_id)
            .is_some_and(|c| c.remote_description_set);
        if !ready {
            self.candidates.push(peer_id, candidate);
            return;
        }
        if let Err(e) = self.media.add_candidate(peer_id, &candidate) {
            warn!("call candidate from {} rejected: {}", peer_id, e);
        }
    }

    fn flush_candidates(&mut self, peer_id: &PeerId) {
        for candidate in self.candidates.take(peer_id) {
            if let Err(e) = self.media.add_candidate(peer_id, &candidate) {
                warn!("buffered call candidate from {} rejected: {}", peer_id, e);
            }
        }
    }

    pub fn on_media_event(
        &mut self,
        event: MediaEvent,
        now: Instant,
        signaling: &mut SignalingClient,
    ) -> Vec<CallEvent> {
        match event {
            MediaEvent::LocalCandidate { peer_id, candidate } => {
                if self.current_with(&peer_id).is_some() {
                    signaling.send(ClientSignal::CallIceCandidate {
                        to: peer_id,
                        candidate,
                    });
                }
                Vec::new()
            }
            MediaEvent::StateChanged { peer_id, state } => {
                self.on_media_state(&peer_id, state, now)
            }
        }
    }

    fn on_media_state(
        &mut self,
        peer_id: &PeerId,
        state: ConnectionState,
        now: Instant,
    ) -> Vec<CallEvent> {
        let (base, max) = (self.reconnect_base, self.max_attempts);
        let Some(call) = self.current_with(peer_id) else {
            return Vec::new();
        };
        match (call.status, state) {
            (CallStatus::Active, ConnectionState::Connected) => {
                call.reoffer = None;
                Vec::new()
            }
            (CallStatus::Active, ConnectionState::Failed) => {
                let backoff = call.reoffer.get_or_insert_with(|| Backoff::new(base, max));
                if backoff.schedule(now) {
                    info!(
                        "call media to {} failed; re-offer {} scheduled",
                        peer_id,
                        backoff.attempt()
                    );
                    return Vec::new();
                }
                warn!("call media to {} could not be restored", peer_id);
                let mut events = self.finish(CallTransition::Failed(EndReason::TransportFailed));
                events.push(CallEvent::RelayFallback(peer_id.clone()));
                events
            }
            (CallStatus::Connecting, ConnectionState::Failed) => {
                self.finish(CallTransition::Failed(EndReason::TransportFailed))
            }
            _ => Vec::new(),
        }
    }

    /// Swap the outgoing track in place (camera, screen, microphone). No renegotiation.
    pub fn replace_track(&mut self, source: &TrackSource) -> Result<(), CallError> {
        let call = self.current.as_ref().ok_or(CallError::NoCall)?;
        if call.status != CallStatus::Active {
            return Err(CallError::InvalidState(call.status));
        }
        let peer_id = call.peer_id.clone();
        self.media.replace_track(&peer_id, source)?;
        Ok(())
    }

    /// Ring timeout and due re-offers.
    pub fn tick_at(&mut self, now: Instant, signaling: &mut SignalingClient) -> Vec<CallEvent> {
        let Some(call) = self.current.as_mut() else {
            return Vec::new();
        };
        let peer_id = call.peer_id.clone();
        if call.deadline.is_some_and(|d| now >= d) {
            info!("no answer from {}; ending call", peer_id);
            signaling.send(ClientSignal::CallEnd {
                to: peer_id.clone(),
            });
            let mut events = vec![CallEvent::SignalingTimeout(peer_id)];
            events.extend(self.finish(CallTransition::Ended(EndReason::NoAnswer)));
            return events;
        }
        let attempt = match call.reoffer.as_mut() {
            Some(backoff) => {
                if !backoff.due(now) {
                    return Vec::new();
                }
                backoff.attempt()
            }
            None => return Vec::new(),
        };
        let (kind, stream) = (call.kind, call.stream);
        let Some(stream) = stream else {
            return Vec::new();
        };
        match self.media.create_offer(&peer_id, stream) {
            Ok(offer) => {
                if let Some(c) = self.current.as_mut() {
                    c.awaiting_reanswer = true;
                }
                signaling.send(ClientSignal::CallOffer {
                    to: peer_id.clone(),
                    sdp: offer,
                    media_kind: kind,
                });
                vec![CallEvent::Reoffering { peer_id, attempt }]
            }
            Err(e) => {
                warn!("re-offer to {} failed: {}", peer_id, e);
                self.on_media_state(&peer_id, ConnectionState::Failed, now)
            }
        }
    }

    /// Drop any call with `peer_id` (peer torn down). Ends it as a transport failure.
    pub fn drop_peer(&mut self, peer_id: &PeerId) -> Vec<CallEvent> {
        self.candidates.clear(peer_id);
        if self.current_with(peer_id).is_none() {
            return Vec::new();
        }
        self.finish(CallTransition::Failed(EndReason::TransportFailed))
    }

    fn finish(&mut self, transition: CallTransition) -> Vec<CallEvent> {
        let Some(mut call) = self.current.take() else {
            return Vec::new();
        };
        if let Err(e) = call.apply(transition) {
            warn!("{}", e);
        }
        if let Some(stream) = call.stream.take() {
            self.media.release(stream);
        }
        self.media.close(&call.peer_id);
        self.candidates.clear(&call.peer_id);
        let reason = call.end_reason.unwrap_or(EndReason::Hangup);
        info!("call with {} {:?}: {}", call.peer_id, call.status, reason.as_str());
        let event = if call.status == CallStatus::Failed {
            CallEvent::Failed {
                peer_id: call.peer_id.clone(),
                reason,
            }
        } else {
            CallEvent::Ended {
                peer_id: call.peer_id.clone(),
                reason,
            }
        };
        self.history.push(call);
        vec![event]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("no call in progress")]
    NoCall,
    #[error("another call is in progress")]
    Busy,
    #[error("call is {0:?}")]
    InvalidState(CallStatus),
    #[error(transparent)]
    MediaAcquisition(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Media(#[from] MediaError),
}
