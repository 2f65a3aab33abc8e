//! Host-driven API: ChatCore receives events from the host, returns actions.
//!
//! The host feeds signaling messages, transport and media events, user commands and
//! timer ticks; after each call it drains [`ChatCore::poll`] for signals to put on the
//! rendezvous connection and events to show the user.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::auth::{Admission, AuthorizationGate};
use crate::call::{CallEvent, CallSession, CallSessionManager};
use crate::config::Config;
use crate::crypto::{EncryptionState, KeyExchangeEngine};
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::media::{MediaAcquisitionError, MediaEvent, MediaProvider, TrackSource};
use crate::message::{Message, MessageKind};
use crate::messaging::{MessageProtocol, StatusChange};
use crate::peer::{PeerConnectionManager, PeerEvent, PeerSession};
use crate::protocol::Frame;
use crate::signaling::{ClientSignal, MediaKind, PresenceChange, ServerSignal, SignalingClient};
use crate::store::{ChatSummary, MessageRecord, MessageStore};
use crate::transfer::{
    ChunkOutcome, FileMeta, FileTransfer, FileTransferEngine, OfferOutcome, TransferError,
};
use crate::transport::{ConnectionState, TransportEvent, TransportProvider};

/// Application-level happenings for the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Presence(PresenceChange),
    PeerState {
        peer_id: PeerId,
        state: ConnectionState,
    },
    /// Sub-channel handed over; messages can flow.
    ChannelReady(PeerId),
    ChannelClosed(PeerId),
    EncryptionEstablished(PeerId),
    /// A message went out as plaintext because no key was established yet.
    UnencryptedSend {
        peer_id: PeerId,
        message_id: String,
    },
    MessageReceived(Message),
    /// Held until the conversation is accepted.
    MessagePendingAuthorization {
        peer_id: PeerId,
        message_id: String,
    },
    /// Placeholder for a message whose body could not be decrypted.
    Undecryptable {
        peer_id: PeerId,
        message_id: String,
    },
    StatusChanged(StatusChange),
    Typing {
        peer_id: PeerId,
        typing: bool,
    },
    AuthAccepted(PeerId),
    AuthRefused(PeerId),
    FileOffered(FileTransfer),
    TransferStarted(String),
    TransferProgress {
        transfer_id: String,
        transferred: u64,
        total: u64,
        speed: f64,
    },
    /// `data` is the rebuilt file on the receiving side, `None` for the sender.
    TransferCompleted {
        transfer_id: String,
        data: Option<Vec<u8>>,
    },
    TransferFailed {
        transfer_id: String,
        reason: String,
    },
    TransferRejected(String),
    TransferCancelled(String),
    Call(CallEvent),
    MediaAcquisitionFailed {
        peer_id: PeerId,
        error: MediaAcquisitionError,
    },
    Reconnecting {
        peer_id: PeerId,
        attempt: u32,
    },
    /// Direct connection attempts are exhausted; use the relay path.
    RelayFallback(PeerId),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Put this on the rendezvous connection.
    Signal(ClientSignal),
    Notify(Event),
}

/// Main coordinator. Host passes events; core returns actions.
pub struct ChatCore {
    config: Config,
    local_id: PeerId,
    signaling: SignalingClient,
    peers: PeerConnectionManager,
    keys: KeyExchangeEngine,
    messages: MessageProtocol,
    gate: AuthorizationGate,
    transfers: FileTransferEngine,
    calls: CallSessionManager,
    store: Box<dyn MessageStore>,
    events: VecDeque<Event>,
}

impl ChatCore {
    pub fn new(
        local_id: PeerId,
        config: Config,
        transport: Box<dyn TransportProvider>,
        media: Box<dyn MediaProvider>,
        store: Box<dyn MessageStore>,
    ) -> Self {
        let peers = PeerConnectionManager::new(
            local_id.clone(),
            transport,
            config.channel_label.clone(),
            config.reconnect_base(),
            config.max_reconnect_attempts,
        );
        let transfers =
            FileTransferEngine::new(config.chunk_size, config.max_file_size, config.chunks_per_pump);
        let calls = CallSessionManager::new(
            media,
            config.call_timeout(),
            config.reconnect_base(),
            config.max_reconnect_attempts,
        );
        Self {
            config,
            local_id,
            signaling: SignalingClient::new(),
            peers,
            keys: KeyExchangeEngine::new(),
            messages: MessageProtocol::new(),
            gate: AuthorizationGate::new(),
            transfers,
            calls,
            store,
            events: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.peers.session(peer_id)
    }

    pub fn encryption_state(&self, peer_id: &PeerId) -> EncryptionState {
        self.keys.state(peer_id)
    }

    pub fn outbound(&self, peer_id: &PeerId) -> &[Message] {
        self.messages.outbound(peer_id)
    }

    pub fn pending_authorization(&self, peer_id: &PeerId) -> &[Message] {
        self.gate.pending(peer_id)
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<&FileTransfer> {
        self.transfers.get(transfer_id)
    }

    pub fn call(&self) -> Option<&CallSession> {
        self.calls.current()
    }

    pub fn call_history(&self) -> &[CallSession] {
        self.calls.history()
    }

    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    /// Signals to send, then events to surface, in the order they were produced.
    pub fn poll(&mut self) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .signaling
            .drain()
            .into_iter()
            .map(Action::Signal)
            .collect();
        actions.extend(self.events.drain(..).map(Action::Notify));
        actions
    }

    fn emit(&mut self, event: Event) {
        self.events.push_back(event);
    }

    // --- inbound: signaling -------------------------------------------------------------

    pub fn on_signal(&mut self, signal: ServerSignal) {
        if let Some(change) = self.signaling.apply_presence(&signal) {
            self.emit(Event::Presence(change));
            return;
        }
        match signal {
            ServerSignal::Offer { from, sdp } => {
                match self.peers.on_remote_offer(&from, &sdp, &mut self.signaling) {
                    Ok(events) => self.handle_peer_events(events, Instant::now()),
                    Err(e) => warn!("offer from {} failed: {}", from, e),
                }
            }
            ServerSignal::Answer { from, sdp } => {
                if let Err(e) = self.peers.on_remote_answer(&from, &sdp) {
                    warn!("answer from {} failed: {}", from, e);
                }
            }
            ServerSignal::IceCandidate { from, candidate } => {
                self.peers.on_remote_candidate(&from, candidate);
            }
            ServerSignal::CallOffer {
                from,
                sdp,
                media_kind,
            } => {
                let events = self
                    .calls
                    .on_call_offer(&from, sdp, media_kind, &mut self.signaling);
                self.emit_calls(events);
            }
            ServerSignal::CallAnswer { from, sdp } => {
                let events = self.calls.on_call_answer(&from, &sdp);
                self.emit_calls(events);
            }
            ServerSignal::CallEnd { from } => {
                let events = self.calls.on_call_end(&from);
                self.emit_calls(events);
            }
            ServerSignal::CallReject { from, reason } => {
                let events = self.calls.on_call_reject(&from, &reason);
                self.emit_calls(events);
            }
            ServerSignal::CallIceCandidate { from, candidate } => {
                self.calls.on_call_candidate(&from, candidate);
            }
            ServerSignal::UserOnline { .. }
            | ServerSignal::UserOffline { .. }
            | ServerSignal::OnlineUsers { .. }
            | ServerSignal::StatusUpdated { .. } => {}
            ServerSignal::Unknown => debug!("dropping unknown signal"),
        }
    }

    fn emit_calls(&mut self, events: Vec<CallEvent>) {
        for e in events {
            self.emit(Event::Call(e));
        }
    }

    // --- inbound: transport and media -----------------------------------------------------

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        self.on_transport_event_at(event, Instant::now());
    }

    pub fn on_transport_event_at(&mut self, event: TransportEvent, now: Instant) {
        let events = self
            .peers
            .on_transport_event_at(event, &mut self.signaling, now);
        self.handle_peer_events(events, now);
    }

    pub fn on_media_event(&mut self, event: MediaEvent) {
        self.on_media_event_at(event, Instant::now());
    }

    pub fn on_media_event_at(&mut self, event: MediaEvent, now: Instant) {
        let events = self.calls.on_media_event(event, now, &mut self.signaling);
        self.emit_calls(events);
    }

    fn handle_peer_events(&mut self, events: Vec<PeerEvent>, now: Instant) {
        for event in events {
            match event {
                PeerEvent::StateChanged(peer_id, state) => {
                    self.emit(Event::PeerState { peer_id, state })
                }
                PeerEvent::ChannelOpen(peer_id) => self.on_channel_open(&peer_id),
                PeerEvent::ChannelClosed(peer_id) => self.emit(Event::ChannelClosed(peer_id)),
                PeerEvent::Message(peer_id, data) => self.on_frame(&peer_id, &data, now),
                PeerEvent::SessionReset(peer_id) => self.keys.remove(&peer_id),
                PeerEvent::ReconnectScheduled { peer_id, attempt } => {
                    debug!("reconnect {} to {} scheduled", attempt, peer_id)
                }
                PeerEvent::Reconnecting { peer_id, attempt } => {
                    self.emit(Event::Reconnecting { peer_id, attempt })
                }
                PeerEvent::RelayFallback(peer_id) => self.emit(Event::RelayFallback(peer_id)),
            }
        }
    }

    /// Start key agreement on a freshly opened sub-channel, then hand it over.
    fn on_channel_open(&mut self, peer_id: &PeerId) {
        if let Some(frame) = self.keys.initiate(peer_id) {
            self.send_handshake(peer_id, &frame);
        }
        let state = self.keys.state(peer_id);
        if self.peers.hand_over_channel(peer_id, state) {
            info!("channel to {} ready ({:?})", peer_id, state);
            self.emit(Event::ChannelReady(peer_id.clone()));
        } else {
            warn!("channel to {} not handed over: encryption {:?}", peer_id, state);
        }
    }

    fn send_handshake(&mut self, peer_id: &PeerId, frame: &Frame) {
        let sent = frame
            .encode()
            .map_err(Error::from)
            .and_then(|text| self.peers.send_handshake(peer_id, &text).map_err(Error::from));
        match sent {
            Ok(()) => self.keys.key_sent(peer_id),
            Err(e) => warn!("key exchange to {} not sent: {}", peer_id, e),
        }
    }

    /// Send a frame, logging instead of failing. Used for acknowledgements and replies
    /// produced while handling inbound frames.
    fn reply(&mut self, peer_id: &PeerId, frame: &Frame) {
        if let Err(e) = MessageProtocol::send(&mut self.peers, peer_id, frame) {
            warn!("{} to {} not sent: {}", frame.kind(), peer_id, e);
        }
    }

    fn on_frame(&mut self, peer_id: &PeerId, data: &str, now: Instant) {
        let frame = match Frame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                warn!("dropping malformed frame from {}: {}", peer_id, e);
                return;
            }
        };
        debug!("frame in from {}: {}", peer_id, frame.kind());
        match frame {
            Frame::KeyExchange { public_key } => self.on_key_exchange(peer_id, &public_key),
            Frame::Text {
                message_id,
                content,
                timestamp,
            } => self.on_payload(peer_id, message_id, content, timestamp, false),
            Frame::EncryptedMessage {
                message_id,
                encrypted,
                iv,
                timestamp,
            } => match self.keys.open_message(peer_id, &encrypted, &iv) {
                Ok(content) => self.on_payload(peer_id, message_id, content, timestamp, true),
                Err(e) => {
                    warn!("message {} from {} undecryptable: {}", message_id, peer_id, e);
                    self.emit(Event::Undecryptable {
                        peer_id: peer_id.clone(),
                        message_id,
                    });
                }
            },
            Frame::TypingStart => self.on_typing(peer_id, true),
            Frame::TypingStop => self.on_typing(peer_id, false),
            Frame::AuthAccepted => self.emit(Event::AuthAccepted(peer_id.clone())),
            Frame::AuthRefused => {
                info!("{} refused the conversation", peer_id);
                let changes = self.messages.refuse_all(peer_id);
                self.apply_status_changes(changes);
                self.emit(Event::AuthRefused(peer_id.clone()));
            }
            ack @ (Frame::MessageReceived { .. } | Frame::MessageRead { .. }) => {
                let changes = self.messages.on_ack(peer_id, &ack);
                self.apply_status_changes(changes);
            }
            Frame::FileOffer {
                transfer_id,
                name,
                size,
                file_type,
                thumbnail,
            } => {
                let meta = FileMeta {
                    name,
                    mime: file_type,
                    thumbnail,
                };
                match self.transfers.on_offer(peer_id, &transfer_id, meta, size) {
                    OfferOutcome::Pending(t) => self.emit(Event::FileOffered(t)),
                    OfferOutcome::AutoRejected(reply) => self.reply(peer_id, &reply),
                    OfferOutcome::Duplicate => debug!("duplicate offer {}", transfer_id),
                }
            }
            Frame::FileAccept { transfer_id } => {
                match self.transfers.on_accept(peer_id, &transfer_id, now) {
                    Ok(metadata) => {
                        self.reply(peer_id, &metadata);
                        self.emit(Event::TransferStarted(transfer_id));
                    }
                    Err(e) => warn!("file_accept from {}: {}", peer_id, e),
                }
            }
            Frame::FileReject { transfer_id } => {
                match self.transfers.on_reject(peer_id, &transfer_id) {
                    Ok(()) => self.emit(Event::TransferRejected(transfer_id)),
                    Err(e) => warn!("file_reject from {}: {}", peer_id, e),
                }
            }
            Frame::FileCancel { transfer_id } => {
                match self.transfers.on_cancel(peer_id, &transfer_id) {
                    Ok(()) => self.emit(Event::TransferCancelled(transfer_id)),
                    Err(e) => debug!("file_cancel from {}: {}", peer_id, e),
                }
            }
            Frame::FileMetadata {
                transfer_id,
                total_chunks,
                chunk_size,
                sha256,
            } => match self.transfers.on_metadata(
                peer_id,
                &transfer_id,
                total_chunks,
                chunk_size,
                &sha256,
            ) {
                Ok(()) => {}
                Err(e @ TransferError::Reconstruction { .. }) => self.emit(Event::TransferFailed {
                    transfer_id,
                    reason: e.to_string(),
                }),
                Err(e) => warn!("file_metadata from {}: {}", peer_id, e),
            },
            Frame::FileChunk {
                transfer_id,
                chunk_index,
                total_chunks,
                data,
                is_final,
            } => self.on_chunk(
                peer_id,
                &transfer_id,
                chunk_index,
                total_chunks,
                &data,
                is_final,
                now,
            ),
            Frame::ChunkAck {
                transfer_id,
                chunk_index,
            } => {
                if self
                    .transfers
                    .on_chunk_ack(peer_id, &transfer_id, chunk_index, now)
                {
                    self.emit_progress(&transfer_id);
                }
            }
            Frame::FileTransferAck { transfer_id } => {
                match self.transfers.on_transfer_ack(peer_id, &transfer_id, now) {
                    Ok(()) => self.emit(Event::TransferCompleted {
                        transfer_id,
                        data: None,
                    }),
                    Err(e) => warn!("file_transfer_ack from {}: {}", peer_id, e),
                }
            }
            Frame::Unknown => debug!("dropping unknown frame from {}", peer_id),
        }
    }

    fn on_typing(&mut self, peer_id: &PeerId, typing: bool) {
        if self.gate.is_authorized(peer_id) {
            self.emit(Event::Typing {
                peer_id: peer_id.clone(),
                typing,
            });
        }
    }

    fn on_key_exchange(&mut self, peer_id: &PeerId, public_key: &str) {
        match self.keys.on_remote_key(peer_id, public_key) {
            Ok(reply) => {
                if let Some(frame) = reply {
                    self.send_handshake(peer_id, &frame);
                }
                let state = self.keys.state(peer_id);
                let ready = self
                    .peers
                    .session(peer_id)
                    .is_some_and(PeerSession::is_channel_ready);
                if ready {
                    self.peers.set_encryption(peer_id, state);
                } else if self.peers.hand_over_channel(peer_id, state) {
                    self.emit(Event::ChannelReady(peer_id.clone()));
                }
                if state == EncryptionState::Established {
                    self.emit(Event::EncryptionEstablished(peer_id.clone()));
                }
            }
            Err(e) => {
                warn!("key exchange with {} failed: {}", peer_id, e);
                self.peers
                    .set_encryption(peer_id, self.keys.state(peer_id));
            }
        }
    }

    fn on_payload(
        &mut self,
        peer_id: &PeerId,
        message_id: String,
        content: String,
        timestamp: DateTime<Utc>,
        encrypted: bool,
    ) {
        if !self.messages.first_sighting(peer_id, &message_id) {
            debug!("duplicate message {} from {}", message_id, peer_id);
            return;
        }
        let message = Message::incoming(
            message_id.clone(),
            peer_id.clone(),
            content,
            timestamp,
            encrypted,
        );
        match self.gate.admit(peer_id, message) {
            Admission::Deliver(m) => self.deliver(peer_id, m),
            Admission::Held => {
                info!("holding message from {} until the conversation is accepted", peer_id);
                self.emit(Event::MessagePendingAuthorization {
                    peer_id: peer_id.clone(),
                    message_id,
                });
            }
        }
    }

    /// Surface, store and acknowledge an inbound message from an authorized peer.
    fn deliver(&mut self, peer_id: &PeerId, message: Message) {
        self.store
            .save_message(MessageRecord::from_message(peer_id.as_str(), &message));
        self.touch_summary(peer_id, &message.content, message.timestamp, SummaryUpdate::Unread);
        self.reply(
            peer_id,
            &Frame::MessageReceived {
                message_id: message.id.clone(),
            },
        );
        self.emit(Event::MessageReceived(message));
    }

    #[allow(clippy::too_many_arguments)]
    fn on_chunk(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: &str,
        is_final: bool,
        now: Instant,
    ) {
        let outcome = self.transfers.on_chunk(
            peer_id,
            transfer_id,
            chunk_index,
            total_chunks,
            data,
            is_final,
            now,
        );
        match outcome {
            Ok(ChunkOutcome::Stored { ack }) => {
                self.reply(peer_id, &ack);
                self.emit_progress(transfer_id);
            }
            Ok(ChunkOutcome::Completed { ack, done, data }) => {
                self.reply(peer_id, &ack);
                self.reply(peer_id, &done);
                self.emit_progress(transfer_id);
                self.emit(Event::TransferCompleted {
                    transfer_id: transfer_id.to_string(),
                    data: Some(data),
                });
            }
            Err(e @ TransferError::Reconstruction { .. }) => {
                self.emit(Event::TransferFailed {
                    transfer_id: transfer_id.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => warn!("file_chunk from {}: {}", peer_id, e),
        }
    }

    fn emit_progress(&mut self, transfer_id: &str) {
        if let Some(t) = self.transfers.get(transfer_id) {
            let event = Event::TransferProgress {
                transfer_id: t.id.clone(),
                transferred: t.transferred,
                total: t.total,
                speed: t.speed,
            };
            self.emit(event);
        }
    }

    fn apply_status_changes(&mut self, changes: Vec<StatusChange>) {
        for change in changes {
            self.store
                .update_status(change.peer_id.as_str(), &change.message_id, change.status);
            self.emit(Event::StatusChanged(change));
        }
    }

    fn touch_summary(
        &mut self,
        peer_id: &PeerId,
        preview: &str,
        timestamp: DateTime<Utc>,
        update: SummaryUpdate,
    ) {
        let existing = self
            .store
            .summaries()
            .into_iter()
            .find(|s| s.chat_id == peer_id.as_str());
        let unread = existing.as_ref().map(|s| s.unread).unwrap_or(0);
        let (last_message, last_timestamp) = match (update, existing) {
            (SummaryUpdate::Read, Some(s)) => (s.last_message, s.last_timestamp),
            _ => (preview.to_string(), timestamp),
        };
        self.store.save_summary(ChatSummary {
            chat_id: peer_id.to_string(),
            last_message,
            last_timestamp,
            unread: match update {
                SummaryUpdate::Unread => unread.saturating_add(1),
                SummaryUpdate::Outgoing => unread,
                SummaryUpdate::Read => 0,
            },
        });
    }

    // --- commands -------------------------------------------------------------------------

    /// Open (or reuse) the session with `peer_id`.
    pub fn open(&mut self, peer_id: &PeerId) -> Result<()> {
        let events = self.peers.open(peer_id, &mut self.signaling)?;
        self.handle_peer_events(events, Instant::now());
        Ok(())
    }

    /// Pre-authorize a peer whose conversation already exists.
    pub fn authorize(&mut self, peer_id: &PeerId) {
        self.gate.authorize(peer_id);
    }

    /// Send a text message. Encrypted when a key is established; otherwise sent as a
    /// plain `text` frame and reported with [`Event::UnencryptedSend`]. Returns the id.
    pub fn send_text(&mut self, peer_id: &PeerId, content: &str) -> Result<String> {
        let mut message = Message::outgoing(content, MessageKind::Text);
        let frame = if self.keys.is_established(peer_id) {
            message.encrypted = true;
            self.keys
                .seal_message(peer_id, &message.id, &message.content, message.timestamp)?
        } else {
            Frame::Text {
                message_id: message.id.clone(),
                content: message.content.clone(),
                timestamp: message.timestamp,
            }
        };
        let id = message.id.clone();
        let timestamp = message.timestamp;
        self.store
            .save_message(MessageRecord::from_message(peer_id.as_str(), &message));
        self.messages.record_outbound(peer_id, message);

        MessageProtocol::send(&mut self.peers, peer_id, &frame)?;

        if !matches!(frame, Frame::EncryptedMessage { .. }) {
            warn!("message {} to {} sent without encryption", id, peer_id);
            self.emit(Event::UnencryptedSend {
                peer_id: peer_id.clone(),
                message_id: id.clone(),
            });
        }
        if let Some(change) = self.messages.mark_sent(peer_id, &id) {
            self.apply_status_changes(vec![change]);
        }
        self.touch_summary(peer_id, content, timestamp, SummaryUpdate::Outgoing);
        if self.gate.on_local_send(peer_id) {
            for held in self.gate.release(peer_id) {
                self.deliver(peer_id, held);
            }
        }
        Ok(id)
    }

    pub fn set_typing(&mut self, peer_id: &PeerId, typing: bool) -> Result<()> {
        let frame = if typing {
            Frame::TypingStart
        } else {
            Frame::TypingStop
        };
        MessageProtocol::send(&mut self.peers, peer_id, &frame)
    }

    /// Tell the peer we read `message_id`, or everything when `None`.
    pub fn mark_read(&mut self, peer_id: &PeerId, message_id: Option<&str>) -> Result<()> {
        MessageProtocol::send(
            &mut self.peers,
            peer_id,
            &Frame::MessageRead {
                message_id: message_id.map(str::to_string),
            },
        )?;
        self.touch_summary(peer_id, "", Utc::now(), SummaryUpdate::Read);
        Ok(())
    }

    /// Accept the conversation: held messages are delivered in arrival order and the peer
    /// is told with `auth_accepted`.
    pub fn accept_conversation(&mut self, peer_id: &PeerId) -> Result<()> {
        let (frame, released) = self.gate.accept(peer_id);
        info!(
            "accepted conversation with {} ({} held)",
            peer_id,
            released.len()
        );
        for m in released {
            self.deliver(peer_id, m);
        }
        MessageProtocol::send(&mut self.peers, peer_id, &frame)
    }

    /// Reject the conversation: held messages are discarded. Returns how many.
    pub fn reject_conversation(&mut self, peer_id: &PeerId) -> Result<usize> {
        let (frame, dropped) = self.gate.reject(peer_id);
        info!("rejected conversation with {} ({} dropped)", peer_id, dropped);
        MessageProtocol::send(&mut self.peers, peer_id, &frame)?;
        Ok(dropped)
    }

    pub fn set_status(&mut self, status: &str) {
        self.signaling.send(ClientSignal::SetStatus {
            status: status.to_string(),
        });
    }

    /// Offer a file. Returns the transfer id.
    pub fn send_file(&mut self, peer_id: &PeerId, meta: FileMeta, data: Vec<u8>) -> Result<String> {
        let (id, frame) = self.transfers.offer(peer_id, meta, data)?;
        if let Err(e) = MessageProtocol::send(&mut self.peers, peer_id, &frame) {
            if self.transfers.mark_failed(&id) {
                self.emit(Event::TransferFailed {
                    transfer_id: id,
                    reason: e.to_string(),
                });
            }
            return Err(e);
        }
        Ok(id)
    }

    pub fn accept_file(&mut self, transfer_id: &str) -> Result<()> {
        let (peer_id, frame) = self.transfers.accept(transfer_id, Instant::now())?;
        MessageProtocol::send(&mut self.peers, &peer_id, &frame)
    }

    pub fn reject_file(&mut self, transfer_id: &str) -> Result<()> {
        let (peer_id, frame) = self.transfers.reject(transfer_id)?;
        MessageProtocol::send(&mut self.peers, &peer_id, &frame)
    }

    pub fn cancel_file(&mut self, transfer_id: &str) -> Result<()> {
        let (peer_id, frame) = self.transfers.cancel(transfer_id)?;
        self.emit(Event::TransferCancelled(transfer_id.to_string()));
        MessageProtocol::send(&mut self.peers, &peer_id, &frame)
    }

    /// Emit the next batch of file chunks. Returns how many went out. Call repeatedly
    /// while transfers are in progress.
    pub fn pump(&mut self) -> usize {
        let mut sent = 0;
        for (peer_id, frame) in self.transfers.pump() {
            match MessageProtocol::send(&mut self.peers, &peer_id, &frame) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("chunk to {} not sent: {}", peer_id, e);
                    for transfer_id in self.transfers.fail_peer(&peer_id) {
                        self.emit(Event::TransferFailed {
                            transfer_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        sent
    }

    pub fn start_call(&mut self, peer_id: &PeerId, kind: MediaKind) -> Result<()> {
        self.calls
            .start_call(peer_id, kind, Instant::now(), &mut self.signaling)?;
        Ok(())
    }

    /// Answer the ringing call. Media acquisition failures reject the call and are
    /// surfaced with the specific cause.
    pub fn accept_call(&mut self) -> Result<()> {
        let peer_id = self.calls.current().map(|c| c.peer_id.clone());
        match self.calls.accept_call(&mut self.signaling) {
            Ok(events) => {
                self.emit_calls(events);
                Ok(())
            }
            Err(e) => {
                let err = Error::from(e);
                if let (Error::MediaAcquisition(cause), Some(peer_id)) = (&err, peer_id) {
                    self.emit(Event::MediaAcquisitionFailed {
                        peer_id,
                        error: cause.clone(),
                    });
                }
                Err(err)
            }
        }
    }

    pub fn reject_call(&mut self) -> Result<()> {
        let events = self.calls.reject_call(&mut self.signaling)?;
        self.emit_calls(events);
        Ok(())
    }

    pub fn hangup(&mut self) -> Result<()> {
        let events = self.calls.hangup(&mut self.signaling)?;
        self.emit_calls(events);
        Ok(())
    }

    pub fn replace_track(&mut self, source: &TrackSource) -> Result<()> {
        self.calls.replace_track(source)?;
        Ok(())
    }

    /// Periodic tick: reconnect attempts, call ring timeout, call re-offers.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        let events = self.peers.tick_at(now, &mut self.signaling);
        self.handle_peer_events(events, now);
        let events = self.calls.tick_at(now, &mut self.signaling);
        self.emit_calls(events);
    }

    /// Close everything with `peer_id`: transport, keys, unfinished transfers and any call.
    pub fn teardown(&mut self, peer_id: &PeerId) {
        self.peers.teardown(peer_id);
        self.keys.remove(peer_id);
        for transfer_id in self.transfers.fail_peer(peer_id) {
            self.emit(Event::TransferFailed {
                transfer_id,
                reason: "peer closed".to_string(),
            });
        }
        let events = self.calls.drop_peer(peer_id);
        self.emit_calls(events);
        info!("tore down {}", peer_id);
    }
}

#[derive(Debug, Clone, Copy)]
enum SummaryUpdate {
    Unread,
    Outgoing,
    Read,
}
