//! Signaling: typed messages exchanged with the rendezvous server, an outbox the host
//! drains onto the wire, and a presence table fed by presence events.

use std::collections::{HashMap, VecDeque};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Offer or answer blob produced by a transport or media stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Messages the client sends to the rendezvous server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientSignal {
    Offer { to: PeerId, sdp: SessionDescription },
    Answer { to: PeerId, sdp: SessionDescription },
    IceCandidate { to: PeerId, candidate: IceCandidate },
    CallOffer {
        to: PeerId,
        sdp: SessionDescription,
        media_kind: MediaKind,
    },
    CallAnswer { to: PeerId, sdp: SessionDescription },
    CallEnd { to: PeerId },
    CallReject { to: PeerId, reason: String },
    CallIceCandidate { to: PeerId, candidate: IceCandidate },
    SetStatus { status: String },
}

impl ClientSignal {
    /// Addressee, if the message is routed to a peer.
    pub fn to(&self) -> Option<&PeerId> {
        match self {
            ClientSignal::Offer { to, .. }
            | ClientSignal::Answer { to, .. }
            | ClientSignal::IceCandidate { to, .. }
            | ClientSignal::CallOffer { to, .. }
            | ClientSignal::CallAnswer { to, .. }
            | ClientSignal::CallEnd { to }
            | ClientSignal::CallReject { to, .. }
            | ClientSignal::CallIceCandidate { to, .. } => Some(to),
            ClientSignal::SetStatus { .. } => None,
        }
    }
}

/// Messages the rendezvous server delivers to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerSignal {
    Offer { from: PeerId, sdp: SessionDescription },
    Answer { from: PeerId, sdp: SessionDescription },
    IceCandidate { from: PeerId, candidate: IceCandidate },
    CallOffer {
        from: PeerId,
        sdp: SessionDescription,
        media_kind: MediaKind,
    },
    CallAnswer { from: PeerId, sdp: SessionDescription },
    CallEnd { from: PeerId },
    CallReject { from: PeerId, reason: String },
    CallIceCandidate { from: PeerId, candidate: IceCandidate },
    UserOnline { user_id: PeerId },
    UserOffline { user_id: PeerId },
    OnlineUsers { users: Vec<PeerId> },
    StatusUpdated { user_id: PeerId, status: String },
    #[serde(other)]
    Unknown,
}

impl ClientSignal {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerSignal {
    pub fn decode(text: &str) -> Result<ServerSignal, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// What a remote user looks like from the presence feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
    pub status: Option<String>,
}

/// Presence change worth surfacing to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Online(PeerId),
    Offline(PeerId),
    Status(PeerId, String),
    Snapshot(Vec<PeerId>),
}

/// Host-driven signaling endpoint. Components enqueue outbound signals; the host drains
/// them onto its connection and feeds inbound presence events back in.
#[derive(Default)]
pub struct SignalingClient {
    outbox: VecDeque<ClientSignal>,
    presence: HashMap<PeerId, Presence>,
}

impl SignalingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, signal: ClientSignal) {
        debug!("signal out: {:?}", signal);
        self.outbox.push_back(signal);
    }

    /// Take everything queued so far, in send order.
    pub fn drain(&mut self) -> Vec<ClientSignal> {
        self.outbox.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Apply a presence event. Returns `None` for non-presence signals.
    pub fn apply_presence(&mut self, signal: &ServerSignal) -> Option<PresenceChange> {
        match signal {
            ServerSignal::UserOnline { user_id } => {
                self.presence_mut(user_id).online = true;
                Some(PresenceChange::Online(user_id.clone()))
            }
            ServerSignal::UserOffline { user_id } => {
                self.presence_mut(user_id).online = false;
                Some(PresenceChange::Offline(user_id.clone()))
            }
            ServerSignal::OnlineUsers { users } => {
                for p in self.presence.values_mut() {
                    p.online = false;
                }
                for u in users {
                    self.presence_mut(u).online = true;
                }
                Some(PresenceChange::Snapshot(users.clone()))
            }
            ServerSignal::StatusUpdated { user_id, status } => {
                self.presence_mut(user_id).status = Some(status.clone());
                Some(PresenceChange::Status(user_id.clone(), status.clone()))
            }
            _ => None,
        }
    }

    pub fn is_online(&self, peer_id: &PeerId) -> bool {
        self.presence.get(peer_id).map(|p| p.online).unwrap_or(false)
    }

    pub fn presence(&self, peer_id: &PeerId) -> Option<&Presence> {
        self.presence.get(peer_id)
    }

    /// Users currently online, sorted.
    pub fn online(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .presence
            .iter()
            .filter(|(_, p)| p.online)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    fn presence_mut(&mut self, peer_id: &PeerId) -> &mut Presence {
        self.presence.entry(peer_id.clone()).or_insert(Presence {
            online: false,
            status: None,
        })
    }
}
