//! Key exchange engine: per-peer X25519 agreement over the sub-channel, then
//! ChaCha20-Poly1305 for message bodies.
//!
//! Either side may initiate. Each side sends its public key at most once per
//! encryption session; on receiving the other key it derives the session key and, if it
//! has not sent its own key yet, replies with it. Both ends therefore converge on the same
//! key whether one or both initiated. The key only counts as sent once the caller reports
//! it with [`KeyExchangeEngine::key_sent`]; a reply that could not go out is offered again
//! by the next `initiate`.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::identity::{self, Keypair, PeerId, PublicKey, NONCE_LEN};
use crate::protocol::{Frame, SealedBody};

/// Encryption status of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    None,
    /// Local key sent, waiting for the peer's key.
    Pending,
    Established,
    Failed,
}

impl EncryptionState {
    /// Whether the sub-channel may be used for application frames.
    pub fn allows_channel(self) -> bool {
        matches!(self, EncryptionState::Pending | EncryptionState::Established)
    }
}

struct EncryptionSession {
    keypair: Keypair,
    remote: Option<PublicKey>,
    key: Option<[u8; 32]>,
    state: EncryptionState,
    local_sent: bool,
    /// 0 or 1, from ordering the two public keys; first byte of every nonce we produce.
    direction: u8,
    send_counter: u64,
}

impl EncryptionSession {
    fn new() -> Self {
        Self {
            keypair: Keypair::generate(),
            remote: None,
            key: None,
            state: EncryptionState::None,
            local_sent: false,
            direction: 0,
            send_counter: 0,
        }
    }

    fn key_frame(&self) -> Frame {
        Frame::KeyExchange {
            public_key: self.keypair.public_key().to_base64(),
        }
    }
}

#[derive(Default)]
pub struct KeyExchangeEngine {
    sessions: HashMap<PeerId, EncryptionSession>,
}

impl KeyExchangeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start agreement with `peer_id`. Returns the `key_exchange` frame to send, or `None`
    /// if the local key was already sent.
    pub fn initiate(&mut self, peer_id: &PeerId) -> Option<Frame> {
        let session = self
            .sessions
            .entry(peer_id.clone())
            .or_insert_with(EncryptionSession::new);
        if session.local_sent {
            return None;
        }
        if session.state == EncryptionState::None {
            session.state = EncryptionState::Pending;
        }
        Some(session.key_frame())
    }

    /// Handle the peer's `key_exchange`. Returns a reply frame when our own key has not
    /// been sent yet.
    pub fn on_remote_key(
        &mut self,
        peer_id: &PeerId,
        public_key: &str,
    ) -> Result<Option<Frame>, KeyExchangeError> {
        let session = self
            .sessions
            .entry(peer_id.clone())
            .or_insert_with(EncryptionSession::new);
        let remote = match PublicKey::from_base64(public_key) {
            Some(k) => k,
            None => {
                if session.state != EncryptionState::Established {
                    session.state = EncryptionState::Failed;
                }
                return Err(KeyExchangeError::InvalidPublicKey);
            }
        };
        if session.state == EncryptionState::Established {
            if session.remote.as_ref() != Some(&remote) {
                warn!(
                    "ignoring new public key from {} on an established session",
                    peer_id
                );
            }
            return Ok(None);
        }
        let shared = session.keypair.shared_secret(&remote);
        session.key = Some(identity::derive_session_key(&shared));
        session.direction = if session.keypair.public_key().as_bytes() < remote.as_bytes() {
            0
        } else {
            1
        };
        session.remote = Some(remote);
        session.state = EncryptionState::Established;
        info!("encryption established with {}", peer_id);
        if session.local_sent {
            Ok(None)
        } else {
            Ok(Some(session.key_frame()))
        }
    }

    /// Record that our `key_exchange` frame reached the sub-channel.
    pub fn key_sent(&mut self, peer_id: &PeerId) {
        if let Some(session) = self.sessions.get_mut(peer_id) {
            session.local_sent = true;
        }
    }

    pub fn state(&self, peer_id: &PeerId) -> EncryptionState {
        self.sessions
            .get(peer_id)
            .map(|s| s.state)
            .unwrap_or(EncryptionState::None)
    }

    pub fn is_established(&self, peer_id: &PeerId) -> bool {
        self.state(peer_id) == EncryptionState::Established
    }

    /// Drop the peer's encryption session. The next session starts from scratch.
    pub fn remove(&mut self, peer_id: &PeerId) {
        self.sessions.remove(peer_id);
    }

    /// Encrypt under the established key with a fresh nonce.
    pub fn encrypt(
        &mut self,
        peer_id: &PeerId,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; NONCE_LEN]), EncryptError> {
        let session = self
            .sessions
            .get_mut(peer_id)
            .ok_or(EncryptError::NotEstablished)?;
        let key = match (session.state, session.key) {
            (EncryptionState::Established, Some(k)) => k,
            _ => return Err(EncryptError::NotEstablished),
        };
        let counter = session.send_counter;
        session.send_counter = counter.checked_add(1).ok_or(EncryptError::NonceExhausted)?;
        let nonce = identity::make_nonce(session.direction, counter);
        let ciphertext = identity::encrypt_payload(&key, &nonce, plaintext)
            .map_err(|_| EncryptError::Cipher)?;
        Ok((ciphertext, nonce))
    }

    pub fn decrypt(
        &self,
        peer_id: &PeerId,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
    ) -> Result<Vec<u8>, DecryptionError> {
        let key = self
            .sessions
            .get(peer_id)
            .filter(|s| s.state == EncryptionState::Established)
            .and_then(|s| s.key)
            .ok_or(DecryptionError::NoSharedSecret)?;
        identity::decrypt_payload(&key, nonce, ciphertext)
            .map_err(|_| DecryptionError::Authentication)
    }

    /// Seal a message body into an `encrypted_message` frame.
    pub fn seal_message(
        &mut self,
        peer_id: &PeerId,
        message_id: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Frame, EncryptError> {
        let body = serde_json::to_vec(&SealedBody {
            content: content.to_string(),
        })
        .map_err(|_| EncryptError::Cipher)?;
        let (ciphertext, nonce) = self.encrypt(peer_id, &body)?;
        Ok(Frame::EncryptedMessage {
            message_id: message_id.to_string(),
            encrypted: BASE64.encode(ciphertext),
            iv: BASE64.encode(nonce),
            timestamp,
        })
    }

    /// Open the base64 `encrypted`/`iv` pair of an `encrypted_message` frame.
    pub fn open_message(
        &self,
        peer_id: &PeerId,
        encrypted: &str,
        iv: &str,
    ) -> Result<String, DecryptionError> {
        let ciphertext = BASE64
            .decode(encrypted)
            .map_err(|_| DecryptionError::Malformed)?;
        let nonce: [u8; NONCE_LEN] = BASE64
            .decode(iv)
            .map_err(|_| DecryptionError::Malformed)?
            .try_into()
            .map_err(|_| DecryptionError::Malformed)?;
        let plain = self.decrypt(peer_id, &ciphertext, &nonce)?;
        let body: SealedBody =
            serde_json::from_slice(&plain).map_err(|_| DecryptionError::Malformed)?;
        Ok(body.content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyExchangeError {
    #[error("invalid public key")]
    InvalidPublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptError {
    #[error("no established session key")]
    NotEstablished,
    #[error("nonce space exhausted")]
    NonceExhausted,
    #[error("encryption failed")]
    Cipher,
}

/// A message body could not be decrypted. Terminal for the message, not for the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptionError {
    #[error("no shared secret with peer")]
    NoSharedSecret,
    #[error("authentication failed")]
    Authentication,
    #[error("malformed ciphertext or nonce")]
    Malformed,
}
