//! Peer identity and crypto primitives: peer IDs, X25519 keypairs, session keys, payload encryption.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of a ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Opaque identifier of a remote (or the local) user, as issued by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// X25519 public key (32 bytes). Travels base64-encoded inside `key_exchange` frames.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse a base64 public key. Returns `None` on bad encoding or wrong length.
    pub fn from_base64(s: &str) -> Option<Self> {
        let buf = BASE64.decode(s).ok()?;
        let bytes: [u8; 32] = buf.try_into().ok()?;
        Some(PublicKey(bytes))
    }
}

/// X25519 keypair. One is generated per encryption session; the secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw Diffie-Hellman output with the other side's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive the 32-byte ChaCha20-Poly1305 key from a DH shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"parley-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Build a nonce from a direction byte and a per-direction counter.
/// Layout: `[direction, 0, 0, 0, counter (8 bytes LE)]`. Both peers share one key, so the
/// direction byte keeps their nonce spaces disjoint.
pub fn make_nonce(direction: u8, counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = direction;
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt with ChaCha20-Poly1305. The caller owns nonce uniqueness.
pub fn encrypt_payload(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, PayloadCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| PayloadCryptoError::Key)?;
    let nonce_arr = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(nonce);
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| PayloadCryptoError::Encrypt)
}

/// Decrypt and authenticate with ChaCha20-Poly1305.
pub fn decrypt_payload(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, PayloadCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| PayloadCryptoError::Key)?;
    let nonce_arr = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(nonce);
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| PayloadCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(
            a.shared_secret(b.public_key()),
            b.shared_secret(a.public_key())
        );
    }

    #[test]
    fn public_key_base64() {
        let kp = Keypair::generate();
        let encoded = kp.public_key().to_base64();
        assert_eq!(PublicKey::from_base64(&encoded).as_ref(), Some(kp.public_key()));
        assert!(PublicKey::from_base64("AAAA").is_none());
        assert!(PublicKey::from_base64("not base64!").is_none());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let nonce = make_nonce(1, 7);
        let cipher = encrypt_payload(&key, &nonce, b"hello parley").unwrap();
        let plain = decrypt_payload(&key, &nonce, &cipher).unwrap();
        assert_eq!(plain.as_slice(), b"hello parley");
    }

    #[test]
    fn wrong_nonce_fails_authentication() {
        let key = [9u8; 32];
        let cipher = encrypt_payload(&key, &make_nonce(0, 1), b"x").unwrap();
        assert!(matches!(
            decrypt_payload(&key, &make_nonce(0, 2), &cipher),
            Err(PayloadCryptoError::Decrypt)
        ));
    }

    #[test]
    fn nonce_layout() {
        let n = make_nonce(1, 0x0102);
        assert_eq!(n[0], 1);
        assert_eq!(&n[1..4], &[0, 0, 0]);
        assert_eq!(n[4], 0x02);
        assert_eq!(n[5], 0x01);
        assert_ne!(make_nonce(0, 5), make_nonce(1, 5));
    }
}
