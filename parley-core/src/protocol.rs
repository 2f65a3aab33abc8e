//! Sub-channel wire protocol: every frame is a JSON object tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version, advertised in the link handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All frame types carried on a peer's sub-channel.
///
/// Unknown `type` values decode to [`Frame::Unknown`] so newer peers can add frames
/// without breaking older ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Plaintext message (explicit unencrypted path).
    Text {
        message_id: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    TypingStart,
    TypingStop,
    AuthAccepted,
    AuthRefused,
    MessageReceived {
        message_id: String,
    },
    /// Without `messageId`, marks every message sent to the reader as read.
    MessageRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    /// Base64 ciphertext and nonce (`iv`) of a message body.
    EncryptedMessage {
        message_id: String,
        encrypted: String,
        iv: String,
        timestamp: DateTime<Utc>,
    },
    /// Local X25519 public key, base64.
    KeyExchange {
        public_key: String,
    },
    FileOffer {
        transfer_id: String,
        name: String,
        size: u64,
        file_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail: Option<String>,
    },
    FileAccept {
        transfer_id: String,
    },
    FileReject {
        transfer_id: String,
    },
    FileCancel {
        transfer_id: String,
    },
    FileMetadata {
        transfer_id: String,
        total_chunks: u32,
        chunk_size: u32,
        sha256: String,
    },
    FileChunk {
        transfer_id: String,
        chunk_index: u32,
        total_chunks: u32,
        data: String,
        is_final: bool,
    },
    FileTransferAck {
        transfer_id: String,
    },
    ChunkAck {
        transfer_id: String,
        chunk_index: u32,
    },
    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        serde_json::from_str(text).map_err(FrameError::Decode)
    }

    /// Short tag name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text { .. } => "text",
            Frame::TypingStart => "typing_start",
            Frame::TypingStop => "typing_stop",
            Frame::AuthAccepted => "auth_accepted",
            Frame::AuthRefused => "auth_refused",
            Frame::MessageReceived { .. } => "message_received",
            Frame::MessageRead { .. } => "message_read",
            Frame::EncryptedMessage { .. } => "encrypted_message",
            Frame::KeyExchange { .. } => "key_exchange",
            Frame::FileOffer { .. } => "file_offer",
            Frame::FileAccept { .. } => "file_accept",
            Frame::FileReject { .. } => "file_reject",
            Frame::FileCancel { .. } => "file_cancel",
            Frame::FileMetadata { .. } => "file_metadata",
            Frame::FileChunk { .. } => "file_chunk",
            Frame::FileTransferAck { .. } => "file_transfer_ack",
            Frame::ChunkAck { .. } => "chunk_ack",
            Frame::Unknown => "unknown",
        }
    }
}

/// Inner JSON body of an `encrypted_message`, sealed under the session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBody {
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("encode error: {0}")]
    Encode(serde_json::Error),
    #[error("decode error: {0}")]
    Decode(serde_json::Error),
}
