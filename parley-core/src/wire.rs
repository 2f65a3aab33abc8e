//! Link framing for stream transports: length prefix (4 bytes LE) + bincode `LinkFrame`.
//!
//! Datagram-style transports carry frames natively; stream transports (TCP) wrap each
//! sub-channel message in a `LinkFrame::Data`.

use serde::{Deserialize, Serialize};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Envelope on a stream link. `Hello` is always the first frame from the dialing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkFrame {
    Hello { protocol_version: u8, peer_id: String },
    Data(String),
}

/// Encode a link frame. The payload is serialized in place behind a reserved length slot.
pub fn encode_frame(frame: &LinkFrame) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = vec![0u8; LEN_SIZE];
    bincode::serialize_into(&mut out, frame)?;
    let len = u32::try_from(out.len() - LEN_SIZE).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    out[..LEN_SIZE].copy_from_slice(&len.to_le_bytes());
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("link frame serialization failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("link frame exceeds 16 MiB")]
    TooLarge,
}

/// Split one frame off the front of `bytes`, returning it with the count of bytes used.
/// `NeedMore` means the buffer holds only part of a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(LinkFrame, usize), FrameDecodeError> {
    let body = frame_len(bytes)?;
    let end = LEN_SIZE + body;
    let Some(payload) = bytes.get(LEN_SIZE..end) else {
        return Err(FrameDecodeError::NeedMore);
    };
    Ok((bincode::deserialize(payload)?, end))
}

/// Length announced by the prefix, rejected when above the link limit.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let prefix: [u8; LEN_SIZE] = bytes
        .get(..LEN_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or(FrameDecodeError::NeedMore)?;
    match u32::from_le_bytes(prefix) {
        len if len > MAX_FRAME_LEN => Err(FrameDecodeError::TooLarge),
        len => Ok(len as usize),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete link frame")]
    NeedMore,
    #[error("link frame exceeds 16 MiB")]
    TooLarge,
    #[error("link frame deserialization failed: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;

    fn hello() -> LinkFrame {
        LinkFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
            peer_id: "alice".into(),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&hello()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let fa = encode_frame(&hello()).unwrap();
        let fb = encode_frame(&LinkFrame::Data(r#"{"type":"typing_start"}"#.into())).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        assert_eq!(m1, hello());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m2, LinkFrame::Data(s) if s.contains("typing_start")));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let bytes = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(&bytes), Err(FrameDecodeError::TooLarge)));
    }
}
