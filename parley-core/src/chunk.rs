//! Chunking: split a file into fixed-size, index-addressed chunks and reassemble them.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::integrity;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Number of chunks for `len` bytes. Zero-length input has no chunks.
pub fn chunk_count(len: u64, chunk_size: usize) -> u32 {
    let size = effective(chunk_size) as u64;
    len.div_ceil(size) as u32
}

/// Bytes of chunk `index`, or `None` past the end.
pub fn chunk_at(data: &[u8], index: u32, chunk_size: usize) -> Option<&[u8]> {
    let size = effective(chunk_size);
    let start = (index as usize).checked_mul(size)?;
    if start >= data.len() {
        return None;
    }
    let end = (start + size).min(data.len());
    Some(&data[start..end])
}

fn effective(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

pub fn encode_chunk(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Receive side: chunks buffered by index until the final one arrives.
pub struct ChunkAssembler {
    total_chunks: u32,
    expected_size: u64,
    received: BTreeMap<u32, Vec<u8>>,
    bytes: u64,
}

impl ChunkAssembler {
    pub fn new(total_chunks: u32, expected_size: u64) -> Self {
        Self {
            total_chunks,
            expected_size,
            received: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Assembler for a file of `size` bytes cut into `chunk_size` pieces. The sender's
    /// announced chunk count must agree with that.
    pub fn for_file(
        size: u64,
        chunk_size: usize,
        announced: u32,
    ) -> Result<Self, ReconstructionError> {
        let expected = chunk_count(size, chunk_size);
        if announced != expected {
            return Err(ReconstructionError::ChunkCountMismatch {
                announced,
                expected,
            });
        }
        Ok(Self::new(announced, size))
    }

    /// Store one base64 chunk. Returns the decoded length, or 0 for a duplicate index.
    /// A chunk that would take the file past its accepted size is refused.
    pub fn insert(&mut self, index: u32, data: &str) -> Result<usize, ReconstructionError> {
        if index >= self.total_chunks {
            return Err(ReconstructionError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let bytes = BASE64
            .decode(data)
            .map_err(|_| ReconstructionError::MalformedChunk(index))?;
        if self.received.contains_key(&index) {
            return Ok(0);
        }
        let len = bytes.len();
        let after = self.bytes + len as u64;
        if after > self.expected_size {
            return Err(ReconstructionError::SizeMismatch {
                actual: after,
                expected: self.expected_size,
            });
        }
        self.bytes = after;
        self.received.insert(index, bytes);
        Ok(len)
    }

    pub fn received(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Concatenate chunks in index order. Every chunk must be present; size and, when
    /// given, the hex SHA-256 must match.
    pub fn assemble(self, sha256: Option<&str>) -> Result<Vec<u8>, ReconstructionError> {
        if self.received() != self.total_chunks {
            return Err(ReconstructionError::MissingChunks {
                received: self.received(),
                expected: self.total_chunks,
            });
        }
        if self.bytes != self.expected_size {
            return Err(ReconstructionError::SizeMismatch {
                actual: self.bytes,
                expected: self.expected_size,
            });
        }
        let mut out = Vec::with_capacity(self.bytes as usize);
        for chunk in self.received.into_values() {
            out.extend_from_slice(&chunk);
        }
        if let Some(digest) = sha256 {
            if !integrity::verify(&out, digest) {
                return Err(ReconstructionError::DigestMismatch);
            }
        }
        Ok(out)
    }
}

/// A received file could not be rebuilt. Terminal for that transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconstructionError {
    #[error("received {received} of {expected} chunks")]
    MissingChunks { received: u32, expected: u32 },
    #[error("reassembled {actual} bytes, expected {expected}")]
    SizeMismatch { actual: u64, expected: u64 },
    #[error("file digest does not match")]
    DigestMismatch,
    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk {0} is not valid base64")]
    MalformedChunk(u32),
    #[error("sender announced {announced} chunks, file size implies {expected}")]
    ChunkCountMismatch { announced: u32, expected: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn split(data: &[u8], chunk_size: usize) -> Vec<String> {
        (0..chunk_count(data.len() as u64, chunk_size))
            .map(|i| encode_chunk(chunk_at(data, i, chunk_size).unwrap()))
            .collect()
    }

    #[test]
    fn counts() {
        assert_eq!(chunk_count(0, 16), 0);
        assert_eq!(chunk_count(1, 16), 1);
        assert_eq!(chunk_count(16, 16), 1);
        assert_eq!(chunk_count(17, 16), 2);
        assert_eq!(chunk_count(DEFAULT_CHUNK_SIZE as u64 * 2, 0), 2);
        assert!(chunk_at(b"abc", 1, 16).is_none());
    }

    #[test]
    fn reassembles_for_assorted_sizes() {
        let mut rng = rand::thread_rng();
        for size in [1usize, 100, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE + 1, 70_000] {
            let mut data = vec![0u8; size];
            rng.fill_bytes(&mut data);
            let chunks = split(&data, DEFAULT_CHUNK_SIZE);
            let mut asm = ChunkAssembler::new(chunks.len() as u32, size as u64);
            // Deliver in reverse to check ordering by index.
            for (i, c) in chunks.iter().enumerate().rev() {
                asm.insert(i as u32, c).unwrap();
            }
            let digest = integrity::sha256_hex(&data);
            assert_eq!(asm.assemble(Some(&digest)).unwrap(), data);
        }
    }

    #[test]
    fn missing_chunk_is_reconstruction_error() {
        let data = vec![7u8; 40];
        let chunks = split(&data, 16);
        let mut asm = ChunkAssembler::new(3, 40);
        asm.insert(0, &chunks[0]).unwrap();
        asm.insert(2, &chunks[2]).unwrap();
        assert_eq!(
            asm.assemble(None),
            Err(ReconstructionError::MissingChunks {
                received: 2,
                expected: 3
            })
        );
    }

    #[test]
    fn duplicates_do_not_double_count() {
        let mut asm = ChunkAssembler::new(1, 3);
        assert_eq!(asm.insert(0, &encode_chunk(b"abc")).unwrap(), 3);
        assert_eq!(asm.insert(0, &encode_chunk(b"abc")).unwrap(), 0);
        assert_eq!(asm.bytes_received(), 3);
    }

    #[test]
    fn rejects_bad_index_data_and_digest() {
        let mut asm = ChunkAssembler::new(1, 3);
        assert!(matches!(
            asm.insert(1, "YWJj"),
            Err(ReconstructionError::IndexOutOfRange { .. })
        ));
        assert_eq!(
            asm.insert(0, "!!"),
            Err(ReconstructionError::MalformedChunk(0))
        );
        asm.insert(0, &encode_chunk(b"abc")).unwrap();
        assert_eq!(
            asm.assemble(Some(&integrity::sha256_hex(b"abd"))),
            Err(ReconstructionError::DigestMismatch)
        );
    }

    #[test]
    fn size_mismatch() {
        let mut asm = ChunkAssembler::new(1, 10);
        asm.insert(0, &encode_chunk(b"abc")).unwrap();
        assert!(matches!(
            asm.assemble(None),
            Err(ReconstructionError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn overflowing_chunk_is_refused() {
        let mut asm = ChunkAssembler::new(1000, 10);
        assert_eq!(asm.insert(0, &encode_chunk(&[1u8; 8])).unwrap(), 8);
        assert_eq!(
            asm.insert(1, &encode_chunk(&[2u8; 100])),
            Err(ReconstructionError::SizeMismatch {
                actual: 108,
                expected: 10
            })
        );
        assert_eq!(asm.bytes_received(), 8);
        assert_eq!(asm.received(), 1);
    }

    #[test]
    fn announced_count_must_match_size() {
        assert!(ChunkAssembler::for_file(40, 16, 3).is_ok());
        assert!(matches!(
            ChunkAssembler::for_file(10, 16, 1000),
            Err(ReconstructionError::ChunkCountMismatch {
                announced: 1000,
                expected: 1
            })
        ));
    }
}
