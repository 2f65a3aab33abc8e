//! Integrity: whole-file SHA-256 digest, carried hex-encoded in `file_metadata`.

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Verify `data` against a hex digest (either case). Anything that is not a
/// 32-byte hex digest fails.
pub fn verify(data: &[u8], expected_hex: &str) -> bool {
    match hex::decode(expected_hex.trim()) {
        Ok(expected) => expected.as_slice() == sha256(data).as_slice(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn verify_rejects_tampered() {
        let digest = sha256_hex(b"hello file");
        assert!(verify(b"hello file", &digest));
        assert!(verify(b"hello file", &digest.to_uppercase()));
        assert!(!verify(b"hello filE", &digest));
    }

    #[test]
    fn verify_rejects_non_digests() {
        let digest = sha256_hex(b"hello file");
        assert!(!verify(b"hello file", "not hex at all"));
        assert!(!verify(b"hello file", &digest[..62]));
        assert!(!verify(b"hello file", ""));
    }
}
