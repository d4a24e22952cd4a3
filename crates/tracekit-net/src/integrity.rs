//! Subresource integrity verification.
//!
//! Versioned asset paths are content-immutable, so a `sha256-<base64>` digest
//! is enough to detect tampering or corruption without re-fetching.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Compute the `sha256-<base64>` digest string for a body.
pub fn digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("sha256-{}", STANDARD.encode(hash))
}

/// Check a body against an expected integrity string.
///
/// Only `sha256-` digests are understood; anything else fails closed.
pub fn verify_integrity(expected: &str, body: &[u8]) -> bool {
    match expected.strip_prefix("sha256-") {
        Some(b64) => {
            let hash = Sha256::digest(body);
            STANDARD.encode(hash) == b64
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_round_trip() {
        let body = b"frontend_bundle";
        assert!(verify_integrity(&digest(body), body));
    }

    #[test]
    fn test_mismatch_rejected() {
        assert!(!verify_integrity(&digest(b"one"), b"two"));
    }

    #[test]
    fn test_unknown_algorithm_fails_closed() {
        assert!(!verify_integrity("md5-xyz", b"body"));
    }
}
