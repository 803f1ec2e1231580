//! Content addressing helpers.
//!
//! The chain stores a raw 32-byte SHA-256 digest; the blob gateway speaks
//! Base58 CID strings. The string form is the digest wrapped in a multihash
//! header: `0x12` (sha2-256) `0x20` (32 bytes) followed by the digest, all
//! Base58-encoded.

use sha2::{Digest, Sha256};

use crate::error::{NodeError, Result};

/// Multihash header for a sha2-256 digest of length 32.
const MULTIHASH_PREFIX: [u8; 2] = [0x12, 0x20];

/// Compute SHA-256 and return the raw 32-byte digest.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 and return a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_digest(data))
}

/// Wrap a 32-byte digest into its Base58 CID string form.
pub fn digest_to_cid(digest: &[u8; 32]) -> String {
    let mut bytes = Vec::with_capacity(34);
    bytes.extend_from_slice(&MULTIHASH_PREFIX);
    bytes.extend_from_slice(digest);
    bs58::encode(bytes).into_string()
}

/// Recover the 32-byte digest from a Base58 CID string.
///
/// Rejects strings that do not decode, decode to the wrong length, or do not
/// carry the sha2-256 multihash header.
pub fn cid_to_digest(cid: &str) -> Result<[u8; 32]> {
    let bytes = bs58::decode(cid)
        .into_vec()
        .map_err(|e| NodeError::Decode(format!("cid is not base58: {e}")))?;
    if bytes.len() != 34 {
        return Err(NodeError::Decode(format!(
            "cid decodes to {} bytes, expected 34",
            bytes.len()
        )));
    }
    if bytes[0..2] != MULTIHASH_PREFIX {
        return Err(NodeError::Decode(format!(
            "cid multihash header {:02x}{:02x} is not sha2-256/32",
            bytes[0], bytes[1]
        )));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bytes[2..]);
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let digest = sha256_digest(b"job document bytes");
        let cid = digest_to_cid(&digest);
        let back = cid_to_digest(&cid).expect("roundtrip");
        assert_eq!(back, digest);
    }

    #[test]
    fn cid_roundtrip() {
        // encode(decode(x)) = x for a valid CID
        let cid = digest_to_cid(&[0xAB; 32]);
        let digest = cid_to_digest(&cid).expect("decode");
        assert_eq!(digest_to_cid(&digest), cid);
    }

    #[test]
    fn known_prefix() {
        // A digest of zeroes still carries the multihash header after decode.
        let cid = digest_to_cid(&[0u8; 32]);
        let raw = bs58::decode(&cid).into_vec().expect("base58");
        assert_eq!(raw[0], 0x12);
        assert_eq!(raw[1], 0x20);
        assert_eq!(raw.len(), 34);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(cid_to_digest("not base58 0OIl").is_err());
        // valid base58, wrong length
        let short = bs58::encode([0x12, 0x20, 0xFF]).into_string();
        assert!(cid_to_digest(&short).is_err());
        // right length, wrong header
        let mut bytes = vec![0x55, 0x20];
        bytes.extend_from_slice(&[0u8; 32]);
        let wrong = bs58::encode(bytes).into_string();
        assert!(cid_to_digest(&wrong).is_err());
    }

    #[test]
    fn hash_deterministic() {
        let h1 = sha256_hex(b"payload");
        let h2 = sha256_hex(b"payload");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
