//! SHA-256 helpers
//!
//! The shared sequence seed of a connection is derived from the configured
//! token by hashing it and taking the first eight bytes little-endian.

use sha2::{Digest as Sha2Digest, Sha256};

/// Width of a SHA-256 digest
pub const HASH_WIDTH_IN_BYTES: usize = 32;

/// A SHA-256 digest
pub type Digest = [u8; HASH_WIDTH_IN_BYTES];

/// Compute the SHA-256 digest of `data`
///
/// ```
/// use muxtun::protocol::digest;
///
/// let hash = digest(b"my-token");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn digest(data: &[u8]) -> Digest {
    let d = Sha256::new().chain_update(data).finalize();
    let mut result = [0u8; HASH_WIDTH_IN_BYTES];
    result.copy_from_slice(&d);
    result
}

/// Fold a token into a 64-bit seed
pub fn token_seed(token: &str) -> u64 {
    let hash = digest(token.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        // SHA-256("test")
        let hash = digest(b"test");
        let expected: [u8; 32] = [
            0x9f, 0x86, 0xd0, 0x81, 0x88, 0x4c, 0x7d, 0x65, 0x9a, 0x2f, 0xea, 0xa0, 0xc5, 0x5a,
            0xd0, 0x15, 0xa3, 0xbf, 0x4f, 0x1b, 0x2b, 0x0b, 0x82, 0x2c, 0xd1, 0x5d, 0x6c, 0x15,
            0xb0, 0xf0, 0x0a, 0x08,
        ];
        assert_eq!(hash, expected);
    }

    #[test]
    fn test_token_seed_takes_leading_bytes() {
        assert_eq!(token_seed("test"), 0x657d_4c88_81d0_869f);
    }

    #[test]
    fn test_token_seed_differs_per_token() {
        assert_ne!(token_seed("alpha"), token_seed("beta"));
        assert_eq!(token_seed("alpha"), token_seed("alpha"));
    }
}
