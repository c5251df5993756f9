//! Content hash functions used by signatures.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Widest digest we ever store (SHA-256).
pub const MAX_DIGEST_LEN: usize = 32;

/// A digest value, zero-padded past the algorithm's length so that digests
/// of the same kind compare equal as whole arrays.
pub type DigestBytes = [u8; MAX_DIGEST_LEN];

/// Hash algorithm of a signature.
///
/// Wire values: 1 = MD5, 2 = SHA1, 3 = SHA256. MD5 only appears in legacy
/// 32-bit signature files; SHA256 requires the 64-bit format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
}

impl HashKind {
    /// Length in bytes of this algorithm's digest.
    pub const fn digest_len(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(HashKind::Md5),
            2 => Some(HashKind::Sha1),
            3 => Some(HashKind::Sha256),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u32 {
        match self {
            HashKind::Md5 => 1,
            HashKind::Sha1 => 2,
            HashKind::Sha256 => 3,
        }
    }

    /// Digest `buf`, returning the zero-padded digest bytes.
    pub fn compute(self, buf: &[u8]) -> DigestBytes {
        let mut out = [0u8; MAX_DIGEST_LEN];
        match self {
            HashKind::Md5 => out[..16].copy_from_slice(&Md5::digest(buf)),
            HashKind::Sha1 => out[..20].copy_from_slice(&Sha1::digest(buf)),
            HashKind::Sha256 => out[..32].copy_from_slice(&Sha256::digest(buf)),
        }
        out
    }
}

/// Hex-encode the first `len` bytes of a digest for diagnostics.
pub fn hex_digest(digest: &[u8], len: usize) -> String {
    digest[..len.min(digest.len())]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
