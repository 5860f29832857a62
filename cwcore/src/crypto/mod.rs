//! # Cryptography Utilities
//!
//! Hash helpers used by key derivation and the AES-256-IGE chaining mode used
//! to seal secure frames.

pub mod ige;

use sha1::Sha1;
use sha2::{Digest, Sha256};

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-1 digest. Only used for the auth key fingerprint, never for integrity.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
