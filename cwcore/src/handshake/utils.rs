use crate::crypto::{sha1, sha256};
use num_bigint::BigUint;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const NONCE_LEN: usize = 16;
pub const AUTH_KEY_LEN: usize = 32;
pub const AUTH_KEY_ID_LEN: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("invalid DH parameters: {0}")]
    InvalidParams(String),
    #[error("nonce mismatch in {0}")]
    Mismatch(&'static str),
    #[error("handshake did not complete within the allowed time")]
    Timeout,
    #[error("unexpected handshake message: {0}")]
    UnexpectedMessage(String),
    #[error("peer reported handshake error: {0}")]
    Remote(String),
    #[error("malformed handshake message: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, HandshakeError>;

/// Symmetric key derived from a DH shared secret, plus its fingerprint.
///
/// The fingerprint is computed once when the key is built and is the last
/// eight bytes of `SHA1(key)`; the key itself is `SHA256(shared_secret)`.
/// Both are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey {
    key: [u8; AUTH_KEY_LEN],
    id: [u8; AUTH_KEY_ID_LEN],
}

impl AuthKey {
    pub fn from_shared_secret(secret: &BigUint) -> Self {
        let mut secret_bytes = secret.to_bytes_be();
        let key = sha256(&[secret_bytes.as_slice()]);
        secret_bytes.zeroize();
        Self::from_bytes(key)
    }

    pub fn from_bytes(key: [u8; AUTH_KEY_LEN]) -> Self {
        let digest = sha1(&key);
        let mut id = [0u8; AUTH_KEY_ID_LEN];
        id.copy_from_slice(&digest[digest.len() - AUTH_KEY_ID_LEN..]);
        Self { key, id }
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] {
        &self.key
    }

    pub fn id(&self) -> [u8; AUTH_KEY_ID_LEN] {
        self.id
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}

impl Eq for AuthKey {}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthKey")
            .field("id", &self.id_hex())
            .finish_non_exhaustive()
    }
}

pub(crate) fn nonces_match(a: &[u8; NONCE_LEN], b: &[u8; NONCE_LEN]) -> bool {
    a.ct_eq(b).into()
}

pub(crate) fn encode_biguint(value: &BigUint) -> String {
    value.to_str_radix(16)
}

pub(crate) fn decode_biguint(field: &'static str, value: &str) -> Result<BigUint> {
    let trimmed = value.trim_start_matches("0x");
    BigUint::parse_bytes(trimmed.as_bytes(), 16)
        .ok_or_else(|| HandshakeError::Encoding(format!("{field} is not a hex integer")))
}
