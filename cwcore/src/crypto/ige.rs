use aes::Aes256;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use thiserror::Error;

type Aes256IgeEnc = ige::Encryptor<Aes256>;
type Aes256IgeDec = ige::Decryptor<Aes256>;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
/// IGE consumes two blocks of IV: the previous ciphertext and previous plaintext seeds.
pub const IV_SIZE: usize = 2 * BLOCK_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IgeError {
    #[error("input length {0} is not a multiple of the {BLOCK_SIZE}-byte block size")]
    NotBlockAligned(usize),
    #[error("invalid key or IV length for IGE mode")]
    InvalidLength,
}

type Result<T> = std::result::Result<T, IgeError>;

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(IgeError::NotBlockAligned(data.len()));
    }
    Ok(())
}

/// Encrypts block-aligned plaintext with AES-256-IGE. No padding is added.
pub fn encrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_aligned(plaintext)?;
    let enc = Aes256IgeEnc::new_from_slices(key, iv).map_err(|_| IgeError::InvalidLength)?;
    Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// Decrypts block-aligned ciphertext with AES-256-IGE. No padding is removed.
pub fn decrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_aligned(ciphertext)?;
    let dec = Aes256IgeDec::new_from_slices(key, iv).map_err(|_| IgeError::InvalidLength)?;
    dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| IgeError::NotBlockAligned(ciphertext.len()))
}
