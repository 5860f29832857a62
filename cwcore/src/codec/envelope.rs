use super::error::{CodecError, Result};
use crate::crypto::ige::BLOCK_SIZE;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub const AUTH_KEY_ID_LEN: usize = 8;
pub const MESSAGE_KEY_LEN: usize = 16;
pub const ENVELOPE_HEADER_LEN: usize = AUTH_KEY_ID_LEN + MESSAGE_KEY_LEN;

/// `auth_key_id(8) || message_key(16) || ciphertext(n * 16)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEnvelope {
    pub auth_key_id: [u8; AUTH_KEY_ID_LEN],
    pub message_key: [u8; MESSAGE_KEY_LEN],
    pub ciphertext: Vec<u8>,
}

impl WireEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.auth_key_id);
        out.extend_from_slice(&self.message_key);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ENVELOPE_HEADER_LEN {
            return Err(CodecError::Truncated(data.len()));
        }
        let ciphertext = &data[ENVELOPE_HEADER_LEN..];
        check_block_aligned(ciphertext)?;

        let mut auth_key_id = [0u8; AUTH_KEY_ID_LEN];
        auth_key_id.copy_from_slice(&data[..AUTH_KEY_ID_LEN]);
        let mut message_key = [0u8; MESSAGE_KEY_LEN];
        message_key.copy_from_slice(&data[AUTH_KEY_ID_LEN..ENVELOPE_HEADER_LEN]);
        Ok(Self {
            auth_key_id,
            message_key,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Base64 text form used on text-oriented channels.
    pub fn to_text(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_text(text: &[u8]) -> Result<Self> {
        let raw = STANDARD
            .decode(text)
            .map_err(|e| CodecError::Encoding(e.to_string()))?;
        Self::from_bytes(&raw)
    }
}

pub(crate) fn check_block_aligned(ciphertext: &[u8]) -> Result<()> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CodecError::Truncated(ciphertext.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_splits_fields() {
        let mut raw = vec![1u8; 8];
        raw.extend_from_slice(&[2u8; 16]);
        raw.extend_from_slice(&[3u8; 32]);
        let env = WireEnvelope::from_bytes(&raw).unwrap();
        assert_eq!(env.auth_key_id, [1; 8]);
        assert_eq!(env.message_key, [2; 16]);
        assert_eq!(env.ciphertext, vec![3; 32]);
        assert_eq!(env.to_bytes(), raw);
    }

    #[test]
    fn test_rejects_partial_block() {
        let raw = vec![0u8; ENVELOPE_HEADER_LEN + 17];
        assert_eq!(WireEnvelope::from_bytes(&raw), Err(CodecError::Truncated(17)));
    }

    #[test]
    fn test_rejects_missing_header() {
        assert_eq!(
            WireEnvelope::from_bytes(&[0u8; 10]),
            Err(CodecError::Truncated(10))
        );
    }

    #[test]
    fn test_text_form_rejects_garbage() {
        assert!(matches!(
            WireEnvelope::from_text(b"***not base64***"),
            Err(CodecError::Encoding(_))
        ));
    }
}
