//! Plaintext layout sealed inside every envelope.
//!
//! `salt(8) || session_id(8) || message_id(8) || sequence(4) || payload_len(4) || payload || padding`
//!
//! Integers are little-endian. Padding is random and brings the frame to a
//! whole number of blocks, never shorter than [`MIN_PADDING`].

use super::error::{CodecError, Result};
use crate::crypto::ige::BLOCK_SIZE;
use rand::RngCore;

pub const FRAME_HEADER_LEN: usize = 32;
pub const MIN_PADDING: usize = 12;
pub const MAX_PAYLOAD_LEN: usize = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub salt: [u8; 8],
    pub session_id: [u8; 8],
    pub message_id: u64,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

pub fn padding_len(unpadded: usize) -> usize {
    let mut pad = BLOCK_SIZE - unpadded % BLOCK_SIZE;
    if pad < MIN_PADDING {
        pad += BLOCK_SIZE;
    }
    pad
}

impl SecureFrame {
    pub fn new(header: FrameHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }
        let unpadded = FRAME_HEADER_LEN + payload_len;
        let pad = padding_len(unpadded);

        let mut buf = Vec::with_capacity(unpadded + pad);
        buf.extend_from_slice(&self.header.salt);
        buf.extend_from_slice(&self.header.session_id);
        buf.extend_from_slice(&self.header.message_id.to_le_bytes());
        buf.extend_from_slice(&self.header.sequence.to_le_bytes());
        buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        let mut padding = vec![0u8; pad];
        rand::rng().fill_bytes(&mut padding);
        buf.extend_from_slice(&padding);
        Ok(buf)
    }

    /// Reads a frame, taking exactly `payload_len` bytes after the header.
    /// Trailing bytes are padding and are never inspected.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(CodecError::BadLength {
                declared: FRAME_HEADER_LEN,
                available: buf.len(),
            });
        }
        let mut salt = [0u8; 8];
        salt.copy_from_slice(&buf[0..8]);
        let mut session_id = [0u8; 8];
        session_id.copy_from_slice(&buf[8..16]);
        let message_id = u64::from_le_bytes(le_array(&buf[16..24]));
        let sequence = u32::from_le_bytes(le_array(&buf[24..28]));
        let declared = u32::from_le_bytes(le_array(&buf[28..32])) as usize;

        let available = buf.len() - FRAME_HEADER_LEN;
        if declared > available {
            return Err(CodecError::BadLength {
                declared,
                available,
            });
        }

        Ok(Self {
            header: FrameHeader {
                salt,
                session_id,
                message_id,
                sequence,
            },
            payload: buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + declared].to_vec(),
        })
    }
}

fn le_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}
