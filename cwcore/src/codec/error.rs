use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("declared payload length {declared} exceeds the {available} bytes available")]
    BadLength { declared: usize, available: usize },
    #[error("message key verification failed")]
    VerifyFailed,
    #[error("ciphertext of {0} bytes is not a whole number of blocks")]
    Truncated(usize),
    #[error("envelope was sealed under a different auth key")]
    KeyIdMismatch,
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),
    #[error("malformed envelope encoding: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
