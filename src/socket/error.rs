use cwcore::codec::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket is closed")]
    SocketClosed,
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SocketError {
    /// Failures that say nothing about the channel itself; the message is
    /// dropped and the channel stays up.
    pub fn is_discardable(&self) -> bool {
        matches!(self, Self::Codec(_) | Self::Payload(_))
    }
}

pub type Result<T> = std::result::Result<T, SocketError>;
