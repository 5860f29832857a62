use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalStoreError {
    #[error("signal store unavailable: {0}")]
    Unavailable(String),

    #[error("signal store rejected the request: {0}")]
    Rejected(String),

    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),
}

impl SignalStoreError {
    /// Transient failures are retried on the next poll or send cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, SignalStoreError>;
