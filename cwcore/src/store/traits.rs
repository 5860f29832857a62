use super::error::Result;
use super::record::DeliveredSignal;
use crate::types::{PeerId, SessionId, SignalId};
use async_trait::async_trait;

/// Store-and-forward delivery of opaque signal payloads.
///
/// Reads and writes are scoped by session and receiver. `poll` must mark
/// what it returns as consumed atomically with respect to concurrent polls
/// by the same receiver, so a record is never delivered twice.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Durably stores a payload. `target_id = None` addresses every other
    /// participant of the session.
    async fn put(
        &self,
        session_id: &SessionId,
        sender_id: &PeerId,
        target_id: Option<&PeerId>,
        payload: Vec<u8>,
    ) -> Result<SignalId>;

    /// Returns and consumes every outstanding record for `receiver_id`.
    async fn poll(
        &self,
        session_id: &SessionId,
        receiver_id: &PeerId,
    ) -> Result<Vec<DeliveredSignal>>;
}
