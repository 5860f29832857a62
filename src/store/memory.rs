use crate::clock;
use async_trait::async_trait;
use cwcore::store::{
    DeliveredSignal, Result, RetentionPolicy, SignalRecord, SignalStore, SignalStoreError,
};
use cwcore::types::{PeerId, SessionId, SignalId};
use dashmap::DashMap;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// In-process [`SignalStore`].
///
/// Records live in one vector per session. `poll` holds that session's
/// entry for the whole read-and-mark pass, so concurrent pollers never see
/// the same record twice.
pub struct MemorySignalStore {
    sessions: DashMap<SessionId, Vec<SignalRecord>>,
    next_id: AtomicU64,
    policy: RetentionPolicy,
    available: AtomicBool,
}

impl Default for MemorySignalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::with_policy(RetentionPolicy::default())
    }

    pub fn with_policy(policy: RetentionPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            policy,
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable every call fails with
    /// [`SignalStoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn record_count(&self) -> usize {
        self.sessions.iter().map(|entry| entry.len()).sum()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SignalStoreError::Unavailable("store offline".into()))
        }
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut purged = 0;
        for mut entry in self.sessions.iter_mut() {
            let before = entry.len();
            entry.retain(|record| !self.policy.is_expired(record, now));
            purged += before - entry.len();
        }
        self.sessions.retain(|_, records| !records.is_empty());
        if purged > 0 {
            trace!(target: "Call/Store", "Purged {purged} expired records");
        }
        purged
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn put(
        &self,
        session_id: &SessionId,
        sender_id: &PeerId,
        target_id: Option<&PeerId>,
        payload: Vec<u8>,
    ) -> Result<SignalId> {
        self.check_available()?;
        let now = clock::now();
        self.purge_expired(now);

        let id = SignalId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = SignalRecord::new(
            id,
            session_id.clone(),
            sender_id.clone(),
            target_id.cloned(),
            payload,
            now,
        );
        self.sessions
            .entry(session_id.clone())
            .or_default()
            .push(record);
        debug!(
            target: "Call/Store",
            "Stored signal {id} in {session_id} from {sender_id} to {}",
            target_id.map_or("*", PeerId::as_str)
        );
        Ok(id)
    }

    async fn poll(
        &self,
        session_id: &SessionId,
        receiver_id: &PeerId,
    ) -> Result<Vec<DeliveredSignal>> {
        self.check_available()?;
        let now = clock::now();
        let Some(mut records) = self.sessions.get_mut(session_id) else {
            return Ok(Vec::new());
        };

        let mut delivered = Vec::new();
        for record in records.iter_mut() {
            if !record.is_addressed_to(receiver_id) || record.is_consumed_by(receiver_id) {
                continue;
            }
            if !self.policy.is_deliverable(record, now) {
                continue;
            }
            if record.mark_consumed(receiver_id, now) {
                delivered.push(record.to_delivered());
            }
        }
        if !delivered.is_empty() {
            debug!(
                target: "Call/Store",
                "Delivered {} signals in {session_id} to {receiver_id}",
                delivered.len()
            );
        }
        Ok(delivered)
    }
}
