use crate::types::{PeerId, SessionId, SignalId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a consumed record stays around before it is purged.
    pub consumed_grace: Duration,
    /// Upper bound for records nobody ever consumed.
    pub unconsumed_ttl: Duration,
    /// Older records are no longer handed out, so a stale offer never rings.
    pub max_delivery_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            consumed_grace: Duration::from_secs(10),
            unconsumed_ttl: Duration::from_secs(5 * 60),
            max_delivery_age: Duration::from_secs(30),
        }
    }
}

impl RetentionPolicy {
    pub fn is_expired(&self, record: &SignalRecord, now: Instant) -> bool {
        match record.consumed_at {
            Some(at) => now.saturating_duration_since(at) >= self.consumed_grace,
            None => now.saturating_duration_since(record.created_at) >= self.unconsumed_ttl,
        }
    }

    pub fn is_deliverable(&self, record: &SignalRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.created_at) < self.max_delivery_age
    }
}

#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub id: SignalId,
    pub session_id: SessionId,
    pub sender_id: PeerId,
    pub target_id: Option<PeerId>,
    pub payload: Vec<u8>,
    pub created_at: Instant,
    pub received_at: DateTime<Utc>,
    consumed_by: HashSet<PeerId>,
    consumed_at: Option<Instant>,
}

impl SignalRecord {
    pub fn new(
        id: SignalId,
        session_id: SessionId,
        sender_id: PeerId,
        target_id: Option<PeerId>,
        payload: Vec<u8>,
        created_at: Instant,
    ) -> Self {
        Self {
            id,
            session_id,
            sender_id,
            target_id,
            payload,
            created_at,
            received_at: Utc::now(),
            consumed_by: HashSet::new(),
            consumed_at: None,
        }
    }

    /// Targeted records go to their target; broadcasts go to everyone but
    /// the sender, each receiver consuming its own copy.
    pub fn is_addressed_to(&self, receiver: &PeerId) -> bool {
        match &self.target_id {
            Some(target) => target == receiver,
            None => &self.sender_id != receiver,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_consumed_by(&self, receiver: &PeerId) -> bool {
        self.consumed_by.contains(receiver)
    }

    /// Returns `false` if this receiver already consumed the record.
    pub fn mark_consumed(&mut self, receiver: &PeerId, now: Instant) -> bool {
        if !self.consumed_by.insert(receiver.clone()) {
            return false;
        }
        self.consumed_at.get_or_insert(now);
        true
    }

    pub fn to_delivered(&self) -> DeliveredSignal {
        DeliveredSignal {
            signal_id: self.id,
            sender_id: self.sender_id.clone(),
            payload: self.payload.clone(),
            received_at: self.received_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredSignal {
    pub signal_id: SignalId,
    pub sender_id: PeerId,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}
