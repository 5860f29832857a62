//! Tracks media connectivity for an established call and decides when to
//! renegotiate or give up.

use super::engine::MediaConnectionState;
use cwcore::call::{CallSession, ReconnectDecision};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityAction {
    /// Media came (back) up. Pending connectivity timers are obsolete.
    Connected,
    /// Start the disconnected grace timer tagged with `generation`.
    StartGrace { generation: u64 },
    /// Renegotiate and arm the reconnect timer tagged with `generation`.
    Renegotiate { attempt: u32, generation: u64 },
    /// The retry budget is spent; the call has to fail.
    Exhausted { attempts: u32 },
}

/// Per-session connectivity bookkeeping.
///
/// Every action that arms a timer carries a generation. A timer whose
/// generation no longer matches was overtaken by a newer state change and
/// is ignored.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    max_attempts: u32,
    reconnecting: bool,
    generation: u64,
}

impl ConnectivityMonitor {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            reconnecting: false,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn observe(
        &mut self,
        state: MediaConnectionState,
        session: &mut CallSession,
    ) -> Option<ConnectivityAction> {
        match state {
            MediaConnectionState::Connected => {
                self.generation += 1;
                if self.reconnecting {
                    info!(target: "Call/Connectivity", "Media for {} recovered", session.peer_id());
                }
                self.reconnecting = false;
                Some(ConnectivityAction::Connected)
            }
            MediaConnectionState::Disconnected => {
                if self.reconnecting {
                    return None;
                }
                self.generation += 1;
                debug!(
                    target: "Call/Connectivity",
                    "Media for {} disconnected, waiting out the grace period",
                    session.peer_id()
                );
                Some(ConnectivityAction::StartGrace {
                    generation: self.generation,
                })
            }
            MediaConnectionState::Failed => Some(self.degrade(session)),
            MediaConnectionState::New
            | MediaConnectionState::Checking
            | MediaConnectionState::Closed => None,
        }
    }

    /// A grace or reconnect timer fired.
    pub fn timer_fired(
        &mut self,
        generation: u64,
        session: &mut CallSession,
    ) -> Option<ConnectivityAction> {
        if generation != self.generation {
            debug!(target: "Call/Connectivity", "Dropping stale timer (gen {generation}, now {})", self.generation);
            return None;
        }
        Some(self.degrade(session))
    }

    fn degrade(&mut self, session: &mut CallSession) -> ConnectivityAction {
        self.generation += 1;
        match session.begin_reconnect(self.max_attempts) {
            ReconnectDecision::Attempt(attempt) => {
                self.reconnecting = true;
                info!(
                    target: "Call/Connectivity",
                    "Renegotiating media with {} (attempt {attempt}/{})",
                    session.peer_id(),
                    self.max_attempts
                );
                ConnectivityAction::Renegotiate {
                    attempt,
                    generation: self.generation,
                }
            }
            ReconnectDecision::Exhausted => {
                warn!(
                    target: "Call/Connectivity",
                    "Giving up on {} after {} attempts",
                    session.peer_id(),
                    self.max_attempts
                );
                ConnectivityAction::Exhausted {
                    attempts: self.max_attempts,
                }
            }
        }
    }
}
