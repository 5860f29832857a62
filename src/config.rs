use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        reason: String,
    },
}

/// Timing and retry knobs for call sessions.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Bound on the whole key exchange; expiry latches the session to polling.
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
    pub offer_resend_interval: Duration,
    pub offer_resend_max: u32,
    pub decline_cooldown: Duration,
    pub teardown_cooldown: Duration,
    pub max_reconnect_attempts: u32,
    /// A renegotiation that neither connects nor fails within this counts as failed.
    pub reconnect_timeout: Duration,
    /// How long a `Disconnected` media state may last before it counts as failed.
    pub disconnected_grace: Duration,
    /// Consecutive undecryptable frames tolerated on one channel.
    pub codec_failure_tolerance: u32,
    /// Unanswered `Offering` or `Ringing` ends the call after this.
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(8),
            poll_interval: Duration::from_millis(1500),
            offer_resend_interval: Duration::from_secs(3),
            offer_resend_max: 5,
            decline_cooldown: Duration::from_secs(20),
            teardown_cooldown: Duration::from_secs(3),
            max_reconnect_attempts: 3,
            reconnect_timeout: Duration::from_secs(10),
            disconnected_grace: Duration::from_secs(5),
            codec_failure_tolerance: 3,
            ring_timeout: Duration::from_secs(45),
        }
    }
}

impl CallConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("handshake_timeout", self.handshake_timeout),
            ("poll_interval", self.poll_interval),
            ("offer_resend_interval", self.offer_resend_interval),
            ("reconnect_timeout", self.reconnect_timeout),
            ("disconnected_grace", self.disconnected_grace),
            ("ring_timeout", self.ring_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.codec_failure_tolerance == 0 {
            return Err(ConfigError::Zero {
                field: "codec_failure_tolerance",
            });
        }
        if self.handshake_timeout > Duration::from_secs(60) {
            return Err(ConfigError::OutOfRange {
                field: "handshake_timeout",
                reason: format!("{:?} exceeds 60s", self.handshake_timeout),
            });
        }
        Ok(())
    }
}
