//! Call lifecycle states and the transition table.
//!
//! Caller path: `Idle -> Notifying -> Offering -> Connected -> Ended`.
//! Callee path: `Idle -> Ringing -> Negotiating -> Connected -> Ended`.
//! Any live state may move to `Failed`, which is terminal like `Ended`.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Which delivery path a session uses. Once `Fallback`, always `Fallback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing: acquiring media and building the offer.
    Notifying,
    /// Outgoing: offer sent, waiting for an answer and connectivity.
    Offering,
    /// Incoming: waiting for a local accept or decline.
    Ringing,
    /// Incoming: answer sent, waiting for connectivity.
    Negotiating,
    Connected,
    Ended,
    Failed,
}

impl CallState {
    /// Any state that holds a call, i.e. not `Idle` and not terminal.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    pub fn is_ringing(self) -> bool {
        matches!(self, Self::Offering | Self::Ringing)
    }

    pub fn can_accept(self) -> bool {
        matches!(self, Self::Ringing)
    }

    pub fn transition(self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        use CallState::*;
        use CallTransition as T;

        let next = match (self, transition) {
            (Idle, T::StartCall) => Notifying,
            (Idle, T::OfferReceived) => Ringing,
            (Notifying, T::OfferSent) => Offering,
            (Ringing, T::Accept) => Negotiating,
            (Ringing, T::Decline) => Idle,
            (Offering | Negotiating | Connected, T::MediaConnected) => Connected,
            (Notifying | Offering | Ringing | Negotiating | Connected, T::End) => Ended,
            (current, T::Fail) if !current.is_terminal() => Failed,
            (current, attempted) => return Err(InvalidTransition { current, attempted }),
        };
        Ok(next)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Notifying => "notifying",
            Self::Offering => "offering",
            Self::Ringing => "ringing",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    StartCall,
    OfferSent,
    OfferReceived,
    Accept,
    Decline,
    MediaConnected,
    End,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {attempted:?} in state {current}")]
pub struct InvalidTransition {
    pub current: CallState,
    pub attempted: CallTransition,
}
