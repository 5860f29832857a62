use cwcore::call::CallState;
use cwcore::types::{MediaMode, PeerId, SessionId};
use serde::Serialize;

/// Notifications published by session actors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    /// An inbound offer is ringing; answer with accept or decline.
    IncomingCall {
        session_id: SessionId,
        peer_id: PeerId,
        media_mode: MediaMode,
    },
    StateChanged {
        session_id: SessionId,
        peer_id: PeerId,
        from: CallState,
        to: CallState,
    },
    /// Start or stop the local ringback indicator.
    Ringback {
        session_id: SessionId,
        peer_id: PeerId,
        active: bool,
    },
    /// The session switched to store-and-forward delivery for good.
    TransportLatched {
        session_id: SessionId,
        peer_id: PeerId,
        reason: String,
    },
    CallFailed {
        session_id: SessionId,
        peer_id: PeerId,
        error: String,
    },
}

impl CallEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::IncomingCall { peer_id, .. }
            | Self::StateChanged { peer_id, .. }
            | Self::Ringback { peer_id, .. }
            | Self::TransportLatched { peer_id, .. }
            | Self::CallFailed { peer_id, .. } => peer_id,
        }
    }
}
