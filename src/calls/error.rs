//! Call-related error types.

use crate::config::ConfigError;
use cwcore::call::InvalidTransition;
use cwcore::types::{PeerId, SessionId};
use thiserror::Error;

/// Local media or SDP problems. These fail the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("local media denied: {0}")]
    MediaDenied(String),
    #[error("malformed session description: {0}")]
    MalformedSdp(String),
    #[error("media engine error: {0}")]
    Engine(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("connectivity lost after {attempts} renegotiation attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no session for peer {0}")]
    NotFound(PeerId),

    #[error("session {0} already has a call peer")]
    SessionTaken(SessionId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("too many undecryptable frames ({0}) on the primary channel")]
    Codec(u32),

    #[error("no active call")]
    NoActiveCall,

    #[error("session is shutting down")]
    SessionClosed,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
