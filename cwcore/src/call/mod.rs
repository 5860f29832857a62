//! Call session data model and the pure negotiation rules.
//!
//! Nothing here performs I/O or keeps timers; the runtime drives a
//! [`CallSession`] with decisions returned from these methods.

pub mod session;
pub mod state;

pub use session::{
    AnswerDecision, CallSession, IceDecision, IgnoreReason, OfferDecision, OfferFingerprint,
    ReconnectDecision,
};
pub use state::{CallRole, CallState, CallTransition, InvalidTransition, TransportMode};
