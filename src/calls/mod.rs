//! Call sessions: the per-peer actors, the media capability they drive and
//! the manager that supervises them.
//!
//! # Architecture
//!
//! - [`CallManager`]: registry of watched peers, one supervisor each
//! - [`session::SessionActor`]: runs one call over a transport selector
//! - [`engine::MediaEngine`]: offers, answers, candidates and connectivity
//! - [`monitor::ConnectivityMonitor`]: grace, renegotiation and give-up rules

pub mod engine;
mod error;
mod events;
mod manager;
pub mod monitor;
pub mod session;
pub mod task;

pub use engine::{
    LoopbackMediaEngine, LoopbackMediaFactory, LoopbackOptions, MediaConnectionState,
    MediaEngine, MediaEngineFactory, MediaEvent, SdpKind,
};
pub use error::{CallError, ConnectivityError, NegotiationError};
pub use events::CallEvent;
pub use manager::CallManager;
pub use session::SessionSnapshot;
