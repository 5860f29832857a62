//! Dual-path call signaling runtime.
//!
//! A [`calls::CallManager`] owns one session actor per remote peer. Each
//! actor negotiates over a [`selector::TransportSelector`] that prefers an
//! encrypted duplex channel to a [`relay::RelayHub`] and latches to polling a
//! [`cwcore::store::SignalStore`] when that channel cannot be used.

pub mod calls;
pub mod clock;
pub mod config;
pub mod handshake;
pub mod relay;
pub mod selector;
pub mod socket;
pub mod store;
pub mod transport;

pub use calls::{CallEvent, CallManager};
pub use config::CallConfig;
pub use cwcore::types::{MediaMode, PeerId, SessionId};
