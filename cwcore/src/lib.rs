//! Sans-io core of the callwire signaling stack.
//!
//! Nothing in this crate opens sockets or spawns tasks. Clock readings are
//! passed in by the caller, which keeps every rule here directly testable.

pub mod call;
pub mod codec;
pub mod crypto;
pub mod handshake;
pub mod messages;
pub mod net;
pub mod store;
pub mod types;
