pub mod dh;
pub mod messages;
pub mod responder;
pub mod state;
pub mod utils;

pub use dh::DhParams;
pub use messages::{HandshakeMessage, Nonce};
pub use responder::{ResponderState, ResponderStep};
pub use state::{HandshakeState, HandshakeStep};
pub use utils::{AuthKey, HandshakeError, Result};
