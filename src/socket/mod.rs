pub mod error;
pub mod secure_socket;

pub use error::{Result, SocketError};
pub use secure_socket::SecureSocket;
