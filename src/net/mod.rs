//! Networking: socket transport and the WebSocket wire protocol.

pub mod transport;
pub mod websocket;

pub use transport::{Listener, Socket, Transport, TransportError};
