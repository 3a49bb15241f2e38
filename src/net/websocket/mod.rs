//! WebSocket protocol implementation (RFC 6455, hybi-10 subset).
//!
//! This module provides frame encoding/decoding, close payloads and the
//! server half of the HTTP upgrade handshake.
//!
//! # Architecture
//!
//! - `frame`: Wire format encoding/decoding (RFC 6455 Section 5)
//! - `handshake`: HTTP upgrade validation and response (RFC 6455 Section 4)
//! - `close`: Close codes and close payloads
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use wschannel::codec::Encoder;
//! use wschannel::net::websocket::{Frame, FrameCodec};
//!
//! let mut codec = FrameCodec::server();
//! let mut buf = BytesMut::new();
//! codec.encode(Frame::text("Hello, WebSocket!"), &mut buf).unwrap();
//! assert_eq!(buf[0], 0x81);
//! ```

mod close;
mod frame;
mod handshake;

pub use close::{CloseCode, CloseReason};
pub use frame::{apply_mask, Frame, FrameCodec, Opcode, Role, WsError};
pub use handshake::{
    compute_accept_key, status_reason, AcceptResponse, HandshakeError, HttpRequest,
    ServerHandshake, MAX_REQUEST_SIZE, MIN_VERSION,
};
