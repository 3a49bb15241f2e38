//! Test utilities.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - [`MemorySocket`], an in-memory [`Transport`], and its client half
//!   [`MemoryPeer`]
//! - [`RecordingOutbox`], an [`Outbox`] that records instead of delivering
//! - Client-side helpers: upgrade requests and masked frames
//!
//! # Example
//! ```
//! use wschannel::net::Transport;
//! use wschannel::test_utils::{init_test_logging, MemorySocket};
//!
//! init_test_logging();
//! let (mut socket, peer) = MemorySocket::pair("127.0.0.1:4000".parse().unwrap());
//! peer.push(b"hello");
//! assert_eq!(socket.read_all().unwrap(), b"hello");
//! ```

use crate::channel::Outbox;
use crate::codec::Decoder;
use crate::net::websocket::{CloseCode, CloseReason, Frame, FrameCodec, Opcode};
use crate::net::{Transport, TransportError};
use crate::types::ConnectionId;
use bytes::BytesMut;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Key used by [`upgrade_request`]; RFC 6455's sample nonce.
pub const TEST_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Acquire the global environment lock for tests that mutate env vars.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

#[derive(Debug, Default)]
struct Pipe {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    peer_closed: bool,
    shut_down: bool,
    fail_writes: bool,
}

/// Server half of an in-memory connection.
pub struct MemorySocket {
    pipe: Rc<RefCell<Pipe>>,
    peer: SocketAddr,
    eof: bool,
}

impl MemorySocket {
    /// Socket "accepted" from `peer`, plus the handle that plays the client.
    #[must_use]
    pub fn pair(peer: SocketAddr) -> (Self, MemoryPeer) {
        let pipe = Rc::new(RefCell::new(Pipe::default()));
        let socket = Self {
            pipe: Rc::clone(&pipe),
            peer,
            eof: false,
        };
        let client = MemoryPeer {
            pipe,
            received: BytesMut::new(),
            codec: FrameCodec::client(),
        };
        (socket, client)
    }
}

impl fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySocket")
            .field("peer", &self.peer)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

impl Transport for MemorySocket {
    fn read_all(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.eof {
            return Err(TransportError::Closed);
        }
        let mut pipe = self.pipe.borrow_mut();
        let data = std::mem::take(&mut pipe.inbound);
        if pipe.peer_closed {
            self.eof = true;
            if data.is_empty() {
                return Err(TransportError::Closed);
            }
        }
        Ok(data)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.shut_down || pipe.fail_writes {
            return Err(TransportError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory socket closed",
            )));
        }
        pipe.outbound.extend_from_slice(data);
        Ok(data.len())
    }

    fn shutdown(&mut self) {
        self.pipe.borrow_mut().shut_down = true;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn at_eof(&self) -> bool {
        self.eof
    }
}

/// Client half of a [`MemorySocket`].
pub struct MemoryPeer {
    pipe: Rc<RefCell<Pipe>>,
    received: BytesMut,
    codec: FrameCodec,
}

impl MemoryPeer {
    /// Queue raw bytes for the server to read.
    pub fn push(&self, data: &[u8]) {
        self.pipe.borrow_mut().inbound.extend_from_slice(data);
    }

    /// Queue the upgrade request for `channel`.
    pub fn push_upgrade(&self, channel: &str, origin: Option<&str>) {
        self.push(upgrade_request(channel, origin).as_bytes());
    }

    /// Queue one masked frame.
    pub fn push_frame(&self, frame: Frame) {
        self.push(&client_frame(frame));
    }

    /// Queue one masked text frame.
    pub fn push_text(&self, text: &str) {
        self.push_frame(Frame::text(text.to_string()));
    }

    /// Queue `value` as a masked text frame.
    pub fn push_json(&self, value: &Value) {
        self.push_text(&value.to_string());
    }

    /// Close the client side; the server reads end-of-stream next.
    pub fn hang_up(&self) {
        self.pipe.borrow_mut().peer_closed = true;
    }

    /// Make every later server write fail.
    pub fn break_writes(&self) {
        self.pipe.borrow_mut().fail_writes = true;
    }

    /// Whether the server shut the socket down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.pipe.borrow().shut_down
    }

    /// Everything the server wrote since the last take.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.borrow_mut().outbound)
    }

    /// The HTTP response head the server wrote, if complete.
    pub fn read_http_response(&mut self) -> Option<String> {
        self.pull();
        let end = crate::net::websocket::HttpRequest::header_block_len(&self.received)?;
        let head = self.received.split_to(end);
        Some(String::from_utf8_lossy(&head).into_owned())
    }

    /// Every complete frame the server wrote so far.
    pub fn read_frames(&mut self) -> Vec<Frame> {
        self.pull();
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.codec.decode(&mut self.received) {
            frames.push(frame);
        }
        frames
    }

    /// Payloads of the text frames the server wrote, parsed as JSON.
    pub fn read_json(&mut self) -> Vec<Value> {
        self.read_frames()
            .into_iter()
            .filter(|frame| frame.opcode == Opcode::Text)
            .filter_map(|frame| serde_json::from_slice(&frame.payload).ok())
            .collect()
    }

    /// Close code of the first close frame in `frames`.
    #[must_use]
    pub fn close_code(frames: &[Frame]) -> Option<CloseCode> {
        frames
            .iter()
            .find(|frame| frame.opcode == Opcode::Close)
            .and_then(|frame| CloseReason::parse(&frame.payload).ok())
            .and_then(|reason| reason.close_code())
    }

    fn pull(&mut self) {
        let output = self.take_output();
        self.received.extend_from_slice(&output);
    }
}

impl fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("buffered", &self.received.len())
            .finish_non_exhaustive()
    }
}

/// Upgrade request for `/<channel>` with an optional `Origin` header.
#[must_use]
pub fn upgrade_request(channel: &str, origin: Option<&str>) -> String {
    let mut request = format!(
        "GET /{channel} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {TEST_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if let Some(origin) = origin {
        request.push_str("Origin: ");
        request.push_str(origin);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Encode `frame` as a client would: masked.
#[must_use]
pub fn client_frame(frame: Frame) -> Vec<u8> {
    FrameCodec::client()
        .encode_to_vec(frame.masked(Some([0x37, 0xfa, 0x21, 0x3d])))
        .unwrap_or_default()
}

/// [`Outbox`] that records deliveries and closes.
#[derive(Debug, Default)]
pub struct RecordingOutbox {
    sent: Vec<(ConnectionId, Value)>,
    closed: Vec<(ConnectionId, CloseCode)>,
    failing: HashSet<ConnectionId>,
}

impl RecordingOutbox {
    /// Empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `id` fail.
    pub fn fail_for(&mut self, id: impl Into<ConnectionId>) {
        self.failing.insert(id.into());
    }

    /// Forget everything recorded.
    pub fn clear(&mut self) {
        self.sent.clear();
        self.closed.clear();
    }

    /// Every delivery, in order.
    #[must_use]
    pub fn sent(&self) -> &[(ConnectionId, Value)] {
        &self.sent
    }

    /// Payloads delivered to `id`, in order.
    #[must_use]
    pub fn sent_to(&self, id: &ConnectionId) -> Vec<Value> {
        self.sent
            .iter()
            .filter(|(to, _)| to == id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Closes, in order.
    #[must_use]
    pub fn closed(&self) -> Vec<(ConnectionId, CloseCode)> {
        self.closed.clone()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.closed.is_empty()
    }
}

impl Outbox for RecordingOutbox {
    fn send(&mut self, to: &ConnectionId, payload: &Value) -> bool {
        if self.failing.contains(to) {
            return false;
        }
        self.sent.push((to.clone(), payload.clone()));
        true
    }

    fn close(&mut self, id: &ConnectionId, code: CloseCode) {
        self.closed.push((id.clone(), code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_socket_eof_after_data() {
        let (mut socket, peer) = MemorySocket::pair("127.0.0.1:1".parse().unwrap());
        assert!(socket.read_all().unwrap().is_empty());
        peer.push(b"bye");
        peer.hang_up();
        assert_eq!(socket.read_all().unwrap(), b"bye");
        assert!(socket.at_eof());
        assert!(matches!(socket.read_all(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_memory_socket_writes_reach_peer() {
        let (mut socket, mut peer) = MemorySocket::pair("127.0.0.1:1".parse().unwrap());
        let bytes = FrameCodec::server()
            .encode_to_vec(Frame::text(json!({"a":1}).to_string()))
            .unwrap();
        socket.write_all(&bytes).unwrap();
        assert_eq!(peer.read_json(), vec![json!({"a":1})]);

        socket.shutdown();
        assert!(peer.is_shut_down());
        assert!(socket.write_all(b"x").is_err());
    }

    #[test]
    fn test_client_frame_is_masked() {
        let bytes = client_frame(Frame::text("hi"));
        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1] & 0x80, 0x80);
        let decoded = FrameCodec::server()
            .decode(&mut BytesMut::from(&bytes[..]))
            .unwrap()
            .unwrap();
        assert_eq!(&decoded.payload[..], b"hi");
    }

    #[test]
    fn test_recording_outbox_failures() {
        let mut out = RecordingOutbox::new();
        out.fail_for("B");
        assert!(out.send(&"A".into(), &json!(1)));
        assert!(!out.send(&"B".into(), &json!(2)));
        out.close(&"A".into(), CloseCode::Normal);
        assert_eq!(out.sent_to(&"A".into()), vec![json!(1)]);
        assert_eq!(out.closed(), vec![(ConnectionId::from("A"), CloseCode::Normal)]);
        out.clear();
        assert!(out.is_empty());
    }
}
