#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use bytes::BytesMut;
use mio::Token;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use serde_json::{json, Value};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use wschannel::codec::Decoder;
use wschannel::net::websocket::{Frame, FrameCodec, HttpRequest, Opcode};
use wschannel::test_utils::{client_frame, upgrade_request, MemoryPeer, MemorySocket};
use wschannel::{ChannelSpec, Server, ServerConfig};

pub use wschannel::test_utils::{init_test_logging, init_test_logging_with_level};

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "WSCHANNEL_PROPTEST_SEED";
const PROPTEST_MAX_SHRINK_ITERS_ENV: &str = "WSCHANNEL_PROPTEST_MAX_SHRINK_ITERS";

/// Rounds of `iterate` a loopback helper waits before giving up.
const LOOPBACK_ROUNDS: usize = 400;
const LOOPBACK_PAUSE: Duration = Duration::from_millis(5);

/// Configuration for property tests with optional deterministic seed support.
#[derive(Debug, Clone)]
pub struct PropertyTestConfig {
    /// Fixed seed for reproducibility (overrides CI default when set).
    pub seed: Option<u64>,
    /// Number of successful cases required.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl PropertyTestConfig {
    /// Build a config with defaults for property tests.
    #[must_use]
    pub fn new(cases: u32) -> Self {
        Self {
            seed: read_proptest_seed(),
            cases,
            max_shrink_iters: read_max_shrink_iters()
                .unwrap_or(ProptestConfig::default().max_shrink_iters),
        }
    }

    /// Convert into a ProptestConfig, applying deterministic seed rules.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        let mut config = ProptestConfig::with_cases(self.cases);

        // Honor existing PROPTEST_RNG_SEED, otherwise apply our own.
        if matches!(config.rng_seed, RngSeed::Random) {
            if let Some(seed) = self.seed {
                config.rng_seed = RngSeed::Fixed(seed);
            }
        }

        config.max_shrink_iters = self.max_shrink_iters;
        config
    }
}

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    PropertyTestConfig::new(cases).to_proptest_config()
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }
    None
}

fn read_max_shrink_iters() -> Option<u32> {
    std::env::var(PROPTEST_MAX_SHRINK_ITERS_ENV)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
}

// =============================================================================
// In-memory clients
// =============================================================================

/// Config with origin checks off and the given default-kind channels.
#[must_use]
pub fn open_config(channels: &[&str]) -> ServerConfig {
    ServerConfig {
        check_origin: false,
        channels: channels.iter().map(|name| ChannelSpec::new(*name)).collect(),
        ..ServerConfig::default()
    }
}

/// Unbound server for in-memory clients.
#[must_use]
pub fn memory_server(channels: &[&str]) -> Server {
    init_test_logging();
    Server::builder(open_config(channels))
        .secret("integration")
        .build()
        .expect("server builds")
}

/// A client driven through a [`MemorySocket`].
#[derive(Debug)]
pub struct MemoryClient {
    pub token: Token,
    pub peer: MemoryPeer,
    pub id: String,
}

impl MemoryClient {
    /// Admit a transport from `addr` without handshaking.
    pub fn attach(server: &mut Server, addr: &str) -> Option<(Token, MemoryPeer)> {
        let (socket, peer) = MemorySocket::pair(addr.parse().expect("socket address"));
        let token = server.accept_transport(Box::new(socket))?;
        Some((token, peer))
    }

    /// Handshake on `channel` and return the client with its bootstrap.
    pub fn upgrade(server: &mut Server, addr: &str, channel: &str) -> (Self, Value) {
        let (token, mut peer) = Self::attach(server, addr).expect("admitted");
        peer.push_upgrade(channel, None);
        server.pump();
        let response = peer.read_http_response().expect("http response");
        assert!(response.starts_with("HTTP/1.1 101"), "unexpected response: {response}");
        let bootstrap = peer.read_json().into_iter().next().expect("bootstrap");
        let id = bootstrap["id"].as_str().expect("bootstrap id").to_string();
        (Self { token, peer, id }, bootstrap)
    }

    /// Handshake and `connect` with `open_data`; the join notices are
    /// consumed.
    pub fn join(server: &mut Server, addr: &str, channel: &str, open_data: Value) -> Self {
        let (mut client, _) = Self::upgrade(server, addr, channel);
        client.send(&json!({"__lxws_action__": "connect", "channelOpenData": open_data}));
        server.pump();
        client.peer.read_json();
        client
    }

    /// Queue `value` as a text frame.
    pub fn send(&self, value: &Value) {
        self.peer.push_json(value);
    }

    /// Everything received as JSON since the last read.
    pub fn received(&mut self) -> Vec<Value> {
        self.peer.read_json()
    }
}

/// Read every client's inbox so later assertions start clean.
pub fn drain(clients: &mut [&mut MemoryClient]) {
    for client in clients.iter_mut() {
        client.received();
    }
}

/// Wrapped application message.
#[must_use]
pub fn message(data: Value, meta: Value) -> Value {
    json!({"__data__": data, "__metaData__": meta})
}

// =============================================================================
// Loopback TCP clients
// =============================================================================

/// A real TCP WebSocket client talking to a bound [`Server`].
///
/// The server is single-threaded, so every wait drives it with
/// [`Server::iterate`] between non-blocking reads.
#[derive(Debug)]
pub struct TcpClient {
    stream: TcpStream,
    received: BytesMut,
    codec: FrameCodec,
}

impl TcpClient {
    /// Connect to `addr`.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            received: BytesMut::new(),
            codec: FrameCodec::client(),
        })
    }

    /// Write raw bytes, driving the server while the socket is full.
    pub fn send_raw(&mut self, server: &mut Server, mut data: &[u8]) {
        for _ in 0..LOOPBACK_ROUNDS {
            if data.is_empty() {
                return;
            }
            match self.stream.write(data) {
                Ok(n) => data = &data[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    server.iterate().expect("server iterates");
                    std::thread::sleep(LOOPBACK_PAUSE);
                }
                Err(err) => panic!("client write failed: {err}"),
            }
        }
        assert!(data.is_empty(), "client write did not finish");
    }

    /// Send the upgrade request for `channel`.
    pub fn send_upgrade(&mut self, server: &mut Server, channel: &str) {
        let request = upgrade_request(channel, None);
        self.send_raw(server, request.as_bytes());
    }

    /// Send `value` as a masked text frame.
    pub fn send_json(&mut self, server: &mut Server, value: &Value) {
        let frame = client_frame(Frame::text(value.to_string()));
        self.send_raw(server, &frame);
    }

    /// Wait for the HTTP response head.
    pub fn await_http(&mut self, server: &mut Server) -> String {
        for _ in 0..LOOPBACK_ROUNDS {
            server.iterate().expect("server iterates");
            self.pull();
            if let Some(end) = HttpRequest::header_block_len(&self.received) {
                let head = self.received.split_to(end);
                return String::from_utf8_lossy(&head).into_owned();
            }
            std::thread::sleep(LOOPBACK_PAUSE);
        }
        panic!("no http response from server");
    }

    /// Wait until at least `count` JSON messages arrived and return them.
    pub fn await_json(&mut self, server: &mut Server, count: usize) -> Vec<Value> {
        let mut values = Vec::new();
        for _ in 0..LOOPBACK_ROUNDS {
            server.iterate().expect("server iterates");
            self.pull();
            while let Ok(Some(frame)) = self.codec.decode(&mut self.received) {
                if frame.opcode == Opcode::Text {
                    if let Ok(value) = serde_json::from_slice(&frame.payload) {
                        values.push(value);
                    }
                }
            }
            if values.len() >= count {
                return values;
            }
            std::thread::sleep(LOOPBACK_PAUSE);
        }
        panic!("expected {count} messages, got {}: {values:?}", values.len());
    }

    /// Drive the server for a few rounds and return whatever arrived.
    pub fn settle(&mut self, server: &mut Server) -> Vec<Value> {
        let mut values = Vec::new();
        for _ in 0..10 {
            server.iterate().expect("server iterates");
            std::thread::sleep(LOOPBACK_PAUSE);
        }
        self.pull();
        while let Ok(Some(frame)) = self.codec.decode(&mut self.received) {
            if frame.opcode == Opcode::Text {
                if let Ok(value) = serde_json::from_slice(&frame.payload) {
                    values.push(value);
                }
            }
        }
        values
    }

    fn pull(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => self.received.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return,
            }
        }
    }
}
