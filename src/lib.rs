//! wschannel: a single-threaded WebSocket channel server.
//!
//! # Overview
//!
//! Clients connect over WebSocket to a named channel (`ws://host/<channel>`),
//! announce themselves with a `connect` action and then exchange JSON
//! messages, named events and request/response pairs with the other members
//! of that channel. Disconnected clients may reclaim their identity within a
//! configurable window.
//!
//! # Core Guarantees
//!
//! - **One thread, no locks**: every connection and channel is driven from
//!   the loop in [`server::Server`]
//! - **Isolation**: a misbehaving connection is closed with a specific
//!   close code; it never stops the loop for anyone else
//! - **Admission control**: global and per-IP connection caps plus a
//!   per-connection request rate
//!
//! # Module Structure
//!
//! - [`net`]: socket transport and the WebSocket wire protocol
//! - [`connection`]: per-client protocol state and action handling
//! - [`channel`]: channels, messages, events, requests and listeners
//! - [`repository`]: connection and channel registries, origin gate
//! - [`server`]: the poll-dispatch loop
//! - [`config`]: configuration from defaults, TOML and environment
//! - [`error`]: crate error taxonomy
//! - [`test_utils`]: in-memory transport and test logging
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use wschannel::{ChannelSpec, Server, ServerConfig};
//!
//! let config = ServerConfig {
//!     channels: vec![ChannelSpec::new("demo")],
//!     ..ServerConfig::default()
//! };
//! let mut server = Server::builder(config).bind()?;
//! server.run(Duration::from_millis(10))?;
//! # Ok::<(), wschannel::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod net;
pub mod repository;
pub mod server;
pub mod test_utils;
pub mod types;

// Re-exports for convenient access to core types
pub use channel::{
    Channel, ChannelBehavior, ChannelConfig, ChannelEvent, ChannelMessage, ChannelRequest,
    ChannelResponse, EventListener, EventRouter, Member, Outbox, RequestHandler, RequestRouter,
};
pub use config::{ChannelSpec, ConfigError, ServerConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use net::websocket::CloseCode;
pub use repository::{AdmissionLimits, ChannelRepository, ConnectionRepository, OriginValidator};
pub use server::{Server, ServerBuilder};
pub use types::ConnectionId;
