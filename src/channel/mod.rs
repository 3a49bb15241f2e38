//! Channels: named pub/sub domains and the values routed through them.
//!
//! - [`envelope`]: decoding client documents into tagged [`Inbound`] values
//! - [`message`], [`event`], [`request`]: routed payloads with per-recipient
//!   shaping
//! - [`listener`]: event interception through a dispatch table
//! - [`channel`]: membership, authorization and fan-out
//! - [`outbox`]: the seam through which a channel reaches connections
//!
//! # Receiver resolution
//!
//! ```
//! use indexmap::IndexMap;
//! use serde_json::json;
//! use wschannel::channel::ChannelMessage;
//! use wschannel::types::ConnectionId;
//!
//! let live: IndexMap<ConnectionId, ()> =
//!     ["A", "B", "C"].into_iter().map(|id| (ConnectionId::from(id), ())).collect();
//!
//! let mut message = ChannelMessage::new(json!({"text": "hi"}));
//! message
//!     .set_initiator("A".into())
//!     .set_receiver("B".into())
//!     .set_return_to_sender(false);
//!
//! assert_eq!(message.resolve_receivers(&live), vec![ConnectionId::from("B")]);
//! ```

pub mod channel;
pub mod envelope;
pub mod event;
pub mod listener;
pub mod message;
pub mod outbox;
pub mod registry;
pub mod request;

pub use channel::{Channel, ChannelBehavior, ChannelConfig, Member};
pub use envelope::{parse_inbound, Action, Envelope, EnvelopeError, Inbound, Routing};
pub use event::ChannelEvent;
pub use listener::{EventListener, EventRouter};
pub use message::{ChannelMessage, Routed};
pub use outbox::Outbox;
pub use registry::RegistryHandle;
pub use request::{ChannelRequest, ChannelResponse, RequestHandler, RequestRouter};
