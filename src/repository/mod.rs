//! Server-side registries: connections, channels and the origin gate.

pub mod channels;
pub mod connections;
pub mod origin;

pub use channels::{ChannelRepository, DEFAULT_KIND};
pub use connections::{AdmissionLimits, ConnectionRepository, REQUEST_WINDOW};
pub use origin::OriginValidator;
