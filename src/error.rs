//! Crate-level error taxonomy.
//!
//! Every module keeps its own typed error (`TransportError`, `WsError`,
//! `HandshakeError`, `EnvelopeError`, `ConfigError`, `ConnectionError`).
//! They all convert into [`Error`], whose [`ErrorKind`] is grouped into an
//! [`ErrorCategory`]:
//!
//! - **Transport**: socket accept, read or write failures
//! - **Protocol**: malformed frames, handshakes or payloads
//! - **Authorization**: origin and password refusals
//! - **Admission**: capacity and rate limits
//! - **Application**: unknown or closed channels, unknown kinds
//! - **Config**: unusable configuration
//! - **Internal**: invariant violations
//!
//! The event loop never propagates these out of a tick: it logs, tears
//! down the offending connection when [`ErrorKind::is_fatal`] says so, and
//! keeps serving everyone else.

use core::fmt;
use std::sync::Arc;

use crate::channel::EnvelopeError;
use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::net::websocket::{CloseCode, HandshakeError, WsError};
use crate::net::TransportError;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Transport ===
    /// The listening socket could not be bound.
    Bind,
    /// A socket read or write failed.
    Io,
    /// The peer went away.
    PeerClosed,

    // === Protocol ===
    /// A frame violated RFC 6455 framing rules.
    MalformedFrame,
    /// A frame or text payload was larger than allowed.
    FrameTooLarge,
    /// A text frame was not valid UTF-8.
    InvalidEncoding,
    /// The upgrade request was malformed.
    BadHandshake,
    /// A text message was not a usable envelope.
    InvalidEnvelope,

    // === Authorization ===
    /// The `Origin` header was missing or not allowed.
    OriginRejected,
    /// Password or former id check failed.
    AccessDenied,

    // === Admission ===
    /// Global or per-IP capacity reached.
    CapacityExceeded,
    /// Too many requests in the current window.
    RateLimited,

    // === Application ===
    /// No channel under the requested name.
    UnknownChannel,
    /// The channel is closed.
    ChannelClosed,
    /// No channel kind under the requested name.
    UnknownKind,
    /// A channel of that name already exists.
    DuplicateChannel,

    // === Config ===
    /// Configuration could not be loaded.
    InvalidConfig,

    // === Internal ===
    /// Internal invariant violation.
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Bind | Self::Io | Self::PeerClosed => ErrorCategory::Transport,
            Self::MalformedFrame
            | Self::FrameTooLarge
            | Self::InvalidEncoding
            | Self::BadHandshake
            | Self::InvalidEnvelope => ErrorCategory::Protocol,
            Self::OriginRejected | Self::AccessDenied => ErrorCategory::Authorization,
            Self::CapacityExceeded | Self::RateLimited => ErrorCategory::Admission,
            Self::UnknownChannel
            | Self::ChannelClosed
            | Self::UnknownKind
            | Self::DuplicateChannel => ErrorCategory::Application,
            Self::InvalidConfig => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Whether a connection hitting this error is torn down.
    ///
    /// Only malformed application payloads are survivable: they are logged
    /// and the connection keeps going.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidEnvelope
                | Self::UnknownKind
                | Self::DuplicateChannel
                | Self::InvalidConfig
        )
    }

    /// Close code sent to the peer when the error ends a live connection.
    #[must_use]
    pub const fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::MalformedFrame => Some(CloseCode::ProtocolError),
            Self::FrameTooLarge => Some(CloseCode::LargeFrame),
            Self::InvalidEncoding => Some(CloseCode::WrongEncoding),
            Self::AccessDenied => Some(CloseCode::AccessError),
            Self::RateLimited => Some(CloseCode::RequestLimitExceeded),
            Self::Io => Some(CloseCode::SocketError),
            _ => None,
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Socket failures.
    Transport,
    /// Wire or payload format violations.
    Protocol,
    /// Origin and password refusals.
    Authorization,
    /// Capacity and rate limits.
    Admission,
    /// Channel-level refusals.
    Application,
    /// Configuration problems.
    Config,
    /// Bugs.
    Internal,
}

/// The main error type.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Whether the affected connection must be torn down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates an internal error (runtime bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    fn wrap(kind: ErrorKind, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let message = source.to_string();
        Self::new(kind).with_message(message).with_source(source)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::wrap(ErrorKind::Io, e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        let kind = match e {
            TransportError::Bind { .. } => ErrorKind::Bind,
            TransportError::Closed => ErrorKind::PeerClosed,
            TransportError::Accept(_)
            | TransportError::Read(_)
            | TransportError::Write(_)
            | TransportError::WriteStalled { .. }
            | TransportError::Register(_) => ErrorKind::Io,
        };
        Self::wrap(kind, e)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        let kind = match e {
            WsError::Io(_) => ErrorKind::Io,
            WsError::PayloadTooLarge { .. }
            | WsError::FrameTooLarge(_)
            | WsError::ControlFrameTooLarge(_) => ErrorKind::FrameTooLarge,
            WsError::InvalidUtf8 => ErrorKind::InvalidEncoding,
            WsError::InvalidOpcode(_)
            | WsError::ReservedBitsSet
            | WsError::FragmentedControlFrame
            | WsError::UnmaskedClientFrame
            | WsError::MaskedServerFrame
            | WsError::InvalidClosePayload => ErrorKind::MalformedFrame,
        };
        Self::wrap(kind, e)
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        let kind = match e {
            HandshakeError::UnknownChannel(_) => ErrorKind::UnknownChannel,
            HandshakeError::ChannelClosed(_) => ErrorKind::ChannelClosed,
            HandshakeError::OriginRejected(_) => ErrorKind::OriginRejected,
            HandshakeError::InvalidRequest(_)
            | HandshakeError::RequestTooLarge(_)
            | HandshakeError::MissingHeader(_)
            | HandshakeError::InvalidKey
            | HandshakeError::UnsupportedVersion(_) => ErrorKind::BadHandshake,
        };
        Self::wrap(kind, e)
    }
}

impl From<EnvelopeError> for Error {
    fn from(e: EnvelopeError) -> Self {
        Self::wrap(ErrorKind::InvalidEnvelope, e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::wrap(ErrorKind::InvalidConfig, e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Transport(inner) => inner.into(),
            ConnectionError::Frame(inner) => inner.into(),
            ConnectionError::Json(inner) => Self::wrap(ErrorKind::Internal, inner),
            ConnectionError::Closed => {
                Self::new(ErrorKind::PeerClosed).with_message("connection is closed")
            }
        }
    }
}

/// A specialized Result type for crate operations.
pub type Result<T> = core::result::Result<T, Error>;
