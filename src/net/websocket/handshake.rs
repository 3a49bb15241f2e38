//! Server side of the WebSocket opening handshake (RFC 6455 Section 4).
//!
//! # Client Request
//!
//! ```http
//! GET /demo HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! Origin: http://example.com
//! ```
//!
//! The path names the channel to join. Rejections are answered with a
//! plain HTTP status before the socket is closed:
//!
//! | Status | Cause                                          |
//! |--------|------------------------------------------------|
//! | 400    | malformed request line, key or header block    |
//! | 401    | origin missing or not allowed                  |
//! | 403    | channel exists but is closed                   |
//! | 404    | no channel under that name                     |
//! | 501    | `Sec-WebSocket-Version` missing or below 6     |

use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use thiserror::Error;

/// RFC 6455 GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Lowest accepted `Sec-WebSocket-Version` (hybi drafts from 6 on).
pub const MIN_VERSION: u32 = 6;

/// Upper bound for a buffered request header block.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

/// Compute the Sec-WebSocket-Accept value from a client key.
///
/// ```
/// use wschannel::net::websocket::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Reason phrase for the statuses this server emits.
#[must_use]
pub const fn status_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        501 => "Not Implemented",
        _ => "Error",
    }
}

/// Handshake rejection; each variant maps to one HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Request line or header block is malformed.
    #[error("invalid HTTP request: {0}")]
    InvalidRequest(String),
    /// Header block grew past [`MAX_REQUEST_SIZE`].
    #[error("request header block exceeds {0} bytes")]
    RequestTooLarge(usize),
    /// Required header is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    /// Sec-WebSocket-Key is not 16 base64-encoded bytes.
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,
    /// No channel is registered under the requested path.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    /// The channel exists but is closed.
    #[error("channel is closed: {0}")]
    ChannelClosed(String),
    /// Sec-WebSocket-Version missing or too old.
    #[error("unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),
    /// Origin header missing or not allowed.
    #[error("origin rejected: {0}")]
    OriginRejected(String),
}

impl HandshakeError {
    /// HTTP status answered for this rejection.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_)
            | Self::RequestTooLarge(_)
            | Self::MissingHeader(_)
            | Self::InvalidKey => 400,
            Self::OriginRejected(_) => 401,
            Self::ChannelClosed(_) => 403,
            Self::UnknownChannel(_) => 404,
            Self::UnsupportedVersion(_) => 501,
        }
    }

    /// Full HTTP rejection response.
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        ServerHandshake::reject(self.status())
    }
}

/// Server-side handshake response builder.
#[derive(Debug, Clone, Default)]
pub struct ServerHandshake {
    /// Protocol echoed back when the client asked for one.
    protocol: Option<String>,
}

impl ServerHandshake {
    /// Create a new server handshake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo `protocol` in `Sec-WebSocket-Protocol` whenever the client
    /// sends that header.
    #[must_use]
    pub fn echo_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Validate the upgrade key and build the 101 response.
    ///
    /// Request line, channel, version and origin checks are done by the
    /// caller beforehand, in that order.
    pub fn accept(&self, request: &HttpRequest) -> Result<AcceptResponse, HandshakeError> {
        let client_key = request
            .header("sec-websocket-key")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

        match base64::engine::general_purpose::STANDARD.decode(client_key) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(HandshakeError::InvalidKey),
        }

        let protocol = request
            .header("sec-websocket-protocol")
            .and(self.protocol.clone());

        Ok(AcceptResponse {
            accept_key: compute_accept_key(client_key),
            protocol,
        })
    }

    /// Generate a rejection response with the given HTTP status code.
    #[must_use]
    pub fn reject(status: u16) -> Vec<u8> {
        format!(
            "HTTP/1.1 {status} {}\r\n\
             Connection: close\r\n\
             \r\n",
            status_reason(status)
        )
        .into_bytes()
    }
}

/// Result of accepting a WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptResponse {
    /// Computed Sec-WebSocket-Accept value.
    pub accept_key: String,
    /// Echoed subprotocol, if any.
    pub protocol: Option<String>,
}

impl AcceptResponse {
    /// Generate the HTTP 101 response as bytes.
    #[must_use]
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut response = String::from(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n",
        );

        response.push_str("Sec-WebSocket-Accept: ");
        response.push_str(&self.accept_key);
        response.push_str("\r\n");

        if let Some(ref protocol) = self.protocol {
            response.push_str("Sec-WebSocket-Protocol: ");
            response.push_str(protocol);
            response.push_str("\r\n");
        }

        response.push_str("\r\n");
        response.into_bytes()
    }
}

/// Minimal HTTP request representation for the handshake.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: String,
    /// HTTP headers (lowercase keys).
    headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Length of the header block including the terminating blank line, or
    /// `None` while the terminator has not arrived yet.
    #[must_use]
    pub fn header_block_len(data: &[u8]) -> Option<usize> {
        data.windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|idx| idx + 4)
    }

    /// Parse an HTTP upgrade request.
    ///
    /// The request line must read exactly `GET <path> HTTP/1.1`.
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| HandshakeError::InvalidRequest("invalid UTF-8".into()))?;

        let mut lines = text.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("empty request".into()))?;

        let parts: Vec<&str> = request_line.split(' ').collect();
        let [method, path, version] = parts.as_slice() else {
            return Err(HandshakeError::InvalidRequest(format!(
                "malformed request line '{request_line}'"
            )));
        };
        if *method != "GET" || *version != "HTTP/1.1" || path.is_empty() {
            return Err(HandshakeError::InvalidRequest(format!(
                "expected 'GET <path> HTTP/1.1', got '{request_line}'"
            )));
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self {
            method: (*method).to_string(),
            path: (*path).to_string(),
            version: (*version).to_string(),
            headers,
        })
    }

    /// Get a header value by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Channel key taken from the path: `/demo` names channel `demo`.
    #[must_use]
    pub fn channel_key(&self) -> &str {
        let path = self.path.split('?').next().unwrap_or_default();
        path.strip_prefix('/').unwrap_or(path)
    }

    /// Origin as sent by browsers (`Origin`) or hybi drafts
    /// (`Sec-WebSocket-Origin`).
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
            .or_else(|| self.header("sec-websocket-origin"))
    }

    /// Require `Sec-WebSocket-Version` of at least [`MIN_VERSION`].
    pub fn check_version(&self) -> Result<u32, HandshakeError> {
        let raw = self
            .header("sec-websocket-version")
            .ok_or_else(|| HandshakeError::UnsupportedVersion("missing".into()))?;
        match raw.parse::<u32>() {
            Ok(version) if version >= MIN_VERSION => Ok(version),
            _ => Err(HandshakeError::UnsupportedVersion(raw.to_string())),
        }
    }
}
