//! Close codes and close-frame payloads.
//!
//! The numbering follows RFC 6455 for 1000 and 1001 and then continues with
//! application-specific meanings that clients of this server understand:
//!
//! | Code | Meaning                 |
//! |------|-------------------------|
//! | 1000 | normal closure          |
//! | 1001 | leave (going away)      |
//! | 1002 | access error            |
//! | 1003 | protocol error          |
//! | 1004 | unknown data (opcode)   |
//! | 1005 | frame too large         |
//! | 1006 | socket error            |
//! | 1007 | wrong encoding          |
//! | 1008 | policy violation        |
//! | 1009 | request limit exceeded  |
//!
//! A close payload is the big-endian code followed by UTF-8 reason text.

use super::{Frame, WsError};
use bytes::Bytes;

/// Close status codes understood by channel clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Client leaves for good (1001).
    Leave = 1001,
    /// Authorization failed (1002).
    AccessError = 1002,
    /// Wire protocol violated (1003).
    ProtocolError = 1003,
    /// Unsupported opcode or binary data (1004).
    UnknownData = 1004,
    /// Frame exceeded the payload limit (1005).
    LargeFrame = 1005,
    /// Transport failure (1006).
    SocketError = 1006,
    /// Text payload was not valid UTF-8 (1007).
    WrongEncoding = 1007,
    /// Message violates server policy (1008).
    PolicyViolation = 1008,
    /// Too many requests in the current window (1009).
    RequestLimitExceeded = 1009,
}

impl CloseCode {
    /// Parse a close code from its numeric value.
    #[must_use]
    pub const fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::Leave),
            1002 => Some(Self::AccessError),
            1003 => Some(Self::ProtocolError),
            1004 => Some(Self::UnknownData),
            1005 => Some(Self::LargeFrame),
            1006 => Some(Self::SocketError),
            1007 => Some(Self::WrongEncoding),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::RequestLimitExceeded),
            _ => None,
        }
    }

    /// Reason text sent alongside the code.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::Leave => "going away",
            Self::AccessError => "access error",
            Self::ProtocolError => "protocol error",
            Self::UnknownData => "unknown data (opcode)",
            Self::LargeFrame => "frame too large",
            Self::SocketError => "socket error",
            Self::WrongEncoding => "utf8 expected",
            Self::PolicyViolation => "message violates server policy",
            Self::RequestLimitExceeded => "request limit exceeded",
        }
    }

    /// Returns true for codes that signal a client-side fault.
    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Normal | Self::Leave)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", u16::from(*self), self.reason())
    }
}

/// Parsed close frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseReason {
    /// Raw status code, if the payload carried one.
    pub code: Option<u16>,
    /// Reason text, if present.
    pub text: Option<String>,
}

impl CloseReason {
    /// Close reason for a known code with its standard text.
    #[must_use]
    pub fn new(code: CloseCode) -> Self {
        Self {
            code: Some(code.into()),
            text: Some(code.reason().to_string()),
        }
    }

    /// Parse a close frame payload.
    ///
    /// An empty payload has neither code nor text; a single byte is invalid.
    pub fn parse(payload: &[u8]) -> Result<Self, WsError> {
        match payload.len() {
            0 => Ok(Self::default()),
            1 => Err(WsError::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let text = if payload.len() > 2 {
                    let text = std::str::from_utf8(&payload[2..])
                        .map_err(|_| WsError::InvalidClosePayload)?;
                    Some(text.to_string())
                } else {
                    None
                };
                Ok(Self {
                    code: Some(code),
                    text,
                })
            }
        }
    }

    /// Known close code, if the raw value maps to one.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        self.code.and_then(CloseCode::from_u16)
    }

    /// Encode this close reason into a frame payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let Some(code) = self.code else {
            return Bytes::new();
        };
        let text = self.text.as_deref().unwrap_or("");
        let mut buf = Vec::with_capacity(2 + text.len());
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(text.as_bytes());
        Bytes::from(buf)
    }

    /// Convert to a close frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::close(self.code.unwrap_or(1000), self.text.as_deref().unwrap_or(""))
    }
}

impl From<CloseCode> for CloseReason {
    fn from(code: CloseCode) -> Self {
        Self::new(code)
    }
}
