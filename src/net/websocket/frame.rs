//! WebSocket frame codec (RFC 6455, hybi-10 subset).
//!
//! Encodes and decodes single, unfragmented frames:
//! - Text, close, ping and pong frames on the way out
//! - Masking and unmasking with a cycling 4-byte key
//! - 7, 16 and 64-bit payload length forms
//!
//! # Frame Format (RFC 6455 Section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! Decoding never consumes a partial frame. The header is inspected, the
//! total frame length is computed, and if the buffer is shorter the decoder
//! reports "incomplete" and leaves the bytes where they are.

use super::CloseCode;
use crate::codec::{Decoder, Encoder};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (fragmented message).
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    /// Returns true if this is a control frame (Close, Ping, Pong).
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Returns true if this is a data frame (Continuation, Text, Binary).
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    /// Try to parse an opcode from the low nibble of a header byte.
    pub fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::InvalidOpcode(value)),
        }
    }
}

/// One WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag (FIN bit).
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the frame is (or should be) masked on the wire.
    pub masked: bool,
    /// Masking key; a fresh random key is drawn on encode when absent.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload data.
    pub payload: Bytes,
}

impl Frame {
    fn new(opcode: Opcode, payload: Bytes) -> Self {
        Self {
            fin: true,
            opcode,
            masked: false,
            mask_key: None,
            payload,
        }
    }

    /// Create a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload.into())
    }

    /// Create a binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload.into())
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload.into())
    }

    /// Create a close frame carrying a status code and reason text.
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, buf.freeze())
    }

    /// Request masking on encode, optionally with a fixed key.
    #[must_use]
    pub fn masked(mut self, key: Option<[u8; 4]>) -> Self {
        self.masked = true;
        self.mask_key = key;
        self
    }

    /// Total encoded length of this frame in bytes.
    #[must_use]
    pub fn encoded_len(&self, masked: bool) -> usize {
        header_len(self.payload.len(), masked) + self.payload.len()
    }
}

/// WebSocket codec errors.
#[derive(Debug, Error)]
pub enum WsError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Invalid opcode value.
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),
    /// Reserved bits set without extension support.
    #[error("reserved bits set without extension")]
    ReservedBitsSet,
    /// Declared payload exceeds the configured maximum.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Declared payload size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Payload length does not fit the 63-bit wire field.
    #[error("frame too large to encode: {0} bytes")]
    FrameTooLarge(u64),
    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),
    /// Control frame is fragmented (FIN not set).
    #[error("control frame cannot be fragmented")]
    FragmentedControlFrame,
    /// Client frame is not masked.
    #[error("client frame must be masked")]
    UnmaskedClientFrame,
    /// Server frame is masked.
    #[error("server frame should not be masked")]
    MaskedServerFrame,
    /// Invalid UTF-8 in a text frame.
    #[error("invalid UTF-8 in text frame")]
    InvalidUtf8,
    /// Invalid close frame payload.
    #[error("invalid close frame payload")]
    InvalidClosePayload,
}

impl WsError {
    /// Close code sent to a peer whose frame raised this error.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::UnmaskedClientFrame | Self::MaskedServerFrame | Self::ReservedBitsSet => {
                CloseCode::ProtocolError
            }
            Self::InvalidOpcode(_) => CloseCode::UnknownData,
            Self::PayloadTooLarge { .. }
            | Self::FrameTooLarge(_)
            | Self::ControlFrameTooLarge(_) => CloseCode::LargeFrame,
            Self::InvalidUtf8 => CloseCode::WrongEncoding,
            Self::FragmentedControlFrame | Self::InvalidClosePayload => CloseCode::PolicyViolation,
            Self::Io(_) => CloseCode::SocketError,
        }
    }
}

/// Role in the WebSocket connection (affects masking requirements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client role: masks outgoing frames, expects unmasked frames.
    Client,
    /// Server role: sends unmasked frames, requires masked frames.
    Server,
}

/// WebSocket frame codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
    role: Role,
    validate_reserved_bits: bool,
}

impl FrameCodec {
    /// Default maximum payload size (16 MB).
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

    /// Creates a new frame codec for the given role.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            max_payload_size: Self::DEFAULT_MAX_PAYLOAD_SIZE,
            role,
            validate_reserved_bits: true,
        }
    }

    /// Creates a client-role frame codec.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Creates a server-role frame codec.
    #[must_use]
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Sets the maximum payload size.
    #[must_use]
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Sets whether to validate reserved bits.
    #[must_use]
    pub fn validate_reserved_bits(mut self, validate: bool) -> Self {
        self.validate_reserved_bits = validate;
        self
    }

    /// Returns the codec role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Encodes a frame into a fresh buffer.
    pub fn encode_to_vec(&mut self, frame: Frame) -> Result<Vec<u8>, WsError> {
        let mut dst = BytesMut::with_capacity(frame.encoded_len(frame.masked));
        self.encode(frame, &mut dst)?;
        Ok(dst.to_vec())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::server()
    }
}

/// Parsed fixed part of a frame header.
struct Header {
    fin: bool,
    opcode: Opcode,
    mask_offset: Option<usize>,
    payload_offset: usize,
    payload_len: u64,
}

impl FrameCodec {
    /// Reads the header without consuming; `None` means more bytes are needed.
    fn peek_header(&self, src: &[u8]) -> Result<Option<Header>, WsError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first_byte = src[0];
        let second_byte = src[1];

        let fin = (first_byte & 0x80) != 0;
        let reserved = first_byte & 0x70;
        let masked = (second_byte & 0x80) != 0;
        let payload_len_7 = second_byte & 0x7F;

        if self.validate_reserved_bits && reserved != 0 {
            return Err(WsError::ReservedBitsSet);
        }

        let opcode = Opcode::from_u8(first_byte & 0x0F)?;

        match self.role {
            Role::Server if !masked => return Err(WsError::UnmaskedClientFrame),
            Role::Client if masked => return Err(WsError::MaskedServerFrame),
            _ => {}
        }

        if opcode.is_control() {
            if !fin {
                return Err(WsError::FragmentedControlFrame);
            }
            if payload_len_7 > 125 {
                return Err(WsError::ControlFrameTooLarge(usize::from(payload_len_7)));
            }
        }

        let (payload_len, length_end) = match payload_len_7 {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            short => (u64::from(short), 2),
        };

        if payload_len > self.max_payload_size as u64 {
            return Err(WsError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }

        let (mask_offset, payload_offset) = if masked {
            (Some(length_end), length_end + 4)
        } else {
            (None, length_end)
        };

        Ok(Some(Header {
            fin,
            opcode,
            mask_offset,
            payload_offset,
            payload_len,
        }))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = self.peek_header(src)? else {
            return Ok(None);
        };

        // Bounded by max_payload_size, which is a usize.
        let payload_len = header.payload_len as usize;
        let total = header.payload_offset + payload_len;
        if src.len() < total {
            return Ok(None);
        }

        let mask_key = header.mask_offset.map(|offset| {
            let mut key = [0u8; 4];
            key.copy_from_slice(&src[offset..offset + 4]);
            key
        });

        let mut frame_bytes = src.split_to(total);
        let mut payload = frame_bytes.split_off(header.payload_offset);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            masked: mask_key.is_some(),
            mask_key,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(WsError::FragmentedControlFrame);
            }
            if payload_len > 125 {
                return Err(WsError::ControlFrameTooLarge(payload_len));
            }
        }

        // The 64-bit length form reserves its most significant bit.
        let wire_len = payload_len as u64;
        if wire_len > i64::MAX as u64 {
            return Err(WsError::FrameTooLarge(wire_len));
        }

        let should_mask = frame.masked || self.role == Role::Client;

        let mut first_byte = frame.opcode as u8;
        if frame.fin {
            first_byte |= 0x80;
        }
        let mask_bit = if should_mask { 0x80 } else { 0 };

        dst.reserve(header_len(payload_len, should_mask) + payload_len);
        dst.put_u8(first_byte);

        if payload_len <= 125 {
            dst.put_u8(mask_bit | (payload_len as u8));
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(wire_len);
        }

        if should_mask {
            let mask_key = match frame.mask_key {
                Some(key) => key,
                None => generate_mask_key()?,
            };
            dst.put_slice(&mask_key);

            let mut masked_payload = BytesMut::from(frame.payload.as_ref());
            apply_mask(&mut masked_payload, mask_key);
            dst.put_slice(&masked_payload);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }
}

fn header_len(payload_len: usize, masked: bool) -> usize {
    let length_bytes = if payload_len > 65535 {
        8
    } else if payload_len > 125 {
        2
    } else {
        0
    };
    2 + length_bytes + if masked { 4 } else { 0 }
}

/// Apply XOR masking to payload data in place.
///
/// Masking is an involution: applying the same key twice restores the input.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// Draw a mask key from the OS entropy source.
fn generate_mask_key() -> Result<[u8; 4], WsError> {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key)
        .map_err(|err| WsError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())))?;
    Ok(key)
}
