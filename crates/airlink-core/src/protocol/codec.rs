//! Frame codec for the host protocol.
//!
//! Wire format:
//! ```text
//! [type:i32][length:u32][payload:length]
//! ```
//! Header size: 8 bytes. All multi-byte integers are big-endian.
//!
//! A declared `length` above [`MAX_PAYLOAD_SIZE`] is a protocol violation.
//! Stream readers are expected to call [`parse_header`] first and refuse to
//! allocate the payload buffer when it fails.

use thiserror::Error;

use crate::protocol::messages::{MessageType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The declared payload length exceeds the protocol maximum.
    #[error("frame too large: declared {declared} bytes, maximum is {max}")]
    Oversized { declared: usize, max: usize },

    /// The stream ended partway through a frame.
    #[error("stream ended mid-frame: expected {expected} bytes, got {received}")]
    Truncated { expected: usize, received: usize },

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A string or list is too long for its 2-byte length prefix.
    #[error("field too long: {len} exceeds the {max} a 2-byte prefix can carry")]
    FieldTooLong { len: usize, max: usize },
}

/// One typed, length-delimited message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw wire type code; see [`MessageType`].
    pub message_type: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame from a raw type code.
    pub fn new(message_type: i32, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    /// Creates a frame for a known message type.
    pub fn of(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self::new(message_type.code(), payload)
    }

    /// Creates a payload-less frame (ping, pong, close).
    pub fn empty(message_type: MessageType) -> Self {
        Self::new(message_type.code(), Vec::new())
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: i32,
    pub length: usize,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a frame into a byte vector including the 8-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError::Oversized`] if the payload exceeds the maximum.
///
/// # Examples
///
/// ```rust
/// use airlink_core::protocol::codec::{decode_frame, encode_frame, Frame};
///
/// let frame = Frame::new(101, b"hello".to_vec());
/// let bytes = encode_frame(&frame).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::Oversized {
            declared: frame.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
    buf.extend_from_slice(&frame.message_type.to_be_bytes());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Parses and validates the 8-byte frame header.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] for short input and
/// [`ProtocolError::Oversized`] when the declared length is above the maximum.
pub fn parse_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let message_type = read_i32(bytes, 0)?;
    let length = read_u32(bytes, 4)? as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::Oversized {
            declared: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(FrameHeader {
        message_type,
        length,
    })
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed so the caller can
/// advance its read cursor. A buffer that holds only part of a frame yields
/// [`ProtocolError::InsufficientData`]; the caller should read more and retry.
///
/// # Errors
///
/// Returns [`ProtocolError`] for short or oversized input.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let header = parse_header(bytes)?;
    let total = FRAME_HEADER_SIZE + header.length;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let payload = bytes[FRAME_HEADER_SIZE..total].to_vec();
    Ok((Frame::new(header.message_type, payload), total))
}

/// Decodes a buffer that must contain exactly one frame.
///
/// Used for relay-proxied payloads, where each WebSocket message carries one
/// complete inner frame. Missing bytes are reported as
/// [`ProtocolError::Truncated`] rather than "read more".
///
/// # Errors
///
/// Returns [`ProtocolError`] when the buffer is not one well-formed frame.
pub fn decode_exact_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    match decode_frame(bytes) {
        Ok((frame, consumed)) if consumed == bytes.len() => Ok(frame),
        Ok((_, consumed)) => Err(ProtocolError::MalformedPayload(format!(
            "{} trailing bytes after frame",
            bytes.len() - consumed
        ))),
        Err(ProtocolError::InsufficientData { needed, available }) => {
            Err(ProtocolError::Truncated {
                expected: needed,
                received: available,
            })
        }
        Err(e) => Err(e),
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

pub(crate) fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn read_i16(buf: &[u8], offset: usize) -> Result<i16, ProtocolError> {
    require_len(buf, offset + 2, "i16")?;
    Ok(i16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

pub(crate) fn read_i32(buf: &[u8], offset: usize) -> Result<i32, ProtocolError> {
    require_len(buf, offset + 4, "i32")?;
    Ok(i32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    require_len(buf, offset + 4, "u32")?;
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
///
/// Strings longer than `u16::MAX` bytes are rejected rather than cut, which
/// could split a character.
pub(crate) fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&short_length(bytes.len())?.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Checks that `len` fits a 2-byte length prefix.
pub(crate) fn short_length(len: usize) -> Result<u16, ProtocolError> {
    u16::try_from(len).map_err(|_| ProtocolError::FieldTooLong {
        len,
        max: u16::MAX as usize,
    })
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
pub(crate) fn read_length_prefixed_string(
    buf: &[u8],
    offset: usize,
) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

/// Reads a 4-byte length prefix and then that many raw bytes.
pub(crate) fn read_length_prefixed_bytes(
    buf: &[u8],
    offset: usize,
) -> Result<(Vec<u8>, usize), ProtocolError> {
    let len = read_u32(buf, offset)? as usize;
    let start = offset + 4;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "byte block of length {len} at offset {start} exceeds buffer"
        )));
    }
    Ok((buf[start..start + len].to_vec(), start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
