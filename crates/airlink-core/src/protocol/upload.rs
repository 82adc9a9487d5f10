//! Payload codec for chunked file uploads and their result frames.
//!
//! Fragment payloads (`send-file-existing` / `send-file-new`):
//! ```text
//! existing: [request_id:i16][index:i32][is_last:u8][chat_guid:str]
//!           [data_len:u32][gzip data][file_name:str if index == 0]
//! new:      [request_id:i16][index:i32][is_last:u8][count:u16][member:str]*
//!           [data_len:u32][gzip data][file_name:str, service:str if index == 0]
//! ```
//! `str` is a u16 length prefix followed by UTF-8.
//!
//! Result payload (`send-result`):
//! ```text
//! [request_id:i16][code:i32][has_details:u8][details:str if has_details]
//! ```

use crate::protocol::codec::{
    read_i16, read_i32, read_length_prefixed_bytes, read_length_prefixed_string, require_len,
    short_length, write_length_prefixed_string, ProtocolError,
};
use crate::protocol::messages::{SendResultCode, UploadKind};

/// Where a completed file should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An existing conversation, by its GUID.
    ExistingChat { chat_guid: String },
    /// A new conversation with these members. `service` is only present on
    /// the first fragment.
    NewChat {
        members: Vec<String>,
        service: Option<String>,
    },
}

/// The part of a [`Destination`] that identifies an upload across fragments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DestinationKey {
    ExistingChat(String),
    NewChat(Vec<String>),
}

impl Destination {
    pub fn key(&self) -> DestinationKey {
        match self {
            Destination::ExistingChat { chat_guid } => DestinationKey::ExistingChat(chat_guid.clone()),
            Destination::NewChat { members, .. } => DestinationKey::NewChat(members.clone()),
        }
    }

    pub fn kind(&self) -> UploadKind {
        match self {
            Destination::ExistingChat { .. } => UploadKind::ExistingChat,
            Destination::NewChat { .. } => UploadKind::NewChat,
        }
    }
}

/// One fragment of a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFragment {
    pub request_id: i16,
    pub index: i32,
    pub is_last: bool,
    pub destination: Destination,
    /// Gzip-compressed slice of the file.
    pub data: Vec<u8>,
    /// Only present on fragment 0.
    pub file_name: Option<String>,
}

/// Result of a send request, reported back to the requesting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub request_id: i16,
    pub code: SendResultCode,
    pub details: Option<String>,
}

// ── Fragments ─────────────────────────────────────────────────────────────────

/// Decodes a fragment payload of the given upload kind.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] for truncated fields, bad
/// UTF-8, or a first fragment without a file name.
pub fn decode_fragment(kind: UploadKind, p: &[u8]) -> Result<FileFragment, ProtocolError> {
    require_len(p, 7, "FileFragment")?;
    let request_id = read_i16(p, 0)?;
    let index = read_i32(p, 2)?;
    let is_last = p[6] != 0;
    let mut offset = 7;

    let mut destination = match kind {
        UploadKind::ExistingChat => {
            let (chat_guid, next) = read_length_prefixed_string(p, offset)?;
            offset = next;
            Destination::ExistingChat { chat_guid }
        }
        UploadKind::NewChat => {
            require_len(p, offset + 2, "FileFragment member count")?;
            let count = u16::from_be_bytes([p[offset], p[offset + 1]]) as usize;
            offset += 2;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let (member, next) = read_length_prefixed_string(p, offset)?;
                members.push(member);
                offset = next;
            }
            Destination::NewChat {
                members,
                service: None,
            }
        }
    };

    let (data, next) = read_length_prefixed_bytes(p, offset)?;
    offset = next;

    let file_name = if index == 0 {
        let (name, next) = read_length_prefixed_string(p, offset)?;
        if let Destination::NewChat { service, .. } = &mut destination {
            *service = Some(read_length_prefixed_string(p, next)?.0);
        }
        Some(name)
    } else {
        None
    };

    Ok(FileFragment {
        request_id,
        index,
        is_last,
        destination,
        data,
        file_name,
    })
}

/// Encodes a fragment payload. Used by clients and tests.
///
/// # Errors
///
/// Returns [`ProtocolError::FieldTooLong`] for a string or member list that
/// does not fit its 2-byte length prefix.
pub fn encode_fragment(fragment: &FileFragment) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(32 + fragment.data.len());
    buf.extend_from_slice(&fragment.request_id.to_be_bytes());
    buf.extend_from_slice(&fragment.index.to_be_bytes());
    buf.push(u8::from(fragment.is_last));

    match &fragment.destination {
        Destination::ExistingChat { chat_guid } => write_length_prefixed_string(&mut buf, chat_guid)?,
        Destination::NewChat { members, .. } => {
            buf.extend_from_slice(&short_length(members.len())?.to_be_bytes());
            for member in members {
                write_length_prefixed_string(&mut buf, member)?;
            }
        }
    }

    buf.extend_from_slice(&(fragment.data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&fragment.data);

    if fragment.index == 0 {
        write_length_prefixed_string(&mut buf, fragment.file_name.as_deref().unwrap_or_default())?;
        if let Destination::NewChat { service, .. } = &fragment.destination {
            write_length_prefixed_string(&mut buf, service.as_deref().unwrap_or_default())?;
        }
    }
    Ok(buf)
}

// ── Send result ───────────────────────────────────────────────────────────────

/// Encodes a `send-result` payload.
///
/// # Errors
///
/// Returns [`ProtocolError::FieldTooLong`] if the details text does not fit
/// its 2-byte length prefix.
pub fn encode_send_result(result: &SendResult) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(7);
    buf.extend_from_slice(&result.request_id.to_be_bytes());
    buf.extend_from_slice(&(result.code as i32).to_be_bytes());
    match &result.details {
        Some(details) => {
            buf.push(1);
            write_length_prefixed_string(&mut buf, details)?;
        }
        None => buf.push(0),
    }
    Ok(buf)
}

/// Decodes a `send-result` payload.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] for truncated input or an
/// unknown result code.
pub fn decode_send_result(p: &[u8]) -> Result<SendResult, ProtocolError> {
    require_len(p, 7, "SendResult")?;
    let request_id = read_i16(p, 0)?;
    let raw = read_i32(p, 2)?;
    let code = SendResultCode::try_from(raw)
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown send result: {raw}")))?;
    let details = if p[6] != 0 {
        Some(read_length_prefixed_string(p, 7)?.0)
    } else {
        None
    };
    Ok(SendResult {
        request_id,
        code,
        details,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
