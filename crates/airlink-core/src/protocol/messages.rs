//! Message type codes and status codes of the Airlink host protocol.
//!
//! Every frame on the wire carries a signed 32-bit type code.  Negative codes
//! are protocol-level (close, ping, pong); non-negative codes carry the
//! information/authentication handshake and the business messages that the
//! host routes to its message-store collaborator.
//!
//! # Why two classification enums? (for beginners)
//!
//! The same numeric code means different things depending on where a session
//! is in its lifecycle.  Before authentication only `authenticate` and
//! `close` are meaningful; everything else is silently ignored.  After
//! authentication the protocol codes are handled by the session manager and
//! the rest goes to business logic.  Modelling each phase as its own closed
//! enum ([`HandshakeMessage`], [`SessionMessage`]) lets the compiler check
//! that every dispatch site handles every case.

// ── Protocol constants ────────────────────────────────────────────────────────

/// Major protocol version advertised in the information frame.
pub const PROTOCOL_VERSION: i32 = 4;

/// Minor protocol version advertised in the information frame.
pub const PROTOCOL_SUBVERSION: i32 = 6;

/// Size of the frame header: `int32 type | uint32 length`.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload a single frame may declare (50 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 50 * 1024 * 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes used by the host protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    // Protocol (negative)
    Close = -1,
    Ping = -2,
    Pong = -3,
    // Handshake
    Information = 0,
    Authentication = 1,
    // Message store
    MessageUpdate = 2,
    TimeRetrieval = 3,
    MassRetrieval = 4,
    ConversationUpdate = 5,
    ModifierUpdate = 6,
    AttachmentReq = 7,
    AttachmentReqConfirm = 8,
    AttachmentReqFail = 9,
    MassRetrievalFinish = 10,
    MassRetrievalFile = 11,
    CreateChat = 12,
    // Outgoing message requests
    SendResult = 100,
    SendTextExisting = 101,
    SendTextNew = 102,
    SendFileExisting = 103,
    SendFileNew = 104,
}

impl MessageType {
    /// Returns the wire code for this type.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for MessageType {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            -1 => Ok(MessageType::Close),
            -2 => Ok(MessageType::Ping),
            -3 => Ok(MessageType::Pong),
            0 => Ok(MessageType::Information),
            1 => Ok(MessageType::Authentication),
            2 => Ok(MessageType::MessageUpdate),
            3 => Ok(MessageType::TimeRetrieval),
            4 => Ok(MessageType::MassRetrieval),
            5 => Ok(MessageType::ConversationUpdate),
            6 => Ok(MessageType::ModifierUpdate),
            7 => Ok(MessageType::AttachmentReq),
            8 => Ok(MessageType::AttachmentReqConfirm),
            9 => Ok(MessageType::AttachmentReqFail),
            10 => Ok(MessageType::MassRetrievalFinish),
            11 => Ok(MessageType::MassRetrievalFile),
            12 => Ok(MessageType::CreateChat),
            100 => Ok(MessageType::SendResult),
            101 => Ok(MessageType::SendTextExisting),
            102 => Ok(MessageType::SendTextNew),
            103 => Ok(MessageType::SendFileExisting),
            104 => Ok(MessageType::SendFileNew),
            _ => Err(()),
        }
    }
}

// ── Phase-specific classification ─────────────────────────────────────────────

/// What an inbound frame means to a session that has not yet authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// The peer presents its encrypted shared secret.
    Authenticate,
    /// The peer is leaving; tear down immediately.
    Close,
    /// Anything else; dropped without error while unauthenticated.
    Ignored(i32),
}

impl HandshakeMessage {
    /// Classifies a raw type code for the handshake phase.
    pub fn classify(code: i32) -> Self {
        match MessageType::try_from(code) {
            Ok(MessageType::Authentication) => HandshakeMessage::Authenticate,
            Ok(MessageType::Close) => HandshakeMessage::Close,
            _ => HandshakeMessage::Ignored(code),
        }
    }
}

/// The two upload request shapes, distinguished by destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// File sent into an existing conversation.
    ExistingChat,
    /// File sent to a new conversation built from a member list.
    NewChat,
}

/// What an inbound frame means to a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMessage {
    /// Peer requests a graceful close.
    Close,
    /// Keepalive check; answered with a pong.
    Ping,
    /// Keepalive answer.
    Pong,
    /// One fragment of a chunked file upload.
    Upload(UploadKind),
    /// Any other code, routed opaquely to business logic.
    Business(i32),
}

impl SessionMessage {
    /// Classifies a raw type code for the registered phase.
    pub fn classify(code: i32) -> Self {
        match MessageType::try_from(code) {
            Ok(MessageType::Close) => SessionMessage::Close,
            Ok(MessageType::Ping) => SessionMessage::Ping,
            Ok(MessageType::Pong) => SessionMessage::Pong,
            Ok(MessageType::SendFileExisting) => SessionMessage::Upload(UploadKind::ExistingChat),
            Ok(MessageType::SendFileNew) => SessionMessage::Upload(UploadKind::NewChat),
            _ => SessionMessage::Business(code),
        }
    }
}

// ── Status codes ──────────────────────────────────────────────────────────────

/// Result of an authentication attempt, sent back as a 4-byte code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthStatus {
    Ok = 0,
    Unauthorized = 1,
    BadRequest = 2,
}

impl AuthStatus {
    /// Encodes the status as the 4-byte big-endian reply payload.
    pub fn to_payload(self) -> Vec<u8> {
        (self as i32).to_be_bytes().to_vec()
    }
}

impl TryFrom<i32> for AuthStatus {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(AuthStatus::Ok),
            1 => Ok(AuthStatus::Unauthorized),
            2 => Ok(AuthStatus::BadRequest),
            _ => Err(()),
        }
    }
}

/// Outcome of an outgoing message or file request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SendResultCode {
    Ok = 0,
    /// The messaging automation reported an error.
    ScriptError = 1,
    /// The request could not be understood.
    BadRequest = 2,
    /// The system refused to send.
    Unauthorized = 3,
    /// The target conversation does not exist.
    NoConversation = 4,
    /// File fragments stopped arriving.
    RequestTimeout = 5,
}

impl TryFrom<i32> for SendResultCode {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(SendResultCode::Ok),
            1 => Ok(SendResultCode::ScriptError),
            2 => Ok(SendResultCode::BadRequest),
            3 => Ok(SendResultCode::Unauthorized),
            4 => Ok(SendResultCode::NoConversation),
            5 => Ok(SendResultCode::RequestTimeout),
            _ => Err(()),
        }
    }
}

// ── Information frame ─────────────────────────────────────────────────────────

/// Version information pushed to every peer as soon as it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: i32,
    pub subversion: i32,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            subversion: PROTOCOL_SUBVERSION,
        }
    }
}

impl ServerInfo {
    /// Encodes as `int32 version | int32 subversion`.
    pub fn to_payload(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.subversion.to_be_bytes());
        buf
    }

    /// Decodes the 8-byte information payload.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(Self {
            version: i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            subversion: i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
