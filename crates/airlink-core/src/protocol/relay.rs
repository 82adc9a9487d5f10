//! Outer protocol spoken with the cloud relay.
//!
//! Every WebSocket binary message on the relay link is one outer message:
//! ```text
//! [outer_type:i32][connection_id:i32]?[inner bytes]?
//! ```
//!
//! | outer_type | name                   | fields                        |
//! |------------|------------------------|-------------------------------|
//! | 0          | connection-ok          | none                          |
//! | 200        | server-open            | connection_id                 |
//! | 201        | server-close           | connection_id                 |
//! | 210        | server-proxy           | connection_id, inner frame    |
//! | 211        | server-proxy-broadcast | inner frame                   |
//!
//! Type 100 (client-proxy) belongs to the client side of the relay and is
//! rejected here.  When the relay closes the link, its WebSocket close code
//! is mapped to a [`StopReason`] by [`close_reason`].

use thiserror::Error;

use crate::domain::status::{AccountIssue, StopReason};
use crate::protocol::codec::read_i32;

/// Errors decoding an outer relay message.
#[derive(Debug, Error, PartialEq)]
pub enum RelayError {
    #[error("relay message truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported relay message type: {0}")]
    UnsupportedType(i32),
}

/// Outer message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RelayMessageType {
    ConnectionOk = 0,
    ClientProxy = 100,
    ServerOpen = 200,
    ServerClose = 201,
    ServerProxy = 210,
    ServerProxyBroadcast = 211,
}

impl TryFrom<i32> for RelayMessageType {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, ()> {
        match value {
            0 => Ok(RelayMessageType::ConnectionOk),
            100 => Ok(RelayMessageType::ClientProxy),
            200 => Ok(RelayMessageType::ServerOpen),
            201 => Ok(RelayMessageType::ServerClose),
            210 => Ok(RelayMessageType::ServerProxy),
            211 => Ok(RelayMessageType::ServerProxyBroadcast),
            _ => Err(()),
        }
    }
}

/// One outer message on the relay link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// The relay accepted this server; the link is live.
    ConnectionOk,
    /// A client connected through the relay.
    ServerOpen { connection_id: i32 },
    /// A client went away (relay → server) or should be dropped (server → relay).
    ServerClose { connection_id: i32 },
    /// Inner frame bytes for one client.
    ServerProxy { connection_id: i32, payload: Vec<u8> },
    /// Inner frame bytes for every client of this server.
    ServerProxyBroadcast { payload: Vec<u8> },
}

impl RelayMessage {
    pub fn message_type(&self) -> RelayMessageType {
        match self {
            RelayMessage::ConnectionOk => RelayMessageType::ConnectionOk,
            RelayMessage::ServerOpen { .. } => RelayMessageType::ServerOpen,
            RelayMessage::ServerClose { .. } => RelayMessageType::ServerClose,
            RelayMessage::ServerProxy { .. } => RelayMessageType::ServerProxy,
            RelayMessage::ServerProxyBroadcast { .. } => RelayMessageType::ServerProxyBroadcast,
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encodes an outer relay message.
pub fn encode_relay_message(msg: &RelayMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(msg.message_type() as i32).to_be_bytes());
    match msg {
        RelayMessage::ConnectionOk => {}
        RelayMessage::ServerOpen { connection_id } | RelayMessage::ServerClose { connection_id } => {
            buf.extend_from_slice(&connection_id.to_be_bytes());
        }
        RelayMessage::ServerProxy {
            connection_id,
            payload,
        } => {
            buf.extend_from_slice(&connection_id.to_be_bytes());
            buf.extend_from_slice(payload);
        }
        RelayMessage::ServerProxyBroadcast { payload } => buf.extend_from_slice(payload),
    }
    buf
}

/// Decodes an outer relay message.
///
/// # Errors
///
/// Returns [`RelayError`] for short input or a type a server cannot receive.
pub fn decode_relay_message(bytes: &[u8]) -> Result<RelayMessage, RelayError> {
    let outer = read_i32(bytes, 0).map_err(|_| RelayError::Truncated {
        needed: 4,
        available: bytes.len(),
    })?;
    let ty = RelayMessageType::try_from(outer).map_err(|_| RelayError::UnsupportedType(outer))?;

    let connection_id = || {
        read_i32(bytes, 4).map_err(|_| RelayError::Truncated {
            needed: 8,
            available: bytes.len(),
        })
    };

    match ty {
        RelayMessageType::ConnectionOk => Ok(RelayMessage::ConnectionOk),
        RelayMessageType::ServerOpen => Ok(RelayMessage::ServerOpen {
            connection_id: connection_id()?,
        }),
        RelayMessageType::ServerClose => Ok(RelayMessage::ServerClose {
            connection_id: connection_id()?,
        }),
        RelayMessageType::ServerProxy => Ok(RelayMessage::ServerProxy {
            connection_id: connection_id()?,
            payload: bytes[8..].to_vec(),
        }),
        RelayMessageType::ServerProxyBroadcast => Ok(RelayMessage::ServerProxyBroadcast {
            payload: bytes[4..].to_vec(),
        }),
        RelayMessageType::ClientProxy => Err(RelayError::UnsupportedType(outer)),
    }
}

// ── Close codes ───────────────────────────────────────────────────────────────

/// WebSocket and relay-specific close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const ABNORMAL: u16 = 1006;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const SERVICE_RESTART: u16 = 1012;
    pub const TRY_AGAIN_LATER: u16 = 1013;
    pub const NO_GROUP: u16 = 4000;
    pub const NO_CAPACITY: u16 = 4001;
    pub const ACCOUNT_VALIDATION: u16 = 4002;
    pub const SERVER_TOKEN_REFRESH: u16 = 4003;
    pub const NO_SUBSCRIPTION: u16 = 4004;
    pub const OTHER_LOCATION: u16 = 4005;
}

/// Maps the relay's close code (`None` if the link dropped without a close
/// frame) to the reason reported upstream.
///
/// Only [`StopReason::Connectivity`] is retried; every other reason is
/// terminal and surfaced to the operator.
pub fn close_reason(code: Option<u16>) -> StopReason {
    use close_code::*;

    match code {
        None
        | Some(NORMAL)
        | Some(GOING_AWAY)
        | Some(ABNORMAL)
        | Some(INTERNAL_ERROR)
        | Some(SERVICE_RESTART)
        | Some(TRY_AGAIN_LATER) => StopReason::Connectivity,
        Some(PROTOCOL_ERROR) | Some(NO_GROUP) | Some(NO_CAPACITY) => StopReason::BadRequest,
        Some(POLICY_VIOLATION) => StopReason::Outdated,
        Some(ACCOUNT_VALIDATION) => StopReason::Unauthorized(AccountIssue::Validation),
        Some(SERVER_TOKEN_REFRESH) => StopReason::Unauthorized(AccountIssue::TokenRefresh),
        Some(NO_SUBSCRIPTION) => StopReason::Unauthorized(AccountIssue::NoSubscription),
        Some(OTHER_LOCATION) => StopReason::Conflict,
        Some(_) => StopReason::Connectivity,
    }
}
