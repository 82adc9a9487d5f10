//! Operator-visible reasons for a transport pausing or stopping.

use thiserror::Error;

/// Broad failure category, used by callers to choose retry vs. abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or oversized frame.
    Protocol,
    /// Shared-secret mismatch during the handshake.
    Auth,
    /// Connectivity loss; recovered by reconnecting.
    Transient,
    /// The remote side refused us for good (version, access, conflict).
    FatalRemote,
    /// Local I/O or resource fault.
    Internal,
}

/// Which account check the relay rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountIssue {
    /// The account token could not be validated.
    Validation,
    /// The account token expired and must be refreshed.
    TokenRefresh,
    /// The account has no active subscription.
    NoSubscription,
}

/// Why a transport stopped (or paused, for [`StopReason::Connectivity`]).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopReason {
    #[error("stopped on request")]
    Requested,

    #[error("port {port} is already in use")]
    PortUnavailable { port: u16 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("lost connection to the relay")]
    Connectivity,

    #[error("the relay rejected the request as malformed")]
    BadRequest,

    #[error("this server is running an outdated protocol version")]
    Outdated,

    #[error("account rejected by the relay: {0:?}")]
    Unauthorized(AccountIssue),

    #[error("this account is connected from another location")]
    Conflict,
}

impl StopReason {
    /// The failure category, or `None` for a requested stop.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StopReason::Requested => None,
            StopReason::PortUnavailable { .. } | StopReason::Internal(_) => {
                Some(ErrorKind::Internal)
            }
            StopReason::Connectivity => Some(ErrorKind::Transient),
            StopReason::BadRequest
            | StopReason::Outdated
            | StopReason::Unauthorized(_)
            | StopReason::Conflict => Some(ErrorKind::FatalRemote),
        }
    }

    /// Whether the transport may recover on its own by reconnecting.
    pub fn is_transient(&self) -> bool {
        self.kind() == Some(ErrorKind::Transient)
    }
}
