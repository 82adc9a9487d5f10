//! Per-session lifecycle state machine.
//!
//! ```text
//!  AwaitingHandshake ──register──▶ Registered
//!         │                            │
//!         └──────begin_close───────────┴──▶ Closing ──finish──▶ Closed
//!         └────────────────────finish─────────────────────────▶ Closed
//! ```
//!
//! The machine is pure: it knows nothing about sockets or timers.  The
//! server's session manager wraps it in a per-session lock and drives it from
//! transport events, timer expiry, and business-logic requests.

use std::fmt;

/// Opaque identifier of one logical remote client.
///
/// Direct connections are numbered locally; relay connections use the id the
/// relay assigned, so the two namespaces are kept apart by the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SessionId {
    Direct(u64),
    Relay(i32),
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Direct(n) => write!(f, "direct-{n}"),
            SessionId::Relay(n) => write!(f, "relay-{n}"),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected; only `authenticate` and `close` are meaningful.
    AwaitingHandshake,
    /// Authenticated; may exchange business messages.
    Registered,
    /// Teardown has begun; inbound traffic is ignored.
    Closing,
    /// Gone from the active set.
    Closed,
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Lifecycle of one session.
#[derive(Debug, Clone)]
pub struct SessionLifecycle {
    state: SessionState,
    registered: bool,
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifecycle {
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingHandshake,
            registered: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session ever completed the handshake.
    ///
    /// Stays `true` through `Closing` and `Closed` so teardown can tell whether
    /// business logic was told about the session.
    pub fn was_registered(&self) -> bool {
        self.registered
    }

    /// Whether the session is currently `Registered`.
    pub fn is_registered(&self) -> bool {
        self.state == SessionState::Registered
    }

    /// AwaitingHandshake → Registered. Happens at most once.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] from any other state.
    pub fn register(&mut self) -> Result<(), InvalidTransition> {
        if self.state != SessionState::AwaitingHandshake {
            return Err(InvalidTransition {
                from: self.state,
                to: SessionState::Registered,
            });
        }
        self.state = SessionState::Registered;
        self.registered = true;
        Ok(())
    }

    /// Moves to `Closing`. Returns `false` if teardown already started.
    pub fn begin_close(&mut self) -> bool {
        match self.state {
            SessionState::AwaitingHandshake | SessionState::Registered => {
                self.state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Moves to `Closed` from any state. Returns `false` if already closed.
    pub fn finish(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }
}
