//! The transport abstraction shared by the direct and relay transports.
//!
//! The session manager depends only on the [`Transport`] trait.  A transport
//! reports what happens on the wire as [`TransportEvent`]s on an unbounded
//! channel and accepts outbound work as [`Outbound`] entries, which it writes
//! from a single writer in FIFO order so frames for different sessions never
//! interleave.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use airlink_core::{Frame, SessionId, StopReason};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::application::session::Session;

/// Callback run by the writer once an outbound entry has been written.
pub type OnSent = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned by [`Transport::start`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening port is taken by another process.
    #[error("port {port} is already in use")]
    PortInUse {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Binding failed for another reason (permissions, bad address).
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("transport was already started")]
    AlreadyStarted,

    #[error("internal transport error: {0}")]
    Internal(String),
}

impl TransportError {
    /// The reason reported through `TransportEvent::Stopped` for this failure.
    pub fn stop_reason(&self) -> StopReason {
        match self {
            TransportError::PortInUse { port, .. } => StopReason::PortUnavailable { port: *port },
            other => StopReason::Internal(other.to_string()),
        }
    }
}

/// Who an outbound frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Session(SessionId),
    Broadcast,
}

/// One entry in a transport's writer queue.
pub struct Outbound {
    pub target: Target,
    pub frame: Frame,
    /// Broadcasts of sensitive frames skip sessions that are not Registered.
    pub sensitive: bool,
    pub on_sent: Option<OnSent>,
}

impl Outbound {
    pub fn new(target: Target, frame: Frame, sensitive: bool) -> Self {
        Self {
            target,
            frame,
            sensitive,
            on_sent: None,
        }
    }

    pub fn with_on_sent(mut self, on_sent: OnSent) -> Self {
        self.on_sent = Some(on_sent);
        self
    }

    /// Whether this entry should be written to `session`.
    pub fn delivers_to(&self, session: &Session) -> bool {
        match self.target {
            Target::Session(id) => id == session.id(),
            Target::Broadcast => !self.sensitive || session.is_registered(),
        }
    }

    /// Runs the sent callback, if any.
    pub fn complete(&mut self) {
        if let Some(on_sent) = self.on_sent.take() {
            on_sent();
        }
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("target", &self.target)
            .field("message_type", &self.frame.message_type)
            .field("payload_len", &self.frame.payload.len())
            .field("sensitive", &self.sensitive)
            .field("on_sent", &self.on_sent.is_some())
            .finish()
    }
}

/// What a transport reports to the session manager.
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport is live and accepting sessions.
    Started,
    /// Connectivity was lost; the transport is reconnecting on its own.
    Paused(StopReason),
    /// The transport stopped and will not recover without a new start.
    Stopped(StopReason),
    /// A new physical or multiplexed connection.
    Opened(Arc<Session>),
    /// A connection is gone. Reported once per session.
    Closed(SessionId),
    /// One inbound frame.
    Frame {
        session: SessionId,
        frame: Frame,
        encrypted_in_transit: bool,
    },
}

/// Capability set shared by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts the transport, reporting events on `events`.
    ///
    /// A start failure is returned *and* reported once as
    /// `TransportEvent::Stopped`.
    async fn start(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError>;

    /// Gracefully closes every session and tears the transport down.
    async fn stop(&self);

    /// Queues a frame on the transport's single writer.
    fn send(&self, outbound: Outbound);

    /// Drops one connection without a close frame.
    ///
    /// Queued behind earlier sends, so a close frame sent just before is
    /// flushed first.
    fn disconnect(&self, session: SessionId);

    /// Ids of every connection currently open.
    async fn connections(&self) -> Vec<SessionId>;

    /// Whether the link itself is encrypted (payloads need no envelope).
    fn encrypts_in_transit(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sensitive_broadcast_skips_unregistered_session() {
        let pending = Session::new(SessionId::Direct(1));
        let outbound = Outbound::new(Target::Broadcast, Frame::new(2, vec![]), true);
        assert!(!outbound.delivers_to(&pending));

        let plain = Outbound::new(Target::Broadcast, Frame::new(2, vec![]), false);
        assert!(plain.delivers_to(&pending));
    }

    #[tokio::test]
    async fn test_targeted_send_reaches_only_its_session() {
        let a = Session::new(SessionId::Relay(1));
        let b = Session::new(SessionId::Relay(2));
        let outbound = Outbound::new(Target::Session(a.id()), Frame::new(2, vec![]), true);
        assert!(outbound.delivers_to(&a));
        assert!(!outbound.delivers_to(&b));
    }

    #[test]
    fn test_complete_runs_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut outbound = Outbound::new(Target::Broadcast, Frame::new(2, vec![]), false)
            .with_on_sent(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        outbound.complete();
        outbound.complete();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_port_in_use_maps_to_port_unavailable() {
        let err = TransportError::PortInUse {
            port: 1359,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(err.stop_reason(), StopReason::PortUnavailable { port: 1359 });
        assert!(matches!(
            TransportError::AlreadyStarted.stop_reason(),
            StopReason::Internal(_)
        ));
    }
}
