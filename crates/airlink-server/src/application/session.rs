//! Shared handle for one logical remote client.
//!
//! A [`Session`] is created by the transport that accepted the connection and
//! handed to the session manager inside `TransportEvent::Opened`.  Both sides
//! hold an `Arc`:
//!
//! - the transport reads [`Session::is_registered`] when it fans a sensitive
//!   broadcast out to its connections;
//! - the session manager drives the lifecycle and owns the timers.
//!
//! # The per-session lock
//!
//! Lifecycle state and the handles of the handshake and ping timers live
//! behind one `tokio::sync::Mutex`.  A timer that fires must take this lock
//! and *remove its own handle* before acting; a close takes the same lock and
//! aborts whatever handles are still present.  Whichever gets the lock first
//! wins, and the loser sees either a missing handle or a non-live state and
//! does nothing.  That is what makes "timer fires while business logic closes
//! the session" a safe no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use airlink_core::domain::session::InvalidTransition;
use airlink_core::{SessionId, SessionLifecycle, SessionState};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::AbortHandle;

/// State guarded by the per-session lock.
#[derive(Debug, Default)]
pub struct SessionInner {
    pub lifecycle: SessionLifecycle,
    pub handshake_timer: Option<AbortHandle>,
    pub ping_timer: Option<AbortHandle>,
}

impl SessionInner {
    /// Aborts every pending timer.
    pub fn cancel_timers(&mut self) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.ping_timer.take() {
            timer.abort();
        }
    }
}

/// One logical remote client, independent of transport.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    registered: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            registered: AtomicBool::new(false),
            inner: Mutex::new(SessionInner::default()),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Lock-free view of "currently Registered", for transport writers.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.lifecycle.state()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    /// AwaitingHandshake → Registered, cancelling the handshake timer.
    pub(crate) fn register(&self, inner: &mut SessionInner) -> Result<(), InvalidTransition> {
        inner.lifecycle.register()?;
        if let Some(timer) = inner.handshake_timer.take() {
            timer.abort();
        }
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    /// Starts teardown. Returns `false` if teardown already started.
    pub(crate) fn begin_close(&self, inner: &mut SessionInner) -> bool {
        let started = inner.lifecycle.begin_close();
        if started {
            self.registered.store(false, Ordering::Release);
            inner.cancel_timers();
        }
        started
    }

    /// Marks the session closed. Returns `false` if it already was.
    pub(crate) fn finish(&self, inner: &mut SessionInner) -> bool {
        let finished = inner.lifecycle.finish();
        if finished {
            self.registered.store(false, Ordering::Release);
            inner.cancel_timers();
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_registered_flag_follows_lifecycle() {
        // Arrange
        let session = Session::new(SessionId::Direct(1));
        assert!(!session.is_registered());

        // Act / Assert
        {
            let mut inner = session.lock().await;
            session.register(&mut inner).unwrap();
        }
        assert!(session.is_registered());
        assert_eq!(session.state().await, SessionState::Registered);

        {
            let mut inner = session.lock().await;
            assert!(session.begin_close(&mut inner));
        }
        assert!(!session.is_registered());
    }

    #[tokio::test]
    async fn test_begin_close_aborts_pending_timers() {
        // Arrange: a timer that would flip a flag if it ever ran
        let session = Session::new(SessionId::Relay(4));
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = Arc::clone(&fired);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                fired.store(true, Ordering::SeqCst);
            });
            session.lock().await.ping_timer = Some(timer.abort_handle());
        }

        // Act
        {
            let mut inner = session.lock().await;
            session.begin_close(&mut inner);
            assert!(inner.ping_timer.is_none());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Assert
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finish_twice_reports_once() {
        let session = Session::new(SessionId::Direct(9));
        let mut inner = session.lock().await;
        assert!(session.finish(&mut inner));
        assert!(!session.finish(&mut inner));
    }
}
