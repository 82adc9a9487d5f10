//! Thread-safe allocator for direct-connection session ids.
//!
//! Relay sessions use the connection id handed out by the relay, but direct
//! TCP connections have no external identity, so the listener numbers them
//! itself.  Ids are never reused for the lifetime of a transport, which keeps
//! a stale timer or a late callback from ever addressing a newer connection
//! that happens to share a slot.
//!
//! # Thread safety
//!
//! The counter is an `AtomicU64`; `fetch_add` hands out each value exactly
//! once even when several accept tasks race.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::session::SessionId;

/// Hands out [`SessionId::Direct`] values starting at 1.
///
/// # Examples
///
/// ```rust
/// use airlink_core::domain::{ids::ConnectionIdAllocator, session::SessionId};
///
/// let ids = ConnectionIdAllocator::new();
/// assert_eq!(ids.next(), SessionId::Direct(1));
/// assert_eq!(ids.next(), SessionId::Direct(2));
/// ```
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    inner: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns a fresh id. `Relaxed` is enough: only uniqueness matters.
    pub fn next(&self) -> SessionId {
        SessionId::Direct(self.inner.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.inner.load(Ordering::Relaxed) - 1
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_id_is_one() {
        // Arrange
        let ids = ConnectionIdAllocator::new();

        // Act
        let first = ids.next();

        // Assert
        assert_eq!(first, SessionId::Direct(1));
    }

    #[test]
    fn test_issued_counts_handed_out_ids() {
        let ids = ConnectionIdAllocator::default();
        assert_eq!(ids.issued(), 0);
        ids.next();
        ids.next();
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        // Arrange
        let ids = Arc::new(ConnectionIdAllocator::new());
        let thread_count = 8;
        let per_thread = 500;

        // Act – allocate from many threads simultaneously
        let handles: Vec<_> = (0..thread_count)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..per_thread).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<SessionId> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no duplicates
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), thread_count * per_thread);
    }
}
