//! Reconnection backoff for the relay link.
//!
//! The nth consecutive reconnection waits `2^(n-1)` seconds plus a jitter in
//! `[0, 1)` seconds.  The exponent stops growing at [`MAX_EXPONENT`], so at
//! steady state the link retries roughly every 256 s.
//!
//! The attempt counter is only reset by [`ReconnectBackoff::reset`], which the
//! relay transport calls when the relay confirms the link with
//! `connection-ok`.  A TCP/WebSocket connection that opens and then fails the
//! relay handshake does **not** reset it.

use std::time::Duration;

/// Largest exponent used for the base delay (2^8 = 256 s).
pub const MAX_EXPONENT: u32 = 8;

/// Attempt counter and delay calculator.
#[derive(Debug, Clone, Default)]
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Number of reconnections scheduled since the last reset, capped.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the delay for the next reconnection and advances the counter.
    ///
    /// `jitter` is a fraction of a second; values outside `[0, 1)` are clamped.
    pub fn next_delay(&mut self, jitter: f64) -> Duration {
        let exponent = self.attempt.min(MAX_EXPONENT);
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 0.999_999)
        } else {
            0.0
        };
        if self.attempt < MAX_EXPONENT {
            self.attempt += 1;
        }
        Duration::from_secs(1u64 << exponent) + Duration::from_secs_f64(jitter)
    }

    /// Clears the counter after a fully successful reconnection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
