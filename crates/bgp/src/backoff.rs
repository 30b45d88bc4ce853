//! # Reconnect Backoff
//!
//! Capped exponential backoff between connection attempts to a peer.
//! Sequence with the session defaults: 1s, 2s, 4s, 8s, 16s, 32s, 60s (max).

use std::time::Duration;

/// Floor used by sessions.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);
/// Cap used by sessions.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff calculator
///
/// Each value doubles the previous one, starting at `min` and capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First value, and the value after a reset
    min: Duration,
    /// Value returned by the next call
    current: Duration,
    /// Cap
    max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl ExponentialBackoff {
    /// Create a backoff starting at `min` and never exceeding `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.min(max);
        Self { min, current: min, max }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    ///
    /// Called once a session reaches Established.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
