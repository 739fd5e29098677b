//! # Fibonacci Backoff
//!
//! Delay before a failed work item is retried. Grows more slowly than
//! exponential backoff so a tenant waiting on a peer or a device settles
//! quickly without hammering the API server.
//!
//! Default sequence: 1s, 1s, 2s, 3s, 5s, 8s, ... capped at 60s.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, starting from `min` twice and
/// capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibonacciBackoff {
    min: Duration,
    max: Duration,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl FibonacciBackoff {
    /// Creates a backoff starting at `min` and capped at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Delay after `error_count` consecutive failures (0-indexed).
    ///
    /// Stateless: the work queue keeps the error count on each item.
    #[must_use]
    pub fn delay_for(&self, error_count: u32) -> Duration {
        let mut prev = self.min;
        let mut current = self.min;
        for _ in 1..error_count {
            let next = prev.saturating_add(current);
            prev = current;
            current = next.min(self.max);
            if current >= self.max {
                break;
            }
        }
        current.min(self.max)
    }
}
