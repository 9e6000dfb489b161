//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciliations. The delay grows along the Fibonacci sequence
//! with the number of consecutive failures of a request, capped at a maximum. Counting from
//! the first failure the delays are 1s, 2s, 3s, 5s, 8s, ... 300s with the default bounds.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Stateless: the work queue counts failures per request and asks for the matching delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FibonacciBackoff {
    /// Delay for the first two failures, in seconds
    min_seconds: u64,
    /// Cap on the delay, in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a backoff with the given bounds in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            max_seconds: max_seconds.max(min_seconds),
        }
    }

    /// Delay before retrying a request that has failed `failures` times in a row
    ///
    /// `failures` 0 and 1 both give the minimum; from there each delay is the sum of the two
    /// before it.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let mut prev = self.min_seconds;
        let mut current = self.min_seconds;

        for _ in 2..=failures {
            // A zero minimum never grows
            if current >= self.max_seconds || current == 0 {
                break;
            }
            let next = prev.saturating_add(current);
            prev = current;
            current = next;
        }

        Duration::from_secs(current.min(self.max_seconds))
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, 300)
    }
}
