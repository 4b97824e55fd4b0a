//! Reconnect backoff and timeout utilities.
//!
//! The policy in this module is pure state: it counts consecutive failed
//! connection attempts and turns that count into a delay. It performs no I/O
//! and can be driven directly from tests.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Default cap on consecutive reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default delay unit; attempt `n` waits `n * DEFAULT_BASE_DELAY`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Linear backoff policy governing automatic reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive reconnect attempts after a failure.
    pub max_attempts: u32,
    /// Delay unit multiplied by the attempt number.
    pub base_delay: Duration,
    attempts: u32,
}

/// Outcome of asking the policy for the next reconnect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectStep {
    /// 1-based attempt number this step describes.
    pub attempt: u32,
    /// Delay to wait before attempting to connect.
    pub delay: Duration,
    /// Whether the attempt is allowed under `max_attempts`.
    pub permitted: bool,
}

impl ReconnectPolicy {
    /// Creates a policy with explicit limits and a zeroed attempt counter.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            attempts: 0,
        }
    }

    /// Number of consecutive attempts counted since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Counts a failed connection and computes the wait before the next try.
    ///
    /// Delays grow linearly: `base_delay * attempts`. Once the counter passes
    /// `max_attempts` the step is reported as not permitted; the counter keeps
    /// growing so repeated calls stay not permitted until [`reset`](Self::reset).
    pub fn next_delay(&mut self) -> ReconnectStep {
        self.attempts = self.attempts.saturating_add(1);
        let step = ReconnectStep {
            attempt: self.attempts,
            delay: self.base_delay.saturating_mul(self.attempts),
            permitted: self.attempts <= self.max_attempts,
        };
        debug!(
            event = "reconnect_step",
            attempt = step.attempt,
            max_attempts = self.max_attempts,
            delay_ms = step.delay.as_millis() as u64,
            permitted = step.permitted
        );
        step
    }

    /// Clears the attempt counter.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
