//! Bounded retry with doubling backoff
//!
//! Used around every dispatched handler and around the connection liveness
//! check. Only errors that report themselves as retryable are repeated; the
//! backoff sleeps are tokio timers, so waiting never blocks a worker.

use log::{error, warn};
use std::future::Future;
use std::time::Duration;

use crate::error::{DbError, DbResult};

/// How many times to try an operation and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after every failure
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    /// Policy for dispatched commands: 3 attempts, 500ms then 1s
    pub const fn dispatch() -> Self {
        Self::new(3, Duration::from_millis(500))
    }

    /// Policy for the connection liveness check: 3 attempts, 1s then 2s
    pub const fn connection() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }

    /// Delay slept after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. Exhaustion is reported as `OperationFailed`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    error!("{} failed after {} attempts: {}", operation, attempt, e);
                    return Err(DbError::OperationFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} attempt {}/{} failed, retrying in {}ms: {}",
                        operation,
                        attempt,
                        max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::dispatch()
    }
}
