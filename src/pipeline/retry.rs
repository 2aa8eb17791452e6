//! Retry with fixed or exponential backoff for flaky collaborators.

use crate::error::{Result, SamleError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `initial`, doubled after each failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run once, no retries.
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Run `op` until it succeeds or attempts run out. `op` gets the 1-based
    /// attempt number. Cancellation and missing tools are never retried.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !Self::is_retryable(&e) || attempt >= self.attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        label, attempt, self.attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn is_retryable(error: &SamleError) -> bool {
        !matches!(error, SamleError::Cancelled | SamleError::ToolNotFound(_))
    }
}
