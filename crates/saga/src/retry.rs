//! Bounded retries with exponential backoff for second-phase branch calls.

use std::future::Future;
use std::time::Duration;

/// Starting delay between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum delay between attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How often and how patiently a commit or rollback is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: BACKOFF_BASE,
            multiplier: 2,
            max_backoff: BACKOFF_MAX,
        }
    }
}

/// Every attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetriesExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` and a fixed backoff.
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: backoff,
            multiplier: 1,
            max_backoff: backoff,
        }
    }

    /// Returns the delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds or the attempts are used up.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetriesExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => {
                    return Err(RetriesExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                Err(err) => {
                    let delay = self.backoff_after(attempt);
                    tracing::warn!(attempt, max_attempts, ?delay, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
