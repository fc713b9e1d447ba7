use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// How long to wait before the next attempt. `attempt` is 1-based.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// base * 2^attempt.
    Exponential { base: Duration },
    /// step * attempt.
    Linear { step: Duration },
}

/// Bounded retry schedule shared by the page fetcher, the existence resolver
/// and the upsert sink.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base },
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear { step },
        }
    }

    pub fn attempts(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            // Cap the shift so a misconfigured budget can't overflow.
            Backoff::Exponential { base } => base.saturating_mul(1u32 << attempt.min(16)),
            Backoff::Linear { step } => step.saturating_mul(attempt),
        }
    }

    /// Run a fallible async operation under this schedule, sleeping between
    /// attempts. Returns the last error once the budget is exhausted.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in self.attempts() {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt < self.max_attempts {
                        let wait = self.delay_for(attempt);
                        warn!(
                            attempt,
                            max = self.max_attempts,
                            wait_s = wait.as_secs_f64(),
                            error = %e,
                            "operation failed; retrying"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry budget was zero")))
    }
}
