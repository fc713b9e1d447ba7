use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::util::env::{env_opt, env_parse};

/// Run-wide tunables, all env-overridable.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Candidate page sizes, largest first. A size that keeps failing
    /// degrades to the next smaller one before the page is given up on.
    pub page_sizes: Vec<u32>,
    pub between_pages_delay: Duration,
    pub post_batch_delay: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    /// Base for exponential backoff (delay = base * 2^attempt).
    pub retry_base: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            page_sizes: vec![100, 50, 25],
            between_pages_delay: Duration::from_secs(1),
            post_batch_delay: Duration::from_secs(1),
            max_retries: 4,
            request_timeout: Duration::from_secs(60),
            retry_base: Duration::from_secs(1),
        }
    }
}

/// `Duration::from_secs_f64` panics on negative input; treat a negative
/// configured delay as "no delay".
fn delay_secs(raw: f64) -> Duration {
    Duration::from_secs_f64(raw.max(0.0))
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let page_sizes = env_opt("PAGE_SIZES")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|s| s.trim().parse().ok())
                    .collect::<Vec<u32>>()
            })
            .filter(|sizes| !sizes.is_empty())
            .unwrap_or(defaults.page_sizes);
        Self {
            page_sizes,
            between_pages_delay: delay_secs(env_parse("BETWEEN_PAGES_DELAY", 1.0)),
            post_batch_delay: delay_secs(env_parse("POST_BATCH_DELAY", 1.0)),
            max_retries: env_parse("MAX_RETRIES", 4u32),
            request_timeout: Duration::from_secs(env_parse("REQ_TIMEOUT", 60u64)),
            retry_base: Duration::from_millis(env_parse("RETRY_BASE_MS", 1000u64)),
        }
    }

    /// Transient-failure schedule shared by the fetcher and the sink.
    pub fn transient_backoff(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.retry_base)
    }
}
