//! Exponential-backoff retry around the remote seam.
//!
//! All sleeping goes through the [`Sleeper`] trait, so retry timing is
//! unit-testable without waiting the delays out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::remote::RemoteError;

/// How to wait between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, dur: Duration);
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Bounded exponential backoff for remote submissions.
///
/// Only `Transient` and `RateLimited` failures are retried; `Fatal` errors
/// short-circuit. Rate-limited failures draw from their own, larger attempt
/// budget so expected throttling does not exhaust the ordinary retry
/// allowance.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts (including the first call) for transient failures.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempt budget for rate-limited failures, tracked separately.
    pub rate_limited_max_retries: u32,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
            rate_limited_max_retries: max_retries.saturating_mul(2),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_rate_limited_budget(mut self, attempts: u32) -> Self {
        self.rate_limited_max_retries = attempts;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails fatally, or a budget runs out.
    /// Returns the last error when retries are exhausted.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut transient_attempts = 0u32;
        let mut rate_limited_attempts = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err @ RemoteError::Fatal(_)) => return Err(err),
                Err(err @ RemoteError::Transient(_)) => {
                    transient_attempts += 1;
                    if transient_attempts >= self.max_retries {
                        return Err(err);
                    }
                    let delay = self.delay_for(transient_attempts);
                    debug!(attempt = transient_attempts, ?delay, "transient failure, backing off");
                    self.sleeper.sleep(delay).await;
                }
                Err(err @ RemoteError::RateLimited(_)) => {
                    rate_limited_attempts += 1;
                    if rate_limited_attempts >= self.rate_limited_max_retries {
                        return Err(err);
                    }
                    // Throttling always waits at least one extra backoff step.
                    let delay = self.delay_for(rate_limited_attempts + 1);
                    debug!(attempt = rate_limited_attempts, ?delay, "rate limited, backing off");
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }
}
