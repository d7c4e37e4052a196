//! Dispatch throttling.
//!
//! One limiter is shared by every worker; a permit is owned by exactly one
//! caller. Permits are evenly spaced (no burst), which keeps any rolling
//! one-second window of dispatches at or under the configured rate.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::error::{Error, Result};

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Throttles outgoing batch dispatch to the remote service's tolerance.
pub struct RateLimiter {
    inner: DirectLimiter,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Result<Self> {
        if per_second == 0 {
            return Err(Error::Config(
                "rate_limit_per_second must be at least 1".into(),
            ));
        }
        let period = Duration::from_secs(1) / per_second;
        let quota = Quota::with_period(period)
            .ok_or_else(|| Error::Config("rate limit period must be non-zero".into()))?
            .allow_burst(NonZeroU32::MIN);
        Ok(Self {
            inner: GovernorLimiter::direct(quota),
        })
    }

    /// Block the calling worker until the next dispatch is permitted.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Non-blocking probe. Consumes the permit on success.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}
