//! Engine configuration.
//!
//! Typed knobs with working defaults, optionally overridden from
//! `SUBMITQ_*` environment variables. Loads once at startup and fails fast
//! on anything unparseable.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// When the checkpoint writer rewrites the snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Rewrite after every committed batch.
    EveryBatch,
    /// Rewrite after every `n` committed batches (and always on the last).
    /// Widens the resubmission window on crash by at most `n - 1` batches.
    EveryBatches(u32),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Items per remote call. The engine behaves identically at 1.
    pub chunk_size: usize,
    /// Concurrent workers pulling batches.
    pub max_workers: usize,
    /// Total submission attempts per batch for transient failures.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub rate_limit_per_second: u32,
    /// Deadline applied to every remote call; elapsing counts as transient.
    pub submit_timeout: Duration,
    /// Whole-batch persistence attempts before the job aborts.
    pub persist_retries: u32,
    pub flush_policy: FlushPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_workers: 20,
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            rate_limit_per_second: 10,
            submit_timeout: Duration::from_secs(30),
            persist_retries: 3,
            flush_policy: FlushPolicy::EveryBatch,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `SUBMITQ_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("SUBMITQ_CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        if let Some(v) = env_parse("SUBMITQ_MAX_WORKERS")? {
            config.max_workers = v;
        }
        if let Some(v) = env_parse("SUBMITQ_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(ms) = env_parse::<u64>("SUBMITQ_BASE_BACKOFF_MS")? {
            config.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SUBMITQ_MAX_BACKOFF_MS")? {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("SUBMITQ_RATE_LIMIT_PER_SECOND")? {
            config.rate_limit_per_second = v;
        }
        if let Some(ms) = env_parse::<u64>("SUBMITQ_SUBMIT_TIMEOUT_MS")? {
            config.submit_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("SUBMITQ_PERSIST_RETRIES")? {
            config.persist_retries = v;
        }
        if let Some(n) = env_parse::<u32>("SUBMITQ_FLUSH_EVERY_BATCHES")? {
            config.flush_policy = if n <= 1 {
                FlushPolicy::EveryBatch
            } else {
                FlushPolicy::EveryBatches(n)
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".into()));
        }
        if self.rate_limit_per_second == 0 {
            return Err(Error::Config(
                "rate_limit_per_second must be at least 1".into(),
            ));
        }
        if self.persist_retries == 0 {
            return Err(Error::Config("persist_retries must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}
