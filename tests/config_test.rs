use std::time::Duration;

use submitq::config::{EngineConfig, FlushPolicy};

#[test]
fn defaults_pass_validation() {
    let config = EngineConfig::default();
    config.validate().unwrap();
    assert_eq!(config.chunk_size, 100);
    assert_eq!(config.max_workers, 20);
    assert_eq!(config.flush_policy, FlushPolicy::EveryBatch);
}

#[test]
fn validate_rejects_zero_knobs() {
    let zeroed = EngineConfig {
        chunk_size: 0,
        ..EngineConfig::default()
    };
    assert!(zeroed.validate().is_err());

    let zeroed = EngineConfig {
        max_workers: 0,
        ..EngineConfig::default()
    };
    assert!(zeroed.validate().is_err());

    let zeroed = EngineConfig {
        rate_limit_per_second: 0,
        ..EngineConfig::default()
    };
    assert!(zeroed.validate().is_err());
}

/// Env overrides and the rejection path share one test: the harness runs
/// tests in parallel threads and the environment is process-global.
#[test]
fn from_env_reads_overrides_then_rejects_garbage() {
    unsafe {
        std::env::set_var("SUBMITQ_CHUNK_SIZE", "25");
        std::env::set_var("SUBMITQ_MAX_WORKERS", "8");
        std::env::set_var("SUBMITQ_BASE_BACKOFF_MS", "250");
        std::env::set_var("SUBMITQ_FLUSH_EVERY_BATCHES", "4");
    }

    let config = EngineConfig::from_env().unwrap();
    assert_eq!(config.chunk_size, 25);
    assert_eq!(config.max_workers, 8);
    assert_eq!(config.base_backoff, Duration::from_millis(250));
    assert_eq!(config.flush_policy, FlushPolicy::EveryBatches(4));

    unsafe {
        std::env::set_var("SUBMITQ_MAX_WORKERS", "lots");
    }
    assert!(EngineConfig::from_env().is_err());

    unsafe {
        std::env::remove_var("SUBMITQ_CHUNK_SIZE");
        std::env::remove_var("SUBMITQ_MAX_WORKERS");
        std::env::remove_var("SUBMITQ_BASE_BACKOFF_MS");
        std::env::remove_var("SUBMITQ_FLUSH_EVERY_BATCHES");
    }
}
