use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::fanout::FanoutConfig;
use crate::job::{DISCOVERY_MAX_ATTEMPTS, WorkerConfig};
use crate::pool::PoolConfig;
use crate::throttle::ThrottleConfig;

/// Everything a crawler process needs, besides the database.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub worker: WorkerConfig,
    pub pool: PoolConfig,
    pub throttle: ThrottleConfig,
    pub fanout: FanoutConfig,
    pub discovery_attempts: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            pool: PoolConfig::default().with_max(worker.concurrency),
            worker,
            throttle: ThrottleConfig::default(),
            fanout: FanoutConfig::default(),
            discovery_attempts: DISCOVERY_MAX_ATTEMPTS,
        }
    }
}

impl CrawlerConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// - `UNITSCOUT_WORKER_ID`
    /// - `UNITSCOUT_CONCURRENCY` (also the browser pool's max)
    /// - `UNITSCOUT_POLL_INTERVAL_SECS`
    /// - `UNITSCOUT_POOL_MIN`
    /// - `UNITSCOUT_POOL_ACQUIRE_TIMEOUT_SECS`
    /// - `UNITSCOUT_POOL_IDLE_TIMEOUT_SECS`
    /// - `UNITSCOUT_THROTTLE_THRESHOLD`
    /// - `UNITSCOUT_THROTTLE_BASE_SECS`
    /// - `UNITSCOUT_THROTTLE_MAX_SECS`
    /// - `UNITSCOUT_MAX_QUEUE_SIZE`
    /// - `UNITSCOUT_FANOUT_CHUNK_SIZE`
    /// - `UNITSCOUT_DISCOVERY_ATTEMPTS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(id) = lookup("UNITSCOUT_WORKER_ID").filter(|v| !v.trim().is_empty()) {
            config.worker = config.worker.with_worker_id(id.trim());
        }
        if let Some(n) = positive::<usize>(&lookup, "UNITSCOUT_CONCURRENCY")? {
            config.worker = config.worker.with_concurrency(n);
        }
        if let Some(secs) = positive::<u64>(&lookup, "UNITSCOUT_POLL_INTERVAL_SECS")? {
            config.worker = config.worker.with_poll_interval(Duration::from_secs(secs));
        }

        config.pool = config.pool.with_max(config.worker.concurrency);
        if let Some(min) = parse::<usize>(&lookup, "UNITSCOUT_POOL_MIN")? {
            if min > config.pool.max {
                return Err(AppError::ConfigError(format!(
                    "UNITSCOUT_POOL_MIN ({min}) exceeds concurrency ({})",
                    config.pool.max
                )));
            }
            config.pool = config.pool.with_min(min);
        }
        if let Some(secs) = positive::<u64>(&lookup, "UNITSCOUT_POOL_ACQUIRE_TIMEOUT_SECS")? {
            config.pool.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = positive::<u64>(&lookup, "UNITSCOUT_POOL_IDLE_TIMEOUT_SECS")? {
            config.pool.idle_timeout = Duration::from_secs(secs);
        }

        if let Some(n) = positive::<u32>(&lookup, "UNITSCOUT_THROTTLE_THRESHOLD")? {
            config.throttle.blocking_threshold = n;
        }
        if let Some(secs) = positive::<u64>(&lookup, "UNITSCOUT_THROTTLE_BASE_SECS")? {
            config.throttle.base_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = positive::<u64>(&lookup, "UNITSCOUT_THROTTLE_MAX_SECS")? {
            config.throttle.max_backoff = Duration::from_secs(secs);
        }
        if config.throttle.max_backoff < config.throttle.base_backoff {
            return Err(AppError::ConfigError(
                "UNITSCOUT_THROTTLE_MAX_SECS must not be below UNITSCOUT_THROTTLE_BASE_SECS".into(),
            ));
        }

        if let Some(n) = positive::<u64>(&lookup, "UNITSCOUT_MAX_QUEUE_SIZE")? {
            config.fanout.max_queue_size = n;
        }
        if let Some(n) = positive::<usize>(&lookup, "UNITSCOUT_FANOUT_CHUNK_SIZE")? {
            config.fanout.chunk_size = n;
        }
        if let Some(n) = positive::<u32>(&lookup, "UNITSCOUT_DISCOVERY_ATTEMPTS")? {
            config.discovery_attempts = n;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|_| {
        AppError::ConfigError(format!(
            "Invalid {key} '{raw}': must be a non-negative integer"
        ))
    })
}

fn positive<T: FromStr + Default + PartialEq>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match parse::<T>(lookup, key)? {
        Some(v) if v == T::default() => {
            Err(AppError::ConfigError(format!("{key} must be at least 1")))
        }
        other => Ok(other),
    }
}
