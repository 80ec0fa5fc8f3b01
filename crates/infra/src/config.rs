//! Configuration loading and representation.
//!
//! Values come from environment variables (a `.env` file is honoured by the binaries).
//!
//! | Env Var | Default |
//! |---------|---------|
//! | `DATABASE_URL` | unset (in-memory store) |
//! | `REDIS_URL` | unset (in-memory status channel) |
//! | `BIND_ADDR` | `0.0.0.0:8080` |
//! | `WORKER_POLL_INTERVAL_MS` | `2000` |
//! | `RETRY_BASE_DELAY_MS` | `1000` |
//! | `RETRY_MAX_DELAY_MS` | `30000` |
//! | `JOB_TIMEOUT_SECS` | `30` |
//! | `JOB_TIMEOUT_<TYPE>_SECS` | `JOB_TIMEOUT_SECS` |
//! | `STUCK_THRESHOLD_SECS` | `300` |
//! | `SWEEP_INTERVAL_SECS` | `300` |
//! | `DEAD_LETTER_AFTER_SECS` | `3600` |
//! | `RETENTION_DAYS` | `7` |
//! | `PRUNE_INTERVAL_SECS` | `86400` |
//! | `EXTRACTOR_URL` / `GENERATOR_URL` | unset |

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::{BackoffPolicy, JobType, SweeperConfig, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Inconsistent(String),
}

/// Full pipeline configuration shared by the API, worker and sweeper processes.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub worker: WorkerConfig,
    pub sweeper: SweeperConfig,
    pub extractor_url: Option<String>,
    pub generator_url: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests use a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let backoff = BackoffPolicy::new(
            Duration::from_millis(env.parse_or("RETRY_BASE_DELAY_MS", 1000u64)?),
            Duration::from_millis(env.parse_or("RETRY_MAX_DELAY_MS", 30_000u64)?),
        );

        let default_timeout = Duration::from_secs(env.parse_or("JOB_TIMEOUT_SECS", 30u64)?);
        let mut timeouts = HashMap::new();
        for job_type in JobType::ALL {
            let key = format!("JOB_TIMEOUT_{}_SECS", job_type.as_str().to_ascii_uppercase());
            if let Some(secs) = env.parse::<u64>(&key)? {
                timeouts.insert(job_type, Duration::from_secs(secs));
            }
        }

        let worker = WorkerConfig {
            poll_interval: Duration::from_millis(env.parse_or("WORKER_POLL_INTERVAL_MS", 2000u64)?),
            backoff,
            default_timeout,
            timeouts,
            ..WorkerConfig::default()
        };

        let retention_days: u64 = env.parse_or("RETENTION_DAYS", 7u64)?;
        let sweeper = SweeperConfig {
            interval: Duration::from_secs(env.parse_or("SWEEP_INTERVAL_SECS", 300u64)?),
            stuck_threshold: Duration::from_secs(env.parse_or("STUCK_THRESHOLD_SECS", 300u64)?),
            dead_letter_after: Duration::from_secs(env.parse_or("DEAD_LETTER_AFTER_SECS", 3600u64)?),
            retention: Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)),
            prune_interval: Duration::from_secs(env.parse_or("PRUNE_INTERVAL_SECS", 86_400u64)?),
            backoff,
        };

        let config = Self {
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            bind_addr: env.parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            worker,
            sweeper,
            extractor_url: env.string("EXTRACTOR_URL"),
            generator_url: env.string("GENERATOR_URL"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let backoff = &self.worker.backoff;
        if backoff.base_delay.is_zero() || backoff.base_delay > backoff.max_delay {
            return Err(ConfigError::Inconsistent(format!(
                "retry base delay ({:?}) must be non-zero and not exceed the max delay ({:?})",
                backoff.base_delay, backoff.max_delay
            )));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "WORKER_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        if self.sweeper.interval.is_zero() || self.sweeper.prune_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "sweep and prune intervals must be positive".to_string(),
            ));
        }

        // A job still inside its handler timeout must never look stuck.
        let max_timeout = self.worker.max_timeout();
        if self.sweeper.stuck_threshold <= max_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "STUCK_THRESHOLD_SECS ({}s) must exceed the largest handler timeout ({}s)",
                self.sweeper.stuck_threshold.as_secs(),
                max_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value, trimmed.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                    reason: e.to_string(),
                }),
        }
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }
}
