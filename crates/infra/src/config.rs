//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::processor::ProcessorConfig;
use crate::jobs::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the worker binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub meili_url: String,
    pub meili_master_key: Option<String>,
    /// How long to wait for the engine to finish an enqueued write
    pub meili_task_timeout: Duration,
    pub index_name: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub max_concurrency: usize,
    pub backoff_base: Duration,
    /// `None` when stale reclaim is disabled
    pub stale_after: Option<Duration>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let stale_after_secs: u64 = parse_or(&get, "WORKER_STALE_AFTER_SECS", 600)?;

        Ok(Self {
            database_url,
            database_max_connections: positive(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            meili_url: get("MEILI_URL").unwrap_or_else(|| "http://localhost:7700".to_string()),
            meili_master_key: get("MEILI_MASTER_KEY"),
            meili_task_timeout: Duration::from_millis(positive(
                &get,
                "MEILI_TASK_TIMEOUT_MS",
                10_000,
            )?),
            index_name: get("SEARCH_INDEX_NAME").unwrap_or_else(|| "programs".to_string()),
            poll_interval: Duration::from_millis(positive(&get, "WORKER_POLL_INTERVAL_MS", 5000)?),
            batch_size: positive(&get, "WORKER_BATCH_SIZE", 10)?,
            max_attempts: positive(&get, "WORKER_MAX_ATTEMPTS", 5)?,
            max_concurrency: positive(&get, "WORKER_MAX_CONCURRENCY", 4)?,
            backoff_base: Duration::from_secs(positive(&get, "WORKER_BACKOFF_BASE_SECS", 10)?),
            stale_after: (stale_after_secs > 0).then(|| Duration::from_secs(stale_after_secs)),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig::default()
            .with_index_name(self.index_name.clone())
            .with_batch_size(self.batch_size)
            .with_max_concurrency(self.max_concurrency)
            .with_stale_after(self.stale_after)
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let parsed = parse_or(get, var, default)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: get(var).unwrap_or_default(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}
