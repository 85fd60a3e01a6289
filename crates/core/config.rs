//! Configuration types for the worker pool.

use std::time::Duration;

use crate::error::{Result, RowqError};
use crate::filter::PopFilter;
use crate::task::TaskStatus;

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Namespace prefix for the task table.
    pub namespace: String,
    /// Number of worker loops to spawn.
    pub num_workers: usize,
    /// Sleep between poll attempts.
    pub poll_gap: Duration,
    /// Which tasks the workers claim.
    pub filter: PopFilter,
    /// Stop each worker after this many poll attempts (`None`: run forever).
    pub tries: Option<usize>,
    /// Reset orphaned `in_progress` tasks before spawning workers.
    pub cleanup_on_start: bool,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            namespace: "rowq".to_string(),
            num_workers: 1,
            poll_gap: Duration::from_secs(1),
            filter: PopFilter::default(),
            tries: None,
            cleanup_on_start: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Load configuration from `ROWQ_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// - `ROWQ_NAMESPACE`
    /// - `ROWQ_WORKERS`
    /// - `ROWQ_POLL_GAP_SECS` (float seconds)
    /// - `ROWQ_STATUSES` (comma separated, e.g. `new,failed`)
    /// - `ROWQ_INCLUDE_TYPES` / `ROWQ_EXCLUDE_TYPES` (comma separated)
    /// - `ROWQ_RAW_FILTER`
    /// - `ROWQ_SKIP_LOCKED`
    /// - `ROWQ_CLEANUP_ON_START`
    /// - `ROWQ_SHUTDOWN_TIMEOUT_SECS` (float seconds)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut filter = PopFilter::default();

        if let Some(statuses) = lookup("ROWQ_STATUSES") {
            filter.statuses = split_list(&statuses)
                .iter()
                .map(|s| s.parse::<TaskStatus>())
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(kinds) = lookup("ROWQ_INCLUDE_TYPES") {
            filter.include_types = split_list(&kinds);
        }
        if let Some(kinds) = lookup("ROWQ_EXCLUDE_TYPES") {
            filter.exclude_types = split_list(&kinds);
        }
        filter.raw_predicate = lookup("ROWQ_RAW_FILTER").filter(|p| !p.trim().is_empty());
        filter.skip_locked = parse_bool(&lookup, "ROWQ_SKIP_LOCKED", false)?;
        filter.validate()?;

        let num_workers = match lookup("ROWQ_WORKERS") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map_err(|e| invalid("ROWQ_WORKERS", &v, e))?,
            None => defaults.num_workers,
        };
        if num_workers == 0 {
            return Err(RowqError::Config("ROWQ_WORKERS must be at least 1".to_string()));
        }

        Ok(Self {
            namespace: lookup("ROWQ_NAMESPACE").unwrap_or(defaults.namespace),
            num_workers,
            poll_gap: parse_secs(&lookup, "ROWQ_POLL_GAP_SECS", defaults.poll_gap)?,
            filter,
            tries: None,
            cleanup_on_start: parse_bool(&lookup, "ROWQ_CLEANUP_ON_START", false)?,
            shutdown_timeout: parse_secs(
                &lookup,
                "ROWQ_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout,
            )?,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    let secs = value
        .trim()
        .parse::<f64>()
        .map_err(|e| invalid(key, &value, e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(key, &value, e))
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(RowqError::Config(format!(
            "invalid value '{}' for {}: expected a boolean",
            value, key
        ))),
    }
}

fn invalid(key: &str, value: &str, err: impl std::fmt::Display) -> RowqError {
    RowqError::Config(format!("invalid value '{}' for {}: {}", value, key, err))
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the gap between poll attempts.
    pub fn poll_gap(mut self, gap: Duration) -> Self {
        self.config.poll_gap = gap;
        self
    }

    /// Set the pop filter.
    pub fn filter(mut self, filter: PopFilter) -> Self {
        self.config.filter = filter;
        self
    }

    /// Bound every worker to `tries` poll attempts.
    pub fn tries(mut self, tries: usize) -> Self {
        self.config.tries = Some(tries);
        self
    }

    /// Run cleanup before workers start.
    pub fn cleanup_on_start(mut self, enabled: bool) -> Self {
        self.config.cleanup_on_start = enabled;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}
