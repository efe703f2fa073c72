// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use keelson_core::{ExecutorConfig, RetryPolicy};

use crate::queue::QueueSettings;

/// Keelson queue configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Queues consumed by the worker pool
    pub queues: Vec<String>,
    /// Maximum concurrently executing jobs
    pub worker_concurrency: usize,
    /// Maximum concurrently executing steps within one run
    pub step_concurrency: usize,
    /// Idle poll interval for workers, scheduler and cancellation watch
    pub poll_interval: Duration,
    /// Window in which a unique key suppresses duplicate inserts
    pub unique_window: Duration,
    /// Default attempt budget for new jobs
    pub default_max_attempts: i32,
    /// Job-level backoff
    pub retry: RetryPolicy,
    /// Lease length for executing jobs
    pub lease_timeout: Duration,
}

impl Config {
    /// Configuration with defaults for everything except the database URL.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            queues: vec!["default".to_string()],
            worker_concurrency: 10,
            step_concurrency: 4,
            poll_interval: Duration::from_millis(1000),
            unique_window: Duration::from_secs(60),
            default_max_attempts: 20,
            retry: RetryPolicy::new(Duration::from_millis(1000), Duration::from_millis(3_600_000)),
            lease_timeout: Duration::from_secs(300),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `KEELSON_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `KEELSON_QUEUES`: comma-separated queue names (default: default)
    /// - `KEELSON_WORKER_CONCURRENCY`: concurrent jobs (default: 10)
    /// - `KEELSON_STEP_CONCURRENCY`: concurrent steps per run (default: 4)
    /// - `KEELSON_POLL_INTERVAL_MS`: idle poll interval (default: 1000)
    /// - `KEELSON_UNIQUE_WINDOW_SECS`: uniqueness window (default: 60)
    /// - `KEELSON_DEFAULT_MAX_ATTEMPTS`: attempts per job (default: 20)
    /// - `KEELSON_RETRY_BASE_MS`: backoff base (default: 1000)
    /// - `KEELSON_RETRY_MAX_MS`: backoff cap (default: 3600000)
    /// - `KEELSON_LEASE_TIMEOUT_SECS`: lease length (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("KEELSON_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("KEELSON_DATABASE_URL"))?;

        let queues: Vec<String> = std::env::var("KEELSON_QUEUES")
            .unwrap_or_else(|_| "default".to_string())
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(String::from)
            .collect();
        if queues.is_empty() {
            return Err(ConfigError::Invalid(
                "KEELSON_QUEUES",
                "must name at least one queue",
            ));
        }

        let worker_concurrency: usize = positive("KEELSON_WORKER_CONCURRENCY", 10)?;
        let step_concurrency: usize = positive("KEELSON_STEP_CONCURRENCY", 4)?;
        let poll_interval_ms: u64 = positive("KEELSON_POLL_INTERVAL_MS", 1000)?;
        let unique_window_secs: u64 = parse("KEELSON_UNIQUE_WINDOW_SECS", 60)?;
        let default_max_attempts: i32 = positive("KEELSON_DEFAULT_MAX_ATTEMPTS", 20)?;
        let retry_base_ms: u64 = parse("KEELSON_RETRY_BASE_MS", 1000)?;
        let retry_max_ms: u64 = parse("KEELSON_RETRY_MAX_MS", 3_600_000)?;
        let lease_timeout_secs: u64 = positive("KEELSON_LEASE_TIMEOUT_SECS", 300)?;

        if retry_max_ms < retry_base_ms {
            return Err(ConfigError::Invalid(
                "KEELSON_RETRY_MAX_MS",
                "must not be smaller than KEELSON_RETRY_BASE_MS",
            ));
        }

        Ok(Self {
            database_url,
            queues,
            worker_concurrency,
            step_concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
            unique_window: Duration::from_secs(unique_window_secs),
            default_max_attempts,
            retry: RetryPolicy::new(
                Duration::from_millis(retry_base_ms),
                Duration::from_millis(retry_max_ms),
            ),
            lease_timeout: Duration::from_secs(lease_timeout_secs),
        })
    }

    /// Settings for a [`JobQueue`](crate::queue::JobQueue).
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            unique_window: self.unique_window,
            default_max_attempts: self.default_max_attempts,
            retry: self.retry,
            lease_timeout: self.lease_timeout,
        }
    }

    /// Settings for the workflow executor used by workers.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: self.step_concurrency,
            ..ExecutorConfig::default()
        }
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn positive<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value = parse(var, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(var, "must be a positive integer"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
