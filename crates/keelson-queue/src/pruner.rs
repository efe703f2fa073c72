// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for deleting old finished jobs.
//!
//! Jobs in a terminal state (completed, discarded, cancelled) whose
//! `completed_at` is older than the retention period are deleted in batches,
//! keeping each delete statement short.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::persistence::JobStore;

/// Configuration for the job pruner.
#[derive(Debug, Clone)]
pub struct JobPrunerConfig {
    /// Whether pruning is enabled.
    pub enabled: bool,
    /// How often to prune.
    pub poll_interval: Duration,
    /// Retention for finished jobs.
    pub max_age: Duration,
    /// Maximum jobs deleted per statement.
    pub batch_size: i64,
}

impl Default for JobPrunerConfig {
    fn default() -> Self {
        Self {
            enabled: false,                              // Disabled by default
            poll_interval: Duration::from_secs(3600),    // 1 hour
            max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
            batch_size: 500,
        }
    }
}

impl JobPrunerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `KEELSON_PRUNE_ENABLED`: "true" or "1" to enable (default: false)
    /// - `KEELSON_PRUNE_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `KEELSON_PRUNE_MAX_AGE_DAYS`: days a finished job is kept (default: 7)
    /// - `KEELSON_PRUNE_BATCH_SIZE`: max jobs per batch (default: 500)
    pub fn from_env() -> Self {
        let enabled = std::env::var("KEELSON_PRUNE_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let poll_interval_secs = std::env::var("KEELSON_PRUNE_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let max_age_days = std::env::var("KEELSON_PRUNE_MAX_AGE_DAYS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(7);

        let batch_size = std::env::var("KEELSON_PRUNE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|size: &i64| *size > 0)
            .unwrap_or(500);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
            batch_size,
        }
    }
}

/// Background worker that deletes old finished jobs.
pub struct JobPruner {
    store: Arc<dyn JobStore>,
    config: JobPrunerConfig,
}

impl std::fmt::Debug for JobPruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPruner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobPruner {
    /// Create a new pruner.
    pub fn new(store: Arc<dyn JobStore>, config: JobPrunerConfig) -> Self {
        Self { store, config }
    }

    /// Run the pruning loop until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Job pruner disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Job pruner started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Job pruner received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.prune(Utc::now()).await {
                        error!(error = %e, "Failed to prune old jobs");
                    }
                }
            }
        }

        info!("Job pruner stopped");
    }

    /// Delete finished jobs older than the retention period as of `now`.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(self.config.max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut total_deleted = 0u64;

        loop {
            let deleted = self
                .store
                .delete_terminal_older_than(cutoff, self.config.batch_size)
                .await?;
            total_deleted += deleted;

            debug!(
                deleted = deleted,
                total_deleted = total_deleted,
                "Pruned batch of jobs"
            );

            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(
                total_deleted = total_deleted,
                cutoff = %cutoff,
                "Job pruning cycle completed"
            );
        } else {
            debug!("Job pruning cycle completed, no old jobs found");
        }

        Ok(total_deleted)
    }
}
