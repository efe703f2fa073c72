// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease rescuer.
//!
//! A worker that dies mid-job leaves the row in `executing`. Once the lease
//! expires the rescuer releases it: back to `available` while attempts remain,
//! `discarded` when exhausted, `cancelled` when a cancel was pending. Together
//! with leasing this gives at-least-once execution. Jobs discarded here fire
//! the registry's discard hook just like jobs discarded by a worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::job::{Job, JobState};
use crate::persistence::JobStore;
use crate::registry::DiscardHook;

/// Configuration for the lease rescuer.
#[derive(Debug, Clone)]
pub struct LeaseRescuerConfig {
    /// Whether rescuing is enabled.
    pub enabled: bool,
    /// How often to look for expired leases.
    pub poll_interval: Duration,
}

impl Default for LeaseRescuerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Releases jobs whose lease ran out.
pub struct LeaseRescuer {
    store: Arc<dyn JobStore>,
    config: LeaseRescuerConfig,
    discard_hook: Option<Arc<dyn DiscardHook>>,
}

impl std::fmt::Debug for LeaseRescuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRescuer")
            .field("config", &self.config)
            .field("discard_hook", &self.discard_hook.as_ref().map(|_| "..."))
            .finish_non_exhaustive()
    }
}

impl LeaseRescuer {
    /// Create a new rescuer.
    pub fn new(store: Arc<dyn JobStore>, config: LeaseRescuerConfig) -> Self {
        Self {
            store,
            config,
            discard_hook: None,
        }
    }

    /// Fire `hook` for every job that runs out of attempts with an expired lease.
    pub fn with_discard_hook(mut self, hook: Arc<dyn DiscardHook>) -> Self {
        self.discard_hook = Some(hook);
        self
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Lease rescuer disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Lease rescuer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Lease rescuer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.rescue(Utc::now()).await {
                        error!(error = %e, "Failed to rescue expired leases");
                    }
                }
            }
        }

        info!("Lease rescuer stopped");
    }

    /// Release every job whose lease expired before `now`.
    pub async fn rescue(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rescued = self.store.rescue_expired_leases(now).await?;
        for job in &rescued {
            warn!(
                job_id = job.id,
                queue = %job.queue,
                attempt = job.attempt,
                state = %job.state,
                "Released job with expired lease"
            );
            if job.state == JobState::Discarded
                && let Some(hook) = &self.discard_hook
            {
                debug!(job_id = job.id, "Running discard hook");
                hook.on_discard(job, job.last_error.as_deref().unwrap_or("lease expired"))
                    .await;
            }
        }
        Ok(rescued)
    }
}
