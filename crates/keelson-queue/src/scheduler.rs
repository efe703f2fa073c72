// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron scheduler.
//!
//! A declarative table of `(name, cron expression, queue, workflow, default inputs)`
//! evaluated on a timer. Every due occurrence becomes one enqueued workflow job
//! running as the system actor. The unique key `cron:{name}:{occurrence}` keeps
//! several scheduler instances from inserting the same occurrence twice.

use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use keelson_core::{ActorContext, SystemOperation};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, Result};
use crate::job::{EnqueueOptions, JobArgs, JobId};
use crate::queue::JobQueue;

/// Most occurrences enqueued per entry and tick. Older missed occurrences are skipped.
const MAX_CATCH_UP: usize = 10;

/// One row of the schedule.
pub struct CronEntry {
    name: String,
    expression: String,
    cron: Cron,
    queue: String,
    workflow: String,
    inputs: Map<String, Value>,
}

impl std::fmt::Debug for CronEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronEntry")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .field("queue", &self.queue)
            .field("workflow", &self.workflow)
            .finish()
    }
}

impl CronEntry {
    /// Parse `expression` (5 fields, or 6 with seconds) and build an entry.
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        queue: impl Into<String>,
        workflow: impl Into<String>,
        default_inputs: Map<String, Value>,
    ) -> Result<Self> {
        let expression = expression.into();
        let cron = Cron::new(&expression)
            .with_seconds_optional()
            .parse()
            .map_err(|e| QueueError::InvalidCron {
                expression: expression.clone(),
                reason: e.to_string(),
            })?;

        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(QueueError::EmptyQueue);
        }

        Ok(Self {
            name: name.into(),
            expression,
            cron,
            queue,
            workflow: workflow.into(),
            inputs: default_inputs,
        })
    }

    /// Entry name, part of the unique key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cron expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Target queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Workflow to run.
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&after, false).ok()
    }

    fn unique_key(&self, occurrence: DateTime<Utc>) -> String {
        format!("cron:{}:{}", self.name, occurrence.to_rfc3339())
    }
}

/// Enqueues cron entries as they come due.
pub struct CronScheduler {
    queue: JobQueue,
    entries: Vec<CronEntry>,
    last_tick: DateTime<Utc>,
    poll_interval: Duration,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler")
            .field("entries", &self.entries)
            .field("last_tick", &self.last_tick)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl CronScheduler {
    /// Create a scheduler. Occurrences before now are not enqueued.
    pub fn new(queue: JobQueue, entries: Vec<CronEntry>) -> Self {
        Self {
            queue,
            entries,
            last_tick: Utc::now(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Treat `at` as the previous tick, enqueuing occurrences since then on the next tick.
    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_tick = at;
        self
    }

    /// How often [`run`](Self::run) ticks.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Scheduled entries.
    pub fn entries(&self) -> &[CronEntry] {
        &self.entries
    }

    /// Enqueue every occurrence in `(previous tick, now]` and return the ids of
    /// newly inserted jobs.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let since = self.last_tick;
        if now <= since {
            return Ok(Vec::new());
        }

        let mut inserted = Vec::new();
        for entry in &self.entries {
            let mut occurrences = Vec::new();
            let mut cursor = since;
            while let Some(next) = entry.next_after(cursor) {
                if next > now {
                    break;
                }
                occurrences.push(next);
                cursor = next;
            }

            if occurrences.len() > MAX_CATCH_UP {
                let skipped = occurrences.len() - MAX_CATCH_UP;
                warn!(entry = %entry.name, skipped, "Skipping missed cron occurrences");
                occurrences.drain(..skipped);
            }

            for occurrence in occurrences {
                let args = JobArgs::new(
                    entry.workflow.clone(),
                    entry.inputs.clone(),
                    ActorContext::system(SystemOperation::RunScheduledJob),
                );
                let opts = EnqueueOptions::new()
                    .scheduled_at(occurrence)
                    .unique_key(entry.unique_key(occurrence));

                let result = self
                    .queue
                    .enqueue_job(&entry.queue, args.to_value(), opts)
                    .await?;
                if result.inserted {
                    info!(
                        entry = %entry.name,
                        occurrence = %occurrence,
                        job_id = result.job.id,
                        "Scheduled job enqueued"
                    );
                    inserted.push(result.job.id);
                } else {
                    debug!(entry = %entry.name, occurrence = %occurrence, "Occurrence already enqueued");
                }
            }
        }

        self.last_tick = now;
        Ok(inserted)
    }

    /// Tick every poll interval until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            entries = self.entries.len(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Cron scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Cron scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Cron tick failed");
                    }
                }
            }
        }
    }
}
