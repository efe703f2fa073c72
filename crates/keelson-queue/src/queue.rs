// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queue facade over a [`JobStore`].
//!
//! [`JobQueue`] owns the policy a store does not know about: argument
//! validation, the uniqueness window, default attempt budgets, lease length and
//! job-level backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keelson_core::{ActorContext, RetryPolicy};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{QueueError, Result};
use crate::job::{EnqueueOptions, Job, JobArgs, JobId, JobState, validate_actor};
use crate::persistence::{
    CancelOutcome, InsertResult, JobFilter, JobStore, NewJob, far_future,
};

/// Queue policy.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// A unique key suppresses inserts for this long after the original insert.
    pub unique_window: Duration,
    /// Attempt budget when the caller does not set one.
    pub default_max_attempts: i32,
    /// Job-level backoff.
    pub retry: RetryPolicy,
    /// How long a lease lasts before the rescuer may reclaim the job.
    pub lease_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            unique_window: Duration::from_secs(60),
            default_max_attempts: 20,
            retry: RetryPolicy::default(),
            lease_timeout: Duration::from_secs(300),
        }
    }
}

/// What [`JobQueue::fail`] did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt runs at `at`, `delay` from now.
    Retry {
        /// When the job becomes leasable again.
        at: DateTime<Utc>,
        /// Backoff applied.
        delay: Duration,
    },
    /// No attempts left; the job is discarded.
    Discard,
    /// Cancellation was requested while the attempt ran; the job is cancelled.
    Cancelled,
}

/// What [`JobQueue::snooze`] did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoozeOutcome {
    /// The job becomes leasable again at `until`.
    Snoozed {
        /// New `scheduled_at`.
        until: DateTime<Utc>,
    },
    /// Cancellation was requested while the attempt ran; the job is cancelled.
    Cancelled,
}

/// Durable job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("store", &"...")
            .field("settings", &self.settings)
            .finish()
    }
}

/// `now + delay`, saturating at the latest time the stores can order correctly.
pub(crate) fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or_else(far_future, |at| at.min(far_future()))
}

impl JobQueue {
    /// Create a queue over `store`.
    pub fn new(store: Arc<dyn JobStore>, settings: QueueSettings) -> Self {
        Self { store, settings }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Queue policy.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Enqueue a job and return its id.
    ///
    /// When a live job with the same unique key was inserted within the
    /// uniqueness window, that job's id is returned and nothing is inserted.
    pub async fn enqueue(&self, queue: &str, args: Value, opts: EnqueueOptions) -> Result<JobId> {
        Ok(self.enqueue_job(queue, args, opts).await?.job.id)
    }

    /// Like [`enqueue`](Self::enqueue) but returns the stored job and whether it
    /// was newly inserted.
    #[instrument(skip_all, fields(queue = %queue))]
    pub async fn enqueue_job(
        &self,
        queue: &str,
        args: Value,
        opts: EnqueueOptions,
    ) -> Result<InsertResult> {
        let queue = queue.trim();
        if queue.is_empty() {
            return Err(QueueError::EmptyQueue);
        }
        validate_actor(&args)?;

        let max_attempts = opts
            .get_max_attempts()
            .unwrap_or(self.settings.default_max_attempts);
        if max_attempts <= 0 {
            return Err(QueueError::InvalidArgs(format!(
                "max_attempts must be positive, got {}",
                max_attempts
            )));
        }

        let now = Utc::now();
        let scheduled_at = opts.resolve_scheduled_at(now);
        let state = if scheduled_at > now {
            JobState::Scheduled
        } else {
            JobState::Available
        };
        let unique_key = opts.resolve_unique_key(queue, &args);
        let unique_since = chrono::Duration::from_std(self.settings.unique_window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |since| {
                since.max(DateTime::<Utc>::UNIX_EPOCH)
            });

        let result = self
            .store
            .insert_job(
                NewJob {
                    queue: queue.to_string(),
                    state,
                    args,
                    max_attempts,
                    priority: opts.get_priority(),
                    scheduled_at,
                    unique_key,
                    inserted_at: now,
                },
                unique_since,
            )
            .await?;

        if result.inserted {
            info!(
                job_id = result.job.id,
                queue = %queue,
                state = %result.job.state,
                scheduled_at = %result.job.scheduled_at,
                "Job enqueued"
            );
        } else {
            debug!(job_id = result.job.id, queue = %queue, "Enqueue matched an existing job");
        }

        Ok(result)
    }

    /// Enqueue a run of `workflow` on behalf of `actor`.
    pub async fn enqueue_workflow(
        &self,
        queue: &str,
        workflow: &str,
        inputs: Map<String, Value>,
        actor: &ActorContext,
        opts: EnqueueOptions,
    ) -> Result<JobId> {
        let args = JobArgs::new(workflow, inputs, actor.clone());
        self.enqueue(queue, args.to_value(), opts).await
    }

    /// Claim the next due job of `queue`, if any.
    pub async fn lease(&self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let job = self
            .store
            .lease_job(queue, now, offset(now, self.settings.lease_timeout))
            .await?;
        if let Some(job) = &job {
            debug!(job_id = job.id, queue = %queue, attempt = job.attempt, "Job leased");
        }
        Ok(job)
    }

    /// Renew the lease held on `job`.
    ///
    /// The methods taking a leased [`Job`] act only while that lease is current:
    /// once the job was rescued and leased again they fail with
    /// [`QueueError::InvalidState`].
    pub async fn extend_lease(&self, job: &Job) -> Result<()> {
        self.store
            .extend_lease(
                job.id,
                job.attempt,
                offset(Utc::now(), self.settings.lease_timeout),
            )
            .await
    }

    /// Mark a leased job completed.
    pub async fn complete(&self, job: &Job) -> Result<()> {
        self.store.complete_job(job.id, job.attempt).await?;
        debug!(job_id = job.id, "Job completed");
        Ok(())
    }

    /// Record a transient failure of a leased job.
    ///
    /// Reschedules with exponential backoff while attempts remain, otherwise
    /// discards the job. A job whose cancellation was requested meanwhile is
    /// cancelled instead of rescheduled.
    pub async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome> {
        let id = job.id;
        if !job.has_attempts_left() {
            self.store.discard_job(id, job.attempt, error).await?;
            warn!(job_id = id, attempt = job.attempt, error = %error, "Job failed, attempts exhausted");
            return Ok(FailOutcome::Discard);
        }

        let delay = self
            .settings
            .retry
            .delay_for_attempt(u32::try_from(job.attempt).unwrap_or(1));
        let at = offset(Utc::now(), delay);
        match self.store.retry_job(id, job.attempt, error, at).await? {
            JobState::Cancelled => {
                info!(job_id = id, error = %error, "Job failed after cancellation was requested");
                Ok(FailOutcome::Cancelled)
            }
            _ => {
                warn!(
                    job_id = id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retrying"
                );
                Ok(FailOutcome::Retry { at, delay })
            }
        }
    }

    /// Discard a leased job without further attempts.
    pub async fn discard(&self, job: &Job, error: &str) -> Result<()> {
        self.store.discard_job(job.id, job.attempt, error).await?;
        warn!(job_id = job.id, error = %error, "Job discarded");
        Ok(())
    }

    /// Defer a leased job by `delay` without consuming the attempt.
    pub async fn snooze(&self, job: &Job, delay: Duration) -> Result<SnoozeOutcome> {
        let until = offset(Utc::now(), delay);
        match self.store.snooze_job(job.id, job.attempt, until).await? {
            JobState::Cancelled => {
                info!(job_id = job.id, "Snooze turned into cancellation");
                Ok(SnoozeOutcome::Cancelled)
            }
            _ => {
                debug!(job_id = job.id, until = %until, "Job snoozed");
                Ok(SnoozeOutcome::Snoozed { until })
            }
        }
    }

    /// Cancel a job.
    ///
    /// Pending jobs are cancelled immediately. Executing jobs are flagged and
    /// stop before their next ready set.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let outcome = self.store.cancel_job(id).await?;
        match &outcome {
            CancelOutcome::Cancelled(_) => info!(job_id = id, "Job cancelled"),
            CancelOutcome::Requested(_) => info!(job_id = id, "Cancellation requested"),
            CancelOutcome::AlreadyFinished(job) => {
                debug!(job_id = id, state = %job.state, "Cancel ignored, job already finished")
            }
            CancelOutcome::NotFound => debug!(job_id = id, "Cancel ignored, job not found"),
        }
        Ok(outcome)
    }

    /// Move a leased job to `cancelled` once its run stopped.
    pub async fn mark_cancelled(&self, job: &Job, error: &str) -> Result<()> {
        self.store.mark_cancelled(job.id, job.attempt, error).await
    }

    /// Whether cancellation was requested for `id`.
    pub async fn is_cancel_requested(&self, id: JobId) -> Result<bool> {
        self.store.is_cancel_requested(id).await
    }

    /// Fetch a job.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    /// List jobs, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    /// Jobs per state in `queue`.
    pub async fn counts(&self, queue: &str) -> Result<Vec<(JobState, i64)>> {
        self.store.count_by_state(queue).await
    }
}
