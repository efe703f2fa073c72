// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workers: lease jobs, rebuild the actor, run the workflow, record the outcome.
//!
//! The outcome of a run maps onto the job state machine by failure class:
//!
//! | Run result | Job transition |
//! |------------|----------------|
//! | success | `completed` |
//! | transient, attempts left | `available`/`scheduled` with backoff |
//! | transient, exhausted | `discarded`, discard hook fires |
//! | permanent | `discarded`, discard hook fires |
//! | snooze | `scheduled`, attempt not consumed |
//! | cancelled | `cancelled` |
//!
//! Undecodable arguments (unknown role, forged system actor, unknown workflow)
//! discard the job without running anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keelson_core::{FailureClass, RunOptions, WorkflowExecutor};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::job::{Job, JobArgs, JobId};
use crate::queue::{FailOutcome, JobQueue, SnoozeOutcome};
use crate::registry::WorkflowRegistry;

/// What happened to a processed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The workflow succeeded with this value.
    Completed(Value),
    /// A transient failure; the job runs again at `at`.
    Retried {
        /// When the job becomes leasable again.
        at: DateTime<Utc>,
    },
    /// The workflow asked to be deferred.
    Snoozed {
        /// When the job becomes leasable again.
        until: DateTime<Utc>,
    },
    /// The job was discarded with this reason.
    Discarded(String),
    /// Cancellation was observed and the run rolled back.
    Cancelled,
}

/// Executes leased jobs. Cheap to clone.
#[derive(Clone)]
pub struct Worker {
    queue: JobQueue,
    registry: Arc<WorkflowRegistry>,
    executor: WorkflowExecutor,
    poll_interval: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Worker {
    /// Create a worker. The poll interval defaults to one second.
    pub fn new(queue: JobQueue, registry: WorkflowRegistry, executor: WorkflowExecutor) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            executor,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// How often idle pools poll and running jobs check for cancellation.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The queue this worker reports to.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Registered workflows.
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Lease and process one job from `queue`.
    pub async fn work_one(&self, queue: &str) -> Result<Option<(JobId, JobOutcome)>> {
        let Some(job) = self.queue.lease(queue).await? else {
            return Ok(None);
        };
        let id = job.id;
        let outcome = self.process_job(job).await?;
        Ok(Some((id, outcome)))
    }

    /// Run a leased job to its next state.
    #[instrument(skip_all, fields(job_id = job.id, queue = %job.queue, attempt = job.attempt))]
    pub async fn process_job(&self, job: Job) -> Result<JobOutcome> {
        let args = match JobArgs::decode(&job.args) {
            Ok(args) => args,
            Err(e) => {
                error!(error = %e, "Job arguments rejected");
                return self.discard(&job, &e.to_string()).await;
            }
        };

        let Some(workflow) = self.registry.get(args.workflow()) else {
            let e = QueueError::UnknownWorkflow(args.workflow().to_string());
            error!(error = %e, "Job references an unregistered workflow");
            return self.discard(&job, &e.to_string()).await;
        };

        let cancellation = CancellationToken::new();
        let done = CancellationToken::new();
        let watcher = tokio::spawn(watch_job(
            self.queue.clone(),
            job.clone(),
            cancellation.clone(),
            done.clone(),
            self.poll_interval,
        ));

        let options = RunOptions {
            attempt: u32::try_from(job.attempt).unwrap_or(1),
            cancellation: cancellation.clone(),
            run_id: Uuid::new_v4(),
        };
        let (_, inputs, actor) = args.into_parts();
        info!(workflow = %workflow.name(), actor = %actor, "Processing job");

        let result = self
            .executor
            .execute_with(&workflow, inputs, actor, options)
            .await;

        done.cancel();
        if let Err(e) = watcher.await {
            warn!(error = %e, "Job watcher task failed");
        }

        let error = match result {
            Ok(value) => {
                self.queue.complete(&job).await?;
                info!("Job completed");
                return Ok(JobOutcome::Completed(value));
            }
            Err(error) => error,
        };

        let message = error.to_string();
        if self.cancel_requested(&job, &cancellation).await {
            return self.cancel(&job, &message).await;
        }

        match error.class() {
            FailureClass::Cancelled => self.cancel(&job, &message).await,
            FailureClass::Snooze(delay) => match self.queue.snooze(&job, delay).await? {
                SnoozeOutcome::Snoozed { until } => {
                    info!(until = %until, "Job snoozed");
                    Ok(JobOutcome::Snoozed { until })
                }
                SnoozeOutcome::Cancelled => Ok(JobOutcome::Cancelled),
            },
            FailureClass::Transient => match self.queue.fail(&job, &message).await? {
                FailOutcome::Retry { at, .. } => Ok(JobOutcome::Retried { at }),
                FailOutcome::Cancelled => Ok(JobOutcome::Cancelled),
                FailOutcome::Discard => {
                    self.fire_discard_hook(&job, &message).await;
                    Ok(JobOutcome::Discarded(message))
                }
            },
            FailureClass::Permanent => {
                warn!(code = error.error_code(), error = %message, "Job failed permanently");
                self.discard(&job, &message).await
            }
        }
    }

    /// Whether the run was stopped by, or raced with, a cancel request.
    async fn cancel_requested(&self, job: &Job, cancellation: &CancellationToken) -> bool {
        if cancellation.is_cancelled() {
            return true;
        }
        match self.queue.is_cancel_requested(job.id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(error = %e, "Failed to check cancellation flag");
                false
            }
        }
    }

    async fn cancel(&self, job: &Job, reason: &str) -> Result<JobOutcome> {
        self.queue.mark_cancelled(job, reason).await?;
        info!(error = %reason, "Job cancelled");
        Ok(JobOutcome::Cancelled)
    }

    async fn discard(&self, job: &Job, reason: &str) -> Result<JobOutcome> {
        self.queue.discard(job, reason).await?;
        self.fire_discard_hook(job, reason).await;
        Ok(JobOutcome::Discarded(reason.to_string()))
    }

    async fn fire_discard_hook(&self, job: &Job, reason: &str) {
        if let Some(hook) = self.registry.discard_hook() {
            debug!(job_id = job.id, "Running discard hook");
            hook.on_discard(job, reason).await;
        }
    }
}

/// Watch for a cancel request and keep the lease alive until `done` fires.
///
/// The flag is checked right away, so a job that was already flagged stops
/// before its first ready set runs to completion.
async fn watch_job(
    queue: JobQueue,
    job: Job,
    cancellation: CancellationToken,
    done: CancellationToken,
    poll_interval: Duration,
) {
    let renew_every = queue.settings().lease_timeout / 2;
    let mut renewed_at = Instant::now();

    loop {
        if !cancellation.is_cancelled() {
            match queue.is_cancel_requested(job.id).await {
                Ok(true) => {
                    info!(job_id = job.id, "Cancellation requested, stopping before next ready set");
                    cancellation.cancel();
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = job.id, error = %e, "Failed to check cancellation flag"),
            }
        }

        if renewed_at.elapsed() >= renew_every {
            match queue.extend_lease(&job).await {
                Ok(()) => renewed_at = Instant::now(),
                Err(QueueError::InvalidState { .. }) => {
                    warn!(job_id = job.id, "Lease lost to another worker, stopping the run");
                    cancellation.cancel();
                }
                Err(e) => warn!(job_id = job.id, error = %e, "Failed to extend lease"),
            }
        }

        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Counts of outcomes from [`WorkerPool::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Jobs completed.
    pub completed: usize,
    /// Attempts that were rescheduled.
    pub retried: usize,
    /// Attempts that were snoozed.
    pub snoozed: usize,
    /// Jobs discarded.
    pub discarded: usize,
    /// Jobs cancelled.
    pub cancelled: usize,
}

impl DrainSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed(_) => self.completed += 1,
            JobOutcome::Retried { .. } => self.retried += 1,
            JobOutcome::Snoozed { .. } => self.snoozed += 1,
            JobOutcome::Discarded(_) => self.discarded += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Attempts processed.
    pub fn total(&self) -> usize {
        self.completed + self.retried + self.snoozed + self.discarded + self.cancelled
    }
}

/// A bounded pool of concurrently executing jobs over a set of queues.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    worker: Worker,
    queues: Vec<String>,
    concurrency: u32,
}

impl WorkerPool {
    /// Create a pool leasing from `queues`, running at most `concurrency` jobs.
    pub fn new(worker: Worker, queues: Vec<String>, concurrency: usize) -> Self {
        let concurrency = u32::try_from(concurrency.max(1)).unwrap_or(u32::MAX);
        Self {
            worker,
            queues,
            concurrency,
        }
    }

    /// The worker executing jobs.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Lease and execute jobs until `shutdown` fires, then wait for jobs in flight.
    pub async fn run(&self, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency as usize));
        let poll_interval = self.worker.poll_interval();

        info!(
            queues = ?self.queues,
            concurrency = self.concurrency,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Worker pool started"
        );

        'outer: loop {
            let mut leased_any = false;

            for queue in &self.queues {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'outer,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'outer,
                    },
                };

                match self.worker.queue().lease(queue).await {
                    Ok(Some(job)) => {
                        leased_any = true;
                        let worker = self.worker.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            let id = job.id;
                            if let Err(e) = worker.process_job(job).await {
                                error!(job_id = id, error = %e, "Failed to record job outcome");
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(e) => error!(queue = %queue, error = %e, "Failed to lease job"),
                }
            }

            if !leased_any {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }

        info!("Worker pool shutting down, waiting for running jobs");
        let _ = permits.acquire_many(self.concurrency).await;
        info!("Worker pool stopped");
    }

    /// Process every currently leasable job of `queue` on the calling task.
    ///
    /// Jobs rescheduled with a zero delay are leased again, so a workflow that
    /// keeps snoozing for zero time never drains.
    pub async fn drain(&self, queue: &str) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        while let Some((id, outcome)) = self.worker.work_one(queue).await? {
            debug!(job_id = id, ?outcome, "Drained job");
            summary.record(&outcome);
        }
        Ok(summary)
    }
}
