// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job storage interface and backends.
//!
//! Every mutation is a single atomic statement (or one transaction on PostgreSQL),
//! so concurrent workers can never hold a lease on the same job at once. Changes
//! to a leased job carry the attempt it was leased with, so a worker whose lease
//! was rescued cannot touch the job after someone else leased it.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresJobStore;
pub use self::sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::QueueError;
use crate::job::{Job, JobId, JobState};

/// Columns returned by every query that yields a [`Job`].
pub(crate) const JOB_COLUMNS: &str = "id, queue, state, args, attempt, max_attempts, priority, \
     scheduled_at, unique_key, inserted_at, attempted_at, completed_at, lease_expires_at, \
     last_error, cancel_requested";

/// A job about to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Target queue.
    pub queue: String,
    /// `Available` or `Scheduled`.
    pub state: JobState,
    /// Argument payload.
    pub args: Value,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Lower runs first.
    pub priority: i32,
    /// Earliest lease time.
    pub scheduled_at: DateTime<Utc>,
    /// Deduplication key.
    pub unique_key: Option<String>,
    /// Insert time.
    pub inserted_at: DateTime<Utc>,
}

/// Result of [`JobStore::insert_job`].
#[derive(Debug, Clone)]
pub struct InsertResult {
    /// The new job, or the live duplicate that suppressed the insert.
    pub job: Job,
    /// False when a duplicate was returned instead.
    pub inserted: bool,
}

/// Result of [`JobStore::cancel_job`].
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job had not started and is now cancelled.
    Cancelled(Job),
    /// The job is executing; the worker will stop it at the next ready set.
    Requested(Job),
    /// The job had already finished.
    AlreadyFinished(Job),
    /// No such job.
    NotFound,
}

/// State a fenced change expects, for [`QueueError::InvalidState`].
pub(crate) const LEASE_HELD: &str = "executing under this lease";

/// Message recorded on a job cancelled while it was being retried or snoozed.
pub(crate) const CANCELLED_ON_RELEASE: &str = "cancelled before the next attempt";

/// Upper bound for stored timestamps.
///
/// Later times do not fit the four-digit years SQLite compares as text, nor
/// PostgreSQL's `timestamptz` range.
pub(crate) fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Filter for [`JobStore::list_jobs`].
#[derive(Debug, Clone)]
pub struct JobFilter {
    /// Restrict to one queue.
    pub queue: Option<String>,
    /// Restrict to one state.
    pub state: Option<JobState>,
    /// Maximum rows, newest first.
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue: None,
            state: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    /// Jobs in `queue`.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Jobs in `state`.
    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// At most `limit` jobs.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

/// Persistence for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job unless a live job with the same unique key was inserted at or
    /// after `unique_since`, in which case that job is returned.
    async fn insert_job(
        &self,
        job: NewJob,
        unique_since: DateTime<Utc>,
    ) -> Result<InsertResult, QueueError>;

    /// Fetch a job by id.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Atomically claim the next due job of `queue`: lowest priority number first,
    /// then earliest `scheduled_at`, then lowest id. Increments `attempt`.
    async fn lease_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// Push the lease of an executing job forward.
    ///
    /// Every change to a leased job is fenced on `attempt`, the lease the caller
    /// holds. A job released and leased again by another worker no longer matches
    /// and the call fails with [`QueueError::InvalidState`].
    async fn extend_lease(
        &self,
        id: JobId,
        attempt: i32,
        lease_until: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Executing -> completed.
    async fn complete_job(&self, id: JobId, attempt: i32) -> Result<(), QueueError>;

    /// Executing -> available/scheduled at `at`, recording the error.
    ///
    /// A job with a pending cancel request goes to cancelled instead. Returns
    /// the state the job ended up in.
    async fn retry_job(
        &self,
        id: JobId,
        attempt: i32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<JobState, QueueError>;

    /// Executing -> scheduled at `at` without consuming the attempt.
    ///
    /// A job with a pending cancel request goes to cancelled instead. Returns
    /// the state the job ended up in.
    async fn snooze_job(
        &self,
        id: JobId,
        attempt: i32,
        at: DateTime<Utc>,
    ) -> Result<JobState, QueueError>;

    /// Executing -> discarded, recording the error.
    async fn discard_job(&self, id: JobId, attempt: i32, error: &str) -> Result<(), QueueError>;

    /// Cancel a pending job or flag an executing one.
    async fn cancel_job(&self, id: JobId) -> Result<CancelOutcome, QueueError>;

    /// Executing -> cancelled, once the worker observed the request.
    async fn mark_cancelled(&self, id: JobId, attempt: i32, error: &str)
    -> Result<(), QueueError>;

    /// Whether cancellation was requested for an executing job.
    async fn is_cancel_requested(&self, id: JobId) -> Result<bool, QueueError>;

    /// Release executing jobs whose lease ran out before `now`.
    ///
    /// Jobs with attempts left become available, exhausted ones are discarded and
    /// jobs with a pending cancel request are cancelled. Returns the updated jobs.
    async fn rescue_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;

    /// List jobs, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError>;

    /// Number of jobs per state in `queue`. States without jobs are omitted.
    async fn count_by_state(&self, queue: &str) -> Result<Vec<(JobState, i64)>, QueueError>;

    /// Delete up to `limit` terminal jobs finished before `cutoff`.
    async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, QueueError>;
}

pub(crate) fn parse_counts(rows: Vec<(String, i64)>) -> Result<Vec<(JobState, i64)>, QueueError> {
    let mut counts = rows
        .into_iter()
        .map(|(state, count)| Ok((state.parse::<JobState>()?, count)))
        .collect::<Result<Vec<_>, QueueError>>()?;
    counts.sort();
    Ok(counts)
}
