// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed job store.
//!
//! SQLite serialises writers, so each claim is a single
//! `UPDATE ... WHERE id = (SELECT ... LIMIT 1) RETURNING` statement and each unique
//! insert a single `INSERT ... SELECT ... WHERE NOT EXISTS` statement.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::QueueError;
use crate::job::{Job, JobId, JobState};
use crate::migrations;

use super::{
    CANCELLED_ON_RELEASE, CancelOutcome, InsertResult, JOB_COLUMNS, JobFilter, JobStore, LEASE_HELD,
    NewJob, parse_counts,
};

/// Insert-or-lookup rounds before a contended unique insert gives up.
const UNIQUE_INSERT_ROUNDS: usize = 3;

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    ///
    /// In-memory databases are limited to one connection, since every connection
    /// would otherwise see its own empty database.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::Database(sqlx::Error::Configuration(
                    format!("failed to create directory {:?}: {}", parent, e).into(),
                ))
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Build the error for an update that matched no row.
    async fn missed(&self, id: JobId, expected: &'static str) -> QueueError {
        match self.get_job(id).await {
            Ok(Some(_)) => QueueError::InvalidState { id, expected },
            Ok(None) => QueueError::JobNotFound(id),
            Err(e) => e,
        }
    }

    async fn try_insert_unique(
        &self,
        job: &NewJob,
        key: &str,
        unique_since: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let sql = format!(
            r#"
            INSERT INTO jobs (queue, state, args, attempt, max_attempts, priority,
                              scheduled_at, unique_key, inserted_at)
            SELECT ?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8
            WHERE NOT EXISTS (
                SELECT 1 FROM jobs
                WHERE unique_key = ?7
                  AND state IN ('available', 'scheduled', 'executing')
                  AND inserted_at >= ?9
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Job>(&sql)
            .bind(&job.queue)
            .bind(job.state.as_str())
            .bind(Json(&job.args))
            .bind(job.max_attempts)
            .bind(job.priority)
            .bind(job.scheduled_at)
            .bind(key)
            .bind(job.inserted_at)
            .bind(unique_since)
            .fetch_optional(&self.pool)
            .await?;
        Ok(inserted)
    }

    async fn find_live_duplicate(
        &self,
        key: &str,
        unique_since: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE unique_key = ?
              AND state IN ('available', 'scheduled', 'executing')
              AND inserted_at >= ?
            ORDER BY id ASC
            LIMIT 1
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(key)
            .bind(unique_since)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(
        &self,
        job: NewJob,
        unique_since: DateTime<Utc>,
    ) -> Result<InsertResult, QueueError> {
        if let Some(key) = job.unique_key.clone() {
            // The duplicate may finish between the insert and the lookup; go again.
            for _ in 0..UNIQUE_INSERT_ROUNDS {
                if let Some(inserted) = self.try_insert_unique(&job, &key, unique_since).await? {
                    return Ok(InsertResult {
                        job: inserted,
                        inserted: true,
                    });
                }
                if let Some(existing) = self.find_live_duplicate(&key, unique_since).await? {
                    debug!(job_id = existing.id, unique_key = %key, "Duplicate job suppressed");
                    return Ok(InsertResult {
                        job: existing,
                        inserted: false,
                    });
                }
            }
            return Err(QueueError::UniqueConflict(key));
        }

        let sql = format!(
            r#"
            INSERT INTO jobs (queue, state, args, attempt, max_attempts, priority,
                              scheduled_at, unique_key, inserted_at)
            VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Job>(&sql)
            .bind(&job.queue)
            .bind(job.state.as_str())
            .bind(Json(&job.args))
            .bind(job.max_attempts)
            .bind(job.priority)
            .bind(job.scheduled_at)
            .bind(&job.unique_key)
            .bind(job.inserted_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(InsertResult {
            job: inserted,
            inserted: true,
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn lease_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'executing',
                attempt = attempt + 1,
                attempted_at = ?1,
                lease_expires_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?3
                  AND state IN ('available', 'scheduled')
                  AND scheduled_at <= ?1
                ORDER BY priority ASC, scheduled_at ASC, id ASC
                LIMIT 1
            )
            AND state IN ('available', 'scheduled')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(now)
            .bind(lease_until)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        attempt: i32,
        lease_until: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ? WHERE id = ? AND attempt = ? AND state = 'executing'",
        )
        .bind(lease_until)
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missed(id, LEASE_HELD).await);
        }
        Ok(())
    }

    async fn complete_job(&self, id: JobId, attempt: i32) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', completed_at = ?, lease_expires_at = NULL
            WHERE id = ? AND attempt = ? AND state = 'executing'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missed(id, LEASE_HELD).await);
        }
        Ok(())
    }

    async fn retry_job(
        &self,
        id: JobId,
        attempt: i32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<JobState, QueueError> {
        let now = Utc::now();
        let state = if at <= now {
            JobState::Available
        } else {
            JobState::Scheduled
        };
        let updated: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE ?1 END,
                scheduled_at = CASE WHEN cancel_requested = 1 THEN scheduled_at ELSE ?2 END,
                completed_at = CASE WHEN cancel_requested = 1 THEN ?3 ELSE NULL END,
                last_error = CASE WHEN cancel_requested = 1 THEN ?4 ELSE ?5 END,
                lease_expires_at = NULL
            WHERE id = ?6 AND attempt = ?7 AND state = 'executing'
            RETURNING state
            "#,
        )
        .bind(state.as_str())
        .bind(at)
        .bind(now)
        .bind(CANCELLED_ON_RELEASE)
        .bind(error)
        .bind(id)
        .bind(attempt)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(state) => state.parse(),
            None => Err(self.missed(id, LEASE_HELD).await),
        }
    }

    async fn snooze_job(
        &self,
        id: JobId,
        attempt: i32,
        at: DateTime<Utc>,
    ) -> Result<JobState, QueueError> {
        let updated: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'scheduled' END,
                scheduled_at = CASE WHEN cancel_requested = 1 THEN scheduled_at ELSE ?1 END,
                attempt = CASE WHEN cancel_requested = 1 THEN attempt ELSE MAX(attempt - 1, 0) END,
                completed_at = CASE WHEN cancel_requested = 1 THEN ?2 ELSE completed_at END,
                last_error = CASE WHEN cancel_requested = 1 THEN ?3 ELSE last_error END,
                lease_expires_at = NULL
            WHERE id = ?4 AND attempt = ?5 AND state = 'executing'
            RETURNING state
            "#,
        )
        .bind(at)
        .bind(Utc::now())
        .bind(CANCELLED_ON_RELEASE)
        .bind(id)
        .bind(attempt)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(state) => state.parse(),
            None => Err(self.missed(id, LEASE_HELD).await),
        }
    }

    async fn discard_job(&self, id: JobId, attempt: i32, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'discarded', last_error = ?, completed_at = ?, lease_expires_at = NULL
            WHERE id = ? AND attempt = ? AND state = 'executing'
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missed(id, LEASE_HELD).await);
        }
        Ok(())
    }

    async fn cancel_job(&self, id: JobId) -> Result<CancelOutcome, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'cancelled', completed_at = ?
            WHERE id = ? AND state IN ('available', 'scheduled')
            RETURNING {JOB_COLUMNS}
            "#
        );
        if let Some(job) = sqlx::query_as::<_, Job>(&sql)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(CancelOutcome::Cancelled(job));
        }

        let sql = format!(
            r#"
            UPDATE jobs
            SET cancel_requested = 1
            WHERE id = ? AND state = 'executing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        if let Some(job) = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(CancelOutcome::Requested(job));
        }

        Ok(match self.get_job(id).await? {
            Some(job) => CancelOutcome::AlreadyFinished(job),
            None => CancelOutcome::NotFound,
        })
    }

    async fn mark_cancelled(
        &self,
        id: JobId,
        attempt: i32,
        error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled', last_error = ?, completed_at = ?, lease_expires_at = NULL
            WHERE id = ? AND attempt = ? AND state = 'executing'
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.missed(id, LEASE_HELD).await);
        }
        Ok(())
    }

    async fn is_cancel_requested(&self, id: JobId) -> Result<bool, QueueError> {
        let requested: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        requested.ok_or(QueueError::JobNotFound(id))
    }

    async fn rescue_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = CASE
                    WHEN cancel_requested = 1 THEN 'cancelled'
                    WHEN attempt >= max_attempts THEN 'discarded'
                    ELSE 'available'
                END,
                completed_at = CASE
                    WHEN cancel_requested = 1 OR attempt >= max_attempts THEN ?1
                    ELSE NULL
                END,
                last_error = 'lease expired',
                lease_expires_at = NULL
            WHERE state = 'executing' AND lease_expires_at < ?1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let mut query: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));
        if let Some(queue) = &filter.queue {
            query.push(" AND queue = ").push_bind(queue);
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.as_str());
        }
        query
            .push(" ORDER BY id DESC LIMIT ")
            .push_bind(filter.limit);

        let jobs = query.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn count_by_state(&self, queue: &str) -> Result<Vec<(JobState, i64)>, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs WHERE queue = ? GROUP BY state")
                .bind(queue)
                .fetch_all(&self.pool)
                .await?;
        parse_counts(rows)
    }

    async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE state IN ('completed', 'discarded', 'cancelled')
                  AND completed_at < ?
                ORDER BY completed_at ASC
                LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    /// Create an in-memory store for testing.
    async fn test_store() -> SqliteJobStore {
        SqliteJobStore::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory store")
    }

    fn new_job(queue: &str, now: DateTime<Utc>) -> NewJob {
        NewJob {
            queue: queue.to_string(),
            state: JobState::Available,
            args: json!({ "n": 1 }),
            max_attempts: 3,
            priority: 0,
            scheduled_at: now,
            unique_key: None,
            inserted_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_job() {
        let store = test_store().await;
        let now = Utc::now();

        let result = store
            .insert_job(new_job("default", now), now)
            .await
            .expect("Failed to insert job");
        assert!(result.inserted);

        let job = store
            .get_job(result.job.id)
            .await
            .expect("Failed to get job")
            .expect("Job should exist");
        assert_eq!(job.queue, "default");
        assert_eq!(job.state, JobState::Available);
        assert_eq!(job.args, json!({ "n": 1 }));
        assert_eq!(job.attempt, 0);
        assert!(!job.cancel_requested);
    }

    #[tokio::test]
    async fn test_unique_insert_returns_existing_job() {
        let store = test_store().await;
        let now = Utc::now();
        let mut job = new_job("default", now);
        job.unique_key = Some("order:1".into());

        let first = store.insert_job(job.clone(), now - Duration::seconds(60)).await.unwrap();
        let second = store.insert_job(job.clone(), now - Duration::seconds(60)).await.unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(store.list_jobs(&JobFilter::default()).await.unwrap().len(), 1);

        // Outside the window the key no longer suppresses inserts.
        let later = now + Duration::seconds(120);
        let third = store.insert_job(job, later - Duration::seconds(60)).await.unwrap();
        assert!(third.inserted);
    }

    #[tokio::test]
    async fn test_unique_insert_gives_up_when_contended() {
        let store = test_store().await;
        let now = Utc::now();
        // Swallow every insert of the key, as if a rival kept winning and finishing.
        sqlx::query(
            r#"
            CREATE TRIGGER swallow_contended BEFORE INSERT ON jobs
            WHEN NEW.unique_key = 'contended'
            BEGIN SELECT RAISE(IGNORE); END
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let mut job = new_job("default", now);
        job.unique_key = Some("contended".into());

        let err = store.insert_job(job, now).await.unwrap_err();
        assert!(matches!(err, QueueError::UniqueConflict(ref key) if key == "contended"));
        assert!(store.list_jobs(&JobFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_key_ignores_finished_jobs() {
        let store = test_store().await;
        let now = Utc::now();
        let mut job = new_job("default", now);
        job.unique_key = Some("order:2".into());

        let first = store.insert_job(job.clone(), now).await.unwrap();
        store.cancel_job(first.job.id).await.unwrap();

        let second = store.insert_job(job, now).await.unwrap();
        assert!(second.inserted);
        assert_ne!(first.job.id, second.job.id);
    }

    #[tokio::test]
    async fn test_lease_respects_schedule_and_priority() {
        let store = test_store().await;
        let now = Utc::now();

        let mut later = new_job("default", now);
        later.state = JobState::Scheduled;
        later.scheduled_at = now + Duration::minutes(5);
        store.insert_job(later, now).await.unwrap();

        let mut low = new_job("default", now);
        low.priority = 5;
        let low = store.insert_job(low, now).await.unwrap().job;

        let mut high = new_job("default", now);
        high.priority = -1;
        let high = store.insert_job(high, now).await.unwrap().job;

        let lease_until = now + Duration::minutes(1);
        let first = store.lease_job("default", now, lease_until).await.unwrap().unwrap();
        let second = store.lease_job("default", now, lease_until).await.unwrap().unwrap();
        let third = store.lease_job("default", now, lease_until).await.unwrap();

        assert_eq!(first.id, high.id);
        assert_eq!(first.state, JobState::Executing);
        assert_eq!(first.attempt, 1);
        assert_eq!(second.id, low.id);
        assert!(third.is_none(), "future job must not be leasable");

        let due = now + Duration::minutes(6);
        assert!(store.lease_job("default", due, due).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lease_is_scoped_to_queue() {
        let store = test_store().await;
        let now = Utc::now();
        store.insert_job(new_job("mailers", now), now).await.unwrap();

        assert!(store.lease_job("default", now, now).await.unwrap().is_none());
        assert!(store.lease_job("mailers", now, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snooze_gives_back_the_attempt() {
        let store = test_store().await;
        let now = Utc::now();
        let id = store.insert_job(new_job("default", now), now).await.unwrap().job.id;

        let leased = store.lease_job("default", now, now).await.unwrap().unwrap();
        let state = store
            .snooze_job(id, leased.attempt, now + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(state, JobState::Scheduled);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.attempt, 0);
    }

    #[tokio::test]
    async fn test_release_honors_pending_cancel() {
        let store = test_store().await;
        let now = Utc::now();
        let id = store.insert_job(new_job("default", now), now).await.unwrap().job.id;

        let leased = store.lease_job("default", now, now).await.unwrap().unwrap();
        store.cancel_job(id).await.unwrap();

        let state = store
            .retry_job(id, leased.attempt, "connection reset", now)
            .await
            .unwrap();
        assert_eq!(state, JobState::Cancelled);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.completed_at.is_some());
        assert!(store.lease_job("default", now, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_requires_executing() {
        let store = test_store().await;
        let now = Utc::now();
        let id = store.insert_job(new_job("default", now), now).await.unwrap().job.id;

        let err = store.complete_job(id, 1).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));

        let err = store.complete_job(id + 100, 1).await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_attempt_cannot_touch_relet_job() {
        let store = test_store().await;
        let now = Utc::now();
        let id = store.insert_job(new_job("default", now), now).await.unwrap().job.id;

        let first = store.lease_job("default", now, now).await.unwrap().unwrap();
        let later = now + Duration::seconds(5);
        assert_eq!(store.rescue_expired_leases(later).await.unwrap().len(), 1);
        let second = store
            .lease_job("default", later, later + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, first.attempt + 1);

        let err = store.complete_job(id, first.attempt).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
        let err = store.extend_lease(id, first.attempt, later).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Executing);
        store.complete_job(id, second.attempt).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let store = test_store().await;
        let now = Utc::now();
        let pending = store.insert_job(new_job("default", now), now).await.unwrap().job.id;
        let running = store.insert_job(new_job("default", now), now).await.unwrap().job.id;

        assert!(matches!(
            store.cancel_job(pending).await.unwrap(),
            CancelOutcome::Cancelled(_)
        ));

        let leased = store.lease_job("default", now, now).await.unwrap().unwrap();
        assert_eq!(leased.id, running);
        assert!(!store.is_cancel_requested(running).await.unwrap());
        assert!(matches!(
            store.cancel_job(running).await.unwrap(),
            CancelOutcome::Requested(_)
        ));
        assert!(store.is_cancel_requested(running).await.unwrap());

        store
            .mark_cancelled(running, leased.attempt, "cancelled")
            .await
            .unwrap();
        assert!(matches!(
            store.cancel_job(running).await.unwrap(),
            CancelOutcome::AlreadyFinished(_)
        ));
        assert!(matches!(
            store.cancel_job(9999).await.unwrap(),
            CancelOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn test_rescue_expired_leases() {
        let store = test_store().await;
        let now = Utc::now();

        let mut last_try = new_job("default", now);
        last_try.max_attempts = 1;
        let exhausted = store.insert_job(last_try, now).await.unwrap().job.id;
        let retryable = store.insert_job(new_job("default", now), now).await.unwrap().job.id;

        let expired = now + Duration::seconds(1);
        store.lease_job("default", now, expired).await.unwrap().unwrap();
        store.lease_job("default", now, expired).await.unwrap().unwrap();

        assert!(store.rescue_expired_leases(now).await.unwrap().is_empty());

        let rescued = store
            .rescue_expired_leases(now + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(rescued.len(), 2);

        let exhausted = store.get_job(exhausted).await.unwrap().unwrap();
        let retryable = store.get_job(retryable).await.unwrap().unwrap();
        assert_eq!(exhausted.state, JobState::Discarded);
        assert_eq!(retryable.state, JobState::Available);
        assert_eq!(retryable.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn test_count_and_delete_terminal() {
        let store = test_store().await;
        let now = Utc::now();
        for _ in 0..3 {
            store.insert_job(new_job("default", now), now).await.unwrap();
            let leased = store.lease_job("default", now, now).await.unwrap().unwrap();
            store.discard_job(leased.id, leased.attempt, "bad input").await.unwrap();
        }
        store.insert_job(new_job("default", now), now).await.unwrap();

        let counts = store.count_by_state("default").await.unwrap();
        assert_eq!(
            counts,
            vec![(JobState::Available, 1), (JobState::Discarded, 3)]
        );

        let deleted = store
            .delete_terminal_older_than(Utc::now() + Duration::seconds(1), 2)
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining = store
            .list_jobs(&JobFilter::default().state(JobState::Discarded))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
