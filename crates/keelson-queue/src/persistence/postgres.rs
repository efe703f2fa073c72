// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed job store.
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED` so concurrent workers never block on or
//! double-claim the same row. Unique inserts serialise on a transaction-scoped
//! advisory lock keyed by the unique key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::error::QueueError;
use crate::job::{Job, JobId, JobState};
use crate::migrations;

use super::{
    CANCELLED_ON_RELEASE, CancelOutcome, InsertResult, JOB_COLUMNS, JobFilter, JobStore, LEASE_HELD,
    NewJob, parse_counts,
};

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore").finish_non_exhaustive()
    }
}

impl PostgresJobStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn missed(&self, id: JobId, expected: &'static str) -> QueueError {
        match self.get_job(id).await {
            Ok(Some(_)) => QueueError::InvalidState { id, expected },
            Ok(None) => QueueError::JobNotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(
        &self,
        job: NewJob,
        unique_since: DateTime<Utc>,
    ) -> Result<InsertResult, QueueError> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = &job.unique_key {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(key)
                .execute(&mut *tx)
                .await?;

            let sql = format!(
                r#"
                SELECT {JOB_COLUMNS} FROM jobs
                WHERE unique_key = $1
                  AND state IN ('available', 'scheduled', 'executing')
                  AND inserted_at >= $2
                ORDER BY id ASC
                LIMIT 1
                "#
            );
            let existing = sqlx::query_as::<_, Job>(&sql)
                .bind(key)
                .bind(unique_since)
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(existing) = existing {
                tx.commit().await?;
                debug!(job_id = existing.id, unique_key = %key, "Duplicate job suppressed");
                return Ok(InsertResult {
                    job: existing,
                    inserted: false,
                });
            }
        }

        let sql = format!(
            r#"
            INSERT INTO jobs (queue, state, args, attempt, max_attempts, priority,
                              scheduled_at, unique_key, inserted_at)
            VALUES ($1, $2, $3, 0, $4, $5, $6, $7, $8)
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
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(InsertResult {
            job: inserted,
            inserted: true,
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
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
                attempted_at = $1,
                lease_expires_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $3
                  AND state IN ('available', 'scheduled')
                  AND scheduled_at <= $1
                ORDER BY priority ASC, scheduled_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
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
            r#"
            UPDATE jobs SET lease_expires_at = $1
            WHERE id = $2 AND attempt = $3 AND state = 'executing'
            "#,
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
            SET state = 'completed', completed_at = NOW(), lease_expires_at = NULL
            WHERE id = $1 AND attempt = $2 AND state = 'executing'
            "#,
        )
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
        let state = if at <= Utc::now() {
            JobState::Available
        } else {
            JobState::Scheduled
        };
        let updated: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET state = CASE WHEN cancel_requested THEN 'cancelled' ELSE $1 END,
                scheduled_at = CASE WHEN cancel_requested THEN scheduled_at ELSE $2 END,
                completed_at = CASE WHEN cancel_requested THEN NOW() ELSE NULL END,
                last_error = CASE WHEN cancel_requested THEN $3 ELSE $4 END,
                lease_expires_at = NULL
            WHERE id = $5 AND attempt = $6 AND state = 'executing'
            RETURNING state
            "#,
        )
        .bind(state.as_str())
        .bind(at)
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
            SET state = CASE WHEN cancel_requested THEN 'cancelled' ELSE 'scheduled' END,
                scheduled_at = CASE WHEN cancel_requested THEN scheduled_at ELSE $1 END,
                attempt = CASE WHEN cancel_requested THEN attempt ELSE GREATEST(attempt - 1, 0) END,
                completed_at = CASE WHEN cancel_requested THEN NOW() ELSE completed_at END,
                last_error = CASE WHEN cancel_requested THEN $2 ELSE last_error END,
                lease_expires_at = NULL
            WHERE id = $3 AND attempt = $4 AND state = 'executing'
            RETURNING state
            "#,
        )
        .bind(at)
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
            SET state = 'discarded', last_error = $1, completed_at = NOW(), lease_expires_at = NULL
            WHERE id = $2 AND attempt = $3 AND state = 'executing'
            "#,
        )
        .bind(error)
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
            SET state = 'cancelled', completed_at = NOW()
            WHERE id = $1 AND state IN ('available', 'scheduled')
            RETURNING {JOB_COLUMNS}
            "#
        );
        if let Some(job) = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(CancelOutcome::Cancelled(job));
        }

        let sql = format!(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE
            WHERE id = $1 AND state = 'executing'
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
            SET state = 'cancelled', last_error = $1, completed_at = NOW(), lease_expires_at = NULL
            WHERE id = $2 AND attempt = $3 AND state = 'executing'
            "#,
        )
        .bind(error)
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
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = $1")
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
                    WHEN cancel_requested THEN 'cancelled'
                    WHEN attempt >= max_attempts THEN 'discarded'
                    ELSE 'available'
                END,
                completed_at = CASE
                    WHEN cancel_requested OR attempt >= max_attempts THEN $1
                    ELSE NULL
                END,
                last_error = 'lease expired',
                lease_expires_at = NULL
            WHERE state = 'executing' AND lease_expires_at < $1
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
        let mut query: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
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
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*)::BIGINT FROM jobs WHERE queue = $1 GROUP BY state",
        )
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
                  AND completed_at < $1
                ORDER BY completed_at ASC
                LIMIT $2
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
