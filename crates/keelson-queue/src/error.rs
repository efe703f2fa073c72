// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keelson-queue.

use keelson_core::ActorError;
use thiserror::Error;

use crate::job::JobId;

/// Result type using [`QueueError`].
pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Configuration loading failed.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The serialized actor in the job arguments is invalid.
    #[error("invalid actor: {0}")]
    Actor(#[from] ActorError),

    /// Job arguments do not have the expected shape.
    #[error("invalid job arguments: {0}")]
    InvalidArgs(String),

    /// A queue name was empty.
    #[error("queue name must not be empty")]
    EmptyQueue,

    /// A stored job state is not one of the known states.
    #[error("unknown job state '{0}'")]
    UnknownState(String),

    /// Job was not found.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// The job is not in the state the operation requires.
    #[error("job {id} is not {expected}")]
    InvalidState {
        /// The job.
        id: JobId,
        /// The state the operation requires.
        expected: &'static str,
    },

    /// A unique insert kept racing with jobs that finished under it.
    #[error("unique key '{0}' is contended, try again")]
    UniqueConflict(String),

    /// No workflow with this name is registered.
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// A cron expression failed to parse.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Parser message.
        reason: String,
    },

    /// The database URL scheme is not supported.
    #[error("unsupported database URL '{0}', expected sqlite: or postgres://")]
    UnsupportedDatabase(String),
}

impl QueueError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Actor(_) => "INVALID_ACTOR",
            Self::InvalidArgs(_) => "INVALID_ARGS",
            Self::EmptyQueue => "EMPTY_QUEUE",
            Self::UnknownState(_) => "UNKNOWN_STATE",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_JOB_STATE",
            Self::UniqueConflict(_) => "UNIQUE_CONFLICT",
            Self::UnknownWorkflow(_) => "UNKNOWN_WORKFLOW",
            Self::InvalidCron { .. } => "INVALID_CRON",
            Self::UnsupportedDatabase(_) => "UNSUPPORTED_DATABASE",
        }
    }

    /// Whether retrying the same job can never succeed.
    ///
    /// Argument and registry problems are fatal for the job. Database and I/O
    /// failures are not.
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(
            self,
            Self::Actor(_) | Self::InvalidArgs(_) | Self::UnknownWorkflow(_) | Self::Json(_)
        )
    }
}
