// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keelson queue: durable workflow jobs on PostgreSQL or SQLite.
//!
//! Jobs carry a workflow name, its inputs and the serialized [`ActorContext`] of
//! whoever enqueued them. Workers lease jobs atomically, rebuild the actor, run the
//! workflow with [`keelson_core`] and drive the job state machine from the result.
//!
//! ```text
//!   enqueue ──► scheduled ──► available ──► executing ──► completed
//!                                ▲              │
//!                                └── retry ─────┼──► discarded
//!                                               └──► cancelled
//! ```
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`JobQueue`] | enqueue with priority, schedule and uniqueness; lease, complete, fail, snooze, cancel |
//! | [`Worker`] / [`WorkerPool`] | bounded concurrent execution of leased jobs |
//! | [`CronScheduler`] | enqueues recurring jobs as the system actor |
//! | [`LeaseRescuer`] | releases jobs of crashed workers |
//! | [`JobPruner`] | deletes old finished jobs |
//! | [`QueueRuntime`] | runs all of the above inside a tokio application |
//!
//! # Configuration
//!
//! [`Config::from_env`] reads `KEELSON_*` variables; see its documentation for the
//! full list. Pruning is configured separately through [`JobPrunerConfig::from_env`].
//!
//! [`ActorContext`]: keelson_core::ActorContext

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod job;
pub mod migrations;
pub mod persistence;
pub mod pruner;
pub mod queue;
pub mod registry;
pub mod rescuer;
pub mod runtime;
pub mod scheduler;
pub mod worker;

pub use config::{Config, ConfigError};
pub use error::{QueueError, Result};
pub use job::{EnqueueOptions, Job, JobArgs, JobId, JobState};
pub use persistence::{
    CancelOutcome, InsertResult, JobFilter, JobStore, NewJob, PostgresJobStore, SqliteJobStore,
};
pub use pruner::{JobPruner, JobPrunerConfig};
pub use queue::{FailOutcome, JobQueue, QueueSettings, SnoozeOutcome};
pub use registry::{DiscardHook, WorkflowRegistry};
pub use rescuer::{LeaseRescuer, LeaseRescuerConfig};
pub use runtime::{QueueRuntime, QueueRuntimeBuilder, QueueRuntimeConfig, connect};
pub use scheduler::{CronEntry, CronScheduler};
pub use worker::{DrainSummary, JobOutcome, Worker, WorkerPool};
