// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keelson-queue tests.
//!
//! SQLite tests run against an in-memory database. PostgreSQL tests need
//! `TEST_DATABASE_URL` and are skipped without it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keelson_core::{
    ActorContext, ExecutorConfig, RetryPolicy, Role, Step, StepArgs, StepContext, StepError,
    WorkflowExecutor, async_trait,
};
use keelson_queue::{DiscardHook, Job, JobArgs, JobQueue, QueueSettings, SqliteJobStore};
use serde_json::{Map, Value, json};

/// Skip the test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Queue settings with millisecond backoff so retry tests stay fast.
pub fn fast_settings() -> QueueSettings {
    QueueSettings {
        unique_window: Duration::from_secs(60),
        default_max_attempts: 3,
        retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_secs(1)),
        lease_timeout: Duration::from_secs(30),
    }
}

/// Queue over a fresh in-memory SQLite database.
pub async fn memory_queue(settings: QueueSettings) -> JobQueue {
    let store = SqliteJobStore::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory store");
    JobQueue::new(Arc::new(store), settings)
}

/// Executor without in-place retry delays.
pub fn executor() -> WorkflowExecutor {
    WorkflowExecutor::new(ExecutorConfig {
        max_concurrency: 4,
        retry: RetryPolicy::immediate(),
    })
}

pub fn editor() -> ActorContext {
    ActorContext::new("user-1", "acme", Role::Editor).unwrap()
}

pub fn viewer() -> ActorContext {
    ActorContext::new("user-2", "acme", Role::Viewer).unwrap()
}

/// Serialized args for `workflow` run by `actor` with no inputs.
pub fn workflow_args(workflow: &str, actor: &ActorContext) -> Value {
    JobArgs::new(workflow, Map::new(), actor.clone()).to_value()
}

/// Ordered log of step calls.
#[derive(Debug, Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Step that records calls and the actor it ran as, and fails on demand.
pub struct TracedStep {
    pub name: &'static str,
    pub trace: Trace,
    pub fail_with: Option<StepError>,
    pub delay: Option<Duration>,
    pub calls: Arc<AtomicU32>,
    pub seen: Arc<Mutex<Vec<(ActorContext, u32)>>>,
}

impl TracedStep {
    pub fn new(name: &'static str, trace: &Trace) -> Self {
        Self {
            name,
            trace: trace.clone(),
            fail_with: None,
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(mut self, error: StepError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }

    /// Actors and job attempts observed by `run`.
    pub fn seen(&self) -> Arc<Mutex<Vec<(ActorContext, u32)>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Step for TracedStep {
    async fn run(&self, _args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((ctx.actor().clone(), ctx.attempt()));
        self.trace.push(format!("{}.run", self.name));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(json!({ "step": self.name })),
        }
    }

    async fn compensate(
        &self,
        _result: &Value,
        _args: &StepArgs,
        _ctx: &StepContext,
    ) -> Result<(), StepError> {
        self.trace.push(format!("{}.compensate", self.name));
        Ok(())
    }

    fn compensates(&self) -> bool {
        true
    }
}

/// Discard hook that records every call.
#[derive(Debug, Default)]
pub struct RecordingHook {
    pub calls: Mutex<Vec<(i64, String)>>,
}

impl RecordingHook {
    pub fn calls(&self) -> Vec<(i64, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiscardHook for RecordingHook {
    async fn on_discard(&self, job: &Job, error: &str) {
        self.calls.lock().unwrap().push((job.id, error.to_string()));
    }
}
