// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keelson-core tests.
//!
//! Provides recording steps that append to a shared [`Trace`] so tests can assert
//! the exact order of `run` and `compensate` calls.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keelson_core::{
    ActorContext, ExecutorConfig, RetryPolicy, Role, Step, StepArgs, StepContext, StepError,
    WorkflowExecutor, async_trait,
};
use serde_json::{Map, Value, json};

/// Ordered log of step calls, e.g. `["a.run", "b.run", "a.compensate"]`.
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

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Step that records its calls and can be told to fail.
pub struct RecordingStep {
    pub name: &'static str,
    pub trace: Trace,
    pub result: Value,
    pub fail_with: Option<StepError>,
    pub compensation_error: Option<StepError>,
    pub delay: Option<Duration>,
    pub calls: Arc<AtomicU32>,
}

impl RecordingStep {
    pub fn new(name: &'static str, trace: &Trace) -> Self {
        Self {
            name,
            trace: trace.clone(),
            result: json!({ "step": name }),
            fail_with: None,
            compensation_error: None,
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn returning(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    pub fn failing(mut self, error: StepError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn failing_compensation(mut self, error: StepError) -> Self {
        self.compensation_error = Some(error);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl Step for RecordingStep {
    async fn run(&self, _args: &StepArgs, _ctx: &StepContext) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.trace.push(format!("{}.run", self.name));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(self.result.clone()),
        }
    }

    async fn compensate(
        &self,
        _result: &Value,
        _args: &StepArgs,
        _ctx: &StepContext,
    ) -> Result<(), StepError> {
        self.trace.push(format!("{}.compensate", self.name));
        match &self.compensation_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn compensates(&self) -> bool {
        true
    }
}

/// Step that fails transiently a fixed number of times before succeeding.
pub struct FlakyStep {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
}

impl FlakyStep {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl Step for FlakyStep {
    async fn run(&self, _args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StepError::transient(format!("connection reset #{}", call)));
        }
        Ok(json!({ "step_attempt": ctx.step_attempt() }))
    }
}

/// Executor that retries immediately.
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

/// Turn a JSON object literal into workflow inputs.
pub fn inputs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("inputs must be an object, got {}", other),
    }
}
