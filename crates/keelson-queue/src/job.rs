// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job records, their state machine and the canonical argument payload.
//!
//! ```text
//! scheduled ──► available ──► executing ──► completed
//!                   ▲             │
//!                   └── retry ────┤──► discarded
//!                                 └──► cancelled
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keelson_core::ActorContext;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::error::QueueError;
use crate::persistence::far_future;
use crate::queue::offset;

/// Job identifier.
pub type JobId = i64;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobState {
    /// Ready to be leased.
    Available,
    /// Waiting for its `scheduled_at`.
    Scheduled,
    /// Leased by a worker.
    Executing,
    /// Finished successfully.
    Completed,
    /// Failed permanently or ran out of attempts.
    Discarded,
    /// Cancelled before or during execution.
    Cancelled,
}

impl JobState {
    /// All states.
    pub const ALL: [JobState; 6] = [
        JobState::Available,
        JobState::Scheduled,
        JobState::Executing,
        JobState::Completed,
        JobState::Discarded,
        JobState::Cancelled,
    ];

    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Discarded => "discarded",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the job will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Discarded | Self::Cancelled)
    }

    /// Whether the job counts for uniqueness checks.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Available | Self::Scheduled | Self::Executing)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| QueueError::UnknownState(s.to_string()))
    }
}

impl TryFrom<String> for JobState {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A persisted job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,
    /// Queue the job belongs to.
    pub queue: String,
    /// Current state.
    #[sqlx(try_from = "String")]
    pub state: JobState,
    /// Argument payload, normally a [`JobArgs`] object.
    #[sqlx(json)]
    pub args: Value,
    /// Attempts started so far. Incremented on lease.
    pub attempt: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Lower runs first.
    pub priority: i32,
    /// Not leasable before this time.
    pub scheduled_at: DateTime<Utc>,
    /// Deduplication key.
    pub unique_key: Option<String>,
    /// When the job was enqueued.
    pub inserted_at: DateTime<Utc>,
    /// When the current or last attempt started.
    pub attempted_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the current lease runs out.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Most recent failure text.
    pub last_error: Option<String>,
    /// Set when cancellation was requested while executing.
    pub cancel_requested: bool,
}

impl Job {
    /// Whether another attempt is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Arguments of a workflow job: which workflow, its inputs and the actor it runs as.
///
/// Serialized as `{"workflow": .., "inputs": {..}, "actor": {"id", "tenant_id", "role"}}`
/// with string keys only.
#[derive(Debug, Clone, PartialEq)]
pub struct JobArgs {
    workflow: String,
    inputs: Map<String, Value>,
    actor: ActorContext,
}

#[derive(Deserialize)]
struct RawArgs {
    workflow: String,
    #[serde(default)]
    inputs: Map<String, Value>,
    actor: Value,
}

impl JobArgs {
    /// Build arguments for `workflow`.
    pub fn new(
        workflow: impl Into<String>,
        inputs: Map<String, Value>,
        actor: ActorContext,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            inputs,
            actor,
        }
    }

    /// Workflow name.
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Workflow inputs.
    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    /// The actor the job runs as.
    pub fn actor(&self) -> &ActorContext {
        &self.actor
    }

    /// Split into workflow name, inputs and actor.
    pub fn into_parts(self) -> (String, Map<String, Value>, ActorContext) {
        (self.workflow, self.inputs, self.actor)
    }

    /// Serialized form stored in the job row.
    pub fn to_value(&self) -> Value {
        json!({
            "workflow": self.workflow,
            "inputs": self.inputs,
            "actor": self.actor.to_json(),
        })
    }

    /// Parse and validate a stored payload.
    ///
    /// An unknown role or a forged system actor is an error, never a default.
    pub fn decode(value: &Value) -> Result<Self, QueueError> {
        if !value.is_object() {
            return Err(QueueError::InvalidArgs(
                "job arguments must be a JSON object".to_string(),
            ));
        }
        let raw: RawArgs = serde_json::from_value(value.clone())
            .map_err(|e| QueueError::InvalidArgs(e.to_string()))?;
        if raw.workflow.is_empty() {
            return Err(QueueError::InvalidArgs(
                "workflow name must not be empty".to_string(),
            ));
        }
        let actor = ActorContext::from_json(&raw.actor)?;
        Ok(Self {
            workflow: raw.workflow,
            inputs: raw.inputs,
            actor,
        })
    }
}

/// Check that arbitrary job arguments carry a valid actor.
pub(crate) fn validate_actor(args: &Value) -> Result<ActorContext, QueueError> {
    let object = args.as_object().ok_or_else(|| {
        QueueError::InvalidArgs("job arguments must be a JSON object".to_string())
    })?;
    let actor = object
        .get("actor")
        .ok_or_else(|| QueueError::InvalidArgs("job arguments carry no actor".to_string()))?;
    Ok(ActorContext::from_json(actor)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Uniqueness {
    Key(String),
    Args,
}

/// Options for [`JobQueue::enqueue`](crate::queue::JobQueue::enqueue).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    priority: i32,
    scheduled_at: Option<DateTime<Utc>>,
    schedule_in: Option<Duration>,
    max_attempts: Option<i32>,
    unique: Option<Uniqueness>,
}

impl EnqueueOptions {
    /// Default options: priority 0, run now, default attempts, not unique.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower numbers run first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Do not run before `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self.schedule_in = None;
        self
    }

    /// Do not run before `delay` from now.
    pub fn schedule_in(mut self, delay: Duration) -> Self {
        self.schedule_in = Some(delay);
        self.scheduled_at = None;
        self
    }

    /// Attempt budget for this job.
    pub fn max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Suppress duplicates sharing `key` within the uniqueness window.
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique = Some(Uniqueness::Key(key.into()));
        self
    }

    /// Suppress duplicates with identical queue and arguments.
    pub fn unique_by_args(mut self) -> Self {
        self.unique = Some(Uniqueness::Args);
        self
    }

    pub(crate) fn get_priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn get_max_attempts(&self) -> Option<i32> {
        self.max_attempts
    }

    pub(crate) fn resolve_scheduled_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.scheduled_at, self.schedule_in) {
            (Some(at), _) => at.min(far_future()),
            (None, Some(delay)) => offset(now, delay),
            (None, None) => now,
        }
    }

    pub(crate) fn resolve_unique_key(&self, queue: &str, args: &Value) -> Option<String> {
        match &self.unique {
            Some(Uniqueness::Key(key)) => Some(key.clone()),
            Some(Uniqueness::Args) => Some(args_digest(queue, args)),
            None => None,
        }
    }
}

/// SHA-256 of queue and canonical args. `serde_json` maps serialize with sorted keys.
fn args_digest(queue: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(queue.as_bytes());
    hasher.update([0u8]);
    hasher.update(args.to_string().as_bytes());
    format!("args:{:x}", hasher.finalize())
}
