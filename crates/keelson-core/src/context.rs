// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-step execution context.

use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actor::ActorContext;
use crate::authz::Resource;
use crate::error::{StepError, WorkflowError};
use crate::executor::{RunOptions, WorkflowExecutor};
use crate::workflow::Workflow;

/// Everything a step may know about the run it belongs to.
///
/// Built by the executor for every attempt. The actor inside is the one the run
/// was started with and cannot be replaced.
#[derive(Clone)]
pub struct StepContext {
    pub(crate) actor: ActorContext,
    pub(crate) run_id: Uuid,
    pub(crate) workflow: String,
    pub(crate) step: String,
    pub(crate) attempt: u32,
    pub(crate) step_attempt: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) executor: WorkflowExecutor,
}

impl StepContext {
    /// The actor the workflow runs on behalf of.
    pub fn actor(&self) -> &ActorContext {
        &self.actor
    }

    /// Identifier of the current workflow run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Name of the running workflow.
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Name of the running step.
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Job attempt (1 for synchronous executions).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// In-place attempt of this step within the run, starting at 1.
    pub fn step_attempt(&self) -> u32 {
        self.step_attempt
    }

    /// When the current attempt times out, if the step declares a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether cancellation was requested for the run.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Ask the configured authorizer whether the run's actor may perform `action`.
    ///
    /// Deny and NotFound come back as permanent errors, ready for `?`.
    pub async fn authorize(&self, resource: &Resource, action: &str) -> Result<(), StepError> {
        let authorizer = self
            .executor
            .authorizer()
            .ok_or_else(|| StepError::permanent("no authorizer configured"))?;
        let decision = authorizer.authorize(&self.actor, resource, action).await?;
        tracing::debug!(
            actor = %self.actor,
            resource = %resource,
            action,
            decision = ?decision,
            "Authorization decided"
        );
        decision.into_result(resource, action)
    }

    /// Run a nested workflow with the same actor and cancellation token.
    pub async fn execute_subworkflow(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
    ) -> Result<Value, WorkflowError> {
        let options = RunOptions {
            attempt: self.attempt,
            cancellation: self.cancellation.child_token(),
            run_id: Uuid::new_v4(),
        };
        self.executor
            .execute_with(workflow, inputs, self.actor.clone(), options)
            .await
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("actor", &self.actor)
            .field("run_id", &self.run_id)
            .field("workflow", &self.workflow)
            .field("step", &self.step)
            .field("attempt", &self.attempt)
            .field("step_attempt", &self.step_attempt)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
impl StepContext {
    /// Context for unit tests that call steps directly.
    pub(crate) fn for_test(actor: ActorContext) -> Self {
        Self {
            actor,
            run_id: Uuid::new_v4(),
            workflow: "test".to_string(),
            step: String::new(),
            attempt: 1,
            step_attempt: 1,
            deadline: None,
            cancellation: CancellationToken::new(),
            executor: WorkflowExecutor::default(),
        }
    }
}
