// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compensation coordinator for saga rollback.
//!
//! When a workflow fails, every step that completed successfully is compensated
//! strictly in reverse completion order, one at a time. A failing compensation is
//! logged and recorded, and the remaining compensations still run.

use serde_json::Value;
use tracing::{debug, error, info};

use crate::context::StepContext;
use crate::error::{CompensationFailure, StepError};
use crate::step::{StepArgs, StepDefinition};

/// Compensation state for a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationState {
    /// No compensation defined for this step.
    None,
    /// Compensation completed successfully.
    Completed,
    /// Compensation failed.
    Failed,
}

impl CompensationState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A step that ran successfully, as recorded by the executor.
#[derive(Debug, Clone)]
pub struct CompletedStep {
    /// The step's definition.
    pub definition: StepDefinition,
    /// The arguments `run` was called with.
    pub args: StepArgs,
    /// The value `run` returned.
    pub result: Value,
}

impl CompletedStep {
    /// Step name.
    pub fn name(&self) -> &str {
        self.definition.name()
    }
}

/// Outcome of compensating a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationOutcome {
    /// Step name.
    pub step: String,
    /// Final state.
    pub state: CompensationState,
    /// The error, when the compensation failed.
    pub error: Option<StepError>,
}

/// Summary of a rollback, in the order compensations ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompensationReport {
    /// One entry per completed step, last completed first.
    pub outcomes: Vec<CompensationOutcome>,
}

impl CompensationReport {
    /// Whether every compensation succeeded (steps without one count as success).
    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.state != CompensationState::Failed)
    }

    /// The compensations that failed.
    pub fn failures(&self) -> Vec<CompensationFailure> {
        self.outcomes
            .iter()
            .filter_map(|o| {
                o.error.as_ref().map(|error| CompensationFailure {
                    step: o.step.clone(),
                    error: error.clone(),
                })
            })
            .collect()
    }

    /// Overall state: `None` when nothing needed compensating.
    pub fn state(&self) -> CompensationState {
        if self
            .outcomes
            .iter()
            .all(|o| o.state == CompensationState::None)
        {
            CompensationState::None
        } else if self.all_succeeded() {
            CompensationState::Completed
        } else {
            CompensationState::Failed
        }
    }
}

/// Runs compensations for a failed workflow run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompensationCoordinator;

impl CompensationCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self
    }

    /// Compensate `completed` (in completion order) from last to first.
    ///
    /// Never stops early: a failing compensation is logged and the rest still run.
    pub async fn compensate(
        &self,
        completed: &[CompletedStep],
        ctx: &StepContext,
    ) -> CompensationReport {
        if completed.is_empty() {
            debug!(run_id = %ctx.run_id, "No completed steps to compensate");
            return CompensationReport::default();
        }

        info!(
            run_id = %ctx.run_id,
            workflow = %ctx.workflow,
            count = completed.len(),
            "Triggering compensation"
        );

        let mut outcomes = Vec::with_capacity(completed.len());
        for entry in completed.iter().rev() {
            let step = entry.definition.step();
            let mut step_ctx = ctx.clone();
            step_ctx.step = entry.name().to_string();
            step_ctx.step_attempt = 1;
            step_ctx.deadline = None;

            debug!(run_id = %ctx.run_id, step = %entry.name(), "Compensating step");
            let outcome = match step.compensate(&entry.result, &entry.args, &step_ctx).await {
                Ok(()) => CompensationOutcome {
                    step: entry.name().to_string(),
                    state: if step.compensates() {
                        CompensationState::Completed
                    } else {
                        CompensationState::None
                    },
                    error: None,
                },
                Err(e) => {
                    error!(
                        run_id = %ctx.run_id,
                        step = %entry.name(),
                        error = %e,
                        "Compensation failed, continuing rollback"
                    );
                    CompensationOutcome {
                        step: entry.name().to_string(),
                        state: CompensationState::Failed,
                        error: Some(e),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let report = CompensationReport { outcomes };
        info!(
            run_id = %ctx.run_id,
            state = report.state().as_str(),
            all_succeeded = report.all_succeeded(),
            "Compensation finished"
        );
        report
    }
}
