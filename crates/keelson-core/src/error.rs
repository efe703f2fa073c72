// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy for workflow definition and execution.
//!
//! - [`DefinitionError`]: malformed workflow graph, raised only by
//!   [`WorkflowBuilder::build`](crate::workflow::WorkflowBuilder::build).
//! - [`StepError`]: what a step's `run` or `compensate` returns. Its shape decides
//!   retry classification (see [`crate::retry`]).
//! - [`WorkflowError`]: the outcome of a failed execution, possibly wrapping
//!   compensation failures.

use std::time::Duration;

use crate::retry::{FailureClass, classify};

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Structural problems detected while building a workflow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DefinitionError {
    /// The workflow has no steps.
    #[error("workflow '{0}' has no steps")]
    Empty(String),

    /// A step or input name is empty.
    #[error("names must not be empty")]
    EmptyName,

    /// Two steps share a name.
    #[error("duplicate step '{0}'")]
    DuplicateStep(String),

    /// Two inputs share a name.
    #[error("duplicate input '{0}'")]
    DuplicateInput(String),

    /// A step references a step that does not exist.
    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownStep {
        /// The referencing step.
        step: String,
        /// The missing step name.
        reference: String,
    },

    /// A step references an input that was not declared.
    #[error("step '{step}' references undeclared input '{input}'")]
    UnknownInput {
        /// The referencing step.
        step: String,
        /// The missing input name.
        input: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// The designated return step does not exist.
    #[error("return step '{0}' is not defined")]
    UnknownReturnStep(String),
}

/// Failure returned by a step's `run` or `compensate`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Business failure that must not be retried (validation, invariant violation).
    #[error("{0}")]
    Permanent(String),

    /// The authorization collaborator denied the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resource does not exist (or is hidden from this actor).
    #[error("not found: {0}")]
    NotFound(String),

    /// Network, timeout or contention failure that may succeed on retry.
    #[error("{0}")]
    Transient(String),

    /// Defer the whole job by the given delay without counting a failed attempt.
    #[error("snoozed for {0:?}")]
    Snooze(Duration),
}

impl StepError {
    /// Shorthand for [`StepError::Permanent`].
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Shorthand for [`StepError::Transient`].
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    /// Shorthand for [`StepError::Snooze`].
    pub fn snooze(delay: Duration) -> Self {
        Self::Snooze(delay)
    }

    /// Retry classification of this error.
    pub fn class(&self) -> FailureClass {
        classify(self)
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Permanent(format!("invalid step data: {}", err))
    }
}

/// A compensation that failed during rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    /// Step whose compensation failed.
    pub step: String,
    /// The error returned by `compensate`.
    pub error: StepError,
}

/// Failure of a workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A declared input was not supplied.
    #[error("missing workflow input '{0}'")]
    MissingInput(String),

    /// An input was supplied that the workflow does not declare.
    #[error("unexpected workflow input '{0}'")]
    UnknownInput(String),

    /// A step failed after exhausting its in-place retries.
    #[error("step '{step}' failed after {attempts} attempt(s): {error}")]
    StepFailed {
        /// Failing step.
        step: String,
        /// The step's final error.
        error: StepError,
        /// Number of times the step ran.
        attempts: u32,
    },

    /// A step task panicked.
    #[error("step '{0}' panicked")]
    StepPanicked(String),

    /// Cancellation was observed between ready sets.
    #[error("workflow cancelled")]
    Cancelled,

    /// Rollback itself failed for at least one step.
    #[error("{source} (compensation failed for: {})", failed_steps(.failures))]
    Compensation {
        /// The failure that triggered the rollback.
        source: Box<WorkflowError>,
        /// Every compensation that failed, in the order they were attempted.
        failures: Vec<CompensationFailure>,
    },
}

fn failed_steps(failures: &[CompensationFailure]) -> String {
    failures
        .iter()
        .map(|f| f.step.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl WorkflowError {
    /// Retry classification of this failure.
    ///
    /// A compensation failure is classified by the failure that triggered it.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::StepFailed { error, .. } => classify(error),
            Self::Cancelled => FailureClass::Cancelled,
            Self::Compensation { source, .. } => source.class(),
            Self::MissingInput(_) | Self::UnknownInput(_) | Self::StepPanicked(_) => {
                FailureClass::Permanent
            }
        }
    }

    /// The failure that originally stopped the workflow.
    pub fn original(&self) -> &WorkflowError {
        match self {
            Self::Compensation { source, .. } => source.original(),
            other => other,
        }
    }

    /// The step error behind this failure, if a step failed.
    pub fn step_error(&self) -> Option<&StepError> {
        match self.original() {
            Self::StepFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Compensation failures attached to this error.
    pub fn compensation_failures(&self) -> &[CompensationFailure] {
        match self {
            Self::Compensation { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingInput(_) => "MISSING_INPUT",
            Self::UnknownInput(_) => "UNKNOWN_INPUT",
            Self::StepFailed { error, .. } => match error {
                StepError::Permanent(_) => "PERMANENT_FAILURE",
                StepError::Forbidden(_) => "FORBIDDEN",
                StepError::NotFound(_) => "NOT_FOUND",
                StepError::Transient(_) => "TRANSIENT_FAILURE",
                StepError::Snooze(_) => "SNOOZED",
            },
            Self::StepPanicked(_) => "STEP_PANICKED",
            Self::Cancelled => "CANCELLED",
            Self::Compensation { .. } => "COMPENSATION_FAILED",
        }
    }
}
