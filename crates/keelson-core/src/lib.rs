// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keelson core: saga workflows with dependency ordering and compensation.
//!
//! A [`Workflow`] is a set of named [`Step`]s whose arguments may reference workflow
//! inputs or other steps' results. The references form a DAG that is validated when
//! the workflow is built. The [`WorkflowExecutor`] runs independent steps
//! concurrently and, when a step fails, compensates every completed step in reverse
//! completion order.
//!
//! Every execution carries an [`ActorContext`] that steps can read and pass to the
//! [`Authorizer`] through [`StepContext::authorize`].
//!
//! # Example
//!
//! ```ignore
//! use keelson_core::{ActorContext, Arg, Role, StepDefinition, Workflow, WorkflowExecutor};
//!
//! let workflow = Workflow::builder("place_order")
//!     .input("order")
//!     .step(StepDefinition::new("reserve", ReserveStock).arg("order", Arg::input("order")))
//!     .step(StepDefinition::new("charge", ChargeCard).arg("reservation", Arg::result("reserve")))
//!     .returns("charge")
//!     .build()?;
//!
//! let actor = ActorContext::new("user-1", "acme", Role::Editor)?;
//! let receipt = WorkflowExecutor::default()
//!     .execute(&workflow, inputs, actor)
//!     .await?;
//! ```

#![deny(missing_docs)]

pub mod actor;
pub mod authz;
pub mod compensation;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod retry;
pub mod step;
pub mod workflow;

pub use actor::{ActorContext, ActorError, Role, SYSTEM_TENANT, SerializedActor, SystemOperation};
pub use authz::{AuthorizationDecision, Authorizer, Resource};
pub use compensation::{
    CompensationCoordinator, CompensationOutcome, CompensationReport, CompensationState,
    CompletedStep,
};
pub use context::StepContext;
pub use error::{CompensationFailure, DefinitionError, StepError, WorkflowError};
pub use executor::{ExecutorConfig, RunOptions, RunReport, WorkflowExecutor, WorkflowRun};
pub use graph::ExecutionPlan;
pub use retry::{FailureClass, RetryDecision, RetryPolicy, classify};
pub use step::{Arg, Step, StepArgs, StepDefinition};
pub use workflow::{Workflow, WorkflowBuilder};

// Re-exported so step implementations need not depend on these crates directly.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
