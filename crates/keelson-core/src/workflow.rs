// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A [`Workflow`] is an ordered list of [`StepDefinition`]s plus declared inputs,
//! assembled with [`WorkflowBuilder`]. Building validates the dependency graph, so a
//! `Workflow` value is always acyclic with every reference resolved.
//!
//! ```ignore
//! let workflow = WorkflowBuilder::new("place_order")
//!     .input("order")
//!     .step(StepDefinition::new("reserve", ReserveStock).arg("order", Arg::input("order")))
//!     .step(StepDefinition::new("charge", ChargeCard).arg("reservation", Arg::result("reserve")))
//!     .returns("charge")
//!     .build()?;
//! ```

use crate::error::DefinitionError;
use crate::graph::{ExecutionPlan, StepNode, resolve};
use crate::step::StepDefinition;

/// A validated, immutable workflow definition.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    inputs: Vec<String>,
    steps: Vec<StepDefinition>,
    returns: Option<usize>,
    plan: ExecutionPlan,
}

impl Workflow {
    /// Start defining a workflow.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared inputs.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name() == name)
    }

    /// The step whose result is the workflow result, if designated.
    pub fn return_step(&self) -> Option<&StepDefinition> {
        self.returns.map(|i| &self.steps[i])
    }

    /// The validated execution plan.
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Ready sets as step names. Mostly useful for logging and tests.
    pub fn ready_sets(&self) -> Vec<Vec<&str>> {
        self.plan
            .layers()
            .iter()
            .map(|layer| layer.iter().map(|&i| self.steps[i].name()).collect())
            .collect()
    }
}

/// Builder for [`Workflow`].
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    inputs: Vec<String>,
    steps: Vec<StepDefinition>,
    returns: Option<String>,
}

impl WorkflowBuilder {
    /// Create a new builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            steps: Vec::new(),
            returns: None,
        }
    }

    /// Declare a named input.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    /// Append a step.
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Use this step's result as the workflow result.
    ///
    /// Without it the result is an object mapping each step name to its result.
    pub fn returns(mut self, step: impl Into<String>) -> Self {
        self.returns = Some(step.into());
        self
    }

    /// Validate the definition and produce a [`Workflow`].
    pub fn build(self) -> Result<Workflow, DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty(self.name));
        }

        let plan = {
            let deps: Vec<Vec<&str>> = self.steps.iter().map(|s| s.dependencies()).collect();
            let inputs: Vec<Vec<&str>> =
                self.steps.iter().map(|s| s.input_references()).collect();
            let nodes: Vec<StepNode<'_>> = self
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| StepNode {
                    name: s.name(),
                    steps: &deps[i],
                    inputs: &inputs[i],
                })
                .collect();
            let declared: Vec<&str> = self.inputs.iter().map(String::as_str).collect();
            resolve(&declared, &nodes)?
        };

        let returns = match self.returns {
            Some(name) => Some(
                self.steps
                    .iter()
                    .position(|s| s.name() == name)
                    .ok_or(DefinitionError::UnknownReturnStep(name))?,
            ),
            None => None,
        };

        tracing::debug!(
            workflow = %self.name,
            steps = self.steps.len(),
            ready_sets = plan.layers().len(),
            "Workflow definition validated"
        );

        Ok(Workflow {
            name: self.name,
            inputs: self.inputs,
            steps: self.steps,
            returns,
            plan,
        })
    }
}
