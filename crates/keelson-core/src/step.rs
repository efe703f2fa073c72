// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steps: the units of work a workflow is made of.
//!
//! A step is a value implementing [`Step`], wrapped in a [`StepDefinition`] that
//! names it and declares where each of its arguments comes from. Referencing another
//! step's result as an argument is what creates a dependency edge.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::context::StepContext;
use crate::error::StepError;

/// A unit of work with an optional inverse.
///
/// Implementations take everything they need as explicit parameters and keep no
/// mutable state of their own, so the same step can run for many workflow runs.
#[async_trait]
pub trait Step: Send + Sync {
    /// Perform the step's effect and return its result.
    async fn run(&self, args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError>;

    /// Undo the effect of a successful `run`.
    ///
    /// Must be idempotent: it may be invoked for an effect that is already gone.
    /// The default is a no-op, which is correct for pure reads.
    async fn compensate(
        &self,
        _result: &Value,
        _args: &StepArgs,
        _ctx: &StepContext,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Whether [`Step::compensate`] does anything. Only used for reporting.
    fn compensates(&self) -> bool {
        false
    }
}

/// Where a step argument comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// A declared workflow input.
    Input(String),
    /// The full result of another step.
    Result(String),
    /// A JSON pointer into another step's result.
    Path {
        /// The step whose result is read.
        step: String,
        /// RFC 6901 pointer, e.g. `/order/id`.
        pointer: String,
    },
    /// A constant.
    Value(Value),
}

impl Arg {
    /// Argument bound to a workflow input.
    pub fn input(name: impl Into<String>) -> Self {
        Self::Input(name.into())
    }

    /// Argument bound to another step's result.
    pub fn result(step: impl Into<String>) -> Self {
        Self::Result(step.into())
    }

    /// Argument bound to part of another step's result.
    pub fn path(step: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self::Path {
            step: step.into(),
            pointer: pointer.into(),
        }
    }

    /// Constant argument.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// The step this argument depends on, if any.
    pub fn step_reference(&self) -> Option<&str> {
        match self {
            Self::Result(step) | Self::Path { step, .. } => Some(step),
            Self::Input(_) | Self::Value(_) => None,
        }
    }

    /// The input this argument reads, if any.
    pub fn input_reference(&self) -> Option<&str> {
        match self {
            Self::Input(name) => Some(name),
            _ => None,
        }
    }
}

/// Named arguments handed to a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepArgs {
    values: Map<String, Value>,
}

impl StepArgs {
    /// Create argument bag from a JSON map.
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Look up an argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Look up an argument that must be present.
    pub fn require(&self, name: &str) -> Result<&Value, StepError> {
        self.values
            .get(name)
            .ok_or_else(|| StepError::permanent(format!("missing argument '{}'", name)))
    }

    /// Deserialize an argument into a typed value.
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<T, StepError> {
        let value = self.require(name)?;
        serde_json::from_value(value.clone()).map_err(|e| {
            StepError::permanent(format!("argument '{}' has the wrong shape: {}", name, e))
        })
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// The arguments as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

impl<const N: usize> From<[(&str, Value); N]> for StepArgs {
    fn from(pairs: [(&str, Value); N]) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

/// A named step plus its argument bindings and execution settings.
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    args: Vec<(String, Arg)>,
    wait_for: Vec<String>,
    max_retries: u32,
    timeout: Option<Duration>,
    idempotent: bool,
    step: Arc<dyn Step>,
}

impl StepDefinition {
    /// Define a step with no arguments, no retries and no timeout.
    pub fn new(name: impl Into<String>, step: impl Step + 'static) -> Self {
        Self::from_arc(name, Arc::new(step))
    }

    /// Define a step from a shared implementation.
    pub fn from_arc(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            wait_for: Vec::new(),
            max_retries: 0,
            timeout: None,
            idempotent: true,
            step,
        }
    }

    /// Bind an argument.
    pub fn arg(mut self, name: impl Into<String>, source: Arg) -> Self {
        self.args.push((name.into(), source));
        self
    }

    /// Order this step after another without consuming its result.
    pub fn wait_for(mut self, step: impl Into<String>) -> Self {
        self.wait_for.push(step.into());
        self
    }

    /// Retry transient failures up to `n` extra times in place.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Fail the attempt if `run` takes longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark the step as unsafe to run twice: a timeout then becomes permanent.
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// Step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Argument bindings in declaration order.
    pub fn args(&self) -> &[(String, Arg)] {
        &self.args
    }

    /// Maximum in-place retries for transient failures.
    pub fn retries(&self) -> u32 {
        self.max_retries
    }

    /// Per-attempt timeout.
    pub fn step_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether a timed-out attempt may be retried.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// The step implementation.
    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    /// Steps this one depends on, deduplicated, in declaration order.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        let refs = self
            .args
            .iter()
            .filter_map(|(_, arg)| arg.step_reference())
            .chain(self.wait_for.iter().map(String::as_str));
        for dep in refs {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        deps
    }

    /// Inputs this step reads, in declaration order.
    pub fn input_references(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|(_, arg)| arg.input_reference())
            .collect()
    }

    /// Build the argument bag from workflow inputs and completed step results.
    ///
    /// A path that does not resolve yields `null`.
    pub(crate) fn bind_args(
        &self,
        inputs: &Map<String, Value>,
        results: &HashMap<String, Value>,
    ) -> Result<StepArgs, StepError> {
        let mut values = Map::new();
        for (name, source) in &self.args {
            let value = match source {
                Arg::Input(input) => inputs.get(input).cloned().ok_or_else(|| {
                    StepError::permanent(format!("input '{}' is not available", input))
                })?,
                Arg::Result(step) => results.get(step).cloned().ok_or_else(|| {
                    StepError::permanent(format!("result of '{}' is not available", step))
                })?,
                Arg::Path { step, pointer } => results
                    .get(step)
                    .ok_or_else(|| {
                        StepError::permanent(format!("result of '{}' is not available", step))
                    })?
                    .pointer(pointer)
                    .cloned()
                    .unwrap_or(Value::Null),
                Arg::Value(value) => value.clone(),
            };
            values.insert(name.clone(), value);
        }
        Ok(StepArgs::new(values))
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("wait_for", &self.wait_for)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}
