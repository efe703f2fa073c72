// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow executor.
//!
//! Walks the ready sets of a [`Workflow`] in order. Steps of one ready set run as
//! separate tokio tasks, bounded by [`ExecutorConfig::max_concurrency`]. On the first
//! failure no further step is started, steps already in flight are awaited, and the
//! completed steps are handed to the [`CompensationCoordinator`].
//!
//! ```text
//!  inputs ──► ready set 0 ──► ready set 1 ──► ... ──► result
//!                 │ fail          │ fail
//!                 ▼               ▼
//!           compensate completed steps, last completed first
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::actor::ActorContext;
use crate::authz::Authorizer;
use crate::compensation::{CompensationCoordinator, CompensationReport, CompletedStep};
use crate::context::StepContext;
use crate::error::{StepError, WorkflowError};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::step::{StepArgs, StepDefinition};
use crate::workflow::Workflow;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum steps of one run executing at the same time.
    pub max_concurrency: usize,
    /// Backoff between in-place retries of a transient step failure.
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10)),
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Job attempt number, 1 for synchronous calls.
    pub attempt: u32,
    /// Token observed before each ready set.
    pub cancellation: CancellationToken,
    /// Run identifier used in logs and contexts.
    pub run_id: Uuid,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            attempt: 1,
            cancellation: CancellationToken::new(),
            run_id: Uuid::new_v4(),
        }
    }
}

/// Runtime record of one execution. Never persisted.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    run_id: Uuid,
    completed: Vec<CompletedStep>,
    pending: BTreeSet<String>,
    failure: Option<WorkflowError>,
}

impl WorkflowRun {
    fn new(run_id: Uuid, workflow: &Workflow) -> Self {
        Self {
            run_id,
            completed: Vec::new(),
            pending: workflow.steps().iter().map(|s| s.name().to_string()).collect(),
            failure: None,
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Steps that completed, in completion order.
    pub fn completed(&self) -> &[CompletedStep] {
        &self.completed
    }

    /// Names of completed steps, in completion order.
    pub fn completed_names(&self) -> Vec<&str> {
        self.completed.iter().map(|c| c.name()).collect()
    }

    /// Steps that never completed.
    pub fn pending(&self) -> &BTreeSet<String> {
        &self.pending
    }

    /// The failure that stopped the run, if any.
    pub fn failure(&self) -> Option<&WorkflowError> {
        self.failure.as_ref()
    }

    fn record_failure(&mut self, error: WorkflowError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn results(&self) -> HashMap<String, Value> {
        self.completed
            .iter()
            .map(|c| (c.name().to_string(), c.result.clone()))
            .collect()
    }
}

/// Everything known about a finished execution.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The runtime record.
    pub run: WorkflowRun,
    /// Rollback summary, empty when the run succeeded.
    pub compensation: CompensationReport,
    /// Final result.
    pub result: Result<Value, WorkflowError>,
}

struct ExecutorInner {
    config: ExecutorConfig,
    authorizer: Option<Arc<dyn Authorizer>>,
    coordinator: CompensationCoordinator,
}

/// Executes workflows. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("config", &self.inner.config)
            .field("authorizer", &self.inner.authorizer.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for WorkflowExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

type StepOutcome = Result<(StepArgs, Value), WorkflowError>;

impl WorkflowExecutor {
    /// Create an executor without an authorizer.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                authorizer: None,
                coordinator: CompensationCoordinator::new(),
            }),
        }
    }

    /// Create an executor whose steps can consult `authorizer`.
    pub fn with_authorizer(config: ExecutorConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                authorizer: Some(authorizer),
                coordinator: CompensationCoordinator::new(),
            }),
        }
    }

    /// Executor settings.
    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub(crate) fn authorizer(&self) -> Option<&Arc<dyn Authorizer>> {
        self.inner.authorizer.as_ref()
    }

    /// Execute a workflow on behalf of `actor`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        actor: ActorContext,
    ) -> Result<Value, WorkflowError> {
        self.execute_with(workflow, inputs, actor, RunOptions::default())
            .await
    }

    /// Execute with explicit run options.
    pub async fn execute_with(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        actor: ActorContext,
        options: RunOptions,
    ) -> Result<Value, WorkflowError> {
        self.execute_run(workflow, inputs, actor, options)
            .await
            .result
    }

    /// Execute and return the full [`RunReport`].
    #[instrument(skip_all, fields(workflow = %workflow.name(), run_id = %options.run_id, attempt = options.attempt))]
    pub async fn execute_run(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        actor: ActorContext,
        options: RunOptions,
    ) -> RunReport {
        let mut run = WorkflowRun::new(options.run_id, workflow);

        if let Err(e) = check_inputs(workflow, &inputs) {
            warn!(error = %e, "Rejected workflow inputs");
            run.record_failure(e.clone());
            return RunReport {
                run,
                compensation: CompensationReport::default(),
                result: Err(e),
            };
        }

        info!(actor = %actor, steps = workflow.steps().len(), "Workflow started");

        let base_ctx = StepContext {
            actor,
            run_id: options.run_id,
            workflow: workflow.name().to_string(),
            step: String::new(),
            attempt: options.attempt,
            step_attempt: 1,
            deadline: None,
            cancellation: options.cancellation.clone(),
            executor: self.clone(),
        };

        for (n, layer) in workflow.plan().layers().iter().enumerate() {
            if options.cancellation.is_cancelled() {
                info!(ready_set = n, "Cancellation observed");
                run.record_failure(WorkflowError::Cancelled);
                break;
            }

            debug!(ready_set = n, size = layer.len(), "Starting ready set");
            self.run_ready_set(workflow, layer, &inputs, &base_ctx, &mut run)
                .await;

            if run.failure.is_some() {
                break;
            }
        }

        let Some(failure) = run.failure.clone() else {
            let result = final_value(workflow, &run);
            info!(completed = run.completed.len(), "Workflow completed");
            return RunReport {
                run,
                compensation: CompensationReport::default(),
                result: Ok(result),
            };
        };

        warn!(
            error = %failure,
            completed = run.completed.len(),
            "Workflow failed, rolling back"
        );
        let compensation = self
            .inner
            .coordinator
            .compensate(&run.completed, &base_ctx)
            .await;

        let failures = compensation.failures();
        let result = if failures.is_empty() {
            Err(failure)
        } else {
            error!(
                failed = failures.len(),
                "Rollback incomplete, compensation failures attached to workflow error"
            );
            Err(WorkflowError::Compensation {
                source: Box::new(failure),
                failures,
            })
        };

        RunReport {
            run,
            compensation,
            result,
        }
    }

    async fn run_ready_set(
        &self,
        workflow: &Workflow,
        layer: &[usize],
        inputs: &Map<String, Value>,
        base_ctx: &StepContext,
        run: &mut WorkflowRun,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrency.max(1)));
        let halt = CancellationToken::new();
        let results = run.results();
        let retry = self.inner.config.retry;
        let mut tasks = JoinSet::new();

        for &index in layer {
            let definition = workflow.steps()[index].clone();
            let args = match definition.bind_args(inputs, &results) {
                Ok(args) => args,
                Err(error) => {
                    run.record_failure(WorkflowError::StepFailed {
                        step: definition.name().to_string(),
                        error,
                        attempts: 0,
                    });
                    halt.cancel();
                    break;
                }
            };

            let mut ctx = base_ctx.clone();
            ctx.step = definition.name().to_string();
            let semaphore = semaphore.clone();
            let halt = halt.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = halt.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (index, None);
                };
                if halt.is_cancelled() {
                    return (index, None);
                }

                let name = definition.name().to_string();
                let outcome =
                    match tokio::spawn(attempt_step(definition, args, ctx, retry)).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(step = %name, error = %e, "Step task aborted");
                            Err(WorkflowError::StepPanicked(name))
                        }
                    };
                if outcome.is_err() {
                    halt.cancel();
                }
                (index, Some(outcome))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Some(Ok((args, result))))) => {
                    let definition = workflow.steps()[index].clone();
                    run.pending.remove(definition.name());
                    run.completed.push(CompletedStep {
                        definition,
                        args,
                        result,
                    });
                }
                Ok((_, Some(Err(e)))) => run.record_failure(e),
                Ok((index, None)) => {
                    debug!(step = %workflow.steps()[index].name(), "Step not started");
                }
                Err(e) => {
                    error!(error = %e, "Ready set task aborted");
                    run.record_failure(WorkflowError::StepPanicked("unknown".to_string()));
                }
            }
        }
    }
}

/// Run one step, retrying transient failures in place.
async fn attempt_step(
    definition: StepDefinition,
    args: StepArgs,
    mut ctx: StepContext,
    retry: RetryPolicy,
) -> StepOutcome {
    let max_attempts = definition.retries().saturating_add(1);
    let step = definition.step().clone();
    let mut attempt = 1;

    loop {
        ctx.step_attempt = attempt;
        ctx.deadline = definition.step_timeout().map(|t| Instant::now() + t);
        debug!(step = %definition.name(), attempt, "Step started");

        let result = match definition.step_timeout() {
            Some(limit) => match tokio::time::timeout(limit, step.run(&args, &ctx)).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error(&definition, limit)),
            },
            None => step.run(&args, &ctx).await,
        };

        let error = match result {
            Ok(value) => {
                debug!(step = %definition.name(), attempt, "Step completed");
                return Ok((args, value));
            }
            Err(error) => error,
        };

        match retry.decide(error.class(), attempt, max_attempts) {
            RetryDecision::Retry(delay) if !ctx.cancellation.is_cancelled() => {
                warn!(
                    step = %definition.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Step failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancellation.cancelled() => {
                        return Err(step_failed(&definition, error, attempt));
                    }
                }
                attempt += 1;
            }
            _ => {
                warn!(
                    step = %definition.name(),
                    attempt,
                    class = error.class().as_str(),
                    error = %error,
                    "Step failed"
                );
                return Err(step_failed(&definition, error, attempt));
            }
        }
    }
}

fn step_failed(definition: &StepDefinition, error: StepError, attempts: u32) -> WorkflowError {
    WorkflowError::StepFailed {
        step: definition.name().to_string(),
        error,
        attempts,
    }
}

fn timeout_error(definition: &StepDefinition, limit: Duration) -> StepError {
    let reason = format!("step '{}' timed out after {:?}", definition.name(), limit);
    if definition.is_idempotent() {
        StepError::Transient(reason)
    } else {
        StepError::Permanent(reason)
    }
}

fn check_inputs(workflow: &Workflow, inputs: &Map<String, Value>) -> Result<(), WorkflowError> {
    if let Some(unknown) = inputs.keys().find(|k| !workflow.inputs().contains(k)) {
        return Err(WorkflowError::UnknownInput(unknown.clone()));
    }
    if let Some(missing) = workflow.inputs().iter().find(|i| !inputs.contains_key(*i)) {
        return Err(WorkflowError::MissingInput(missing.clone()));
    }
    Ok(())
}

fn final_value(workflow: &Workflow, run: &WorkflowRun) -> Value {
    let results = run.results();
    match workflow.return_step() {
        Some(step) => results.get(step.name()).cloned().unwrap_or(Value::Null),
        None => Value::Object(
            workflow
                .steps()
                .iter()
                .filter_map(|s| {
                    results
                        .get(s.name())
                        .map(|v| (s.name().to_string(), v.clone()))
                })
                .collect(),
        ),
    }
}
