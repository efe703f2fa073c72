// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order Saga Example - Demonstrates compensation and durable execution.
//!
//! This example shows:
//! - A three-step order workflow with data dependencies
//! - Reverse-order rollback when the card is declined
//! - Enqueueing the same workflow as a durable job run by a worker pool
//! - A cron entry that runs as the system actor
//!
//! Uses `KEELSON_DATABASE_URL` when set, otherwise a SQLite file in the temp dir.
//!
//! Run with: cargo run -p keelson-example --bin order_saga

use std::time::Duration;

use keelson_core::{
    ActorContext, Arg, Role, Step, StepArgs, StepContext, StepDefinition, StepError, Workflow,
    WorkflowError, WorkflowExecutor, async_trait,
};
use keelson_queue::{
    Config, CronEntry, EnqueueOptions, JobState, QueueRuntime, WorkflowRegistry, connect,
};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

struct ReserveStock;

#[async_trait]
impl Step for ReserveStock {
    async fn run(&self, args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        let order = args.require("order")?;
        info!(actor = %ctx.actor(), order = %order, "Reserving stock");
        Ok(json!({ "reservation_id": format!("res-{}", ctx.run_id().simple()) }))
    }

    async fn compensate(
        &self,
        result: &Value,
        _args: &StepArgs,
        _ctx: &StepContext,
    ) -> Result<(), StepError> {
        info!(reservation = %result["reservation_id"], "Releasing reservation");
        Ok(())
    }

    fn compensates(&self) -> bool {
        true
    }
}

struct ChargeCard;

#[async_trait]
impl Step for ChargeCard {
    async fn run(&self, args: &StepArgs, _ctx: &StepContext) -> Result<Value, StepError> {
        let card: String = args.decode("card")?;
        let reservation = args.require("reservation")?;
        if card == "declined" {
            return Err(StepError::permanent("card declined"));
        }
        info!(reservation = %reservation, "Charging card");
        Ok(json!({ "charge_id": "ch_1", "amount": 4200 }))
    }

    async fn compensate(
        &self,
        result: &Value,
        _args: &StepArgs,
        _ctx: &StepContext,
    ) -> Result<(), StepError> {
        info!(charge = %result["charge_id"], "Refunding charge");
        Ok(())
    }

    fn compensates(&self) -> bool {
        true
    }
}

struct SendConfirmation;

#[async_trait]
impl Step for SendConfirmation {
    async fn run(&self, args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        let charge = args.require("charge_id")?;
        info!(actor = %ctx.actor(), charge = %charge, attempt = ctx.attempt(), "Sending confirmation");
        Ok(json!({ "sent": true, "charge_id": charge }))
    }
}

struct Heartbeat;

#[async_trait]
impl Step for Heartbeat {
    async fn run(&self, _args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        info!(actor = %ctx.actor(), "Scheduled heartbeat");
        Ok(Value::Null)
    }
}

fn order_workflow() -> anyhow::Result<Workflow> {
    let workflow = Workflow::builder("place_order")
        .input("order")
        .input("card")
        .step(StepDefinition::new("reserve", ReserveStock).arg("order", Arg::input("order")))
        .step(
            StepDefinition::new("charge", ChargeCard)
                .arg("card", Arg::input("card"))
                .arg("reservation", Arg::path("reserve", "/reservation_id"))
                .max_retries(2)
                .non_idempotent(),
        )
        .step(
            StepDefinition::new("confirm", SendConfirmation)
                .arg("charge_id", Arg::path("charge", "/charge_id"))
                .timeout(Duration::from_secs(5)),
        )
        .returns("confirm")
        .build()?;
    Ok(workflow)
}

fn heartbeat_workflow() -> anyhow::Result<Workflow> {
    Ok(Workflow::builder("heartbeat")
        .step(StepDefinition::new("beat", Heartbeat))
        .build()?)
}

fn order_inputs(card: &str) -> Map<String, Value> {
    let mut inputs = Map::new();
    inputs.insert("order".to_string(), json!({ "id": 42, "sku": "KEEL-01", "qty": 2 }));
    inputs.insert("card".to_string(), json!(card));
    inputs
}

async fn run_in_process(workflow: &Workflow, actor: &ActorContext) -> anyhow::Result<()> {
    let executor = WorkflowExecutor::default();

    info!("--- Running saga in-process ---");
    let receipt = executor
        .execute(workflow, order_inputs("visa"), actor.clone())
        .await?;
    info!(receipt = %receipt, "Order placed");

    info!("--- Running saga with a declined card ---");
    match executor
        .execute(workflow, order_inputs("declined"), actor.clone())
        .await
    {
        Ok(_) => warn!("Declined card unexpectedly succeeded"),
        Err(WorkflowError::Compensation { source, failures }) => {
            warn!(error = %source, failed = failures.len(), "Rollback was incomplete");
        }
        Err(e) => info!(error = %e, code = e.error_code(), "Order rolled back"),
    }
    Ok(())
}

async fn run_on_queue(workflow: Workflow, actor: &ActorContext) -> anyhow::Result<()> {
    let database_url = std::env::var("KEELSON_DATABASE_URL").unwrap_or_else(|_| {
        let path = std::env::temp_dir().join("keelson-example.db");
        format!("sqlite:{}?mode=rwc", path.display())
    });

    let mut config = Config::new(database_url);
    config.poll_interval = Duration::from_millis(200);
    let store = connect(&config).await?;

    let registry = WorkflowRegistry::new()
        .register(workflow)
        .register(heartbeat_workflow()?);

    let runtime = QueueRuntime::builder()
        .store(store)
        .registry(registry)
        .config(config)
        .cron(CronEntry::new(
            "heartbeat",
            "*/2 * * * * *",
            "default",
            "heartbeat",
            Map::new(),
        )?)
        .build()?
        .start()
        .await?;

    info!("--- Running saga as a durable job ---");
    let queue = runtime.queue().clone();
    let id = queue
        .enqueue_workflow(
            "default",
            "place_order",
            order_inputs("visa"),
            actor,
            EnqueueOptions::new().unique_key("order:42"),
        )
        .await?;
    info!(job_id = id, "Job enqueued");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let job = queue.get(id).await?;
        match job {
            Some(job) if job.state.is_terminal() => {
                info!(job_id = id, state = %job.state.as_str(), error = ?job.last_error, "Job finished");
                break;
            }
            Some(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Some(job) => {
                warn!(job_id = id, state = %job.state.as_str(), "Job did not finish in time");
                break;
            }
            None => {
                warn!(job_id = id, "Job was pruned before it could be inspected");
                break;
            }
        }
    }

    // Let the cron entry fire at least once.
    tokio::time::sleep(Duration::from_secs(3)).await;

    for (state, count) in queue.counts("default").await? {
        if state != JobState::Available {
            info!(state = %state.as_str(), count, "Queue contents");
        }
    }

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Order Saga Example ===");

    let workflow = order_workflow()?;
    info!(ready_sets = ?workflow.ready_sets(), "Workflow plan");

    let actor = ActorContext::new("user-1", "acme", Role::Editor)?;

    run_in_process(&workflow, &actor).await?;
    run_on_queue(workflow, &actor).await?;

    info!("=== Order Saga Example complete ===");
    Ok(())
}
