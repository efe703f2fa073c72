// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actor propagation and authorization through the executor.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::*;
use keelson_core::{
    ActorContext, Arg, AuthorizationDecision, Authorizer, ExecutorConfig, FailureClass, Resource,
    RetryPolicy, Role, Step, StepArgs, StepContext, StepDefinition, StepError, Workflow,
    WorkflowExecutor, async_trait,
};
use serde_json::{Map, Value, json};

/// Viewers may read, editors and admins may also update. Other tenants see nothing.
struct TenantPolicy;

#[async_trait]
impl Authorizer for TenantPolicy {
    async fn authorize(
        &self,
        actor: &ActorContext,
        resource: &Resource,
        action: &str,
    ) -> Result<AuthorizationDecision, StepError> {
        if resource.kind == "order" && resource.id.as_deref() == Some("foreign") {
            return Ok(AuthorizationDecision::NotFound);
        }
        let allowed = match action {
            "read" => true,
            "update" => matches!(actor.role(), Role::Admin | Role::Editor),
            _ => false,
        };
        Ok(if allowed {
            AuthorizationDecision::Allow
        } else {
            AuthorizationDecision::Deny
        })
    }
}

struct UpdateOrder {
    trace: Trace,
    calls: Arc<std::sync::atomic::AtomicU32>,
}

#[async_trait]
impl Step for UpdateOrder {
    async fn run(&self, args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.trace.push("update.run");
        let id: String = args.decode("order_id")?;
        ctx.authorize(&Resource::new("order", id.clone()), "update")
            .await?;
        Ok(json!({ "updated": id }))
    }
}

fn guarded_executor() -> WorkflowExecutor {
    WorkflowExecutor::with_authorizer(
        ExecutorConfig {
            max_concurrency: 4,
            retry: RetryPolicy::immediate(),
        },
        Arc::new(TenantPolicy),
    )
}

fn update_workflow(trace: &Trace, update: UpdateOrder) -> Workflow {
    Workflow::builder("update_order")
        .input("order_id")
        .step(StepDefinition::new("reserve", RecordingStep::new("reserve", trace)))
        .step(
            StepDefinition::new("update", update)
                .arg("order_id", Arg::input("order_id"))
                .wait_for("reserve")
                .max_retries(3),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_viewer_denied_fails_permanently_and_compensates() {
    let trace = Trace::new();
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let workflow = update_workflow(
        &trace,
        UpdateOrder {
            trace: trace.clone(),
            calls: calls.clone(),
        },
    );

    let err = guarded_executor()
        .execute(&workflow, inputs(json!({ "order_id": "o-1" })), viewer())
        .await
        .unwrap_err();

    assert_eq!(err.class(), FailureClass::Permanent);
    assert_eq!(err.error_code(), "FORBIDDEN");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        trace.entries(),
        vec!["reserve.run", "update.run", "reserve.compensate"]
    );
}

#[tokio::test]
async fn test_editor_is_allowed() {
    let trace = Trace::new();
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let workflow = update_workflow(
        &trace,
        UpdateOrder {
            trace: trace.clone(),
            calls,
        },
    );

    let result = guarded_executor()
        .execute(&workflow, inputs(json!({ "order_id": "o-1" })), editor())
        .await
        .unwrap();

    assert_eq!(result["update"], json!({ "updated": "o-1" }));
}

#[tokio::test]
async fn test_hidden_resource_is_not_found() {
    let trace = Trace::new();
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let workflow = update_workflow(
        &trace,
        UpdateOrder {
            trace: trace.clone(),
            calls,
        },
    );

    let err = guarded_executor()
        .execute(&workflow, inputs(json!({ "order_id": "foreign" })), editor())
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "NOT_FOUND");
    assert_eq!(err.class(), FailureClass::Permanent);
}

#[tokio::test]
async fn test_authorize_without_authorizer_is_permanent() {
    let trace = Trace::new();
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let workflow = update_workflow(
        &trace,
        UpdateOrder {
            trace: trace.clone(),
            calls: calls.clone(),
        },
    );

    let err = executor()
        .execute(&workflow, inputs(json!({ "order_id": "o-1" })), admin())
        .await
        .unwrap_err();

    assert_eq!(err.class(), FailureClass::Permanent);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

fn admin() -> ActorContext {
    ActorContext::new("root", "acme", Role::Admin).unwrap()
}

/// Records the actor every call observes.
struct WhoAmI(Arc<Mutex<Vec<ActorContext>>>);

#[async_trait]
impl Step for WhoAmI {
    async fn run(&self, _args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        self.0.lock().unwrap().push(ctx.actor().clone());
        Ok(ctx.actor().to_json())
    }
}

struct RunChild {
    child: Workflow,
}

#[async_trait]
impl Step for RunChild {
    async fn run(&self, _args: &StepArgs, ctx: &StepContext) -> Result<Value, StepError> {
        ctx.execute_subworkflow(&self.child, Map::new())
            .await
            .map_err(|e| StepError::permanent(e.to_string()))
    }
}

#[tokio::test]
async fn test_every_step_and_subworkflow_sees_the_same_actor() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let child = Workflow::builder("child")
        .step(StepDefinition::new("inner", WhoAmI(seen.clone())))
        .returns("inner")
        .build()
        .unwrap();
    let parent = Workflow::builder("parent")
        .step(StepDefinition::new("outer", WhoAmI(seen.clone())))
        .step(StepDefinition::new("nested", RunChild { child }).wait_for("outer"))
        .build()
        .unwrap();

    let actor = editor();
    let result = executor()
        .execute(&parent, Map::new(), actor.clone())
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![actor.clone(), actor.clone()]);
    assert_eq!(result["nested"], actor.to_json());
}

#[tokio::test]
async fn test_actor_survives_serialization_into_a_run() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::builder("echo_actor")
        .step(StepDefinition::new("who", WhoAmI(seen.clone())))
        .build()
        .unwrap();

    let original = viewer();
    let restored = ActorContext::from_json(&original.to_json()).unwrap();
    executor()
        .execute(&workflow, Map::new(), restored)
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap()[0], original);
}
