// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definition validation.

mod common;

use common::*;
use keelson_core::{Arg, DefinitionError, StepDefinition, Workflow};

#[test]
fn test_two_step_cycle_is_rejected() {
    let trace = Trace::new();
    let err = Workflow::builder("cyclic")
        .step(StepDefinition::new("a", RecordingStep::new("a", &trace)).arg("x", Arg::result("b")))
        .step(StepDefinition::new("b", RecordingStep::new("b", &trace)).arg("y", Arg::result("a")))
        .build()
        .unwrap_err();

    match err {
        DefinitionError::Cycle(path) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"a".to_string()));
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn test_self_reference_is_rejected() {
    let trace = Trace::new();
    let err = Workflow::builder("selfish")
        .step(StepDefinition::new("a", RecordingStep::new("a", &trace)).wait_for("a"))
        .build()
        .unwrap_err();

    assert_eq!(err, DefinitionError::Cycle(vec!["a".into(), "a".into()]));
}

#[test]
fn test_unknown_references_are_rejected() {
    let trace = Trace::new();

    let err = Workflow::builder("dangling")
        .step(StepDefinition::new("a", RecordingStep::new("a", &trace)).wait_for("ghost"))
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        DefinitionError::UnknownStep {
            step: "a".into(),
            reference: "ghost".into(),
        }
    );

    let err = Workflow::builder("undeclared")
        .step(StepDefinition::new("a", RecordingStep::new("a", &trace)).arg("id", Arg::input("id")))
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        DefinitionError::UnknownInput {
            step: "a".into(),
            input: "id".into(),
        }
    );

    let err = Workflow::builder("returns")
        .step(StepDefinition::new("a", RecordingStep::new("a", &trace)))
        .returns("b")
        .build()
        .unwrap_err();
    assert_eq!(err, DefinitionError::UnknownReturnStep("b".into()));
}

#[test]
fn test_empty_workflow_is_rejected() {
    assert_eq!(
        Workflow::builder("nothing").build().unwrap_err(),
        DefinitionError::Empty("nothing".into())
    );
}

#[test]
fn test_ready_sets_group_independent_steps() {
    let trace = Trace::new();
    let workflow = Workflow::builder("order")
        .input("order")
        .step(
            StepDefinition::new("reserve", RecordingStep::new("reserve", &trace))
                .arg("order", Arg::input("order")),
        )
        .step(
            StepDefinition::new("quote", RecordingStep::new("quote", &trace))
                .arg("order", Arg::input("order")),
        )
        .step(
            StepDefinition::new("charge", RecordingStep::new("charge", &trace))
                .arg("amount", Arg::path("quote", "/total"))
                .wait_for("reserve"),
        )
        .step(
            StepDefinition::new("notify", RecordingStep::new("notify", &trace))
                .arg("receipt", Arg::result("charge")),
        )
        .build()
        .unwrap();

    assert_eq!(
        workflow.ready_sets(),
        vec![vec!["reserve", "quote"], vec!["charge"], vec!["notify"]]
    );
    assert_eq!(workflow.step("charge").unwrap().dependencies(), vec!["quote", "reserve"]);
}
