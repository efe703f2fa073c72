// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queue behaviour on SQLite: uniqueness, scheduling, priority, backoff,
//! snooze and cancellation.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use keelson_queue::{
    CancelOutcome, EnqueueOptions, FailOutcome, JobFilter, JobState, QueueError, QueueSettings,
    SnoozeOutcome,
};
use serde_json::json;

#[tokio::test]
async fn test_unique_key_returns_existing_job() {
    let queue = memory_queue(fast_settings()).await;
    let args = workflow_args("place_order", &editor());
    let opts = EnqueueOptions::new().unique_key("order:42");

    let first = queue.enqueue("default", args.clone(), opts.clone()).await.unwrap();
    let second = queue.enqueue("default", args, opts).await.unwrap();

    assert_eq!(first, second);
    let jobs = queue.list(&JobFilter::default()).await.unwrap();
    assert_eq!(jobs.len(), 1, "duplicate enqueue must not insert a row");
}

#[tokio::test]
async fn test_unique_by_args() {
    let queue = memory_queue(fast_settings()).await;
    let opts = EnqueueOptions::new().unique_by_args();

    let a = queue
        .enqueue("default", workflow_args("place_order", &editor()), opts.clone())
        .await
        .unwrap();
    let b = queue
        .enqueue("default", workflow_args("place_order", &editor()), opts.clone())
        .await
        .unwrap();
    let c = queue
        .enqueue("default", workflow_args("refund", &editor()), opts)
        .await
        .unwrap();

    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[tokio::test]
async fn test_unique_key_outside_window_inserts() {
    let settings = keelson_queue::QueueSettings {
        unique_window: Duration::ZERO,
        ..fast_settings()
    };
    let queue = memory_queue(settings).await;
    let args = workflow_args("place_order", &editor());
    let opts = EnqueueOptions::new().unique_key("order:7");

    let first = queue.enqueue("default", args.clone(), opts.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = queue.enqueue("default", args, opts).await.unwrap();

    assert_ne!(first, second);
}

#[tokio::test]
async fn test_scheduled_job_not_leasable_early() {
    let queue = memory_queue(fast_settings()).await;
    let id = queue
        .enqueue(
            "default",
            workflow_args("place_order", &editor()),
            EnqueueOptions::new().schedule_in(Duration::from_secs(300)),
        )
        .await
        .unwrap();

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Scheduled);
    assert!(job.scheduled_at > Utc::now() + chrono::Duration::seconds(290));
    assert!(queue.lease("default").await.unwrap().is_none());

    // The store leases it once its time has come.
    let later = job.scheduled_at + chrono::Duration::seconds(1);
    let leased = queue
        .store()
        .lease_job("default", later, later + chrono::Duration::seconds(30))
        .await
        .unwrap()
        .expect("due job should be leasable");
    assert_eq!(leased.id, id);
}

#[tokio::test]
async fn test_lower_priority_number_runs_first() {
    let queue = memory_queue(fast_settings()).await;
    let args = workflow_args("place_order", &editor());

    let normal = queue
        .enqueue("default", args.clone(), EnqueueOptions::new())
        .await
        .unwrap();
    let urgent = queue
        .enqueue("default", args.clone(), EnqueueOptions::new().priority(-10))
        .await
        .unwrap();
    let bulk = queue
        .enqueue("default", args, EnqueueOptions::new().priority(10))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue.lease("default").await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![urgent, normal, bulk]);
}

#[tokio::test]
async fn test_transient_failures_back_off_then_discard() {
    let queue = memory_queue(fast_settings()).await;
    let id = queue
        .enqueue(
            "default",
            workflow_args("place_order", &editor()),
            EnqueueOptions::new().max_attempts(4),
        )
        .await
        .unwrap();

    let mut delays = Vec::new();
    loop {
        let job = match queue.lease("default").await.unwrap() {
            Some(job) => job,
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
        };
        assert_eq!(job.id, id);

        match queue.fail(&job, "connection reset").await.unwrap() {
            FailOutcome::Retry { delay, .. } => delays.push(delay),
            FailOutcome::Discard => {
                assert_eq!(job.attempt, 4);
                break;
            }
            FailOutcome::Cancelled => panic!("no cancel was requested"),
        }
    }

    assert_eq!(delays.len(), 3);
    assert!(
        delays.windows(2).all(|w| w[0] < w[1]),
        "backoff must strictly increase: {:?}",
        delays
    );

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Discarded);
    assert_eq!(job.last_error.as_deref(), Some("connection reset"));
}

#[tokio::test]
async fn test_snooze_does_not_consume_attempt() {
    let queue = memory_queue(fast_settings()).await;
    let id = queue
        .enqueue("default", workflow_args("place_order", &editor()), EnqueueOptions::new())
        .await
        .unwrap();

    let job = queue.lease("default").await.unwrap().unwrap();
    assert_eq!(job.attempt, 1);

    let SnoozeOutcome::Snoozed { until } =
        queue.snooze(&job, Duration::from_secs(60)).await.unwrap()
    else {
        panic!("no cancel was requested");
    };
    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Scheduled);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.scheduled_at, until);
    assert!(queue.lease("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_pending_and_finished_jobs() {
    let queue = memory_queue(fast_settings()).await;
    let id = queue
        .enqueue(
            "default",
            workflow_args("place_order", &editor()),
            EnqueueOptions::new().schedule_in(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert!(matches!(
        queue.cancel(id).await.unwrap(),
        CancelOutcome::Cancelled(job) if job.state == JobState::Cancelled
    ));
    assert!(matches!(
        queue.cancel(id).await.unwrap(),
        CancelOutcome::AlreadyFinished(_)
    ));
    assert!(matches!(
        queue.cancel(id + 1000).await.unwrap(),
        CancelOutcome::NotFound
    ));
}

#[tokio::test]
async fn test_cancel_requested_while_running_survives_transient_failure() {
    let queue = memory_queue(fast_settings()).await;
    let id = queue
        .enqueue("default", workflow_args("place_order", &editor()), EnqueueOptions::new())
        .await
        .unwrap();

    let job = queue.lease("default").await.unwrap().unwrap();
    assert!(matches!(
        queue.cancel(id).await.unwrap(),
        CancelOutcome::Requested(_)
    ));

    // The run fails before it ever sees the flag.
    assert_eq!(
        queue.fail(&job, "timeout").await.unwrap(),
        FailOutcome::Cancelled
    );

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.completed_at.is_some());
    assert!(queue.lease("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_requested_while_running_wins_over_snooze() {
    let queue = memory_queue(fast_settings()).await;
    let id = queue
        .enqueue("default", workflow_args("place_order", &editor()), EnqueueOptions::new())
        .await
        .unwrap();

    let job = queue.lease("default").await.unwrap().unwrap();
    queue.cancel(id).await.unwrap();

    assert_eq!(
        queue.snooze(&job, Duration::ZERO).await.unwrap(),
        SnoozeOutcome::Cancelled
    );
    assert_eq!(queue.get(id).await.unwrap().unwrap().state, JobState::Cancelled);
    assert!(queue.lease("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unbounded_delay_parks_job_far_in_future() {
    let queue = memory_queue(fast_settings()).await;
    let parked = queue
        .enqueue(
            "default",
            workflow_args("place_order", &editor()),
            EnqueueOptions::new().schedule_in(Duration::MAX),
        )
        .await
        .unwrap();

    let job = queue.get(parked).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Scheduled);
    assert!(job.scheduled_at > Utc::now() + chrono::Duration::days(365 * 1000));
    assert!(
        queue.lease("default").await.unwrap().is_none(),
        "a job delayed without bound must never be leasable"
    );
}

#[tokio::test]
async fn test_unbounded_unique_window_still_suppresses_duplicates() {
    let queue = memory_queue(QueueSettings {
        unique_window: Duration::MAX,
        ..fast_settings()
    })
    .await;
    let opts = EnqueueOptions::new().unique_key("order:7");

    let first = queue
        .enqueue("default", workflow_args("place_order", &editor()), opts.clone())
        .await
        .unwrap();
    let second = queue
        .enqueue("default", workflow_args("place_order", &editor()), opts)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(queue.list(&JobFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_enqueue_rejects_invalid_actor() {
    let queue = memory_queue(fast_settings()).await;
    let args = json!({
        "workflow": "place_order",
        "inputs": {},
        "actor": { "id": "user-1", "tenant_id": "acme", "role": "superuser" },
    });

    let err = queue
        .enqueue("default", args, EnqueueOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_ACTOR");
    assert!(matches!(err, QueueError::Actor(_)));
}

#[tokio::test]
async fn test_counts_by_state() {
    let queue = memory_queue(fast_settings()).await;
    for _ in 0..3 {
        queue
            .enqueue("default", workflow_args("place_order", &editor()), EnqueueOptions::new())
            .await
            .unwrap();
    }
    let job = queue.lease("default").await.unwrap().unwrap();
    queue.complete(&job).await.unwrap();

    let counts = queue.counts("default").await.unwrap();
    assert_eq!(
        counts,
        vec![(JobState::Available, 2), (JobState::Completed, 1)]
    );
}
