//! Retry, capacity and lifecycle control tests.
//!
//! Verify the retry ceiling, worker-level failure handling, per-worker
//! instance bounds, parallel dispatch, and pause/resume semantics.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use maestro::core::task::{Capability, TaskStatus};
use maestro::orchestration::{EventType, TaskOutput, WorkerError, SECTIONS_KEY};
use maestro::workflow::{GateKind, Phase, WorkflowStatus};

use crate::fixtures::{fail_always, fail_first, fast_config, Harness, WorkerSpec};

/// A task that keeps failing is retried up to the limit, then failed once.
#[tokio::test]
async fn test_retry_ceiling() {
    let harness = Harness::builder()
        .config(fast_config().with_max_task_retries(3))
        .worker(
            WorkerSpec::new(Capability::Drafting)
                .script(fail_always(WorkerError::Execution("model timeout".into()))),
        )
        .build();
    let id = harness.start(&["complaint.pdf"]).await;

    let view = harness.wait_for_gate(id).await;
    assert_eq!(view.current_phase, Phase::Drafting);
    assert_eq!(view.failed_tasks.len(), 1);
    let failed = &view.failed_tasks[0];
    assert_eq!(failed.retry_count, 3);
    assert_eq!(failed.error.as_deref(), Some("model timeout"));

    let retrying = harness.events(id, EventType::TaskRetrying);
    let attempts: Vec<u64> = retrying
        .iter()
        .map(|e| e.data["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(retrying.iter().all(|e| e.data["class"] == "task"));

    let task_failed = harness.events(id, EventType::TaskFailed);
    assert_eq!(task_failed.len(), 1);
    assert_eq!(task_failed[0].data["task_id"], json!(failed.task_id));

    let probe = harness.probe(Capability::Drafting);
    assert_eq!(probe.calls(), 4);
    assert_eq!(probe.attempts(failed.task_id), 4);

    // Task-class failures keep the instance.
    assert_eq!(probe.cleanups(), 0);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_unhealthy_worker_is_replaced() {
    let harness = Harness::builder()
        .worker(
            WorkerSpec::new(Capability::Editing)
                .limit(1)
                .script(fail_first(1, WorkerError::Unhealthy("session expired".into()))),
        )
        .build();
    let id = harness.start(&[]).await;
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    let probe = harness.probe(Capability::Editing);
    assert_eq!(probe.calls(), 2);
    assert_eq!(probe.instances(), 2);
    assert_eq!(probe.cleanups(), 1);

    let retrying = harness.events(id, EventType::TaskRetrying);
    assert_eq!(retrying.len(), 1);
    assert_eq!(retrying[0].data["class"], "worker");

    let snapshot = harness.snapshot(id).await;
    let editing = snapshot.tasks_in_phase(Phase::Editing)[0];
    assert_eq!(editing.status, TaskStatus::Completed);
    assert_eq!(editing.retry_count, 1);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_worker_panic_is_contained() {
    let harness = Harness::builder()
        .worker(WorkerSpec::new(Capability::Finalization).script(|task, _, attempt| {
            if attempt == 1 {
                panic!("formatter crashed");
            }
            Ok(TaskOutput::new(json!({ "done": task.description })))
        }))
        .build();
    let id = harness.start(&[]).await;

    let view = harness.wait_for_status(id, WorkflowStatus::Completed).await;
    assert!(view.failed_tasks.is_empty());

    let retrying = harness.events(id, EventType::TaskRetrying);
    assert_eq!(retrying.len(), 1);
    assert_eq!(retrying[0].data["class"], "worker");
    assert_eq!(retrying[0].data["error"], "worker panicked");
    assert_eq!(harness.probe(Capability::Finalization).instances(), 2);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_missing_capability_fails_without_retry() {
    let harness = Harness::builder()
        .unregistered(Capability::Finalization)
        .build();
    let id = harness.start(&[]).await;

    let view = harness.wait_for_gate(id).await;
    assert_eq!(view.current_phase, Phase::Finalize);
    assert!(matches!(
        view.pending_approval.unwrap().kind,
        GateKind::TaskFailure { .. }
    ));
    assert_eq!(view.failed_tasks[0].retry_count, 0);
    assert!(view.failed_tasks[0]
        .error
        .as_deref()
        .unwrap()
        .contains("finalization"));

    assert!(harness.events(id, EventType::TaskRetrying).is_empty());
    let failed = harness.events(id, EventType::TaskFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].data["class"], "fatal");

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_instance_limit_bounds_concurrency() {
    let harness = Harness::builder()
        .worker(WorkerSpec::new(Capability::Outlining).script(|_, _, _| {
            Ok(TaskOutput::new(json!({}))
                .with_context(SECTIONS_KEY, json!(["a", "b", "c", "d", "e", "f"])))
        }))
        .worker(
            WorkerSpec::new(Capability::Drafting)
                .limit(2)
                .delay(Duration::from_millis(10)),
        )
        .build();
    let id = harness.start(&["complaint.pdf"]).await;
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    let probe = harness.probe(Capability::Drafting);
    assert_eq!(probe.calls(), 7);
    assert_eq!(probe.peak(), 2);
    assert!(probe.instances() <= 2);

    let status = harness.orchestrator.registry().status();
    let drafting = status
        .workers
        .iter()
        .find(|w| w.name == "drafting")
        .unwrap();
    assert!(drafting.live <= drafting.limit);
    assert_eq!(drafting.busy, 0);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_configured_limit_overrides_declared() {
    let mut config = fast_config();
    config.instance_limits.insert("document_intake".to_string(), 1);
    let harness = Harness::builder()
        .config(config)
        .worker(
            WorkerSpec::new(Capability::DocumentIntake)
                .limit(4)
                .delay(Duration::from_millis(5)),
        )
        .build();

    let id = harness.start(&["a.pdf", "b.pdf", "c.pdf"]).await;
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    let probe = harness.probe(Capability::DocumentIntake);
    assert_eq!(probe.calls(), 3);
    assert_eq!(probe.peak(), 1);
    assert_eq!(probe.instances(), 1);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_independent_tasks_run_in_parallel() {
    let harness = Harness::builder()
        .worker(
            WorkerSpec::new(Capability::DocumentIntake)
                .limit(3)
                .delay(Duration::from_millis(20)),
        )
        .build();
    let id = harness.start(&["a.pdf", "b.pdf", "c.pdf"]).await;
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    assert_eq!(harness.probe(Capability::DocumentIntake).peak(), 3);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_pause_lets_in_flight_tasks_finish() {
    let gate = Arc::new(Semaphore::new(0));
    let harness = Harness::builder()
        .worker(WorkerSpec::new(Capability::DocumentIntake).gated(Arc::clone(&gate)))
        .build();
    let id = harness.start(&["a.pdf", "b.pdf"]).await;

    harness.wait_for(id, |v| v.tasks.in_progress == 2).await;
    harness.orchestrator.pause(id).await.unwrap();
    gate.add_permits(2);

    let view = harness.wait_for(id, |v| v.tasks.completed == 2).await;
    assert_eq!(view.status, WorkflowStatus::Paused);

    // The finished phase is not left while paused.
    tokio::time::sleep(Duration::from_millis(40)).await;
    let view = harness.status(id).await;
    assert_eq!(view.status, WorkflowStatus::Paused);
    assert_eq!(view.current_phase, Phase::Intake);
    assert_eq!(harness.probe(Capability::Outlining).calls(), 0);
    assert!(harness.events(id, EventType::PhaseTransition).is_empty());

    harness.orchestrator.resume(id).await.unwrap();
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    assert_eq!(harness.events(id, EventType::WorkflowPaused).len(), 1);
    assert_eq!(harness.events(id, EventType::WorkflowResumed).len(), 1);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_sessions_progress_independently() {
    let harness = Harness::builder()
        .config(fast_config().with_approval_phases(vec![Phase::Outline]))
        .build();

    let blocked = harness.start(&["a.pdf"]).await;
    let mut others = Vec::new();
    for items in [vec!["b.pdf"], vec!["c.pdf", "d.pdf"]] {
        others.push(harness.start(&items).await);
    }

    harness.wait_for_gate(blocked).await;
    for id in &others {
        harness.wait_for_gate(*id).await;
        harness
            .orchestrator
            .approve_phase(*id, Phase::Outline)
            .await
            .unwrap();
    }
    for id in &others {
        harness.wait_for_status(*id, WorkflowStatus::Completed).await;
    }

    // The session nobody approved is still waiting.
    let view = harness.status(blocked).await;
    assert_eq!(view.status, WorkflowStatus::InProgress);
    assert_eq!(view.current_phase, Phase::Outline);
    assert!(view.pending_approval.is_some());

    for id in &others {
        let snapshot = harness.snapshot(*id).await;
        assert!(snapshot.tasks.values().all(|t| t.status == TaskStatus::Completed));
        assert!(harness
            .orchestrator
            .events()
            .session_history(*id, usize::MAX)
            .iter()
            .all(|e| e.session_id == *id));
    }

    harness.orchestrator.shutdown().await;
}
