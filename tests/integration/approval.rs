//! Human approval gate tests.
//!
//! Covers phase review gates (configured per phase) and the gate raised
//! when tasks fail terminally, including approval idempotency and the
//! dependency cascade on accepted failures.

use serde_json::json;

use maestro::core::task::{Capability, TaskStatus};
use maestro::orchestration::{EventType, TaskOutput, WorkerError, SECTIONS_KEY};
use maestro::workflow::{GateKind, Phase, PhaseStatus, WorkflowStatus};
use maestro::Error;

use crate::fixtures::{fail_always, fail_first, fast_config, Harness, WorkerSpec};

#[tokio::test]
async fn test_phase_review_gate_blocks_until_approved() {
    let harness = Harness::builder()
        .config(fast_config().with_approval_phases(vec![Phase::Outline]))
        .build();
    let id = harness.start(&["complaint.pdf"]).await;

    let view = harness.wait_for_gate(id).await;
    let gate = view.pending_approval.unwrap();
    assert_eq!(gate.phase, Phase::Outline);
    assert_eq!(gate.kind, GateKind::PhaseReview);
    assert_eq!(view.current_phase, Phase::Outline);
    assert_eq!(view.phase_status[&Phase::Outline], PhaseStatus::Completed);
    assert_eq!(view.phase_status[&Phase::Research], PhaseStatus::Pending);
    assert_eq!(view.status, WorkflowStatus::InProgress);

    // Several ticks pass without progress while the gate is open.
    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    let snapshot = harness.snapshot(id).await;
    assert!(snapshot.tasks_in_phase(Phase::Research).is_empty());
    assert_eq!(harness.probe(Capability::LegalResearch).calls(), 0);

    let required = harness.events(id, EventType::ApprovalRequired);
    assert_eq!(required.len(), 1);
    assert_eq!(required[0].data["reason"], "phase_review");

    assert!(harness
        .orchestrator
        .approve_phase(id, Phase::Outline)
        .await
        .unwrap());
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    // Approving again is a no-op.
    assert!(!harness
        .orchestrator
        .approve_phase(id, Phase::Outline)
        .await
        .unwrap());
    assert_eq!(harness.events(id, EventType::PhaseApproved).len(), 1);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_approving_the_wrong_phase() {
    let harness = Harness::builder()
        .config(fast_config().with_approval_phases(vec![Phase::Outline]))
        .build();
    let id = harness.start(&["complaint.pdf"]).await;
    harness.wait_for_gate(id).await;

    let err = harness
        .orchestrator
        .approve_phase(id, Phase::Review)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // Intake already finished, so approving it changes nothing.
    assert!(!harness
        .orchestrator
        .approve_phase(id, Phase::Intake)
        .await
        .unwrap());

    let view = harness.status(id).await;
    assert_eq!(view.pending_approval.unwrap().phase, Phase::Outline);
    assert!(harness.events(id, EventType::PhaseApproved).is_empty());

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_multiple_review_gates_in_one_run() {
    let harness = Harness::builder()
        .config(fast_config().with_approval_phases(vec![Phase::Research, Phase::Review]))
        .build();
    let id = harness.start(&["complaint.pdf"]).await;

    for phase in [Phase::Research, Phase::Review] {
        let view = harness
            .wait_for(id, |v| {
                v.pending_approval.as_ref().is_some_and(|g| g.phase == phase)
            })
            .await;
        assert_eq!(view.current_phase, phase);
        assert!(harness
            .orchestrator
            .approve_phase(id, phase)
            .await
            .unwrap());
    }

    harness.wait_for_status(id, WorkflowStatus::Completed).await;
    assert_eq!(harness.events(id, EventType::ApprovalRequired).len(), 2);
    assert_eq!(harness.events(id, EventType::PhaseApproved).len(), 2);

    harness.orchestrator.shutdown().await;
}

/// A terminal task failure blocks the phase; approving it fails the
/// dependents and lets the workflow continue.
#[tokio::test]
async fn test_failure_gate_cascades_on_approval() {
    let harness = Harness::builder()
        .worker(WorkerSpec::new(Capability::Outlining).script(|_, _, _| {
            Ok(TaskOutput::new(json!({})).with_context(SECTIONS_KEY, json!(["facts", "argument"])))
        }))
        .worker(WorkerSpec::new(Capability::Drafting).script(|task, _, _| {
            if task.description == "Draft facts" {
                Err(WorkerError::Unrecoverable("exhibit missing".into()))
            } else {
                Ok(TaskOutput::new(json!({ "done": task.description })))
            }
        }))
        .build();
    let id = harness.start(&["complaint.pdf"]).await;

    let view = harness.wait_for_gate(id).await;
    let gate = view.pending_approval.unwrap();
    assert_eq!(gate.phase, Phase::Drafting);
    let GateKind::TaskFailure { task_ids } = gate.kind else {
        panic!("expected a task failure gate");
    };
    assert_eq!(task_ids.len(), 1);
    assert_eq!(view.failed_tasks.len(), 1);
    assert_eq!(view.failed_tasks[0].task_id, task_ids[0]);
    assert!(view.failed_tasks[0]
        .error
        .as_deref()
        .unwrap()
        .contains("exhibit missing"));
    assert!(harness.events(id, EventType::TaskRetrying).is_empty());

    let snapshot = harness.snapshot(id).await;
    let compile = snapshot
        .tasks_in_phase(Phase::Drafting)
        .into_iter()
        .find(|t| t.description == "Compile draft")
        .unwrap()
        .id;
    assert_eq!(snapshot.task(&compile).unwrap().status, TaskStatus::Pending);

    assert!(harness
        .orchestrator
        .approve_phase(id, Phase::Drafting)
        .await
        .unwrap());
    let view = harness.wait_for_status(id, WorkflowStatus::Completed).await;
    assert_eq!(view.failed_tasks.len(), 2);

    let snapshot = harness.snapshot(id).await;
    let compile = snapshot.task(&compile).unwrap();
    assert_eq!(compile.status, TaskStatus::Failed);
    assert_eq!(compile.error.as_deref(), Some("dependency failed"));
    assert!(compile.started_at.is_none());

    let argument = snapshot
        .tasks_in_phase(Phase::Drafting)
        .into_iter()
        .find(|t| t.description == "Draft argument")
        .unwrap();
    assert_eq!(argument.status, TaskStatus::Completed);

    assert_eq!(harness.events(id, EventType::TaskFailed).len(), 2);
    let completed = harness.events(id, EventType::WorkflowCompleted);
    assert_eq!(completed[0].data["failed"], 2);

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_retry_task_clears_failure_gate() {
    let harness = Harness::builder()
        .config(fast_config().with_max_task_retries(0))
        .worker(
            WorkerSpec::new(Capability::Review)
                .script(fail_first(1, WorkerError::Execution("reviewer offline".into()))),
        )
        .build();
    let id = harness.start(&["complaint.pdf"]).await;

    let view = harness.wait_for_gate(id).await;
    assert_eq!(view.current_phase, Phase::Review);
    let failed = view.failed_tasks[0].task_id;

    // Only failed tasks of the current phase can be retried.
    let intake = harness.snapshot(id).await.tasks_in_phase(Phase::Intake)[0].id;
    assert!(matches!(
        harness.orchestrator.retry_task(id, intake).await.unwrap_err(),
        Error::Validation(_)
    ));

    harness.orchestrator.retry_task(id, failed).await.unwrap();
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    let snapshot = harness.snapshot(id).await;
    let review = snapshot.task(&failed).unwrap();
    assert_eq!(review.status, TaskStatus::Completed);
    assert_eq!(review.retry_count, 0);
    assert!(review.error.is_none());
    assert!(snapshot.pending_approval.is_none());
    assert_eq!(harness.probe(Capability::Review).attempts(failed), 2);

    assert_eq!(harness.events(id, EventType::TaskFailed).len(), 1);
    assert!(harness.events(id, EventType::PhaseApproved).is_empty());

    // A finished workflow rejects further retries.
    assert!(matches!(
        harness.orchestrator.retry_task(id, failed).await.unwrap_err(),
        Error::Validation(_)
    ));

    harness.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_failure_gate_while_phase_review_configured() {
    let harness = Harness::builder()
        .config(
            fast_config()
                .with_max_task_retries(0)
                .with_approval_phases(vec![Phase::Editing]),
        )
        .worker(
            WorkerSpec::new(Capability::Editing)
                .script(fail_always(WorkerError::Execution("style check failed".into()))),
        )
        .build();
    let id = harness.start(&[]).await;

    // The failure gate comes first.
    let view = harness.wait_for_gate(id).await;
    let gate = view.pending_approval.unwrap();
    assert!(matches!(gate.kind, GateKind::TaskFailure { .. }));
    assert_eq!(gate.phase, Phase::Editing);

    // Accepting the failure finishes the phase, which then needs its review.
    assert!(harness
        .orchestrator
        .approve_phase(id, Phase::Editing)
        .await
        .unwrap());
    let view = harness
        .wait_for(id, |v| {
            v.pending_approval
                .as_ref()
                .is_some_and(|g| g.kind == GateKind::PhaseReview)
        })
        .await;
    assert_eq!(view.current_phase, Phase::Editing);

    assert!(harness
        .orchestrator
        .approve_phase(id, Phase::Editing)
        .await
        .unwrap());
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    harness.orchestrator.shutdown().await;
}

/// Retrying an accepted failure while the phase waits for review reopens
/// the phase; the review is requested again once the task has run.
#[tokio::test]
async fn test_retry_during_phase_review_reopens_phase() {
    let harness = Harness::builder()
        .config(
            fast_config()
                .with_max_task_retries(0)
                .with_approval_phases(vec![Phase::Editing]),
        )
        .worker(
            WorkerSpec::new(Capability::Editing)
                .script(fail_first(1, WorkerError::Execution("style check failed".into()))),
        )
        .build();
    let id = harness.start(&[]).await;

    harness.wait_for_gate(id).await;
    assert!(harness
        .orchestrator
        .approve_phase(id, Phase::Editing)
        .await
        .unwrap());
    let view = harness
        .wait_for(id, |v| {
            v.pending_approval
                .as_ref()
                .is_some_and(|g| g.kind == GateKind::PhaseReview)
        })
        .await;
    assert_eq!(view.phase_status[&Phase::Editing], PhaseStatus::Completed);
    let failed = view.failed_tasks[0].task_id;

    harness.orchestrator.retry_task(id, failed).await.unwrap();
    let view = harness.status(id).await;
    assert!(view.pending_approval.is_none());
    assert_eq!(view.phase_status[&Phase::Editing], PhaseStatus::InProgress);

    let view = harness
        .wait_for(id, |v| {
            v.pending_approval
                .as_ref()
                .is_some_and(|g| g.kind == GateKind::PhaseReview)
        })
        .await;
    assert!(view.failed_tasks.is_empty());
    assert_eq!(view.current_phase, Phase::Editing);

    assert!(harness
        .orchestrator
        .approve_phase(id, Phase::Editing)
        .await
        .unwrap());
    harness.wait_for_status(id, WorkflowStatus::Completed).await;

    // A phase is Completed exactly when all of its tasks are terminal.
    let snapshot = harness.snapshot(id).await;
    for phase in Phase::ALL {
        assert_eq!(
            snapshot.phase_status(phase) == PhaseStatus::Completed,
            snapshot.phase_tasks_terminal(phase),
            "phase {}",
            phase
        );
    }
    assert_eq!(snapshot.task(&failed).unwrap().status, TaskStatus::Completed);
    assert_eq!(harness.probe(Capability::Editing).attempts(failed), 2);
    assert_eq!(harness.events(id, EventType::ApprovalRequired).len(), 3);

    harness.orchestrator.shutdown().await;
}
