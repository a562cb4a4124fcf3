//! Read-only views of a workflow for callers of the control surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::task::{Capability, TaskId, TaskStatus};

use super::{ApprovalGate, Phase, PhaseStatus, SessionId, WorkflowSnapshot, WorkflowStatus};

/// A task that ended in failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTaskView {
    pub task_id: TaskId,
    pub phase: Phase,
    pub capability: Capability,
    pub description: String,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Everything a caller needs to know about a workflow without reading logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub session_id: SessionId,
    pub case_name: String,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub phase_status: BTreeMap<Phase, PhaseStatus>,
    pub tasks: TaskCounts,
    /// Completed tasks over all tasks created so far, 0.0 to 1.0.
    pub progress: f64,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<FailedTaskView>,
    pub pending_approval: Option<ApprovalGate>,
    pub error: Option<String>,
    /// Whether an execution loop is currently driving this session.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatusView {
    pub fn from_snapshot(snapshot: &WorkflowSnapshot, active: bool) -> Self {
        let tasks = TaskCounts {
            pending: snapshot.count_by_status(TaskStatus::Pending),
            in_progress: snapshot.count_by_status(TaskStatus::InProgress),
            completed: snapshot.count_by_status(TaskStatus::Completed),
            failed: snapshot.count_by_status(TaskStatus::Failed),
        };
        let progress = if tasks.total() == 0 {
            0.0
        } else {
            tasks.completed as f64 / tasks.total() as f64
        };

        let failed_tasks = snapshot
            .failed_tasks()
            .into_iter()
            .map(|t| FailedTaskView {
                task_id: t.id,
                phase: t.phase,
                capability: t.capability,
                description: t.description.clone(),
                retry_count: t.retry_count,
                error: t.error.clone(),
            })
            .collect();

        Self {
            session_id: snapshot.session_id,
            case_name: snapshot.case_name.clone(),
            status: snapshot.status,
            current_phase: snapshot.current_phase,
            phase_status: snapshot.phase_status.clone(),
            tasks,
            progress,
            completed_tasks: snapshot.completed_tasks.clone(),
            failed_tasks,
            pending_approval: snapshot.pending_approval.clone(),
            error: snapshot.error.clone(),
            active,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

/// One line of the session listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub case_name: String,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub awaiting_approval: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn from_snapshot(snapshot: &WorkflowSnapshot, active: bool) -> Self {
        Self {
            session_id: snapshot.session_id,
            case_name: snapshot.case_name.clone(),
            status: snapshot.status,
            current_phase: snapshot.current_phase,
            awaiting_approval: snapshot.awaiting_approval(),
            active,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}
