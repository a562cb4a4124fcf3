//! Workflow snapshot: the root aggregate for one session.
//!
//! `WorkflowSnapshot` owns every task of a case, the per-phase progress,
//! the context bag produced by completed tasks, and the pending approval
//! gate. It is the unit of persistence: the orchestrator mirrors it to the
//! state store after every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::core::graph::TaskGraph;
use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};

use super::{Phase, PhaseStatus, SessionId, WorkflowStatus};

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    /// The phase that was entered.
    pub phase: Phase,
    /// When this phase was entered.
    pub entered_at: DateTime<Utc>,
}

/// Why the workflow is waiting for a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GateKind {
    /// The phase finished and is configured to require sign-off before advancing.
    PhaseReview,
    /// Tasks failed terminally and the phase cannot finish on its own.
    TaskFailure { task_ids: Vec<TaskId> },
}

/// A pending human-approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub phase: Phase,
    pub kind: GateKind,
    pub requested_at: DateTime<Utc>,
}

impl ApprovalGate {
    pub fn new(phase: Phase, kind: GateKind) -> Self {
        Self {
            phase,
            kind,
            requested_at: Utc::now(),
        }
    }
}

/// A set of tasks to add to a phase in one step.
///
/// Ids are assigned as specs are pushed so later specs in the same batch
/// can depend on earlier ones.
#[derive(Debug, Default)]
pub struct TaskBatch {
    entries: Vec<(TaskId, TaskSpec)>,
}

impl TaskBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a spec to the batch and return the id its task will get.
    pub fn push(&mut self, spec: TaskSpec) -> TaskId {
        let id = TaskId::new();
        self.entries.push((id, spec));
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Full state of one workflow session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub session_id: SessionId,
    pub case_name: String,
    /// Items supplied at creation (uploaded document names).
    pub input_items: Vec<String>,
    pub current_phase: Phase,
    pub status: WorkflowStatus,
    pub phase_status: BTreeMap<Phase, PhaseStatus>,
    pub tasks: HashMap<TaskId, Task>,
    /// Completed task ids in completion order.
    pub completed_tasks: Vec<TaskId>,
    /// Values produced by completed tasks, visible to later tasks.
    pub context: Map<String, Value>,
    pub pending_approval: Option<ApprovalGate>,
    /// Reason the workflow failed, when status is Failed.
    pub error: Option<String>,
    pub phase_history: Vec<PhaseHistoryEntry>,
    /// Sequence number the next inserted task receives.
    pub next_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    /// Create a snapshot positioned at the first phase.
    ///
    /// The first phase is marked InProgress; every later phase stays Pending
    /// until it is entered.
    pub fn new(case_name: &str, input_items: Vec<String>, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        let first = Phase::first();
        let phase_status = Phase::ALL
            .iter()
            .map(|p| {
                let status = if *p == first {
                    PhaseStatus::InProgress
                } else {
                    PhaseStatus::Pending
                };
                (*p, status)
            })
            .collect();

        Self {
            session_id: SessionId::new(),
            case_name: case_name.to_string(),
            input_items,
            current_phase: first,
            status: WorkflowStatus::InProgress,
            phase_status,
            tasks: HashMap::new(),
            completed_tasks: Vec::new(),
            context,
            pending_approval: None,
            error: None,
            phase_history: vec![PhaseHistoryEntry {
                phase: first,
                entered_at: now,
            }],
            next_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record that the snapshot changed.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn awaiting_approval(&self) -> bool {
        self.pending_approval.is_some()
    }

    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.phase_status.get(&phase).copied().unwrap_or_default()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Add a batch of tasks to `phase`.
    ///
    /// The combined task set is validated as a dependency graph; on error the
    /// snapshot is left unchanged.
    pub fn insert_batch(&mut self, phase: Phase, batch: TaskBatch) -> Result<Vec<TaskId>> {
        let mut ids = Vec::with_capacity(batch.len());
        for (id, spec) in batch.entries {
            let mut task = Task::from_spec(spec, phase, self.next_seq);
            task.id = id;
            self.next_seq += 1;
            ids.push(id);
            self.tasks.insert(id, task);
        }

        if let Err(e) = TaskGraph::build(self.tasks.values()) {
            for id in &ids {
                self.tasks.remove(id);
            }
            self.next_seq -= ids.len() as u64;
            return Err(e);
        }

        self.touch();
        Ok(ids)
    }

    /// Tasks belonging to `phase`, in insertion order.
    pub fn tasks_in_phase(&self, phase: Phase) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| t.phase == phase).collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// All tasks in insertion order.
    pub fn tasks_by_seq(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// True when every dependency of `task` is Completed.
    ///
    /// Unknown dependency ids never count as satisfied.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    /// True when every task in `phase` is terminal (vacuously true for an empty phase).
    pub fn phase_tasks_terminal(&self, phase: Phase) -> bool {
        self.tasks
            .values()
            .filter(|t| t.phase == phase)
            .all(|t| t.is_finished())
    }

    /// Failed tasks in insertion order.
    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.tasks_by_seq()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    /// Number of tasks in each status.
    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Mark the current phase Completed.
    pub fn complete_current_phase(&mut self) {
        self.phase_status
            .insert(self.current_phase, PhaseStatus::Completed);
        self.touch();
    }

    /// Return a Completed current phase to InProgress.
    ///
    /// Returns false if the phase was not Completed.
    pub fn reopen_current_phase(&mut self) -> bool {
        if self.phase_status(self.current_phase) != PhaseStatus::Completed {
            return false;
        }
        self.phase_status
            .insert(self.current_phase, PhaseStatus::InProgress);
        self.touch();
        true
    }

    /// Enter `target`, which must be the phase directly after the current one.
    ///
    /// The current phase is marked Completed and the target InProgress.
    pub fn transition(&mut self, target: Phase) -> Result<()> {
        if self.current_phase.next() != Some(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.current_phase.to_string(),
                to: target.to_string(),
            });
        }

        self.phase_status
            .insert(self.current_phase, PhaseStatus::Completed);
        self.phase_status.insert(target, PhaseStatus::InProgress);
        self.current_phase = target;
        self.phase_history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    /// Mark the workflow as failed with a reason.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = WorkflowStatus::Failed;
        self.error = Some(error.into());
        self.touch();
    }

    /// Return InProgress tasks to Pending.
    ///
    /// Used when rehydrating after a crash: whatever was in flight is
    /// dispatched again. Returns the number of tasks reset.
    pub fn requeue_in_flight(&mut self) -> usize {
        let mut count = 0;
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                count += 1;
            }
        }
        if count > 0 {
            self.touch();
        }
        count
    }
}
