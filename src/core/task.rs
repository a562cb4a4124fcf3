//! Task data model.
//!
//! Tasks are the atomic units of work dispatched to workers. Each task
//! belongs to exactly one phase, names the capability it needs, and tracks
//! its status, retries, and results. Tasks are never deleted, only marked
//! terminal, so the snapshot doubles as an audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::workflow::Phase;

/// Unique identifier for a task within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of work a worker can perform.
///
/// Tasks are matched to workers by capability; the set is closed so that
/// every worker kind is registered explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DocumentIntake,
    Outlining,
    LegalResearch,
    Drafting,
    Review,
    Editing,
    Finalization,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::DocumentIntake,
        Capability::Outlining,
        Capability::LegalResearch,
        Capability::Drafting,
        Capability::Review,
        Capability::Editing,
        Capability::Finalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DocumentIntake => "document_intake",
            Capability::Outlining => "outlining",
            Capability::LegalResearch => "legal_research",
            Capability::Drafting => "drafting",
            Capability::Review => "review",
            Capability::Editing => "editing",
            Capability::Finalization => "finalization",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduling priority. Higher priorities are dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or capacity.
    #[default]
    Pending,
    /// Dispatched to a worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; will not be retried without a human decision.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Description of a task to be created.
///
/// Planners and workers describe work with specs; the snapshot turns them
/// into tasks, assigning ids and insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub capability: Capability,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
}

impl TaskSpec {
    pub fn new(capability: Capability, description: impl Into<String>) -> Self {
        Self {
            capability,
            description: description.into(),
            priority: Priority::Normal,
            input: Value::Null,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.depends_on.insert(id);
        self
    }
}

/// A single unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Phase this task belongs to.
    pub phase: Phase,
    /// Capability a worker needs to run this task.
    pub capability: Capability,
    pub description: String,
    pub priority: Priority,
    pub input: Value,
    /// Worker result data, set on completion.
    pub output: Option<Value>,
    /// Tasks that must be completed before this one can start.
    pub depends_on: BTreeSet<TaskId>,
    pub status: TaskStatus,
    /// Number of times the task has been re-scheduled after a failure.
    pub retry_count: u32,
    /// Last error reported for this task.
    pub error: Option<String>,
    /// Insertion order within the workflow; breaks priority ties.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task for `phase` from a spec.
    pub fn from_spec(spec: TaskSpec, phase: Phase, seq: u64) -> Self {
        Self {
            id: TaskId::new(),
            phase,
            capability: spec.capability,
            description: spec.description,
            priority: spec.priority,
            input: spec.input,
            output: None,
            depends_on: spec.depends_on,
            status: TaskStatus::Pending,
            retry_count: 0,
            error: None,
            seq,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to InProgress and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully completed with its output.
    pub fn complete(&mut self, output: Value) {
        self.status = TaskStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as terminally failed.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Put the task back in the queue after a retryable failure.
    pub fn requeue(&mut self, error: &str) {
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.error = Some(error.to_string());
        self.started_at = None;
    }

    /// Reset a failed task for a fresh attempt with a new retry budget.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.error = None;
        self.output = None;
        self.started_at = None;
        self.completed_at = None;
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
