//! Worker contract.
//!
//! Workers are the external collaborators (document processors, LLM-backed
//! research and drafting bots) that actually perform tasks. The engine only
//! ever calls the four operations of the [`Worker`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::task::{Task, TaskId, TaskSpec};
use crate::workflow::WorkflowSnapshot;

/// Failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The task ran and failed; trying again may succeed.
    #[error("{0}")]
    Execution(String),
    /// The worker instance is broken; a fresh instance may succeed.
    #[error("worker unhealthy: {0}")]
    Unhealthy(String),
    /// The task can never succeed; do not retry.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
    /// The worker could not be brought up.
    #[error("initialization failed: {0}")]
    Initialization(String),
}

/// A worker implementation.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Prepare the instance before its first task.
    async fn initialize(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Run one task.
    async fn execute(&self, task: &Task, context: &TaskContext) -> Result<TaskOutput, WorkerError>;

    /// Report whether the instance can keep taking work.
    async fn health_check(&self) -> bool {
        true
    }

    /// Release resources; the instance is discarded afterwards.
    async fn cleanup(&self) {}
}

/// Creates worker instances on demand.
pub type WorkerFactory = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// Read-only inputs assembled for one task.
///
/// Lookups go through the task's own input first, then the outputs of its
/// completed dependencies (ordered by task id), then the workflow context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub case_name: String,
    pub workflow: Map<String, Value>,
    pub input: Value,
    pub dependencies: BTreeMap<TaskId, Value>,
}

impl TaskContext {
    /// Assemble the context for `task` from the current snapshot.
    pub fn build(snapshot: &WorkflowSnapshot, task: &Task) -> Self {
        let dependencies = task
            .depends_on
            .iter()
            .filter_map(|id| {
                let dep = snapshot.task(id)?;
                Some((*id, dep.output.clone()?))
            })
            .collect();

        Self {
            case_name: snapshot.case_name.clone(),
            workflow: snapshot.context.clone(),
            input: task.input.clone(),
            dependencies,
        }
    }

    /// Look up `key` with input → dependency outputs → workflow precedence.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.input.get(key) {
            return Some(v);
        }
        if let Some(v) = self.dependencies.values().find_map(|out| out.get(key)) {
            return Some(v);
        }
        self.workflow.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// What a worker returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Stored as the task's output.
    pub data: Value,
    /// Merged into the workflow context.
    #[serde(default)]
    pub context_updates: Map<String, Value>,
    /// Additional tasks for the current phase, each depending on this task.
    #[serde(default)]
    pub follow_on: Vec<TaskSpec>,
}

impl TaskOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }

    pub fn spawn(mut self, spec: TaskSpec) -> Self {
        self.follow_on.push(spec);
        self
    }
}
