//! Ready-task selection.
//!
//! The scheduler is a pure function of the workflow snapshot and the current
//! worker capacity. It decides what may start in the next round; dispatch
//! and result handling belong to the orchestrator.

use std::collections::HashMap;

use crate::core::task::{Capability, Task, TaskId, TaskStatus};
use crate::workflow::WorkflowSnapshot;

use super::registry::CapabilityRegistry;

/// Source of per-capability start slots.
pub trait CapacityProvider {
    /// Tasks of `capability` that may start now, or `None` when no worker
    /// covers the capability at all.
    fn capacity(&self, capability: Capability) -> Option<usize>;
}

impl CapacityProvider for CapabilityRegistry {
    fn capacity(&self, capability: Capability) -> Option<usize> {
        CapabilityRegistry::capacity(self, capability)
    }
}

impl CapacityProvider for HashMap<Capability, usize> {
    fn capacity(&self, capability: Capability) -> Option<usize> {
        self.get(&capability).copied()
    }
}

/// Pending tasks of the current phase whose dependencies are all Completed.
///
/// Ordered by phase, then descending priority, then insertion order.
pub fn eligible_tasks(snapshot: &WorkflowSnapshot) -> Vec<&Task> {
    let mut tasks: Vec<&Task> = snapshot
        .tasks
        .values()
        .filter(|t| t.phase == snapshot.current_phase)
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| snapshot.dependencies_met(t))
        .collect();

    tasks.sort_by(|a, b| {
        a.phase
            .index()
            .cmp(&b.phase.index())
            .then(b.priority.cmp(&a.priority))
            .then(a.seq.cmp(&b.seq))
    });
    tasks
}

/// Tasks to dispatch in the next round.
///
/// Each registered capability contributes at most as many tasks as it has
/// free slots. Tasks for an unregistered capability are passed through so
/// that dispatch can fail them.
pub fn ready_tasks(snapshot: &WorkflowSnapshot, capacity: &impl CapacityProvider) -> Vec<TaskId> {
    let mut budgets: HashMap<Capability, Option<usize>> = HashMap::new();
    let mut ready = Vec::new();

    for task in eligible_tasks(snapshot) {
        let budget = budgets
            .entry(task.capability)
            .or_insert_with(|| capacity.capacity(task.capability));
        match budget {
            None => ready.push(task.id),
            Some(0) => {}
            Some(n) => {
                *n -= 1;
                ready.push(task.id);
            }
        }
    }

    if !ready.is_empty() {
        tracing::debug!(
            session_id = %snapshot.session_id,
            phase = %snapshot.current_phase,
            ready = ready.len(),
            "tasks ready"
        );
    }
    ready
}
