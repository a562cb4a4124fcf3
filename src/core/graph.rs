//! Task dependency graph.
//!
//! The snapshot stores dependencies as id sets on each task. `TaskGraph`
//! lifts them into a petgraph `DiGraph` to validate a task set (every
//! dependency exists, no cycles) and to walk dependents transitively.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// Dependency graph over a set of tasks.
///
/// Edges point from a dependency to the task that depends on it.
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate the graph for `tasks`.
    ///
    /// # Errors
    /// Returns `Error::Validation` if a task depends on an id outside the set,
    /// on itself, or if the dependencies form a cycle.
    pub fn build<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Result<Self> {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let mut graph = DiGraph::with_capacity(tasks.len(), 0);
        let mut index = HashMap::with_capacity(tasks.len());

        for task in &tasks {
            index.insert(task.id, graph.add_node(task.id));
        }

        for task in &tasks {
            let to = index[&task.id];
            for dep in &task.depends_on {
                if *dep == task.id {
                    return Err(Error::Validation(format!(
                        "Task {} depends on itself",
                        task.id
                    )));
                }
                let from = index.get(dep).ok_or_else(|| {
                    Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        task.id, dep
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(Error::Validation(
                "Task dependencies contain a cycle".to_string(),
            ));
        }

        Ok(Self { graph, index })
    }

    /// All tasks that depend on any of `roots`, directly or transitively.
    ///
    /// The roots themselves are not included. Order follows a depth-first
    /// walk and is not significant.
    pub fn transitive_dependents(&self, roots: &[TaskId]) -> Vec<TaskId> {
        let root_set: HashSet<TaskId> = roots.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for root in roots {
            let Some(&start) = self.index.get(root) else {
                continue;
            };
            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(node) = dfs.next(&self.graph) {
                let id = self.graph[node];
                if !root_set.contains(&id) && seen.insert(id) {
                    out.push(id);
                }
            }
        }

        out
    }
}
