//! Core domain models for maestro orchestration.
//!
//! This module contains the task data model and the dependency graph
//! used to validate and walk task sets.

pub mod graph;
pub mod task;

pub use graph::TaskGraph;
pub use task::{Capability, Priority, Task, TaskId, TaskSpec, TaskStatus};
