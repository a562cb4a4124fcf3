//! Workflow management types for the maestro engine.
//!
//! This module provides the phase and status enums, the workflow snapshot
//! aggregate with its phase transition rules, and the read-only status views
//! returned by the control surface.

mod snapshot;
mod status;
mod types;

pub use snapshot::{ApprovalGate, GateKind, PhaseHistoryEntry, TaskBatch, WorkflowSnapshot};
pub use status::{FailedTaskView, SessionSummary, StatusView, TaskCounts};
pub use types::{Phase, PhaseStatus, SessionId, WorkflowStatus};
