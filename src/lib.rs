//! maestro: a workflow orchestration engine for multi-phase document work.
//!
//! A case moves through a fixed sequence of phases (intake, outline,
//! research, drafting, review, editing, finalize). Each phase is a set of
//! tasks with dependencies, dispatched concurrently to capability-matched
//! workers. Progress is persisted after every mutation so a session can be
//! recovered after a restart, and selected phases wait for human approval.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use orchestration::Orchestrator;
pub use workflow::{Phase, SessionId, WorkflowStatus};
