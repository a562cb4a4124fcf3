use thiserror::Error;

use crate::core::task::{Capability, TaskId};
use crate::workflow::SessionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(SessionId),

    #[error("Task {task_id} failed: {message}")]
    TaskExecution { task_id: TaskId, message: String },

    #[error("No worker registered for capability: {0}")]
    CapabilityUnavailable(Capability),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Orchestrator is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, Error>;
