//! Failure classification and recovery decisions.
//!
//! Every failed dispatch is sorted into one of three classes, and the class
//! plus the task's retry history decides what happens next:
//! - `Task`: the worker ran and reported an error. Retried up to the limit.
//! - `Worker`: the instance itself is broken. It is evicted and the task is
//!   retried under the same budget.
//! - `Fatal`: retrying cannot help (no covering worker, unrecoverable input).
//!   The task fails immediately.
//!
//! Persistence failures are handled separately by [`PersistencePolicy`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::core::task::Task;
use crate::error::Error;

use super::registry::InstanceId;
use super::worker::WorkerError;

/// Failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Task,
    Worker,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Task => "task",
            ErrorClass::Worker => "worker",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub class: ErrorClass,
    pub message: String,
    /// Instance that ran the task, when one was acquired.
    pub instance: Option<InstanceId>,
}

impl TaskFailure {
    /// Classify an error returned by a worker.
    pub fn from_worker(error: &WorkerError, instance: InstanceId) -> Self {
        let class = match error {
            WorkerError::Execution(_) => ErrorClass::Task,
            WorkerError::Unhealthy(_) | WorkerError::Initialization(_) => ErrorClass::Worker,
            WorkerError::Unrecoverable(_) => ErrorClass::Fatal,
        };
        Self {
            class,
            message: error.to_string(),
            instance: Some(instance),
        }
    }

    /// Classify an engine error raised before a worker ran the task.
    pub fn from_error(error: &Error) -> Self {
        let class = match error {
            Error::CapabilityUnavailable(_) | Error::Validation(_) => ErrorClass::Fatal,
            // Instance initialization failed; a later attempt gets a fresh one.
            Error::TaskExecution { .. } => ErrorClass::Worker,
            _ => ErrorClass::Task,
        };
        Self {
            class,
            message: error.to_string(),
            instance: None,
        }
    }

    /// A worker panicked while executing.
    pub fn panicked(instance: InstanceId) -> Self {
        Self {
            class: ErrorClass::Worker,
            message: "worker panicked".to_string(),
            instance: Some(instance),
        }
    }
}

/// What to do with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Put the task back in the queue. `attempt` is the retry number (1-based).
    Retry {
        attempt: u32,
        evict: Option<InstanceId>,
    },
    /// Mark the task Failed.
    Fail { evict: Option<InstanceId> },
}

impl FailureAction {
    pub fn evict(&self) -> Option<InstanceId> {
        match self {
            FailureAction::Retry { evict, .. } | FailureAction::Fail { evict } => *evict,
        }
    }
}

/// Decides between retrying and failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClassifier {
    max_task_retries: u32,
}

impl ErrorClassifier {
    pub fn new(max_task_retries: u32) -> Self {
        Self { max_task_retries }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_task_retries)
    }

    pub fn max_task_retries(&self) -> u32 {
        self.max_task_retries
    }

    pub fn decide(&self, task: &Task, failure: &TaskFailure) -> FailureAction {
        let evict = match failure.class {
            ErrorClass::Worker => failure.instance,
            ErrorClass::Task | ErrorClass::Fatal => None,
        };

        if failure.class == ErrorClass::Fatal || task.retry_count >= self.max_task_retries {
            return FailureAction::Fail { evict };
        }
        FailureAction::Retry {
            attempt: task.retry_count + 1,
            evict,
        }
    }
}

/// Retry schedule for failed saves.
///
/// The delay before retry `n` (0-based) is `base * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl PersistencePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.persist_max_retries,
            base_delay: Duration::from_millis(config.persist_backoff_base_ms),
            max_delay: Duration::from_millis(config.persist_backoff_max_ms),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
