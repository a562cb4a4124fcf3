//! Orchestration layer for the maestro engine.
//!
//! This module holds the runtime pieces that move a workflow forward:
//! the event bus, the capability registry and its worker contract, the
//! ready-task scheduler, failure classification, phase planning, and the
//! orchestrator that ties them together into per-session execution loops.

mod bus;
mod classifier;
mod orchestrator;
mod planner;
mod registry;
pub mod scheduler;
mod worker;

pub use bus::{Event, EventBus, EventType, Handler, HandlerError, SubscriptionId};
pub use classifier::{ErrorClass, ErrorClassifier, FailureAction, PersistencePolicy, TaskFailure};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use planner::{CasePlanner, PhasePlanner, RESEARCH_TOPICS_KEY, SECTIONS_KEY};
pub use registry::{
    CapabilityDescriptor, CapabilityRegistry, InstanceId, RegistryStatus, WorkerLease,
    WorkerStatus,
};
pub use scheduler::{ready_tasks, CapacityProvider};
pub use worker::{TaskContext, TaskOutput, Worker, WorkerError, WorkerFactory};
