//! Orchestrator core: the control surface and per-session execution loops.
//!
//! The `Orchestrator` owns the in-memory snapshot of every active session
//! and drives each one with its own tokio task. A loop iteration is one
//! scheduling round:
//!
//! 1. Select ready tasks and mark them InProgress (persisted).
//! 2. Dispatch them concurrently to workers from the registry.
//! 3. Apply each result and persist after each one.
//! 4. Evaluate phase completion: gate, advance, or finish the workflow.
//! 5. Sleep for the tick interval (cut short by control operations).
//!
//! A loop suspends while the workflow is paused or awaiting approval and
//! exits once the workflow is terminal or the session is removed.

use futures::future::join_all;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::graph::TaskGraph;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::store::StateStore;
use crate::workflow::{
    ApprovalGate, GateKind, Phase, PhaseStatus, SessionId, SessionSummary, StatusView, TaskBatch,
    WorkflowSnapshot, WorkflowStatus,
};

use super::bus::{EventBus, EventType};
use super::classifier::{ErrorClassifier, FailureAction, PersistencePolicy, TaskFailure};
use super::planner::{CasePlanner, PhasePlanner};
use super::registry::{CapabilityDescriptor, CapabilityRegistry, InstanceId};
use super::scheduler;
use super::worker::{TaskContext, TaskOutput, WorkerFactory};

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    registry: Option<Arc<CapabilityRegistry>>,
    bus: Option<Arc<EventBus>>,
    planner: Arc<dyn PhasePlanner>,
}

impl OrchestratorBuilder {
    pub fn registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn PhasePlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn build(self) -> Orchestrator {
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.history_capacity)));
        Orchestrator {
            inner: Arc::new(Inner {
                classifier: ErrorClassifier::from_config(&self.config),
                persistence: PersistencePolicy::from_config(&self.config),
                config: self.config,
                registry: self.registry.unwrap_or_default(),
                store: self.store,
                bus,
                planner: self.planner,
                sessions: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

/// Drives workflow sessions from creation to completion.
///
/// Cloning is cheap; clones share all sessions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    classifier: ErrorClassifier,
    persistence: PersistencePolicy,
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    planner: Arc<dyn PhasePlanner>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    shutdown: CancellationToken,
}

struct SessionHandle {
    snapshot: Mutex<WorkflowSnapshot>,
    wake: Notify,
    cancel: CancellationToken,
    running: AtomicBool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    fn new(snapshot: WorkflowSnapshot, cancel: CancellationToken) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            wake: Notify::new(),
            cancel,
            running: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Orchestrator {
    pub fn builder(config: EngineConfig, store: Arc<dyn StateStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            registry: None,
            bus: None,
            planner: Arc::new(CasePlanner),
        }
    }

    /// Orchestrator with a fresh registry, event bus and the default planner.
    pub fn new(config: EngineConfig, store: Arc<dyn StateStore>) -> Self {
        Self::builder(config, store).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    /// Register a worker type, applying any configured instance limit override.
    pub fn register_worker(
        &self,
        mut descriptor: CapabilityDescriptor,
        factory: WorkerFactory,
    ) -> Result<()> {
        descriptor.max_instances = self
            .inner
            .config
            .instance_limit(&descriptor.name, descriptor.max_instances);
        self.inner.registry.register(descriptor, factory)
    }

    /// Create a workflow and start driving it.
    ///
    /// Returns as soon as the first phase's tasks are persisted; execution
    /// continues in the background.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty case name or an invalid first-phase task
    /// graph, `Persistence` if the initial snapshot cannot be saved,
    /// `ShutDown` after [`Orchestrator::shutdown`].
    pub async fn start_workflow(
        &self,
        case_name: &str,
        input_items: Vec<String>,
        initial_context: Map<String, Value>,
    ) -> Result<SessionId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }
        let case_name = case_name.trim();
        if case_name.is_empty() {
            return Err(Error::Validation("case name is empty".to_string()));
        }

        let mut snapshot = WorkflowSnapshot::new(case_name, input_items, initial_context);
        let phase = snapshot.current_phase;
        let batch = self.inner.planner.plan(phase, &snapshot);
        let task_ids = snapshot.insert_batch(phase, batch)?;
        self.inner.save_with_retry(&snapshot).await?;

        let session_id = snapshot.session_id;
        self.inner.bus.emit(
            EventType::WorkflowStarted,
            session_id,
            json!({
                "case_name": snapshot.case_name,
                "phase": phase,
                "items": snapshot.input_items,
                "tasks": task_ids.len(),
            }),
        );
        tracing::info!(
            %session_id,
            case_name = %snapshot.case_name,
            tasks = task_ids.len(),
            "workflow started"
        );

        let handle = Arc::new(SessionHandle::new(
            snapshot,
            self.inner.shutdown.child_token(),
        ));
        self.inner
            .sessions
            .write()
            .await
            .insert(session_id, Arc::clone(&handle));
        self.inner.ensure_running(session_id, &handle);
        Ok(session_id)
    }

    /// Current status of a session, from memory if active, else from the store.
    pub async fn get_status(&self, session_id: SessionId) -> Result<StatusView> {
        if let Some(handle) = self.inner.active(session_id).await {
            let snapshot = handle.snapshot.lock().await;
            return Ok(StatusView::from_snapshot(&snapshot, handle.is_running()));
        }
        match self.inner.store.load(session_id).await? {
            Some(snapshot) => Ok(StatusView::from_snapshot(&snapshot, false)),
            None => Err(Error::WorkflowNotFound(session_id)),
        }
    }

    /// Approve the pending gate for `phase`.
    ///
    /// For a phase review gate the deferred transition runs now. For a task
    /// failure gate the failures are accepted: pending dependents of the
    /// failed tasks are failed too and the phase is re-evaluated.
    ///
    /// Returns `Ok(false)` when the phase was already approved.
    ///
    /// # Errors
    ///
    /// `Validation` if the phase is neither gated nor completed.
    pub async fn approve_phase(&self, session_id: SessionId, phase: Phase) -> Result<bool> {
        let handle = self.inner.attach(session_id).await?;
        let mut snapshot = handle.snapshot.lock().await;

        let gate = match snapshot.pending_approval.take() {
            Some(gate) if gate.phase == phase => gate,
            other => {
                snapshot.pending_approval = other;
                if snapshot.phase_status(phase) == PhaseStatus::Completed {
                    tracing::debug!(%session_id, %phase, "phase already approved");
                    return Ok(false);
                }
                return Err(Error::Validation(format!(
                    "phase {} is not awaiting approval",
                    phase
                )));
            }
        };

        snapshot.touch();
        self.inner.bus.emit(
            EventType::PhaseApproved,
            session_id,
            json!({ "phase": phase, "gate": gate.kind }),
        );
        tracing::info!(%session_id, %phase, "phase approved");

        match gate.kind {
            GateKind::PhaseReview => self.inner.advance_or_fail(&mut snapshot),
            GateKind::TaskFailure { task_ids } => {
                self.inner.accept_failures(&mut snapshot, &task_ids);
                self.inner.evaluate_phase(&mut snapshot);
            }
        }

        let saved = self.inner.persist(&mut snapshot).await;
        let resumable = snapshot.status == WorkflowStatus::InProgress;
        drop(snapshot);

        if resumable {
            self.inner.ensure_running(session_id, &handle);
        }
        handle.wake.notify_one();

        if !saved {
            return Err(Error::Persistence(format!(
                "approval of {} could not be saved",
                phase
            )));
        }
        Ok(true)
    }

    /// Reset a failed task of the current phase so it runs again.
    ///
    /// Dependents that were failed because of it are reset as well, and the
    /// task is removed from the pending failure gate. The gate is cleared
    /// once no undecided failures remain. A phase already waiting for review
    /// is reopened and its review gate dropped; it is requested again when
    /// the phase finishes.
    pub async fn retry_task(&self, session_id: SessionId, task_id: TaskId) -> Result<()> {
        let handle = self.inner.attach(session_id).await?;
        let mut snapshot = handle.snapshot.lock().await;

        if snapshot.status.is_terminal() {
            return Err(Error::Validation(format!(
                "workflow is {}",
                snapshot.status
            )));
        }
        let task = snapshot
            .task(&task_id)
            .ok_or_else(|| Error::Validation(format!("unknown task {}", task_id)))?;
        if task.status != TaskStatus::Failed {
            return Err(Error::Validation(format!(
                "task {} is {}, not failed",
                task_id, task.status
            )));
        }
        if task.phase != snapshot.current_phase {
            return Err(Error::Validation(format!(
                "task {} belongs to completed phase {}",
                task_id, task.phase
            )));
        }

        let graph = TaskGraph::build(snapshot.tasks.values())?;
        let mut reset = vec![task_id];
        reset.extend(
            graph
                .transitive_dependents(&[task_id])
                .into_iter()
                .filter(|id| {
                    snapshot
                        .task(id)
                        .is_some_and(|t| t.status == TaskStatus::Failed)
                }),
        );
        for id in &reset {
            if let Some(task) = snapshot.task_mut(id) {
                task.reset();
            }
        }

        let clear = match snapshot.pending_approval.as_mut() {
            Some(ApprovalGate {
                kind: GateKind::TaskFailure { task_ids },
                ..
            }) => {
                task_ids.retain(|id| !reset.contains(id));
                task_ids.is_empty()
            }
            Some(ApprovalGate {
                kind: GateKind::PhaseReview,
                ..
            }) => true,
            None => false,
        };
        if clear {
            snapshot.pending_approval = None;
        }
        if snapshot.reopen_current_phase() {
            tracing::info!(%session_id, phase = %snapshot.current_phase, "phase reopened");
        }
        snapshot.touch();
        tracing::info!(%session_id, %task_id, reset = reset.len(), "task reset for retry");

        let saved = self.inner.persist(&mut snapshot).await;
        let resumable = snapshot.status == WorkflowStatus::InProgress;
        drop(snapshot);

        if resumable {
            self.inner.ensure_running(session_id, &handle);
        }
        handle.wake.notify_one();

        if !saved {
            return Err(Error::Persistence(format!(
                "retry of task {} could not be saved",
                task_id
            )));
        }
        Ok(())
    }

    /// Stop scheduling new rounds. In-flight tasks finish and are recorded.
    pub async fn pause(&self, session_id: SessionId) -> Result<()> {
        let handle = self.inner.attach(session_id).await?;
        let mut snapshot = handle.snapshot.lock().await;

        match snapshot.status {
            WorkflowStatus::Paused => return Ok(()),
            status if status.is_terminal() => {
                return Err(Error::Validation(format!("workflow is {}", status)));
            }
            _ => {}
        }

        snapshot.status = WorkflowStatus::Paused;
        snapshot.touch();
        self.inner.bus.emit(
            EventType::WorkflowPaused,
            session_id,
            json!({ "phase": snapshot.current_phase }),
        );
        tracing::info!(%session_id, "workflow paused");

        if !self.inner.persist(&mut snapshot).await {
            return Err(Error::Persistence("pause could not be saved".to_string()));
        }
        Ok(())
    }

    /// Resume a paused workflow, re-enrolling it in an execution loop if
    /// none is running.
    pub async fn resume(&self, session_id: SessionId) -> Result<()> {
        let handle = self.inner.attach(session_id).await?;
        let mut snapshot = handle.snapshot.lock().await;

        match snapshot.status {
            WorkflowStatus::Paused => {
                snapshot.status = WorkflowStatus::InProgress;
                snapshot.touch();
                self.inner.bus.emit(
                    EventType::WorkflowResumed,
                    session_id,
                    json!({ "phase": snapshot.current_phase }),
                );
                tracing::info!(%session_id, "workflow resumed");
                if !self.inner.persist(&mut snapshot).await {
                    return Err(Error::Persistence("resume could not be saved".to_string()));
                }
            }
            status if status.is_terminal() => {
                return Err(Error::Validation(format!("workflow is {}", status)));
            }
            _ => {}
        }
        drop(snapshot);

        self.inner.ensure_running(session_id, &handle);
        handle.wake.notify_one();
        Ok(())
    }

    /// All known sessions, active and stored, oldest first.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries: HashMap<SessionId, SessionSummary> = self
            .inner
            .store
            .load_all()
            .await?
            .iter()
            .map(|s| (s.session_id, SessionSummary::from_snapshot(s, false)))
            .collect();

        let active: Vec<(SessionId, Arc<SessionHandle>)> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();
        for (id, handle) in active {
            let snapshot = handle.snapshot.lock().await;
            summaries.insert(id, SessionSummary::from_snapshot(&snapshot, handle.is_running()));
        }

        let mut list: Vec<SessionSummary> = summaries.into_values().collect();
        list.sort_by_key(|s| (s.created_at, s.session_id));
        Ok(list)
    }

    /// Stop a session's loop and delete it from memory and the store.
    pub async fn remove(&self, session_id: SessionId) -> Result<()> {
        let handle = self.inner.sessions.write().await.remove(&session_id);
        if let Some(handle) = &handle {
            handle.cancel.cancel();
            if let Some(task) = handle.take_task() {
                let _ = task.await;
            }
        }

        let deleted = self.inner.store.delete(session_id).await?;
        if handle.is_none() && !deleted {
            return Err(Error::WorkflowNotFound(session_id));
        }
        tracing::info!(%session_id, "session removed");
        Ok(())
    }

    /// Rehydrate every non-terminal stored session that is not already active.
    ///
    /// Tasks that were in flight when the previous process stopped are put
    /// back in the queue. Paused sessions are loaded but stay paused.
    pub async fn recover(&self) -> Result<Vec<SessionId>> {
        let mut recovered = Vec::new();
        for mut snapshot in self.inner.store.load_all().await? {
            let session_id = snapshot.session_id;
            if snapshot.status.is_terminal() || self.inner.active(session_id).await.is_some() {
                continue;
            }

            let requeued = snapshot.requeue_in_flight();
            if requeued > 0 {
                self.inner.save_with_retry(&snapshot).await?;
            }
            tracing::info!(%session_id, requeued, "session recovered");

            let handle = {
                let mut sessions = self.inner.sessions.write().await;
                Arc::clone(sessions.entry(session_id).or_insert_with(|| {
                    Arc::new(SessionHandle::new(
                        snapshot,
                        self.inner.shutdown.child_token(),
                    ))
                }))
            };
            let resumable = handle.snapshot.lock().await.status == WorkflowStatus::InProgress;
            if resumable {
                self.inner.ensure_running(session_id, &handle);
            }
            recovered.push(session_id);
        }
        Ok(recovered)
    }

    /// Probe idle worker instances and evict unhealthy ones.
    pub async fn health_check(&self) -> Vec<InstanceId> {
        self.inner.registry.health_check().await
    }

    /// Cancel every loop, wait for them to exit, and clean up workers.
    ///
    /// Loops finish their current round first. The orchestrator cannot start
    /// new sessions afterwards.
    pub async fn shutdown(&self) {
        tracing::info!("orchestrator shutting down");
        self.inner.shutdown.cancel();

        let handles: Vec<Arc<SessionHandle>> =
            self.inner.sessions.read().await.values().cloned().collect();
        for handle in handles {
            if let Some(task) = handle.take_task() {
                let _ = task.await;
            }
        }
        self.inner.registry.shutdown().await;
    }
}

impl Inner {
    async fn active(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// The active handle for a session, loading it from the store if needed.
    async fn attach(&self, session_id: SessionId) -> Result<Arc<SessionHandle>> {
        if let Some(handle) = self.active(session_id).await {
            return Ok(handle);
        }

        let mut snapshot = self
            .store
            .load(session_id)
            .await?
            .ok_or(Error::WorkflowNotFound(session_id))?;
        snapshot.requeue_in_flight();

        let mut sessions = self.sessions.write().await;
        let handle = sessions
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionHandle::new(snapshot, self.shutdown.child_token())));
        tracing::debug!(%session_id, "session attached from store");
        Ok(Arc::clone(handle))
    }

    fn ensure_running(self: &Arc<Self>, session_id: SessionId, handle: &Arc<SessionHandle>) {
        if handle.cancel.is_cancelled() || handle.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        let loop_handle = Arc::clone(handle);
        let task = tokio::spawn(async move {
            inner.run_session(session_id, &loop_handle).await;
            loop_handle.running.store(false, Ordering::SeqCst);
        });
        *handle.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    async fn run_session(&self, session_id: SessionId, handle: &SessionHandle) {
        tracing::debug!(%session_id, "session loop started");
        loop {
            if handle.cancel.is_cancelled() {
                break;
            }

            let (status, waiting) = {
                let snapshot = handle.snapshot.lock().await;
                (snapshot.status, snapshot.awaiting_approval())
            };
            if status.is_terminal() {
                break;
            }
            if status == WorkflowStatus::Paused || waiting {
                tokio::select! {
                    _ = handle.wake.notified() => continue,
                    _ = handle.cancel.cancelled() => break,
                }
            }

            self.run_round(session_id, handle).await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
                _ = handle.wake.notified() => {}
                _ = handle.cancel.cancelled() => break,
            }
        }
        tracing::debug!(%session_id, "session loop exited");
    }

    async fn run_round(&self, session_id: SessionId, handle: &SessionHandle) {
        let batch: Vec<(Task, TaskContext)> = {
            let mut snapshot = handle.snapshot.lock().await;
            if snapshot.status != WorkflowStatus::InProgress || snapshot.awaiting_approval() {
                return;
            }

            let ready = scheduler::ready_tasks(&snapshot, self.registry.as_ref());
            if ready.is_empty() {
                let before = (snapshot.current_phase, snapshot.status, snapshot.awaiting_approval());
                self.evaluate_phase(&mut snapshot);
                if before != (snapshot.current_phase, snapshot.status, snapshot.awaiting_approval()) {
                    self.persist(&mut snapshot).await;
                }
                return;
            }

            let mut batch = Vec::with_capacity(ready.len());
            for id in &ready {
                let Some(task) = snapshot.task_mut(id) else {
                    continue;
                };
                task.start();
                let task = task.clone();
                self.bus.emit(
                    EventType::TaskStarted,
                    session_id,
                    json!({
                        "task_id": task.id,
                        "phase": task.phase,
                        "capability": task.capability,
                        "attempt": task.retry_count + 1,
                    }),
                );
                let context = TaskContext::build(&snapshot, &task);
                batch.push((task, context));
            }
            snapshot.touch();
            if !self.persist(&mut snapshot).await {
                return;
            }
            batch
        };

        tracing::debug!(%session_id, tasks = batch.len(), "dispatching round");
        let outcomes = join_all(
            batch
                .into_iter()
                .map(|(task, context)| async move {
                    let outcome = self.dispatch(&task, &context).await;
                    (task.id, outcome)
                }),
        )
        .await;

        if handle.cancel.is_cancelled() {
            tracing::debug!(%session_id, "session cancelled, discarding round results");
            return;
        }

        let mut snapshot = handle.snapshot.lock().await;
        for (task_id, outcome) in outcomes {
            match outcome {
                Ok(output) => self.apply_success(&mut snapshot, task_id, output),
                Err(failure) => self.apply_failure(&mut snapshot, task_id, failure).await,
            }
            if !self.persist(&mut snapshot).await {
                return;
            }
        }

        self.evaluate_phase(&mut snapshot);
        self.persist(&mut snapshot).await;
    }

    async fn dispatch(
        &self,
        task: &Task,
        context: &TaskContext,
    ) -> std::result::Result<TaskOutput, TaskFailure> {
        let lease = self
            .registry
            .acquire(task.capability, task.id)
            .await
            .map_err(|e| TaskFailure::from_error(&e))?;
        let instance = lease.instance;

        let result = AssertUnwindSafe(lease.worker().execute(task, context))
            .catch_unwind()
            .await;
        self.registry.release(lease);

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(TaskFailure::from_worker(&e, instance)),
            Err(_) => Err(TaskFailure::panicked(instance)),
        }
    }

    fn apply_success(&self, snapshot: &mut WorkflowSnapshot, task_id: TaskId, output: TaskOutput) {
        let session_id = snapshot.session_id;
        let Some(task) = snapshot.task_mut(&task_id) else {
            return;
        };
        task.complete(output.data);
        let phase = task.phase;
        snapshot.completed_tasks.push(task_id);
        snapshot.context.extend(output.context_updates);

        let mut follow_on = Vec::new();
        if !output.follow_on.is_empty() {
            let mut batch = TaskBatch::new();
            for spec in output.follow_on {
                batch.push(spec.depends_on(task_id));
            }
            match snapshot.insert_batch(snapshot.current_phase, batch) {
                Ok(ids) => follow_on = ids,
                Err(e) => {
                    tracing::warn!(%session_id, %task_id, error = %e, "dropping invalid follow-on tasks")
                }
            }
        }
        snapshot.touch();

        self.bus.emit(
            EventType::TaskCompleted,
            session_id,
            json!({ "task_id": task_id, "phase": phase, "follow_on": follow_on }),
        );
        tracing::debug!(%session_id, %task_id, follow_on = follow_on.len(), "task completed");
    }

    async fn apply_failure(
        &self,
        snapshot: &mut WorkflowSnapshot,
        task_id: TaskId,
        failure: TaskFailure,
    ) {
        let session_id = snapshot.session_id;
        let Some(task) = snapshot.task(&task_id) else {
            return;
        };
        let action = self.classifier.decide(task, &failure);

        if let Some(instance) = action.evict() {
            self.registry.evict(instance).await;
        }

        let Some(task) = snapshot.task_mut(&task_id) else {
            return;
        };
        match action {
            FailureAction::Retry { attempt, .. } => {
                task.requeue(&failure.message);
                self.bus.emit(
                    EventType::TaskRetrying,
                    session_id,
                    json!({
                        "task_id": task_id,
                        "attempt": attempt,
                        "max_retries": self.classifier.max_task_retries(),
                        "class": failure.class,
                        "error": failure.message,
                    }),
                );
                tracing::warn!(
                    %session_id,
                    %task_id,
                    attempt,
                    class = %failure.class,
                    error = %failure.message,
                    "task failed, retrying"
                );
            }
            FailureAction::Fail { .. } => {
                task.fail(&failure.message);
                let phase = task.phase;
                self.bus.emit(
                    EventType::TaskFailed,
                    session_id,
                    json!({
                        "task_id": task_id,
                        "phase": phase,
                        "class": failure.class,
                        "error": failure.message,
                    }),
                );
                tracing::warn!(
                    %session_id,
                    %task_id,
                    class = %failure.class,
                    error = %failure.message,
                    "task failed"
                );
                self.block_on_failure(snapshot, task_id);
            }
        }
        snapshot.touch();
    }

    /// Add a terminally failed task to the phase's failure gate.
    fn block_on_failure(&self, snapshot: &mut WorkflowSnapshot, task_id: TaskId) {
        let phase = snapshot.current_phase;
        let gate = snapshot
            .pending_approval
            .get_or_insert_with(|| ApprovalGate::new(phase, GateKind::TaskFailure { task_ids: vec![] }));
        let task_ids = match &mut gate.kind {
            GateKind::TaskFailure { task_ids } => {
                task_ids.push(task_id);
                task_ids.clone()
            }
            GateKind::PhaseReview => return,
        };

        self.bus.emit(
            EventType::ApprovalRequired,
            snapshot.session_id,
            json!({ "phase": phase, "reason": "task_failure", "task_ids": task_ids }),
        );
    }

    /// Fail every unfinished task that depends on one of `failed`.
    fn accept_failures(&self, snapshot: &mut WorkflowSnapshot, failed: &[TaskId]) {
        let session_id = snapshot.session_id;
        let roots: Vec<TaskId> = failed
            .iter()
            .copied()
            .filter(|id| {
                snapshot
                    .task(id)
                    .is_some_and(|t| t.status == TaskStatus::Failed)
            })
            .collect();

        let dependents = match TaskGraph::build(snapshot.tasks.values()) {
            Ok(graph) => graph.transitive_dependents(&roots),
            Err(e) => {
                tracing::error!(%session_id, error = %e, "task graph invalid");
                return;
            }
        };

        for id in dependents {
            let Some(task) = snapshot.task_mut(&id) else {
                continue;
            };
            if task.is_finished() {
                continue;
            }
            task.fail("dependency failed");
            self.bus.emit(
                EventType::TaskFailed,
                session_id,
                json!({ "task_id": id, "phase": task.phase, "error": "dependency failed" }),
            );
        }
        snapshot.touch();
        tracing::info!(%session_id, accepted = roots.len(), "task failures accepted");
    }

    /// Complete the current phase once all its tasks are terminal.
    fn evaluate_phase(&self, snapshot: &mut WorkflowSnapshot) {
        if snapshot.status != WorkflowStatus::InProgress || snapshot.awaiting_approval() {
            return;
        }
        let phase = snapshot.current_phase;
        if !snapshot.phase_tasks_terminal(phase) {
            return;
        }

        if self.config.requires_approval(phase) {
            snapshot.complete_current_phase();
            snapshot.pending_approval = Some(ApprovalGate::new(phase, GateKind::PhaseReview));
            self.bus.emit(
                EventType::ApprovalRequired,
                snapshot.session_id,
                json!({ "phase": phase, "reason": "phase_review" }),
            );
            tracing::info!(session_id = %snapshot.session_id, %phase, "phase awaiting approval");
            return;
        }

        self.advance_or_fail(snapshot);
    }

    fn advance_or_fail(&self, snapshot: &mut WorkflowSnapshot) {
        if let Err(e) = self.advance(snapshot) {
            self.fail_workflow(snapshot, &e.to_string());
        }
    }

    /// Enter the next phase and generate its tasks, or finish the workflow.
    fn advance(&self, snapshot: &mut WorkflowSnapshot) -> Result<()> {
        let session_id = snapshot.session_id;
        let from = snapshot.current_phase;

        let Some(to) = from.next() else {
            snapshot.complete_current_phase();
            snapshot.status = WorkflowStatus::Completed;
            snapshot.touch();
            self.bus.emit(
                EventType::WorkflowCompleted,
                session_id,
                json!({
                    "case_name": snapshot.case_name,
                    "tasks": snapshot.tasks.len(),
                    "failed": snapshot.failed_tasks().len(),
                }),
            );
            tracing::info!(%session_id, "workflow completed");
            return Ok(());
        };

        snapshot.transition(to)?;
        let batch = self.planner.plan(to, snapshot);
        let task_ids = snapshot.insert_batch(to, batch)?;

        self.bus.emit(
            EventType::PhaseTransition,
            session_id,
            json!({ "from": from, "to": to, "tasks": task_ids.len() }),
        );
        tracing::info!(%session_id, %from, %to, tasks = task_ids.len(), "phase transition");
        Ok(())
    }

    fn fail_workflow(&self, snapshot: &mut WorkflowSnapshot, error: &str) {
        snapshot.fail(error);
        self.bus.emit(
            EventType::WorkflowFailed,
            snapshot.session_id,
            json!({ "error": error, "phase": snapshot.current_phase }),
        );
        tracing::error!(session_id = %snapshot.session_id, error, "workflow failed");
    }

    async fn save_with_retry(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let policy = self.persistence;
        let mut attempt = 0;
        loop {
            match self.store.save(snapshot).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= policy.max_retries => {
                    return Err(Error::Persistence(format!(
                        "save failed after {} retries: {}",
                        policy.max_retries, e
                    )));
                }
                Err(e) => {
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        session_id = %snapshot.session_id,
                        attempt = attempt + 1,
                        ?delay,
                        error = %e,
                        "save failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Save the snapshot, failing the workflow if the store stays unavailable.
    ///
    /// Returns false when the save was abandoned.
    async fn persist(&self, snapshot: &mut WorkflowSnapshot) -> bool {
        match self.save_with_retry(snapshot).await {
            Ok(()) => true,
            Err(e) => {
                self.fail_workflow(snapshot, &e.to_string());
                false
            }
        }
    }
}
