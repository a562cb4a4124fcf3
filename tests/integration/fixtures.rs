//! Test fixtures for integration tests.
//!
//! Provides scripted workers that stand in for the document, research and
//! drafting services, a store that can be made to fail on demand, and a
//! harness that wires an orchestrator with a worker for every capability.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use maestro::config::EngineConfig;
use maestro::core::task::{Capability, Task, TaskId};
use maestro::orchestration::{
    CapabilityDescriptor, Event, EventType, Orchestrator, TaskContext, TaskOutput, Worker,
    WorkerError, WorkerFactory,
};
use maestro::store::{MemoryStore, StateStore};
use maestro::workflow::{SessionId, StatusView, WorkflowSnapshot, WorkflowStatus};
use maestro::{Error, Result};

/// Polling budget for `Harness::wait_for`.
const WAIT_ATTEMPTS: usize = 1000;
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Engine settings for fast, deterministic test runs.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_tick_interval(Duration::from_millis(5))
        .with_approval_phases(vec![])
        .with_persist_retries(3, Duration::from_millis(1))
}

/// Result of one scripted call.
pub type Outcome = std::result::Result<TaskOutput, WorkerError>;

/// Behaviour of a scripted worker for one call.
///
/// Receives the task, its context, and the 1-based attempt number for that
/// task on this worker type.
pub type Script = Arc<dyn Fn(&Task, &TaskContext, usize) -> Outcome + Send + Sync>;

/// Succeed with the task description as output.
pub fn succeed() -> impl Fn(&Task, &TaskContext, usize) -> Outcome + Send + Sync + 'static {
    |task: &Task, _: &TaskContext, _: usize| -> Outcome {
        Ok(TaskOutput::new(serde_json::json!({ "done": task.description })))
    }
}

/// Fail every attempt with `error`.
pub fn fail_always(
    error: WorkerError,
) -> impl Fn(&Task, &TaskContext, usize) -> Outcome + Send + Sync + 'static {
    move |_: &Task, _: &TaskContext, _: usize| -> Outcome { Err(error.clone()) }
}

/// Fail the first `n` attempts of each task with `error`, then succeed.
pub fn fail_first(
    n: usize,
    error: WorkerError,
) -> impl Fn(&Task, &TaskContext, usize) -> Outcome + Send + Sync + 'static {
    move |task: &Task, _: &TaskContext, attempt: usize| -> Outcome {
        if attempt <= n {
            Err(error.clone())
        } else {
            Ok(TaskOutput::new(serde_json::json!({ "done": task.description })))
        }
    }
}

/// Counters shared by every instance of one scripted worker type.
#[derive(Default)]
pub struct Probe {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    instances: AtomicUsize,
    cleanups: AtomicUsize,
    attempts: Mutex<HashMap<TaskId, usize>>,
}

impl Probe {
    /// Total `execute` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous `execute` calls observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Instances created by the factory.
    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, task_id: TaskId) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(&task_id)
            .copied()
            .unwrap_or(0)
    }

    fn begin(&self, task_id: TaskId) -> (usize, ActiveGuard<'_>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts.entry(task_id).or_insert(0);
        *attempt += 1;
        (*attempt, ActiveGuard(self))
    }
}

struct ActiveGuard<'a>(&'a Probe);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock worker driven by a [`Script`].
pub struct ScriptedWorker {
    script: Script,
    probe: Arc<Probe>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn execute(
        &self,
        task: &Task,
        context: &TaskContext,
    ) -> Outcome {
        let (attempt, _active) = self.probe.begin(task.id);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(task, context, attempt)
    }

    async fn cleanup(&self) {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Declaration of one scripted worker type covering a single capability.
pub struct WorkerSpec {
    capability: Capability,
    limit: usize,
    script: Script,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

impl WorkerSpec {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            limit: 2,
            script: Arc::new(succeed()),
            delay: Duration::ZERO,
            gate: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn script<F>(mut self, script: F) -> Self
    where
        F: Fn(&Task, &TaskContext, usize) -> Outcome + Send + Sync + 'static,
    {
        self.script = Arc::new(script);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block each call until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

/// Builder for [`Harness`].
pub struct HarnessBuilder {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    specs: Vec<WorkerSpec>,
    unregistered: Vec<Capability>,
}

impl HarnessBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn worker(mut self, spec: WorkerSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Leave `capability` without any worker.
    pub fn unregistered(mut self, capability: Capability) -> Self {
        self.unregistered.push(capability);
        self
    }

    pub fn build(mut self) -> Harness {
        let orchestrator = Orchestrator::new(self.config, Arc::clone(&self.store));
        let mut probes = HashMap::new();

        for capability in Capability::ALL {
            if self.unregistered.contains(&capability) {
                continue;
            }
            let spec = match self.specs.iter().position(|s| s.capability == capability) {
                Some(index) => self.specs.swap_remove(index),
                None => WorkerSpec::new(capability),
            };

            let probe = Arc::new(Probe::default());
            let factory_probe = Arc::clone(&probe);
            let factory: WorkerFactory = Arc::new(move || {
                factory_probe.instances.fetch_add(1, Ordering::SeqCst);
                Arc::new(ScriptedWorker {
                    script: Arc::clone(&spec.script),
                    probe: Arc::clone(&factory_probe),
                    delay: spec.delay,
                    gate: spec.gate.clone(),
                }) as Arc<dyn Worker>
            });

            orchestrator
                .register_worker(
                    CapabilityDescriptor::new(capability.as_str(), [capability], spec.limit),
                    factory,
                )
                .unwrap();
            probes.insert(capability, probe);
        }

        Harness {
            orchestrator,
            store: self.store,
            probes,
        }
    }
}

/// An orchestrator with one scripted worker type per capability.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn StateStore>,
    probes: HashMap<Capability, Arc<Probe>>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: fast_config(),
            store: Arc::new(MemoryStore::new()),
            specs: Vec::new(),
            unregistered: Vec::new(),
        }
    }

    /// Harness with default settings and succeeding workers.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn probe(&self, capability: Capability) -> &Arc<Probe> {
        &self.probes[&capability]
    }

    pub async fn start(&self, items: &[&str]) -> SessionId {
        self.start_with(items, Map::new()).await
    }

    pub async fn start_with(&self, items: &[&str], context: Map<String, Value>) -> SessionId {
        self.orchestrator
            .start_workflow(
                "Doe v. Acme",
                items.iter().map(|s| s.to_string()).collect(),
                context,
            )
            .await
            .unwrap()
    }

    /// The last persisted snapshot of a session.
    pub async fn snapshot(&self, session_id: SessionId) -> WorkflowSnapshot {
        self.store.load(session_id).await.unwrap().unwrap()
    }

    pub async fn status(&self, session_id: SessionId) -> StatusView {
        self.orchestrator.get_status(session_id).await.unwrap()
    }

    /// Events of one type emitted for a session, oldest first.
    pub fn events(&self, session_id: SessionId, event_type: EventType) -> Vec<Event> {
        self.orchestrator
            .events()
            .session_history(session_id, usize::MAX)
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Poll the session status until `pred` holds.
    pub async fn wait_for<F>(&self, session_id: SessionId, pred: F) -> StatusView
    where
        F: Fn(&StatusView) -> bool,
    {
        let mut last = None;
        for _ in 0..WAIT_ATTEMPTS {
            let view = self.status(session_id).await;
            if pred(&view) {
                return view;
            }
            last = Some(view);
            tokio::time::sleep(WAIT_STEP).await;
        }
        panic!("condition never held; last status: {:#?}", last);
    }

    pub async fn wait_for_status(&self, session_id: SessionId, status: WorkflowStatus) -> StatusView {
        self.wait_for(session_id, |v| v.status == status).await
    }

    /// Wait until the session is blocked on an approval gate.
    pub async fn wait_for_gate(&self, session_id: SessionId) -> StatusView {
        self.wait_for(session_id, |v| v.pending_approval.is_some()).await
    }
}

/// Store that fails saves on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` saves.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every save until switched off.
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Saves rejected so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.fail_all.load(Ordering::SeqCst)
            || self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        if self.should_fail() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Io(std::io::Error::other("disk unavailable")));
        }
        self.inner.save(snapshot).await
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<WorkflowSnapshot>> {
        self.inner.load(session_id).await
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool> {
        self.inner.delete(session_id).await
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        self.inner.list().await
    }
}
