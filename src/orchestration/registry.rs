//! Capability registry and worker instance pool.
//!
//! The `CapabilityRegistry` maps capabilities to worker descriptors and
//! manages the live instances created from each descriptor's factory. It
//! enforces the per-descriptor instance limit, including while instances are
//! still initializing, and never rejects an acquire for a covered capability:
//! once the limit is reached, work is multiplexed onto existing instances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;

use crate::core::task::{Capability, TaskId};
use crate::error::{Error, Result};

use super::worker::{Worker, WorkerFactory};

/// Identifier of a live worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A registered worker type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Worker type name, unique within a registry.
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    /// Upper bound on live instances of this worker type.
    pub max_instances: usize,
}

impl CapabilityDescriptor {
    pub fn new(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        max_instances: usize,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            max_instances,
        }
    }

    pub fn covers(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Exclusive-use token for a worker instance.
///
/// Hand it back with [`CapabilityRegistry::release`] when the task is done.
#[derive(Clone)]
pub struct WorkerLease {
    pub instance: InstanceId,
    pub worker_name: String,
    pub task_id: TaskId,
    worker: Arc<dyn Worker>,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("instance", &self.instance)
            .field("worker_name", &self.worker_name)
            .field("task_id", &self.task_id)
            .finish()
    }
}

/// Point-in-time view of one descriptor's instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub limit: usize,
    pub live: usize,
    pub busy: usize,
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub workers: Vec<WorkerStatus>,
}

impl RegistryStatus {
    pub fn total_live(&self) -> usize {
        self.workers.iter().map(|w| w.live).sum()
    }

    pub fn total_busy(&self) -> usize {
        self.workers.iter().map(|w| w.busy).sum()
    }
}

struct Instance {
    id: InstanceId,
    worker: Arc<dyn Worker>,
    active: usize,
    current_task: Option<TaskId>,
    usage_count: u64,
    last_used: Instant,
}

impl Instance {
    fn is_idle(&self) -> bool {
        self.active == 0
    }

    fn lease(&mut self, name: &str, task_id: TaskId) -> WorkerLease {
        self.active += 1;
        self.usage_count += 1;
        self.current_task = Some(task_id);
        self.last_used = Instant::now();
        WorkerLease {
            instance: self.id,
            worker_name: name.to_string(),
            task_id,
            worker: Arc::clone(&self.worker),
        }
    }
}

struct Entry {
    descriptor: CapabilityDescriptor,
    factory: WorkerFactory,
    instances: Vec<Instance>,
    /// Slots held by instances that are still initializing.
    reserved: usize,
}

impl Entry {
    fn occupied(&self) -> usize {
        self.instances.len() + self.reserved
    }

    fn free_slots(&self) -> usize {
        self.descriptor.max_instances.saturating_sub(self.occupied())
    }

    fn idle(&self) -> usize {
        self.instances.iter().filter(|i| i.is_idle()).count()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Entry>,
    next_instance: u64,
}

enum Plan {
    Spawn {
        entry: usize,
        id: InstanceId,
        worker: Arc<dyn Worker>,
    },
    Reuse(WorkerLease),
    Wait,
}

/// Registry of worker types and their live instances.
#[derive(Default)]
pub struct CapabilityRegistry {
    state: Mutex<RegistryState>,
    /// Signalled whenever a slot settles or an instance goes away.
    changed: Notify,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a worker type.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty name, an empty capability
    /// set, a zero instance limit, or a name that is already registered.
    pub fn register(&self, descriptor: CapabilityDescriptor, factory: WorkerFactory) -> Result<()> {
        if descriptor.name.trim().is_empty() {
            return Err(Error::Validation("worker name is empty".to_string()));
        }
        if descriptor.capabilities.is_empty() {
            return Err(Error::Validation(format!(
                "worker {} declares no capabilities",
                descriptor.name
            )));
        }
        if descriptor.max_instances == 0 {
            return Err(Error::Validation(format!(
                "worker {} has an instance limit of zero",
                descriptor.name
            )));
        }

        let mut state = self.lock();
        if state
            .entries
            .iter()
            .any(|e| e.descriptor.name == descriptor.name)
        {
            return Err(Error::Validation(format!(
                "worker {} is already registered",
                descriptor.name
            )));
        }

        tracing::info!(
            worker = %descriptor.name,
            capabilities = ?descriptor.capabilities,
            limit = descriptor.max_instances,
            "worker registered"
        );
        state.entries.push(Entry {
            descriptor,
            factory,
            instances: Vec::new(),
            reserved: 0,
        });
        Ok(())
    }

    /// Obtain a worker instance for `capability`.
    ///
    /// Below the instance limit a new instance is created and initialized.
    /// At the limit the least recently used idle instance is reused, or if
    /// every instance is busy, the one with the lowest cumulative usage.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityUnavailable` if no registered worker covers the
    /// capability, or `TaskExecution` if a new instance fails to initialize.
    pub async fn acquire(&self, capability: Capability, task_id: TaskId) -> Result<WorkerLease> {
        loop {
            let notified = self.changed.notified();
            let plan = self.plan(capability, task_id)?;

            match plan {
                Plan::Reuse(lease) => {
                    tracing::debug!(instance = %lease.instance, task_id = %task_id, "reusing worker");
                    return Ok(lease);
                }
                Plan::Wait => {
                    tracing::trace!(%capability, "all slots initializing, waiting");
                    notified.await;
                }
                Plan::Spawn { entry, id, worker } => {
                    let init = worker.initialize().await;

                    let mut state = self.lock();
                    let Some(slot) = state.entries.get_mut(entry) else {
                        return Err(Error::CapabilityUnavailable(capability));
                    };
                    slot.reserved = slot.reserved.saturating_sub(1);

                    let result = match init {
                        Ok(()) => {
                            let name = slot.descriptor.name.clone();
                            let mut instance = Instance {
                                id,
                                worker,
                                active: 0,
                                current_task: None,
                                usage_count: 0,
                                last_used: Instant::now(),
                            };
                            let lease = instance.lease(&name, task_id);
                            slot.instances.push(instance);
                            tracing::debug!(instance = %id, worker = %name, task_id = %task_id, "worker instance created");
                            Ok(lease)
                        }
                        Err(e) => {
                            tracing::warn!(instance = %id, error = %e, "worker initialization failed");
                            Err(Error::TaskExecution {
                                task_id,
                                message: e.to_string(),
                            })
                        }
                    };
                    drop(state);
                    self.changed.notify_waiters();
                    return result;
                }
            }
        }
    }

    fn plan(&self, capability: Capability, task_id: TaskId) -> Result<Plan> {
        let mut state = self.lock();
        let covering: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.descriptor.covers(capability))
            .map(|(i, _)| i)
            .collect();
        if covering.is_empty() {
            return Err(Error::CapabilityUnavailable(capability));
        }

        if let Some(&index) = covering.iter().find(|&&i| state.entries[i].free_slots() > 0) {
            let id = InstanceId(state.next_instance);
            state.next_instance += 1;
            let entry = &mut state.entries[index];
            entry.reserved += 1;
            let worker = (entry.factory)();
            return Ok(Plan::Spawn {
                entry: index,
                id,
                worker,
            });
        }

        // (entry, instance) positions of every live candidate.
        let candidates: Vec<(usize, usize)> = covering
            .iter()
            .flat_map(|&e| (0..state.entries[e].instances.len()).map(move |i| (e, i)))
            .collect();

        let idle = candidates
            .iter()
            .filter(|(e, i)| state.entries[*e].instances[*i].is_idle())
            .min_by_key(|(e, i)| state.entries[*e].instances[*i].last_used)
            .copied();
        let chosen = idle.or_else(|| {
            candidates
                .iter()
                .min_by_key(|(e, i)| {
                    let inst = &state.entries[*e].instances[*i];
                    (inst.usage_count, inst.id)
                })
                .copied()
        });

        match chosen {
            Some((e, i)) => {
                let entry = &mut state.entries[e];
                let name = entry.descriptor.name.clone();
                Ok(Plan::Reuse(entry.instances[i].lease(&name, task_id)))
            }
            None => Ok(Plan::Wait),
        }
    }

    /// Return a lease. Leases for evicted instances are ignored.
    pub fn release(&self, lease: WorkerLease) {
        let mut state = self.lock();
        let instance = state
            .entries
            .iter_mut()
            .flat_map(|e| e.instances.iter_mut())
            .find(|i| i.id == lease.instance);

        if let Some(instance) = instance {
            instance.active = instance.active.saturating_sub(1);
            if instance.is_idle() {
                instance.current_task = None;
            }
            instance.last_used = Instant::now();
        }
    }

    /// Number of tasks for `capability` that can start without queueing
    /// behind a busy instance: unspawned slots plus idle instances.
    ///
    /// `None` means no registered worker covers the capability.
    pub fn capacity(&self, capability: Capability) -> Option<usize> {
        let state = self.lock();
        let mut covered = false;
        let mut free = 0;
        for entry in state
            .entries
            .iter()
            .filter(|e| e.descriptor.covers(capability))
        {
            covered = true;
            free += entry.free_slots() + entry.idle();
        }
        covered.then_some(free)
    }

    pub fn status(&self) -> RegistryStatus {
        let state = self.lock();
        RegistryStatus {
            workers: state
                .entries
                .iter()
                .map(|e| WorkerStatus {
                    name: e.descriptor.name.clone(),
                    capabilities: e.descriptor.capabilities.clone(),
                    limit: e.descriptor.max_instances,
                    live: e.instances.len(),
                    busy: e.instances.iter().filter(|i| !i.is_idle()).count(),
                })
                .collect(),
        }
    }

    /// Remove an instance and clean it up. Returns false if it was not live.
    pub async fn evict(&self, id: InstanceId) -> bool {
        let removed = {
            let mut state = self.lock();
            state.entries.iter_mut().find_map(|e| {
                let pos = e.instances.iter().position(|i| i.id == id)?;
                Some(e.instances.remove(pos))
            })
        };

        let Some(instance) = removed else {
            return false;
        };
        tracing::warn!(instance = %id, task_id = ?instance.current_task, "evicting worker instance");
        instance.worker.cleanup().await;
        self.changed.notify_waiters();
        true
    }

    /// Probe every idle instance and evict those that report unhealthy.
    ///
    /// Returns the evicted instance ids.
    pub async fn health_check(&self) -> Vec<InstanceId> {
        let idle: Vec<(InstanceId, Arc<dyn Worker>)> = {
            let state = self.lock();
            state
                .entries
                .iter()
                .flat_map(|e| e.instances.iter())
                .filter(|i| i.is_idle())
                .map(|i| (i.id, Arc::clone(&i.worker)))
                .collect()
        };

        let mut evicted = Vec::new();
        for (id, worker) in idle {
            if !worker.health_check().await && self.evict(id).await {
                evicted.push(id);
            }
        }
        evicted
    }

    /// Clean up and drop every live instance. Registrations are kept.
    pub async fn shutdown(&self) {
        let drained: Vec<Instance> = {
            let mut state = self.lock();
            state
                .entries
                .iter_mut()
                .flat_map(|e| e.instances.drain(..))
                .collect()
        };

        tracing::info!(instances = drained.len(), "shutting down worker instances");
        for instance in drained {
            instance.worker.cleanup().await;
        }
        self.changed.notify_waiters();
    }
}
