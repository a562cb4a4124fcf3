//! In-process event bus.
//!
//! Every component announces state changes through the `EventBus`. Events
//! are appended to a bounded history (oldest evicted first) and delivered
//! synchronously to the subscribers registered for their type, in
//! subscription order. Async observers such as a reconnecting UI can use
//! [`EventBus::watch`] for a broadcast stream and [`EventBus::history`] to
//! replay what they missed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::config::DEFAULT_HISTORY_CAPACITY;
use crate::workflow::SessionId;

/// Named events emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    PhaseTransition,
    TaskStarted,
    TaskCompleted,
    TaskRetrying,
    TaskFailed,
    ApprovalRequired,
    PhaseApproved,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow_started",
            EventType::PhaseTransition => "phase_transition",
            EventType::TaskStarted => "task_started",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskRetrying => "task_retrying",
            EventType::TaskFailed => "task_failed",
            EventType::ApprovalRequired => "approval_required",
            EventType::PhaseApproved => "phase_approved",
            EventType::WorkflowPaused => "workflow_paused",
            EventType::WorkflowResumed => "workflow_resumed",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowFailed => "workflow_failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable record of something that happened in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub session_id: SessionId,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, session_id: SessionId, data: Value) -> Self {
        Self {
            event_type,
            session_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Error returned by a failing subscriber.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronous event callback.
pub type Handler = Arc<dyn Fn(&Event) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    event_type: EventType,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    history: VecDeque<Event>,
    subscribers: Vec<Subscription>,
    next_id: u64,
}

/// Publish/subscribe hub with bounded history.
pub struct EventBus {
    state: Mutex<BusState>,
    capacity: usize,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus retaining at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(BusState::default()),
            capacity,
            tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an event and deliver it to subscribers of its type.
    ///
    /// Subscriber errors and panics are logged and swallowed; they never
    /// reach the caller or stop delivery to later subscribers.
    pub fn emit(&self, event_type: EventType, session_id: SessionId, data: Value) -> Event {
        let event = Event::new(event_type, session_id, data);

        let handlers: Vec<(SubscriptionId, Handler)> = {
            let mut state = self.lock();
            state.history.push_back(event.clone());
            while state.history.len() > self.capacity {
                state.history.pop_front();
            }
            state
                .subscribers
                .iter()
                .filter(|s| s.event_type == event_type)
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        tracing::trace!(
            event = %event_type,
            session = %session_id.short(),
            subscribers = handlers.len(),
            "emit"
        );

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event = %event_type, subscription = id.0, error = %e, "event subscriber failed");
                }
                Err(_) => {
                    tracing::warn!(event = %event_type, subscription = id.0, "event subscriber panicked");
                }
            }
        }

        // No receivers is not an error; history is the source of truth.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Register `handler` for `event_type`.
    ///
    /// Subscribing the same handler (same `Arc`) to the same type again
    /// returns the existing subscription.
    pub fn subscribe(&self, event_type: EventType, handler: Handler) -> SubscriptionId {
        let mut state = self.lock();
        let existing = state.subscribers.iter().find(|s| {
            s.event_type == event_type
                && Arc::as_ptr(&s.handler) as *const () == Arc::as_ptr(&handler) as *const ()
        });
        if let Some(sub) = existing {
            return sub.id;
        }

        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscribers.push(Subscription {
            id,
            event_type,
            handler,
        });
        id
    }

    /// Convenience wrapper around [`EventBus::subscribe`] for closures.
    pub fn subscribe_fn<F>(&self, event_type: EventType, f: F) -> SubscriptionId
    where
        F: Fn(&Event) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(event_type, Arc::new(f))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| s.event_type == event_type)
            .count()
    }

    /// The most recent `limit` events, optionally filtered by type, oldest first.
    pub fn history(&self, event_type: Option<EventType>, limit: usize) -> Vec<Event> {
        let state = self.lock();
        let mut events: Vec<Event> = state
            .history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    /// The most recent `limit` events of one session, oldest first.
    pub fn session_history(&self, session_id: SessionId, limit: usize) -> Vec<Event> {
        let state = self.lock();
        let mut events: Vec<Event> = state
            .history
            .iter()
            .rev()
            .filter(|e| e.session_id == session_id)
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Stream of every event emitted after this call.
    pub fn watch(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
