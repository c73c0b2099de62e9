//! Structured events emitted by the tracker after each state change.
//!
//! Each tracker owns a [`Notifier`] with one ordered subscriber list per
//! event class. Subscribers run in registration order after the change they
//! describe has been accepted. Dispatch is fire-and-forget: a panicking
//! subscriber is logged and skipped, and never fails the tracker operation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{Workflow, WorkflowId, WorkflowStep};

/// A structured event emitted by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic per-tracker sequence number.
    pub seq: u64,
    /// When the event was dispatched.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted { workflow: Workflow },
    StepAdded { step: WorkflowStep },
    WorkflowCompleted { id: WorkflowId },
    WorkflowFailed { id: WorkflowId, reason: Option<String> },
}

impl EventKind {
    pub fn class(&self) -> EventClass {
        match self {
            EventKind::WorkflowStarted { .. } => EventClass::WorkflowStarted,
            EventKind::StepAdded { .. } => EventClass::StepAdded,
            EventKind::WorkflowCompleted { .. } => EventClass::WorkflowCompleted,
            EventKind::WorkflowFailed { .. } => EventClass::WorkflowFailed,
        }
    }
}

/// The four subscribable event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    WorkflowStarted,
    StepAdded,
    WorkflowCompleted,
    WorkflowFailed,
}

impl EventClass {
    fn index(self) -> usize {
        match self {
            EventClass::WorkflowStarted => 0,
            EventClass::StepAdded => 1,
            EventClass::WorkflowCompleted => 2,
            EventClass::WorkflowFailed => 3,
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Typed subscriber registries, one list per [`EventClass`].
#[derive(Default)]
pub struct Notifier {
    seq: AtomicU64,
    subscribers: [RwLock<Vec<Subscriber>>; 4],
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one event class. Subscribers are never removed.
    pub fn subscribe<F>(&self, class: EventClass, f: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers[class.index()].write().push(Arc::new(f));
    }

    /// Dispatch an event to every subscriber of its class, in order.
    ///
    /// The list is snapshotted first, so a subscriber may register further
    /// subscribers without deadlocking; those only see later events.
    pub fn notify(&self, kind: EventKind) -> Event {
        let class = kind.class();
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };

        let subscribers: Vec<Subscriber> = self.subscribers[class.index()].read().clone();
        for (position, subscriber) in subscribers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                warn!(
                    event_class = ?class,
                    seq = event.seq,
                    subscriber = position,
                    "event subscriber panicked"
                );
            }
        }
        event
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
