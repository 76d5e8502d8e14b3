//! Lifecycle events and notification sinks

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SpawnError;

/// Pool-unique worker identifier
///
/// Minted at spawn from the same counter that auto-names workers, so the
/// worker named `worker-7` always carries id 7.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Wrap a numeric id
    pub fn from_u64(id: u64) -> Self {
        WorkerId(id)
    }

    /// Get the numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle notification
///
/// Per worker the sink observes `Created`, then `Started`, then exactly one
/// of `Completed` or `Destroyed`. No ordering holds between different
/// workers' events.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Registered and its context created; not necessarily entered yet
    Created,
    /// The context entered the user callback
    Started,
    /// The callback returned and the worker finalized naturally
    Completed,
    /// The worker was forcibly terminated
    Destroyed,
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerEvent::Created => "created",
            WorkerEvent::Started => "started",
            WorkerEvent::Completed => "completed",
            WorkerEvent::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Event sink callback
pub type EventFn = Arc<dyn Fn(WorkerId, WorkerEvent) + Send + Sync>;

/// Error sink callback
pub type ErrorFn = Arc<dyn Fn(&SpawnError) + Send + Sync>;

/// Single-slot callback holder
///
/// Registration replaces the previous callback. Invocation clones the slot
/// under the lock and calls outside it, so a callback can itself be replaced
/// mid-invocation without deadlock.
pub(crate) struct SinkSlot<T: Clone> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> SinkSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn replace(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    pub(crate) fn snapshot(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}
