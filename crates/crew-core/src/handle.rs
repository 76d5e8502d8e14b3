//! Worker handles

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::control::ControlBlock;
use crate::diag::WorkerSnapshot;
use crate::event::WorkerId;

/// Cloneable reference to one spawned worker
///
/// A handle observes and steers its worker; it never owns the execution.
/// All clones refer to the same worker, and dropping every handle changes
/// nothing: the pool keeps the worker registered until it finalizes.
#[derive(Clone)]
pub struct WorkerHandle {
    control: Arc<ControlBlock>,
}

impl WorkerHandle {
    pub(crate) fn new(control: Arc<ControlBlock>) -> Self {
        Self { control }
    }

    /// Worker id
    pub fn id(&self) -> WorkerId {
        self.control.id()
    }

    /// Worker name, pool defaults applied
    pub fn name(&self) -> &str {
        &self.control.config().name
    }

    /// Whether the worker is currently running
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Whether the worker was forcibly destroyed
    pub fn is_destroyed(&self) -> bool {
        self.control.is_destroyed()
    }

    /// Block until the worker finalizes; returns immediately when it
    /// already has.
    ///
    /// The completion latch stays set forever, so a worker finalizing
    /// between the running check and the block still wakes this call.
    pub fn wait(&self) {
        if !self.is_running() {
            return;
        }
        self.control.completion().wait();
    }

    /// Block until the worker finalizes or `timeout` elapses; `true` when
    /// the worker is finalized on return
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.is_running() {
            return true;
        }
        if self.control.completion().wait_timeout(timeout) {
            return true;
        }
        // The worker may have begun finalizing right as the wait gave up.
        !self.is_running()
    }

    /// Point-in-time snapshot of the worker
    pub fn diag(&self) -> WorkerSnapshot {
        let kernel = self.control.kernel();
        self.control.snapshot(kernel.now(), kernel.tick_period())
    }

    /// Forcibly terminate the worker.
    ///
    /// Exactly one terminal transition happens however many callers race;
    /// destroying an already-finalized worker is a successful no-op.
    /// Returns `false` when the request is refused: a worker calling
    /// destroy on itself, or the owning pool already gone.
    pub fn destroy(&self) -> bool {
        match self.control.pool().upgrade() {
            Some(pool) => pool.destroy_worker(&self.control),
            None => false,
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id())
            .field("running", &self.is_running())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
