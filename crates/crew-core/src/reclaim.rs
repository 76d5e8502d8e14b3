//! Deferred stack reclamation
//!
//! A terminated context's stack cannot be freed at the moment of
//! termination: the kernel may still be winding the context down on that
//! very memory. Leases are instead handed to a background thread that frees
//! each one only once the kernel reports its context gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::kernel::{ContextId, Kernel};
use crate::memory::{RegionAllocator, StackLease};

/// Re-test period for contexts that still hold leases; the kernel gives no
/// death notification, so liveness is polled
const LIVENESS_POLL: Duration = Duration::from_millis(10);

/// A lease waiting for its context to die
struct PendingLease {
    /// The stack memory to return
    lease: StackLease,

    /// Context that ran on the lease; `None` when no context ever entered it
    context: Option<ContextId>,
}

/// Reclaimer state
struct ReclaimState {
    /// Leases not yet safe to free
    pending: Vec<PendingLease>,
}

/// Background thread returning stack leases to their regions
pub(crate) struct StackReclaimer {
    /// Internal state protected by mutex
    state: Mutex<ReclaimState>,

    /// Condvar to wake the thread when a lease arrives or shutdown is set
    notify: Condvar,

    /// Shutdown signal
    shutdown: AtomicBool,

    /// Thread handle
    handle: Mutex<Option<JoinHandle<()>>>,

    /// Kernel consulted for context liveness
    kernel: Arc<dyn Kernel>,

    /// Allocator the leases go back to
    memory: Arc<dyn RegionAllocator>,
}

impl StackReclaimer {
    /// Create a reclaimer; [`start`](Self::start) runs the thread
    pub(crate) fn new(kernel: Arc<dyn Kernel>, memory: Arc<dyn RegionAllocator>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReclaimState {
                pending: Vec::new(),
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
            kernel,
            memory,
        })
    }

    /// Start the reclaim thread
    pub(crate) fn start(self: &Arc<Self>) {
        let reclaimer = Arc::clone(self);

        let handle = thread::Builder::new()
            .name("crew-reclaim".to_string())
            .spawn(move || {
                reclaimer.run_loop();
            })
            .expect("Failed to spawn reclaim thread");

        *self.handle.lock() = Some(handle);
    }

    /// Stop the reclaim thread, then free everything already freeable
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();

        if let Some(handle) = self.handle.lock().take() {
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    break;
                }
                if start.elapsed() > timeout {
                    drop(handle);
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        self.sweep_and_free();
    }

    /// Hand over a lease for eventual release.
    ///
    /// `context` is the context that ran on the lease, `None` when none ever
    /// entered it. After shutdown there is no thread left: a lease whose
    /// context is already dead is freed inline, one still live stays pending
    /// until the final sweep at drop.
    pub(crate) fn schedule(&self, lease: StackLease, context: Option<ContextId>) {
        if self.shutdown.load(Ordering::Acquire) {
            let gone = context.map_or(true, |ctx| !self.kernel.is_live(ctx));
            if gone {
                // SAFETY: the context (if any) is dead; nothing runs on the
                // leased memory any more.
                unsafe { self.memory.release(lease) };
                return;
            }
        }

        let mut state = self.state.lock();
        state.pending.push(PendingLease { lease, context });
        self.notify.notify_one();
    }

    /// Reclaim thread main loop
    fn run_loop(&self) {
        loop {
            // Check shutdown
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let mut state = self.state.lock();

            // Re-check shutdown after acquiring the lock: stop() may set
            // shutdown + notify between the first check and the lock, and
            // that notification would be lost.
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Pull out every lease whose context is gone
            let mut freeable = Vec::new();
            let mut i = 0;
            while i < state.pending.len() {
                let gone = state.pending[i]
                    .context
                    .map_or(true, |ctx| !self.kernel.is_live(ctx));
                if gone {
                    freeable.push(state.pending.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            if freeable.is_empty() {
                if state.pending.is_empty() {
                    // Nothing to watch, wait for new leases
                    self.notify.wait(&mut state);
                } else {
                    self.notify.wait_for(&mut state, LIVENESS_POLL);
                }
                continue;
            }

            drop(state);
            for entry in freeable {
                // SAFETY: the kernel reported the context gone, or none ever
                // ran; no execution context touches the lease any more.
                unsafe { self.memory.release(entry.lease) };
            }
        }

        #[cfg(debug_assertions)]
        eprintln!("Reclaim thread shutting down");
    }

    /// Free pending leases whose context has died; runs with no thread left
    fn sweep_and_free(&self) {
        let mut state = self.state.lock();
        let mut i = 0;
        while i < state.pending.len() {
            let gone = state.pending[i]
                .context
                .map_or(true, |ctx| !self.kernel.is_live(ctx));
            if gone {
                let entry = state.pending.swap_remove(i);
                // SAFETY: same as in the run loop.
                unsafe { self.memory.release(entry.lease) };
            } else {
                i += 1;
            }
        }
    }

    /// Number of leases not yet released
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl Drop for StackReclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}
