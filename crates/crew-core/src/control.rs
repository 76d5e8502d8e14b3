//! Per-worker control block
//!
//! One `ControlBlock` exists per spawned worker, jointly owned by the pool's
//! active-set, every handle cloned from the spawn, and (weakly) the running
//! context itself. All lifecycle state lives here; the pool and the handles
//! are views over it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::config::ResolvedConfig;
use crate::diag::WorkerSnapshot;
use crate::event::WorkerId;
use crate::kernel::{ContextId, Kernel, Tick};
use crate::memory::StackLease;
use crate::pool::PoolInner;
use crate::reclaim::StackReclaimer;
use crate::signal::Signal;

/// Work a worker executes once on its own context
pub(crate) type WorkerFn = Box<dyn FnOnce() + Send + 'static>;

/// Tick stamp value meaning "not stamped yet"
const TICK_UNSET: u64 = u64::MAX;

/// Shared lifecycle state of one worker
///
/// The three flags are independent: `running` answers "is it executing",
/// `destroyed` answers "was it forced down", and `finalized` is the
/// exactly-once gate that decides which caller gets to tear the worker down.
/// Readers may observe any interleaving of the first two; only `finalized`
/// transitions are raced for.
pub(crate) struct ControlBlock {
    /// Pool-unique worker id
    id: WorkerId,

    /// Owning pool; weak so a pool drop is observable from handles
    pool: Weak<PoolInner>,

    /// Kernel the worker's context was created on
    kernel: Arc<dyn Kernel>,

    /// Reclaimer that takes the stack lease back after finalization
    reclaimer: Arc<StackReclaimer>,

    /// Configuration after pool defaults were applied
    config: ResolvedConfig,

    /// User callback, taken exactly once by the trampoline
    callback: Mutex<Option<WorkerFn>>,

    /// Kernel context handle; cleared at finalization
    context: Mutex<Option<ContextId>>,

    /// Alternate-region stack lease, present only for external-stack workers
    stack: Mutex<Option<StackLease>>,

    /// Tick at which the worker was marked running
    start_tick: AtomicU64,

    /// Tick at which the worker finalized
    end_tick: AtomicU64,

    /// Set when the worker is registered and its context exists, cleared at
    /// finalization
    running: AtomicBool,

    /// Set when finalization was forced rather than natural
    destroyed: AtomicBool,

    /// Exactly-once finalization gate; flipped by compare-and-swap
    finalized: AtomicBool,

    /// Signalled once at finalization; what `wait` blocks on
    completion: Signal,

    /// Opened by the spawner after the `Created` event; the trampoline waits
    /// on it so `Started` can never beat `Created` to the sink
    start_gate: Signal,
}

impl ControlBlock {
    pub(crate) fn new(
        id: WorkerId,
        pool: Weak<PoolInner>,
        kernel: Arc<dyn Kernel>,
        reclaimer: Arc<StackReclaimer>,
        config: ResolvedConfig,
        callback: WorkerFn,
    ) -> Self {
        Self {
            id,
            pool,
            kernel,
            reclaimer,
            config,
            callback: Mutex::new(Some(callback)),
            context: Mutex::new(None),
            stack: Mutex::new(None),
            start_tick: AtomicU64::new(TICK_UNSET),
            end_tick: AtomicU64::new(TICK_UNSET),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            completion: Signal::new(),
            start_gate: Signal::new(),
        }
    }

    /// Worker id
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Owning pool
    pub(crate) fn pool(&self) -> &Weak<PoolInner> {
        &self.pool
    }

    /// Kernel this worker runs on
    pub(crate) fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    /// Resolved configuration
    pub(crate) fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Reclaimer shared with the pool
    pub(crate) fn reclaimer(&self) -> &Arc<StackReclaimer> {
        &self.reclaimer
    }

    /// Take the user callback; `None` on every call after the first
    pub(crate) fn take_callback(&self) -> Option<WorkerFn> {
        self.callback.lock().take()
    }

    /// Attach the kernel context handle
    pub(crate) fn set_context(&self, ctx: ContextId) {
        *self.context.lock() = Some(ctx);
    }

    /// Kernel context handle, if not yet finalized
    pub(crate) fn context(&self) -> Option<ContextId> {
        *self.context.lock()
    }

    /// Attach the stack lease of an external-stack worker
    pub(crate) fn attach_stack(&self, lease: StackLease) {
        *self.stack.lock() = Some(lease);
    }

    /// Take the stack lease out of the block
    pub(crate) fn take_stack(&self) -> Option<StackLease> {
        self.stack.lock().take()
    }

    /// Lock the stack slot; the spawner holds this guard across context
    /// creation so the lease cannot move while the kernel reads it
    pub(crate) fn stack_slot(&self) -> MutexGuard<'_, Option<StackLease>> {
        self.stack.lock()
    }

    /// Flip to running and stamp the start tick
    pub(crate) fn mark_running(&self, now: Tick) {
        self.start_tick.store(now.as_u64(), Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
    }

    /// Whether the worker is currently running
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the worker was forcibly destroyed
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Whether finalization has been claimed
    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Claim the right to finalize. Exactly one caller over the worker's
    /// lifetime gets `true`; everyone else must leave the block alone.
    pub(crate) fn try_finalize(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record the terminal state. Only the `try_finalize` winner may call
    /// this. Returns the context handle for the caller to dispose of.
    pub(crate) fn mark_finalized(&self, forced: bool, now: Tick) -> Option<ContextId> {
        self.destroyed.store(forced, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.end_tick.store(now.as_u64(), Ordering::Relaxed);
        let ctx = self.context.lock().take();
        self.completion.set();
        ctx
    }

    /// Completion latch handles wait on
    pub(crate) fn completion(&self) -> &Signal {
        &self.completion
    }

    /// Gate the trampoline waits on before entering the callback
    pub(crate) fn start_gate(&self) -> &Signal {
        &self.start_gate
    }

    /// Runtime measured in kernel ticks, scaled by `period`
    ///
    /// `None` until the worker has both a start stamp and an end point (the
    /// current tick while running, the end stamp once finalized), or when
    /// the stamps are inconsistent.
    pub(crate) fn runtime(&self, now: Tick, period: Duration) -> Option<Duration> {
        let start = self.start_tick.load(Ordering::Relaxed);
        if start == TICK_UNSET {
            return None;
        }
        let end = if self.is_running() {
            now.as_u64()
        } else {
            self.end_tick.load(Ordering::Relaxed)
        };
        if end == TICK_UNSET {
            return None;
        }
        Tick::from_u64(end)
            .checked_since(Tick::from_u64(start))
            .map(|ticks| period.saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX)))
    }

    /// Point-in-time snapshot for diagnostics
    pub(crate) fn snapshot(&self, now: Tick, period: Duration) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            config: self.config.clone(),
            has_context: self.context.lock().is_some(),
            running: self.is_running(),
            destroyed: self.is_destroyed(),
            runtime: self.runtime(now, period).unwrap_or_default(),
        }
    }
}

impl Drop for ControlBlock {
    fn drop(&mut self) {
        // A block can still own its lease here, either from spawn rollback
        // (no context ever entered) or from a pool dropped over a live
        // worker. The reclaimer must not free it while the context lives.
        if let Some(lease) = self.stack.get_mut().take() {
            let ctx = self.context.get_mut().take();
            self.reclaimer.schedule(lease, ctx);
        }
    }
}
