//! Capacity-bounded worker pool
//!
//! The pool owns the active-set: the one place a worker is registered from
//! spawn until finalization. Spawning resolves configuration, registers the
//! control block, and asks the kernel for a context that enters
//! [`worker_trampoline`]. Finalization runs exactly once per worker no
//! matter how the natural and forced paths race, and is the only thing that
//! removes a worker from the active-set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{PoolConfig, WorkerConfig};
use crate::control::{ControlBlock, WorkerFn};
use crate::diag::PoolDiag;
use crate::error::SpawnError;
use crate::event::{ErrorFn, EventFn, SinkSlot, WorkerEvent, WorkerId};
use crate::handle::WorkerHandle;
use crate::kernel::{ContextSpec, Kernel, StackSpec};
use crate::memory::{HeapRegions, RegionAllocator, StackRegion};
use crate::reclaim::StackReclaimer;

/// Capacity-bounded pool of preemptively scheduled workers
///
/// Every worker runs on its own kernel context. The pool tracks them in a
/// capacity-limited active-set, reports lifecycle transitions through an
/// event sink, and reports every refused operation through an error sink.
/// Cloning the pool clones a reference; all clones share one active-set.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Pool with default configuration, stacks served from the process heap
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self::with_config(kernel, PoolConfig::default())
    }

    /// Pool with explicit configuration
    pub fn with_config(kernel: Arc<dyn Kernel>, config: PoolConfig) -> Self {
        Self::with_config_and_memory(kernel, config, Arc::new(HeapRegions::new()))
    }

    /// Pool with explicit configuration and stack allocator
    pub fn with_config_and_memory(
        kernel: Arc<dyn Kernel>,
        config: PoolConfig,
        memory: Arc<dyn RegionAllocator>,
    ) -> Self {
        let reclaimer = StackReclaimer::new(Arc::clone(&kernel), Arc::clone(&memory));
        reclaimer.start();

        Self {
            inner: Arc::new(PoolInner {
                kernel,
                memory,
                config,
                active: Mutex::new(Vec::new()),
                events: SinkSlot::new(),
                errors: SinkSlot::new(),
                reclaimer,
                next_worker: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn a worker running `callback` on a fresh kernel context.
    ///
    /// On success the worker is already registered, marked running, and its
    /// `Created` event has fired. On failure nothing of the worker remains
    /// and the error has also been pushed through the error sink.
    pub fn spawn(
        &self,
        callback: impl FnOnce() + Send + 'static,
        config: WorkerConfig,
    ) -> Result<WorkerHandle, SpawnError> {
        self.inner.spawn(Box::new(callback), config)
    }

    /// Spawn with the stack placed in the alternate memory region
    ///
    /// Shorthand for [`spawn`](Self::spawn) with `external_stack` forced on.
    pub fn spawn_external(
        &self,
        callback: impl FnOnce() + Send + 'static,
        config: WorkerConfig,
    ) -> Result<WorkerHandle, SpawnError> {
        self.inner.spawn(
            Box::new(callback),
            WorkerConfig {
                external_stack: true,
                ..config
            },
        )
    }

    /// Number of registered workers
    pub fn active_workers(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Prune finalized workers still sitting in the active-set.
    ///
    /// Finalization removes workers eagerly, so this normally finds
    /// nothing; it exists to reclaim capacity when an eager removal lost a
    /// race. Returns how many entries were pruned.
    pub fn cleanup_finished(&self) -> usize {
        let mut active = self.inner.active.lock();
        let before = active.len();
        active.retain(|control| !control.is_finalized());
        before - active.len()
    }

    /// Aggregate diagnostics over the active-set
    pub fn diag(&self) -> PoolDiag {
        self.inner.diag()
    }

    /// Install the lifecycle event sink, replacing any previous one
    ///
    /// The sink is invoked outside all pool locks, on whichever context
    /// drives the transition.
    pub fn on_event(&self, sink: EventFn) {
        self.inner.events.replace(sink);
    }

    /// Install the error sink, replacing any previous one
    pub fn on_error(&self, sink: ErrorFn) {
        self.inner.errors.replace(sink);
    }

    /// Kernel this pool schedules on
    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.inner.kernel
    }
}

/// Shared pool state behind the cloneable [`WorkerPool`] front
pub(crate) struct PoolInner {
    /// Kernel all contexts are created on
    kernel: Arc<dyn Kernel>,

    /// Stack allocator for external-stack workers
    memory: Arc<dyn RegionAllocator>,

    /// Pool-wide settings
    config: PoolConfig,

    /// The active-set; holds the pool's strong ownership of control blocks
    active: Mutex<Vec<Arc<ControlBlock>>>,

    /// Lifecycle event sink
    events: SinkSlot<EventFn>,

    /// Error sink
    errors: SinkSlot<ErrorFn>,

    /// Deferred stack reclamation, shared with every control block
    reclaimer: Arc<StackReclaimer>,

    /// Id source for spawned workers
    next_worker: AtomicU64,
}

impl PoolInner {
    fn spawn(
        self: &Arc<Self>,
        callback: WorkerFn,
        config: WorkerConfig,
    ) -> Result<WorkerHandle, SpawnError> {
        let id = WorkerId::from_u64(self.next_worker.fetch_add(1, Ordering::Relaxed));
        let resolved = self.config.resolve(&config, id);

        // Reject unusable configurations before committing any resource
        if resolved.stack_bytes < self.kernel.min_stack_bytes() {
            return Err(self.report(SpawnError::InvalidConfig(
                "stack size below kernel minimum",
            )));
        }
        let align = self.kernel.stack_align();
        if align > 0 && resolved.stack_bytes % align != 0 {
            return Err(self.report(SpawnError::InvalidConfig(
                "stack size not a multiple of kernel stack alignment",
            )));
        }
        if resolved.external_stack
            && (!self.config.allow_external_stacks
                || !self.memory.available(StackRegion::External))
        {
            return Err(self.report(SpawnError::ExternalStackUnsupported));
        }

        let control = Arc::new(ControlBlock::new(
            id,
            Arc::downgrade(self),
            Arc::clone(&self.kernel),
            Arc::clone(&self.reclaimer),
            resolved,
            callback,
        ));

        // Capacity check and registration are one step under the lock, so
        // two racing spawns cannot both squeeze into the last slot.
        {
            let mut active = self.active.lock();
            if active.len() >= self.config.capacity {
                return Err(self.report(SpawnError::MaxWorkersReached));
            }
            active.push(Arc::clone(&control));
        }

        if control.config().external_stack {
            let lease = self.memory.allocate(
                StackRegion::External,
                control.config().stack_bytes,
                self.kernel.stack_align(),
            );
            match lease {
                Some(lease) => control.attach_stack(lease),
                None => {
                    self.remove_active(&control);
                    return Err(self.report(SpawnError::NoMemory));
                }
            }
        }

        // The context references its block weakly; the raw weak travels
        // through the kernel as the opaque entry argument.
        let arg = Weak::into_raw(Arc::downgrade(&control)) as *mut ();

        let created = {
            // Hold the stack slot locked across create so the lease cannot
            // move while the kernel reads its base and length.
            let stack_guard = control.stack_slot();
            let stack = match stack_guard.as_ref() {
                Some(lease) => StackSpec::Leased(lease),
                None => StackSpec::Kernel {
                    bytes: control.config().stack_bytes,
                },
            };
            self.kernel.create(
                worker_trampoline,
                arg,
                ContextSpec {
                    name: &control.config().name,
                    priority: control.config().priority,
                    affinity: control.config().affinity,
                    stack,
                },
            )
        };

        let ctx = match created {
            Ok(ctx) => ctx,
            Err(err) => {
                #[cfg(debug_assertions)]
                eprintln!("Context creation for {} failed: {}", id, err);

                self.remove_active(&control);
                // The kernel never ran the entry, so the raw weak comes
                // back to us; any stack lease returns via the block drop.
                unsafe { drop(Weak::from_raw(arg as *const ControlBlock)) };
                return Err(self.report(SpawnError::TaskCreateFailed(err)));
            }
        };

        control.set_context(ctx);
        control.mark_running(self.kernel.now());
        self.emit_event(id, WorkerEvent::Created);
        // Only now may the context proceed into the callback; see the gate
        // wait in the trampoline.
        control.start_gate().set();

        Ok(WorkerHandle::new(control))
    }

    /// Forcibly terminate a worker.
    ///
    /// `false` when the request is refused: a worker asking to destroy
    /// itself. Destroying an already-finalized worker is a successful no-op.
    pub(crate) fn destroy_worker(&self, control: &Arc<ControlBlock>) -> bool {
        if !control.is_running() {
            return true;
        }

        // A running flag with no context handle means a finalize took the
        // handle mid-flight; fall through and settle the bookkeeping.
        if let Some(ctx) = control.context() {
            if self.kernel.current() == Some(ctx) {
                // Terminating the calling context would pull this very stack
                // away mid-call. The worker must return or exit instead.
                self.emit_error(&SpawnError::InvalidConfig(
                    "a worker cannot destroy itself",
                ));
                return false;
            }
            self.kernel.terminate(ctx);
        }

        finalize_worker(control, true);
        // Losing the finalize race to a worker this call just cancelled
        // leaves nobody guaranteed to reach the completion signal, so set
        // it here too; a second set is a no-op.
        control.completion().set();
        true
    }

    fn diag(&self) -> PoolDiag {
        let workers: Vec<Arc<ControlBlock>> = self.active.lock().clone();
        let now = self.kernel.now();
        let period = self.kernel.tick_period();

        let mut running = 0usize;
        let mut external = 0usize;
        let mut measured = 0u32;
        let mut total_runtime = Duration::ZERO;
        let mut max_runtime = Duration::ZERO;

        for control in &workers {
            if control.is_running() {
                running += 1;
            }
            if control.config().external_stack {
                external += 1;
            }
            if let Some(runtime) = control.runtime(now, period) {
                measured += 1;
                total_runtime += runtime;
                max_runtime = max_runtime.max(runtime);
            }
        }

        PoolDiag {
            total_workers: workers.len(),
            running_workers: running,
            waiting_workers: workers.len() - running,
            external_stack_workers: external,
            average_runtime: if measured > 0 {
                total_runtime / measured
            } else {
                Duration::ZERO
            },
            max_runtime,
        }
    }

    fn remove_active(&self, control: &Arc<ControlBlock>) {
        let mut active = self.active.lock();
        if let Some(pos) = active.iter().position(|entry| Arc::ptr_eq(entry, control)) {
            active.remove(pos);
        }
    }

    /// Emit the error through the sink, then hand it back for returning
    fn report(&self, err: SpawnError) -> SpawnError {
        self.emit_error(&err);
        err
    }

    fn emit_event(&self, id: WorkerId, event: WorkerEvent) {
        if let Some(sink) = self.events.snapshot() {
            sink(id, event);
        }
    }

    fn emit_error(&self, err: &SpawnError) {
        if let Some(sink) = self.errors.snapshot() {
            sink(err);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // The reclaim thread holds an Arc to itself through its closure; it
        // must be stopped explicitly or it would keep the reclaimer alive.
        self.reclaimer.stop();
    }
}

/// Complete a worker's teardown exactly once.
///
/// Both the natural path (trampoline, after the callback returns) and the
/// forced path (destroy) land here. The finalized flag picks the winner;
/// the loser returns without touching anything.
fn finalize_worker(control: &Arc<ControlBlock>, forced: bool) {
    if !control.try_finalize() {
        return;
    }

    let ctx = control.mark_finalized(forced, control.kernel().now());

    if let Some(lease) = control.take_stack() {
        control.reclaimer().schedule(lease, ctx);
    }

    if let Some(pool) = control.pool().upgrade() {
        pool.remove_active(control);
        let event = if forced {
            WorkerEvent::Destroyed
        } else {
            WorkerEvent::Completed
        };
        pool.emit_event(control.id(), event);
    }
}

/// Entry function every worker context runs.
///
/// # Safety
///
/// `arg` must be the raw weak control-block pointer minted by `spawn` for
/// exactly this context, handed over exactly once.
pub(crate) unsafe fn worker_trampoline(arg: *mut ()) {
    // SAFETY: spawn minted this weak specifically to travel through the
    // kernel into this call.
    let weak = unsafe { Weak::from_raw(arg as *const ControlBlock) };
    let Some(control) = weak.upgrade() else {
        // Every strong owner vanished before the context got scheduled;
        // there is nothing to run and nobody to tell.
        return;
    };

    // The spawner opens the gate after it has published the worker; without
    // this wait, Started could reach the sink before Created.
    control.start_gate().wait();

    if !control.is_finalized() {
        if let Some(pool) = control.pool().upgrade() {
            pool.emit_event(control.id(), WorkerEvent::Started);
        }
        if let Some(callback) = control.take_callback() {
            callback();
        }
    }

    finalize_worker(&control, false);

    // Drop the strong reference before leaving; for kernels whose
    // exit_current does not return, anything held here would leak.
    let kernel = Arc::clone(control.kernel());
    drop(control);
    kernel.exit_current();
}
