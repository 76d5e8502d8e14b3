//! Diagnostics and Stack Reclamation Tests
//!
//! Observability coverage over a thread-backed test kernel and a counting
//! stack allocator:
//! - Pool aggregates track the active-set as workers finalize
//! - Average runtime is computed over measured workers only
//! - Cleanup never prunes a live worker
//! - Worker snapshots reflect configuration and lifecycle state
//! - External stack leases are reclaimed only after their context is gone
//!
//! # Running Tests
//! ```bash
//! cargo test --test diag_tests
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crew_core::{
    ContextEntry, ContextId, ContextSpec, CoreAffinity, HeapRegions, Kernel, KernelError,
    PoolConfig, RegionAllocator, StackLease, StackRegion, Tick, WorkerConfig, WorkerPool,
};

// ===== Test kernel and counting allocator =====

struct SendPtr(*mut ());
// SAFETY: the pointer is an opaque token produced on one thread and consumed
// on exactly one other.
unsafe impl Send for SendPtr {}

struct TimedKernel {
    next: AtomicU64,
    live: Arc<Mutex<HashSet<u64>>>,
    epoch: Instant,
}

impl TimedKernel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashSet::new())),
            epoch: Instant::now(),
        })
    }
}

impl Kernel for TimedKernel {
    fn create(
        &self,
        entry: ContextEntry,
        arg: *mut (),
        _spec: ContextSpec<'_>,
    ) -> Result<ContextId, KernelError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(id);

        let live = Arc::clone(&self.live);
        let arg = SendPtr(arg);
        thread::spawn(move || {
            let arg = arg;
            // SAFETY: forwarded create contract, called exactly once.
            unsafe { entry(arg.0) };
            live.lock().remove(&id);
        });

        Ok(ContextId::from_u64(id))
    }

    fn terminate(&self, ctx: ContextId) {
        self.live.lock().remove(&ctx.as_u64());
    }

    fn exit_current(&self) {}

    fn current(&self) -> Option<ContextId> {
        None
    }

    fn is_live(&self, ctx: ContextId) -> bool {
        self.live.lock().contains(&ctx.as_u64())
    }

    fn now(&self) -> Tick {
        Tick::from_u64(self.epoch.elapsed().as_millis() as u64)
    }

    fn tick_period(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn min_stack_bytes(&self) -> usize {
        1024
    }

    fn stack_align(&self) -> usize {
        64
    }
}

/// Heap allocator that counts external leases in and out
struct CountingRegions {
    inner: HeapRegions,
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl CountingRegions {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HeapRegions::new(),
            allocated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl RegionAllocator for CountingRegions {
    fn available(&self, region: StackRegion) -> bool {
        self.inner.available(region)
    }

    fn allocate(&self, region: StackRegion, bytes: usize, align: usize) -> Option<StackLease> {
        let lease = self.inner.allocate(region, bytes, align);
        if lease.is_some() && region == StackRegion::External {
            self.allocated.fetch_add(1, Ordering::SeqCst);
        }
        lease
    }

    unsafe fn release(&self, lease: StackLease) {
        if lease.region() == StackRegion::External {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.release(lease) };
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn spawn_blocked(pool: &WorkerPool, stop: &Arc<AtomicBool>) -> crew_core::WorkerHandle {
    let worker_stop = Arc::clone(stop);
    pool.spawn(
        move || {
            while !worker_stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        },
        WorkerConfig::default(),
    )
    .unwrap()
}

// ===== Pool aggregates =====

#[test]
fn test_counts_track_finalization() {
    let pool = WorkerPool::new(TimedKernel::new());
    let stop = Arc::new(AtomicBool::new(false));

    let _first = spawn_blocked(&pool, &stop);
    let _second = spawn_blocked(&pool, &stop);
    let quick = pool.spawn(|| {}, WorkerConfig::default()).unwrap();
    quick.wait();

    // The finished worker prunes itself from the active-set.
    assert!(wait_until(Duration::from_secs(2), || {
        pool.active_workers() == 2
    }));

    let diag = pool.diag();
    assert_eq!(diag.total_workers, 2);
    assert_eq!(diag.running_workers, 2);
    assert_eq!(diag.waiting_workers, 0);
    assert_eq!(diag.external_stack_workers, 0);

    stop.store(true, Ordering::SeqCst);
}

#[test]
fn test_runtime_aggregates_grow_while_running() {
    let pool = WorkerPool::new(TimedKernel::new());
    let stop = Arc::new(AtomicBool::new(false));

    let _first = spawn_blocked(&pool, &stop);
    let _second = spawn_blocked(&pool, &stop);

    thread::sleep(Duration::from_millis(40));

    let diag = pool.diag();
    assert_eq!(diag.running_workers, 2);
    assert!(diag.average_runtime >= Duration::from_millis(20));
    assert!(diag.max_runtime >= diag.average_runtime);

    stop.store(true, Ordering::SeqCst);
}

#[test]
fn test_cleanup_never_prunes_live_workers() {
    let pool = WorkerPool::new(TimedKernel::new());
    let stop = Arc::new(AtomicBool::new(false));

    let _first = spawn_blocked(&pool, &stop);
    let _second = spawn_blocked(&pool, &stop);

    assert_eq!(pool.cleanup_finished(), 0);
    assert_eq!(pool.active_workers(), 2);

    stop.store(true, Ordering::SeqCst);
}

// ===== Worker snapshots =====

#[test]
fn test_snapshot_reflects_config_and_state() {
    let kernel = TimedKernel::new();
    let pool = WorkerPool::new(kernel);
    let stop = Arc::new(AtomicBool::new(false));

    let worker_stop = Arc::clone(&stop);
    let handle = pool
        .spawn_external(
            move || {
                while !worker_stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
            WorkerConfig {
                name: Some("ext".to_string()),
                affinity: Some(CoreAffinity::Pinned(0)),
                ..WorkerConfig::default()
            },
        )
        .unwrap();

    thread::sleep(Duration::from_millis(20));

    let snapshot = handle.diag();
    assert_eq!(snapshot.config.name, "ext");
    assert_eq!(snapshot.config.affinity, CoreAffinity::Pinned(0));
    assert!(snapshot.config.external_stack);
    assert!(snapshot.has_context);
    assert!(snapshot.running);
    assert!(!snapshot.destroyed);
    assert!(snapshot.runtime >= Duration::from_millis(10));

    assert!(handle.destroy());
    let after = handle.diag();
    assert!(after.destroyed);
    assert!(!after.running);
    assert!(!after.has_context);
    // Runtime froze at destruction.
    assert!(after.runtime >= snapshot.runtime);

    stop.store(true, Ordering::SeqCst);
}

// ===== Stack reclamation =====

#[test]
fn test_lease_reclaimed_only_after_context_dies() {
    let memory = CountingRegions::new();
    let pool = WorkerPool::with_config_and_memory(
        TimedKernel::new(),
        PoolConfig::default(),
        Arc::clone(&memory) as Arc<dyn RegionAllocator>,
    );
    let stop = Arc::new(AtomicBool::new(false));

    let worker_stop = Arc::clone(&stop);
    let handle = pool
        .spawn_external(
            move || {
                while !worker_stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
            WorkerConfig::default(),
        )
        .unwrap();

    assert_eq!(memory.allocated(), 1);

    // Still running: the lease must not come back yet.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(memory.released(), 0);

    stop.store(true, Ordering::SeqCst);
    handle.wait();

    // Once the context is gone the reclaimer returns the lease.
    assert!(wait_until(Duration::from_secs(2), || memory.released() == 1));
}

#[test]
fn test_destroyed_worker_lease_reclaimed() {
    let memory = CountingRegions::new();
    let pool = WorkerPool::with_config_and_memory(
        TimedKernel::new(),
        PoolConfig::default(),
        Arc::clone(&memory) as Arc<dyn RegionAllocator>,
    );
    let stop = Arc::new(AtomicBool::new(false));

    let worker_stop = Arc::clone(&stop);
    let handle = pool
        .spawn_external(
            move || {
                while !worker_stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
            WorkerConfig::default(),
        )
        .unwrap();

    assert!(handle.destroy());
    assert!(wait_until(Duration::from_secs(2), || memory.released() == 1));

    stop.store(true, Ordering::SeqCst);
}

#[test]
fn test_lease_count_balances_over_full_lifecycle() {
    let memory = CountingRegions::new();
    let pool = WorkerPool::with_config_and_memory(
        TimedKernel::new(),
        PoolConfig::default(),
        Arc::clone(&memory) as Arc<dyn RegionAllocator>,
    );

    let handle = pool.spawn_external(|| {}, WorkerConfig::default()).unwrap();
    handle.wait();

    assert_eq!(memory.allocated(), 1);
    assert!(wait_until(Duration::from_secs(2), || memory.released() == 1));
}
