//! Execution contexts over raw POSIX threads

use std::cell::Cell;
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crew_core::{
    ContextEntry, ContextId, ContextSpec, CoreAffinity, Kernel, KernelError, StackSpec, Tick,
};

use crate::memory::page_size;

// Redeclared over libc's binding so the start routine may be unwound by
// thread cancellation.
extern "C" {
    fn pthread_create(
        native: *mut libc::pthread_t,
        attr: *const libc::pthread_attr_t,
        f: extern "C-unwind" fn(*mut libc::c_void) -> *mut libc::c_void,
        value: *mut libc::c_void,
    ) -> libc::c_int;
}

// The libc crate does not bind this function on Linux targets.
extern "C" {
    fn pthread_setcanceltype(ty: libc::c_int, oldtype: *mut libc::c_int) -> libc::c_int;
}

// Value from glibc/musl `pthread.h`; `PTHREAD_CANCEL_DEFERRED` is 0.
const PTHREAD_CANCEL_ASYNCHRONOUS: libc::c_int = 1;

thread_local! {
    /// Context id of the calling thread; 0 when the thread is not a context
    static CURRENT_CTX: Cell<u64> = const { Cell::new(0) };
}

/// One registered context. The slot owns the pthread handle; whoever
/// removes the slot is responsible for joining or detaching it.
struct ContextSlot {
    thread: libc::pthread_t,
}

/// Gate that parks a new thread until its registry slot exists
struct ReadyGate {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl ReadyGate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn open(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
    }
}

/// Everything a new thread needs before it can run its entry
struct Launch {
    entry: ContextEntry,
    arg: *mut (),
    id: u64,
    ready: Arc<ReadyGate>,
}

struct KernelInner {
    /// Live and not-yet-reaped contexts by id
    contexts: DashMap<u64, ContextSlot>,
    /// Id source; 0 is reserved for "no context"
    next_id: AtomicU64,
    /// Clock epoch; ticks count milliseconds from here
    epoch: Instant,
    /// Cached system page size
    page: usize,
}

extern "C-unwind" fn context_main(raw: *mut libc::c_void) -> *mut libc::c_void {
    // SAFETY: `raw` is the Launch box leaked by `create` for this thread.
    let launch = unsafe { Box::from_raw(raw as *mut Launch) };
    let Launch {
        entry,
        arg,
        id,
        ready,
    } = *launch;

    // Hold here until create() has registered this context.
    ready.wait();
    drop(ready);
    CURRENT_CTX.with(|current| current.set(id));

    // terminate() must be able to stop this thread at an arbitrary
    // instruction, not just at cancellation points.
    let mut old = 0;
    // SAFETY: plain pthread call acting on the calling thread.
    unsafe {
        pthread_setcanceltype(PTHREAD_CANCEL_ASYNCHRONOUS, &mut old);
    }

    // SAFETY: create() forwards its caller's contract; the entry runs
    // exactly once with its argument.
    unsafe { entry(arg) };

    std::ptr::null_mut()
}

/// [`Kernel`] implementation over POSIX threads
///
/// Contexts are plain pthreads. `terminate` relies on asynchronous thread
/// cancellation, so forcibly destroyed callbacks are cut mid-instruction
/// and unwound; resources not owned by a destructor at that moment are
/// stranded. A context stays live in the registry until its thread has
/// fully exited and been reaped, which is what makes it safe to hand its
/// stack memory back only after [`Kernel::is_live`] reports false.
///
/// `ContextSpec::priority` is recorded for diagnostics but never applied:
/// the default scheduling policy ignores per-thread priority, and the
/// realtime policies that honor it need privileges a library cannot
/// assume.
#[derive(Clone)]
pub struct PosixKernel {
    inner: Arc<KernelInner>,
}

impl PosixKernel {
    /// Kernel with a fresh context registry and clock epoch
    pub fn new() -> Self {
        Self {
            inner: Arc::new(KernelInner {
                contexts: DashMap::new(),
                next_id: AtomicU64::new(1),
                epoch: Instant::now(),
                page: page_size(),
            }),
        }
    }

    /// Number of contexts that are live or awaiting reaping
    pub fn context_count(&self) -> usize {
        self.inner.contexts.len()
    }
}

impl Default for PosixKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for PosixKernel {
    fn create(
        &self,
        entry: ContextEntry,
        arg: *mut (),
        spec: ContextSpec<'_>,
    ) -> Result<ContextId, KernelError> {
        if let CoreAffinity::Pinned(core) = spec.affinity {
            if core >= num_cpus::get() {
                return Err(KernelError::Unsupported("core index out of range"));
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ready = ReadyGate::new();
        let raw = Box::into_raw(Box::new(Launch {
            entry,
            arg,
            id,
            ready: Arc::clone(&ready),
        }));

        // SAFETY: attr is zeroed storage initialized by pthread_attr_init
        // and destroyed on every path out of the block.
        let mut thread: libc::pthread_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            libc::pthread_attr_init(&mut attr);
            match spec.stack {
                StackSpec::Kernel { bytes } => {
                    libc::pthread_attr_setstacksize(&mut attr, bytes.max(self.min_stack_bytes()));
                }
                StackSpec::Leased(lease) => {
                    libc::pthread_attr_setstack(
                        &mut attr,
                        lease.as_ptr() as *mut libc::c_void,
                        lease.bytes(),
                    );
                }
            }
            let rc = pthread_create(&mut thread, &attr, context_main, raw as *mut libc::c_void);
            libc::pthread_attr_destroy(&mut attr);
            rc
        };

        if rc != 0 {
            // SAFETY: the thread never started, so the leaked launch box
            // comes back here exactly once.
            unsafe { drop(Box::from_raw(raw)) };
            return Err(KernelError::Exhausted);
        }

        self.inner.contexts.insert(id, ContextSlot { thread });
        apply_affinity(thread, spec.affinity);
        set_thread_name(thread, spec.name);
        // The slot exists and decorations are applied; let it run.
        ready.open();

        Ok(ContextId::from_u64(id))
    }

    fn terminate(&self, ctx: ContextId) {
        if let Some(slot) = self.inner.contexts.get(&ctx.as_u64()) {
            // The slot stays registered: the thread is still unwinding on
            // its stack, and is_live() reaps it once the unwind finishes.
            // SAFETY: the handle is valid while its slot exists.
            unsafe {
                libc::pthread_cancel(slot.thread);
            }
        }
    }

    fn exit_current(&self) {
        // SAFETY: plain thread exit; the unwind runs this thread's drops.
        unsafe { libc::pthread_exit(std::ptr::null_mut()) }
    }

    fn current(&self) -> Option<ContextId> {
        let id = CURRENT_CTX.with(|current| current.get());
        (id != 0).then(|| ContextId::from_u64(id))
    }

    fn is_live(&self, ctx: ContextId) -> bool {
        // remove_if holds the entry exclusively, so the join attempt runs
        // at most once per dead thread.
        let reaped = self.inner.contexts.remove_if(&ctx.as_u64(), |_, slot| {
            // SAFETY: exclusive access to the handle for the attempt; a
            // successful join transfers cleanup to us with the removal.
            unsafe { libc::pthread_tryjoin_np(slot.thread, std::ptr::null_mut()) == 0 }
        });
        match reaped {
            Some(_) => false,
            None => self.inner.contexts.contains_key(&ctx.as_u64()),
        }
    }

    fn now(&self) -> Tick {
        Tick::from_u64(self.inner.epoch.elapsed().as_millis() as u64)
    }

    fn tick_period(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn min_stack_bytes(&self) -> usize {
        libc::PTHREAD_STACK_MIN.max(16 * 1024)
    }

    fn stack_align(&self) -> usize {
        self.inner.page
    }
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        // Reap whatever already exited; leave running contexts detached so
        // their resources free themselves when they finish.
        for entry in self.contexts.iter() {
            let thread = entry.value().thread;
            // SAFETY: nobody else can reach the registry during drop, so
            // each handle is joined or detached exactly once.
            unsafe {
                if libc::pthread_tryjoin_np(thread, std::ptr::null_mut()) != 0 {
                    libc::pthread_detach(thread);
                }
            }
        }
        self.contexts.clear();
    }
}

fn apply_affinity(thread: libc::pthread_t, affinity: CoreAffinity) {
    let CoreAffinity::Pinned(core) = affinity else {
        return;
    };
    // SAFETY: cpu_set_t is plain bitset storage and the handle is valid.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::pthread_setaffinity_np(thread, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

fn set_thread_name(thread: libc::pthread_t, name: &str) {
    // The kernel caps thread names at 15 bytes plus the terminator.
    let mut end = name.len().min(15);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    if let Ok(cname) = CString::new(&name[..end]) {
        // SAFETY: valid nul-terminated buffer and a valid handle.
        unsafe {
            libc::pthread_setname_np(thread, cname.as_ptr());
        }
    }
}
