//! Kernel collaborator contract
//!
//! The pool schedules nothing itself. It drives a [`Kernel`]: the preemptive
//! scheduler that creates, terminates, and times execution contexts.
//! `crew-posix` implements this trait over raw POSIX threads; embedded
//! targets bring their own implementation.

use std::time::Duration;

use crate::config::CoreAffinity;
use crate::error::KernelError;
use crate::memory::StackLease;

/// Opaque identifier of a kernel execution context
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Wrap a kernel-assigned id
    pub fn from_u64(id: u64) -> Self {
        ContextId(id)
    }

    /// Get the numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Monotonic kernel clock reading, in kernel ticks
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Tick(u64);

impl Tick {
    /// Wrap a raw tick count
    pub fn from_u64(ticks: u64) -> Self {
        Tick(ticks)
    }

    /// Get the raw tick count
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Ticks elapsed since `earlier`, or `None` if `earlier` is ahead of
    /// `self` (wraparound or an inconsistent snapshot)
    pub fn checked_since(self, earlier: Tick) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }
}

/// Entry function the kernel runs on a fresh context
///
/// The kernel invokes it exactly once with the opaque argument, on the new
/// context, or never if creation failed. Returning from the entry terminates
/// the context.
pub type ContextEntry = unsafe fn(*mut ());

/// Stack backing for a new context
pub enum StackSpec<'a> {
    /// The kernel allocates and owns a stack of at least this many bytes
    Kernel {
        /// Requested stack size in bytes
        bytes: usize,
    },

    /// Run on a caller-provided lease; the caller reclaims it after the
    /// kernel reports the context gone
    Leased(&'a StackLease),
}

/// Parameters for creating one execution context
pub struct ContextSpec<'a> {
    /// Context name, surfaced in debuggers and thread listings
    pub name: &'a str,

    /// Scheduling priority hint; interpretation is kernel-defined
    pub priority: u8,

    /// Core placement request
    pub affinity: CoreAffinity,

    /// Stack backing
    pub stack: StackSpec<'a>,
}

/// The preemptive scheduler the pool runs on
///
/// Implementations must be callable from any context, including from
/// contexts they created themselves.
pub trait Kernel: Send + Sync {
    /// Create a context running `entry(arg)`.
    ///
    /// `arg` is opaque to the kernel: it must be handed to `entry` exactly
    /// once, on the new context, and must not be retained if creation fails.
    /// A successful return means the context exists; a failed return means
    /// the entry will never run.
    fn create(
        &self,
        entry: ContextEntry,
        arg: *mut (),
        spec: ContextSpec<'_>,
    ) -> Result<ContextId, KernelError>;

    /// Forcibly terminate a context, with no opportunity for the context to
    /// run cleanup code. Idempotent; unknown or already-dead ids are a no-op.
    fn terminate(&self, ctx: ContextId);

    /// Terminate the calling context. Implementations may return instead
    /// (cooperative kernels); the caller must return immediately afterwards
    /// and touch nothing else.
    fn exit_current(&self);

    /// Id of the calling context, if this kernel created it
    fn current(&self) -> Option<ContextId>;

    /// Whether the context still occupies kernel resources, its stack
    /// included. Once this reports `false` the context will never run again.
    fn is_live(&self, ctx: ContextId) -> bool;

    /// Current monotonic clock reading
    fn now(&self) -> Tick;

    /// Fixed duration of one tick
    fn tick_period(&self) -> Duration;

    /// Smallest stack the kernel accepts, in bytes
    fn min_stack_bytes(&self) -> usize;

    /// Required granularity of stack sizes and alignment of leased stack
    /// bases, in bytes
    fn stack_align(&self) -> usize;
}
