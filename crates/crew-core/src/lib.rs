//! Crew worker pool core
//!
//! This crate provides the kernel-independent worker lifecycle machinery:
//! - Capacity-bounded pool over preemptively scheduled contexts
//! - Per-worker control blocks with exactly-once finalization
//! - Handles for waiting on, inspecting, and destroying workers
//! - Lifecycle event and error sinks
//! - Capability-tagged stack regions with deferred reclamation
//!
//! The pool itself schedules nothing: it drives a [`Kernel`], the trait a
//! target's preemptive scheduler implements. `crew-posix` ships one over
//! POSIX threads; embedded targets bring their own.
//!
//! # Example
//!
//! ```ignore
//! use crew_core::{WorkerConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(kernel);
//! let handle = pool.spawn(|| crunch_numbers(), WorkerConfig::named("crunch"))?;
//! handle.wait();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
mod control;
pub mod diag;
pub mod error;
pub mod event;
pub mod handle;
pub mod kernel;
pub mod memory;
pub mod pool;
mod reclaim;
mod signal;

pub use config::{CoreAffinity, PoolConfig, ResolvedConfig, WorkerConfig};
pub use diag::{PoolDiag, WorkerSnapshot};
pub use error::{KernelError, SpawnError};
pub use event::{ErrorFn, EventFn, WorkerEvent, WorkerId};
pub use handle::WorkerHandle;
pub use kernel::{ContextEntry, ContextId, ContextSpec, Kernel, StackSpec, Tick};
pub use memory::{HeapRegions, RegionAllocator, StackLease, StackRegion};
pub use pool::WorkerPool;
