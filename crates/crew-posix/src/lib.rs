//! POSIX kernel for crew worker pools
//!
//! This crate provides the hosted implementation of the crew kernel
//! interface:
//!
//! - [`PosixKernel`]: execution contexts over raw POSIX threads, with
//!   forced termination via asynchronous thread cancellation
//! - [`MappedRegions`]: page-aligned `mmap` stacks with a guard page for
//!   the alternate stack region
//!
//! Worker callbacks run on real threads, so anything destroyed through
//! [`crew_core::WorkerHandle::destroy`] is cancelled mid-instruction.
//! Callbacks that must not be cut that way should finish on their own and
//! be waited for instead.
//!
//! Linux is the only supported platform: context reaping uses
//! `pthread_tryjoin_np` and forced termination relies on unwinding thread
//! cancellation, neither of which is portable POSIX. Other targets are
//! rejected at compile time.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//!
//! use crew_core::{WorkerConfig, WorkerPool};
//! use crew_posix::{MappedRegions, PosixKernel};
//!
//! let pool = WorkerPool::with_config_and_memory(
//!     Arc::new(PosixKernel::new()),
//!     Default::default(),
//!     Arc::new(MappedRegions::new()),
//! );
//! let handle = pool.spawn(|| println!("on a pthread"), WorkerConfig::default())?;
//! handle.wait();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("Unsupported platform: crew-posix requires Linux");

pub mod kernel;
pub mod memory;

pub use kernel::PosixKernel;
pub use memory::MappedRegions;
