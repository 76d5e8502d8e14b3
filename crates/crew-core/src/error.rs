//! Spawn and kernel error types

use thiserror::Error;

/// Why a spawn was rejected or a worker operation refused
///
/// Every kind is surfaced twice: as the synchronous return value of the
/// failing call, and through the pool's error sink. None of them is fatal to
/// the pool; a failed spawn leaves no partial registration behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    /// The resolved configuration is unusable, or an operation was refused
    /// (a worker asking to destroy itself)
    #[error("invalid worker config: {0}")]
    InvalidConfig(&'static str),

    /// An alternate-region stack was requested but the pool forbids them or
    /// the region is not available on this target
    #[error("external stack requested but unavailable")]
    ExternalStackUnsupported,

    /// The active-set is at capacity
    #[error("worker limit reached")]
    MaxWorkersReached,

    /// The kernel refused to create the execution context
    #[error("kernel context creation failed: {0}")]
    TaskCreateFailed(KernelError),

    /// Stack memory could not be allocated
    #[error("out of stack memory")]
    NoMemory,
}

/// Failure reported by a [`Kernel`](crate::Kernel) implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// The kernel is out of context resources
    #[error("kernel out of context resources")]
    Exhausted,

    /// The requested context parameters cannot be honored on this kernel
    #[error("unsupported context parameters: {0}")]
    Unsupported(&'static str),
}
