//! Pool and worker diagnostics

use std::time::Duration;

use crate::config::ResolvedConfig;
use crate::event::WorkerId;

/// Point-in-time view of one worker
///
/// Taken from a handle without stopping the worker, so the fields are a
/// snapshot and may be stale by the time they are read.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    /// Worker id
    pub id: WorkerId,

    /// Configuration the worker was spawned with, defaults applied
    pub config: ResolvedConfig,

    /// Whether a kernel context is still attached
    pub has_context: bool,

    /// Whether the worker is currently running
    pub running: bool,

    /// Whether the worker was forcibly destroyed
    pub destroyed: bool,

    /// Runtime so far for a running worker, total runtime for a finalized
    /// one, zero when no measurement exists yet
    pub runtime: Duration,
}

/// Aggregate counters over the pool's active-set
#[derive(Debug, Clone, Default)]
pub struct PoolDiag {
    /// Workers currently registered
    pub total_workers: usize,

    /// Workers with the running flag set
    pub running_workers: usize,

    /// Registered workers that are not running: finalized entries awaiting
    /// prune, or entries whose context has not entered yet
    pub waiting_workers: usize,

    /// Workers whose stack lives in the alternate region
    pub external_stack_workers: usize,

    /// Mean runtime over workers with a measurable runtime
    pub average_runtime: Duration,

    /// Longest runtime among workers with a measurable runtime
    pub max_runtime: Duration,
}
