//! Pool and worker configuration

use std::fmt;

use crate::event::WorkerId;

/// Core placement request for an execution context
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreAffinity {
    /// Any core the kernel likes
    Any,
    /// Pin to one core, by kernel core index
    Pinned(usize),
}

impl Default for CoreAffinity {
    fn default() -> Self {
        CoreAffinity::Any
    }
}

impl fmt::Display for CoreAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreAffinity::Any => f.write_str("any"),
            CoreAffinity::Pinned(core) => write!(f, "core{}", core),
        }
    }
}

/// Pool-wide settings and per-worker defaults
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneously registered workers
    pub capacity: usize,

    /// Stack size for workers that do not specify one, in bytes
    pub default_stack_bytes: usize,

    /// Priority for workers that do not specify one
    pub default_priority: u8,

    /// Core placement for workers that do not specify one
    pub default_affinity: CoreAffinity,

    /// Whether alternate-region stacks may be requested at all
    pub allow_external_stacks: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            default_stack_bytes: 64 * 1024,
            default_priority: 1,
            default_affinity: CoreAffinity::Any,
            allow_external_stacks: true,
        }
    }
}

/// Per-worker configuration overrides
///
/// Unset fields inherit the pool defaults at spawn time, not at construction
/// time, so the same `WorkerConfig` spawned on two pools can resolve
/// differently.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Stack size in bytes
    pub stack_bytes: Option<usize>,

    /// Scheduling priority
    pub priority: Option<u8>,

    /// Core placement
    pub affinity: Option<CoreAffinity>,

    /// Worker name; auto-generated as `worker-<id>` when unset
    pub name: Option<String>,

    /// Request an alternate-region stack
    pub external_stack: bool,
}

impl WorkerConfig {
    /// Named worker, everything else inherited from the pool
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// A worker's configuration after pool defaults have been applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Worker name
    pub name: String,

    /// Stack size in bytes
    pub stack_bytes: usize,

    /// Scheduling priority
    pub priority: u8,

    /// Core placement
    pub affinity: CoreAffinity,

    /// Whether the stack lives in the alternate region
    pub external_stack: bool,
}

impl PoolConfig {
    /// Resolve worker overrides against these defaults
    pub(crate) fn resolve(&self, config: &WorkerConfig, id: WorkerId) -> ResolvedConfig {
        ResolvedConfig {
            name: config
                .name
                .clone()
                .unwrap_or_else(|| format!("worker-{}", id.as_u64())),
            stack_bytes: config.stack_bytes.unwrap_or(self.default_stack_bytes),
            priority: config.priority.unwrap_or(self.default_priority),
            affinity: config.affinity.unwrap_or(self.default_affinity),
            external_stack: config.external_stack,
        }
    }
}
