//! Capability-tagged stack regions
//!
//! Worker stacks come from one of two memory regions: the default internal
//! region that is always present, and an alternate external region (slower
//! or larger memory) that a target may or may not have. The allocator hands
//! out leases that remember which region produced them, so release always
//! dispatches back through the right region regardless of where the lease
//! has traveled in the meantime.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

/// Memory region a stack may be carved from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StackRegion {
    /// Default region, always present
    Internal,
    /// Alternate region that may be absent on a given target
    External,
}

impl fmt::Display for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackRegion::Internal => f.write_str("internal"),
            StackRegion::External => f.write_str("external"),
        }
    }
}

/// An allocated stack, tagged with the region that produced it
///
/// The lease owns the bytes until it is handed back through
/// [`RegionAllocator::release`].
#[derive(Debug)]
pub struct StackLease {
    region: StackRegion,
    ptr: NonNull<u8>,
    bytes: usize,
    align: usize,
}

// The lease is an ownership token for one non-aliased allocation; the bytes
// are only ever touched by the single context running on them.
unsafe impl Send for StackLease {}

impl StackLease {
    /// Build a lease over `bytes` of memory at `ptr`.
    ///
    /// Allocators keep the region tag honest: release dispatches on it.
    pub fn new(region: StackRegion, ptr: NonNull<u8>, bytes: usize, align: usize) -> Self {
        Self {
            region,
            ptr,
            bytes,
            align,
        }
    }

    /// Region that produced this lease
    pub fn region(&self) -> StackRegion {
        self.region
    }

    /// Base address of the stack memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable size in bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Alignment the memory was allocated with
    pub fn align(&self) -> usize {
        self.align
    }
}

/// Allocator serving stack memory out of capability-tagged regions
pub trait RegionAllocator: Send + Sync {
    /// Whether `region` exists and can serve allocations right now
    fn available(&self, region: StackRegion) -> bool;

    /// Allocate `bytes` (aligned to `align`) from `region`; `None` when the
    /// region is absent or exhausted
    fn allocate(&self, region: StackRegion, bytes: usize, align: usize) -> Option<StackLease>;

    /// Return a lease's memory to the region that produced it.
    ///
    /// # Safety
    ///
    /// The lease must originate from this allocator, and no execution
    /// context may still be running on the leased bytes.
    unsafe fn release(&self, lease: StackLease);
}

/// Process-heap implementation of both regions
///
/// Hosted targets have a single heap, so the external region is the same
/// memory behind a different capability tag. It can be switched off to model
/// targets that lack alternate memory entirely.
pub struct HeapRegions {
    external: bool,
}

impl HeapRegions {
    /// Both regions available
    pub fn new() -> Self {
        Self { external: true }
    }

    /// Internal region only; external allocations are refused
    pub fn internal_only() -> Self {
        Self { external: false }
    }
}

impl Default for HeapRegions {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionAllocator for HeapRegions {
    fn available(&self, region: StackRegion) -> bool {
        match region {
            StackRegion::Internal => true,
            StackRegion::External => self.external,
        }
    }

    fn allocate(&self, region: StackRegion, bytes: usize, align: usize) -> Option<StackLease> {
        if !self.available(region) || bytes == 0 {
            return None;
        }
        let layout = Layout::from_size_align(bytes, align.max(1)).ok()?;
        // SAFETY: layout has non-zero size, checked above.
        let raw = unsafe { alloc::alloc(layout) };
        NonNull::new(raw).map(|ptr| StackLease::new(region, ptr, bytes, layout.align()))
    }

    unsafe fn release(&self, lease: StackLease) {
        if let Ok(layout) = Layout::from_size_align(lease.bytes(), lease.align()) {
            // SAFETY: the lease was produced by `allocate` with this layout
            // and the caller guarantees no context still runs on it.
            unsafe { alloc::dealloc(lease.as_ptr(), layout) };
        }
    }
}
