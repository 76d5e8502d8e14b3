//! mmap-backed stack regions

use std::ptr::NonNull;

use crew_core::{HeapRegions, RegionAllocator, StackLease, StackRegion};

/// System page size, with a sane fallback if sysconf misbehaves
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf takes no pointers and cannot fail unsafely.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Region allocator with page-aligned, guard-paged external stacks
///
/// The internal region serves from the process heap. The external region is
/// served by `mmap`, with one inaccessible guard page below the usable
/// range so a stack overflow faults instead of silently corrupting
/// whatever sits underneath.
pub struct MappedRegions {
    page: usize,
    heap: HeapRegions,
}

impl MappedRegions {
    /// Allocator with both regions available
    pub fn new() -> Self {
        Self {
            page: page_size(),
            heap: HeapRegions::new(),
        }
    }
}

impl Default for MappedRegions {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionAllocator for MappedRegions {
    fn available(&self, _region: StackRegion) -> bool {
        true
    }

    fn allocate(&self, region: StackRegion, bytes: usize, align: usize) -> Option<StackLease> {
        if region == StackRegion::Internal {
            return self.heap.allocate(region, bytes, align);
        }
        // mmap gives page alignment and nothing stricter.
        if bytes == 0 || align > self.page {
            return None;
        }

        let usable = round_up(bytes, self.page.max(align.max(1)));
        let total = usable + self.page;

        // SAFETY: fresh anonymous mapping; no existing memory is touched.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }

        // Guard page at the low end; stacks grow downwards into it.
        // SAFETY: the first page lies inside the mapping created above.
        let guarded = unsafe { libc::mprotect(base, self.page, libc::PROT_NONE) };
        if guarded != 0 {
            // SAFETY: unmapping exactly the mapping created above.
            unsafe { libc::munmap(base, total) };
            return None;
        }

        // SAFETY: base is not MAP_FAILED so it is non-null, and one page in
        // is still inside the mapping.
        let usable_base = unsafe { NonNull::new_unchecked((base as *mut u8).add(self.page)) };
        Some(StackLease::new(
            StackRegion::External,
            usable_base,
            usable,
            self.page,
        ))
    }

    unsafe fn release(&self, lease: StackLease) {
        if lease.region() == StackRegion::Internal {
            // SAFETY: forwarded caller contract.
            unsafe { self.heap.release(lease) };
            return;
        }
        let total = lease.bytes() + self.page;
        // SAFETY: the lease points one guard page into a mapping of exactly
        // `total` bytes produced by `allocate`, and the caller guarantees no
        // context still runs on it.
        unsafe {
            libc::munmap(lease.as_ptr().sub(self.page) as *mut libc::c_void, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_lease_page_aligned_and_writable() {
        let regions = MappedRegions::new();
        let page = page_size();
        let lease = regions
            .allocate(StackRegion::External, 24 * 1024, page)
            .unwrap();

        assert_eq!(lease.region(), StackRegion::External);
        assert_eq!(lease.as_ptr() as usize % page, 0);
        assert_eq!(lease.bytes() % page, 0);
        assert!(lease.bytes() >= 24 * 1024);

        // The whole usable range must be accessible.
        unsafe {
            lease.as_ptr().write(0xAA);
            lease.as_ptr().add(lease.bytes() - 1).write(0xBB);
        }

        unsafe { regions.release(lease) };
    }

    #[test]
    fn test_internal_delegates_to_heap() {
        let regions = MappedRegions::new();
        let lease = regions.allocate(StackRegion::Internal, 4096, 64).unwrap();

        assert_eq!(lease.region(), StackRegion::Internal);
        unsafe { regions.release(lease) };
    }

    #[test]
    fn test_degenerate_requests_refused() {
        let regions = MappedRegions::new();
        let page = page_size();

        assert!(regions.allocate(StackRegion::External, 0, page).is_none());
        assert!(regions
            .allocate(StackRegion::External, 4096, page * 4)
            .is_none());
    }
}
