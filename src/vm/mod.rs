//! Virtual Memory Objects
//!
//! Layout of the subsystem, leaves first:
//! - pmm: physical page frames
//! - page_request: pager contract and resumable page request tokens
//! - deferred_delete: iterative teardown of reference chains
//! - hierarchy: the lock shared by every view of one object hierarchy
//! - vm_cow_pages: copy-on-write page store backing paged objects
//! - vm_object: the abstract object contract and shared object state
//! - registry: global list of live objects and enumeration cursors
//! - vm_object_paged: paged objects, clones, slices and references
//! - vm_object_physical: objects over a fixed physical range
//! - user_copy: user buffer wrappers for user-facing reads and writes

pub mod deferred_delete;
pub mod hierarchy;
pub mod page_request;
pub mod pmm;
pub mod registry;
pub mod user_copy;
pub mod vm_cow_pages;
pub mod vm_object;
pub mod vm_object_paged;
pub mod vm_object_physical;

pub use deferred_delete::{deferred_release, DeferredDelete, DeferredDeleteQueue, DeferredDeleteState};
pub use hierarchy::{HierarchyGuard, HierarchyState, VmHierarchy};
pub use page_request::{MultiPageRequest, PageRequestInfo, PageSource, PageSourceProperties, Resolution};
pub use pmm::{VmPage, ZERO_PAGE_PADDR};
pub use registry::{for_each, VmoCursor};
pub use user_copy::{UserInPtr, UserOutPtr};
pub use vm_cow_pages::{CowId, CowRange, DirtyState, SpliceEntry, VmCowPages, VmPageSpliceList};
pub use vm_object::{
    AttributionCounts, CachePolicy, ChildType, ContentSizeManager, EvictionHint, PageFaultFlags, PageInfo,
    PagerVmoStats, RangeChangeOp, ReadWriteOptions, Resizability, SnapshotType, SupplyOptions, VmMapping,
    VmObject, VmObjectBase, VmObjectChildObserver, VmObjectId, VmoKind, VmoLockState,
};
pub use vm_object_paged::{PagedOptions, VmObjectPaged};
pub use vm_object_physical::VmObjectPhysical;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: u64 = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: u64 = 12;

/// Largest object size, page aligned with a page of headroom below u64::MAX
pub const MAX_SIZE: u64 = (u64::MAX & !(PAGE_SIZE - 1)) - PAGE_SIZE;

/// Object name capacity, including the terminator slot
pub const MAX_NAME_LEN: usize = 32;

// ============================================================================
// Range Helpers
// ============================================================================

/// Check page alignment
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Round down to a page boundary
#[inline]
pub const fn round_down_page(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Round up to a page boundary, `None` on overflow
#[inline]
pub const fn round_up_page(value: u64) -> Option<u64> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Whether `[offset, offset + len)` fits inside `[0, max)` without overflow
#[inline]
pub const fn in_range(offset: u64, len: u64, max: u64) -> bool {
    match offset.checked_add(len) {
        Some(end) => end <= max,
        None => false,
    }
}

/// Round `[offset, offset + len)` outwards to page boundaries
#[inline]
pub fn round_range_out(offset: u64, len: u64) -> Option<(u64, u64)> {
    let start = round_down_page(offset);
    let end = round_up_page(offset.checked_add(len)?)?;
    Some((start, end - start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(round_up_page(1), Some(PAGE_SIZE));
        assert_eq!(round_up_page(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(round_up_page(u64::MAX), None);
        assert_eq!(round_down_page(PAGE_SIZE + 7), PAGE_SIZE);
        assert!(is_page_aligned(MAX_SIZE));
        assert_eq!(round_range_out(100, 10), Some((0, PAGE_SIZE)));
        assert_eq!(round_range_out(4000, 200), Some((0, 2 * PAGE_SIZE)));
    }

    #[test]
    fn test_in_range() {
        assert!(in_range(0, PAGE_SIZE, PAGE_SIZE));
        assert!(in_range(PAGE_SIZE, 0, PAGE_SIZE));
        assert!(!in_range(PAGE_SIZE, 1, PAGE_SIZE));
        assert!(!in_range(u64::MAX, 2, u64::MAX));
    }
}
