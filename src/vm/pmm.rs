//! Physical Page Frames
//!
//! Frame allocator standing in for the kernel's physical memory manager.
//! Every frame carries a stable physical address and zero-filled contents.
//! Dropping a frame frees its storage and decrements the live frame count;
//! addresses come from a monotonically increasing counter and are never
//! reused, so contiguous runs are easy to reserve.

use alloc::vec;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VmError, VmResult};
use crate::vm::{PAGE_SHIFT, PAGE_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Physical address of the shared read-only zero page
pub const ZERO_PAGE_PADDR: u64 = 0x1000;

/// First physical address handed out by the allocator
const PADDR_BASE: u64 = 0x10_0000;

/// Next free physical address
static NEXT_PADDR: AtomicU64 = AtomicU64::new(PADDR_BASE);

/// Frames currently allocated
static PAGES_ALLOCATED: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// VmPage
// ============================================================================

/// A physical page frame
pub struct VmPage {
    paddr: u64,
    data: Box<[u8]>,
}

impl VmPage {
    /// Allocate a zero-filled page
    pub fn alloc() -> Self {
        Self::at(NEXT_PADDR.fetch_add(PAGE_SIZE, Ordering::Relaxed))
    }

    fn at(paddr: u64) -> Self {
        PAGES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
        Self {
            paddr,
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }

    /// Allocate a page holding a copy of `other`
    pub fn copy_of(other: &VmPage) -> Self {
        let mut page = Self::alloc();
        page.data.copy_from_slice(&other.data);
        page
    }

    /// Physical address of the frame
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    /// Page contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable page contents
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether every byte of the page is zero
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

impl Drop for VmPage {
    fn drop(&mut self) {
        PAGES_ALLOCATED.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for VmPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmPage").field("paddr", &format_args!("{:#x}", self.paddr)).finish()
    }
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocate `count` physically contiguous pages aligned to `1 << alignment_log2`
///
/// Alignments below a page are raised to page alignment.
pub fn alloc_contiguous(count: u64, alignment_log2: u8) -> VmResult<Vec<VmPage>> {
    if count == 0 {
        return Err(VmError::InvalidArgs);
    }
    let shift = u64::from(alignment_log2).max(PAGE_SHIFT);
    if shift >= 64 {
        return Err(VmError::InvalidArgs);
    }
    let align = 1u64 << shift;
    let bytes = count.checked_mul(PAGE_SIZE).ok_or(VmError::NoMemory)?;

    let mut base = 0;
    NEXT_PADDR
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
            let start = next.checked_add(align - 1)? & !(align - 1);
            base = start;
            start.checked_add(bytes)
        })
        .map_err(|_| VmError::NoMemory)?;

    Ok((0..count).map(|i| VmPage::at(base + i * PAGE_SIZE)).collect())
}

/// Number of frames currently allocated
pub fn allocated_pages() -> u64 {
    PAGES_ALLOCATED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alloc() {
        let mut page = VmPage::alloc();
        assert!(page.is_zero());
        assert_eq!(page.data().len(), PAGE_SIZE as usize);
        page.data_mut()[10] = 0xab;
        assert!(!page.is_zero());

        let copy = VmPage::copy_of(&page);
        assert_ne!(copy.paddr(), page.paddr());
        assert_eq!(copy.data()[10], 0xab);
    }

    #[test]
    fn test_contiguous_alignment() {
        let pages = alloc_contiguous(4, 16).unwrap();
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[0].paddr() % (1 << 16), 0);
        for pair in pages.windows(2) {
            assert_eq!(pair[1].paddr(), pair[0].paddr() + PAGE_SIZE);
        }
        assert_eq!(alloc_contiguous(0, 0).unwrap_err(), VmError::InvalidArgs);
    }

    #[test]
    fn test_freed_addresses_not_reused() {
        let first = VmPage::alloc();
        let freed = first.paddr();
        drop(first);
        let second = VmPage::alloc();
        assert!(second.paddr() > freed);
    }
}
