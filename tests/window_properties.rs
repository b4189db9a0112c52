//! Property-based tests for object windows
//!
//! Slices and clones view their backing store through a window. These
//! properties check that sizes and content line up for arbitrary windows.

use proptest::prelude::*;
use vmo_core::vm::{round_up_page, PagedOptions, Resizability, SnapshotType, VmObject, VmObjectPaged, PAGE_SIZE};
use vmo_core::VmError;

const MAX_PAGES: u64 = 16;

/// `(parent pages, window offset pages, window pages)` with the window inside the parent
fn window() -> impl Strategy<Value = (u64, u64, u64)> {
    (1..=MAX_PAGES).prop_flat_map(|pages| {
        (0..pages).prop_flat_map(move |offset| (Just(pages), Just(offset), 1..=pages - offset))
    })
}

// ════════════════════════════════════════════════════════════
// Slices
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A slice has exactly its window's size and reads the parent's bytes
    #[test]
    fn slice_reads_parent_window((pages, offset, len) in window(), byte in 0..PAGE_SIZE) {
        let parent = VmObjectPaged::create(PagedOptions::empty(), pages * PAGE_SIZE).unwrap();
        let slice = parent.create_paged_slice(offset * PAGE_SIZE, len * PAGE_SIZE, false).unwrap();
        prop_assert_eq!(slice.size(), len * PAGE_SIZE);

        let target = (len - 1) * PAGE_SIZE + byte;
        parent.write(&[0xee], offset * PAGE_SIZE + target).unwrap();
        let mut buf = [0u8; 1];
        slice.read(&mut buf, target).unwrap();
        prop_assert_eq!(buf[0], 0xee);
        prop_assert_eq!(slice.read(&mut buf, len * PAGE_SIZE), Err(VmError::OutOfRange));
    }

    /// Windows extending past the parent are rejected
    #[test]
    fn slice_past_end_rejected((pages, offset, len) in window()) {
        let parent = VmObjectPaged::create(PagedOptions::empty(), pages * PAGE_SIZE).unwrap();
        let overflow = (pages - offset - len + 1) * PAGE_SIZE;
        let result = parent.create_paged_slice(offset * PAGE_SIZE, len * PAGE_SIZE + overflow, false);
        prop_assert_eq!(result.err(), Some(VmError::OutOfRange));
    }
}

// ════════════════════════════════════════════════════════════
// Clones
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A clone sees the parent through its offset, and zeros past the parent end
    #[test]
    fn clone_offsets_into_parent((pages, offset, len) in window(), extra in 0..4u64) {
        let parent = VmObjectPaged::create(PagedOptions::empty(), pages * PAGE_SIZE).unwrap();
        for page in 0..pages {
            parent.write(&[page as u8 + 1], page * PAGE_SIZE).unwrap();
        }
        let size = (len + extra) * PAGE_SIZE;
        let clone = parent
            .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, offset * PAGE_SIZE, size, false)
            .unwrap();
        prop_assert_eq!(clone.size(), size);

        let mut buf = [0u8; 1];
        for page in 0..len + extra {
            clone.read(&mut buf, page * PAGE_SIZE).unwrap();
            let expected = if offset + page < pages { (offset + page) as u8 + 1 } else { 0 };
            prop_assert_eq!(buf[0], expected);
        }
    }

    /// Sizes round up to whole pages
    #[test]
    fn sizes_round_up(bytes in 1..MAX_PAGES * PAGE_SIZE) {
        let vmo = VmObjectPaged::create(PagedOptions::empty(), bytes).unwrap();
        prop_assert_eq!(Some(vmo.size()), round_up_page(bytes));
        prop_assert_eq!(vmo.size() % PAGE_SIZE, 0);
    }
}
