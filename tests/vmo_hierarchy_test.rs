//! Integration tests for paged object hierarchies
//!
//! Exercises clones, slices and references together with the mapping
//! notification, pager and teardown paths they share.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use spin::Mutex;
use vmo_core::vm::{
    ChildType, EvictionHint, MultiPageRequest, PageFaultFlags, PageRequestInfo, PageSource, PageSourceProperties,
    PagedOptions, RangeChangeOp, ReadWriteOptions, Resizability, Resolution, SnapshotType, SupplyOptions,
    UserInPtr, UserOutPtr, VmMapping, VmObject, VmObjectChildObserver, VmObjectPaged, VmPage, VmPageSpliceList,
    PAGE_SIZE,
};
use vmo_core::VmError;

// ════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════

fn read_byte(vmo: &dyn VmObject, offset: u64) -> u8 {
    let mut buf = [0u8; 1];
    vmo.read(&mut buf, offset).expect("read failed");
    buf[0]
}

fn write_byte(vmo: &dyn VmObject, offset: u64, value: u8) {
    vmo.write(&[value], offset).expect("write failed");
}

/// Mapping that records every range change it receives
struct RecordingMapping {
    id: u64,
    offset: u64,
    size: u64,
    changes: Mutex<Vec<(u64, u64, RangeChangeOp)>>,
}

impl RecordingMapping {
    fn new(id: u64, offset: u64, size: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            offset,
            size,
            changes: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<(u64, u64, RangeChangeOp)> {
        std::mem::take(&mut *self.changes.lock())
    }
}

impl VmMapping for RecordingMapping {
    fn id(&self) -> u64 {
        self.id
    }
    fn object_offset(&self) -> u64 {
        self.offset
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn aspace_id(&self) -> u64 {
        1
    }
    fn is_user(&self) -> bool {
        true
    }
    fn apply_range_change(&self, offset: u64, len: u64, op: RangeChangeOp) {
        self.changes.lock().push((offset, len, op));
    }
}

fn map(vmo: &dyn VmObject, mapping: &Arc<RecordingMapping>) {
    let mapping: Arc<dyn VmMapping> = mapping.clone();
    let mut state = vmo.lock();
    vmo.add_mapping_locked(&mut state, &mapping);
}

fn unmap(vmo: &dyn VmObject, mapping: &Arc<RecordingMapping>) {
    let mut state = vmo.lock();
    vmo.remove_mapping_locked(&mut state, mapping.as_ref());
}

/// Pager that fills requested pages with `fill` from inside `send_request`
struct TestPager {
    vmo: Mutex<Weak<VmObjectPaged>>,
    requests: AtomicUsize,
    detached: AtomicUsize,
    fill: u8,
    dirty_tracked: bool,
    fail_with: Option<VmError>,
}

impl TestPager {
    fn new(fill: u8, dirty_tracked: bool) -> Arc<Self> {
        Arc::new(Self {
            vmo: Mutex::new(Weak::new()),
            requests: AtomicUsize::new(0),
            detached: AtomicUsize::new(0),
            fill,
            dirty_tracked,
            fail_with: None,
        })
    }

    fn failing(error: VmError) -> Arc<Self> {
        Arc::new(Self {
            vmo: Mutex::new(Weak::new()),
            requests: AtomicUsize::new(0),
            detached: AtomicUsize::new(0),
            fill: 0,
            dirty_tracked: false,
            fail_with: Some(error),
        })
    }

    fn attach(pager: &Arc<Self>, options: PagedOptions, size: u64) -> Arc<VmObjectPaged> {
        let source: Arc<dyn PageSource> = pager.clone();
        let vmo = VmObjectPaged::create_external(source, options, size).expect("create_external failed");
        *pager.vmo.lock() = Arc::downgrade(&vmo);
        vmo
    }
}

impl PageSource for TestPager {
    fn send_request(&self, request: PageRequestInfo) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let vmo = self.vmo.lock().upgrade();
        let Some(vmo) = vmo else {
            return;
        };
        if let Some(error) = self.fail_with {
            vmo.fail_page_requests(request.offset, request.len, error)
                .expect("fail_page_requests failed");
            return;
        }
        let mut pages = VmPageSpliceList::new();
        for _ in 0..request.len / PAGE_SIZE {
            let mut page = VmPage::alloc();
            page.data_mut().fill(self.fill);
            pages.push_page(page);
        }
        vmo.supply_pages(request.offset, request.len, &mut pages, SupplyOptions::PagerSupply)
            .expect("supply_pages failed");
    }

    fn properties(&self) -> PageSourceProperties {
        PageSourceProperties {
            dirty_tracked: self.dirty_tracked,
        }
    }

    fn koid(&self) -> Option<u64> {
        Some(77)
    }

    fn on_detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingObserver {
    calls: AtomicUsize,
}

impl VmObjectChildObserver for CountingObserver {
    fn on_zero_child(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ════════════════════════════════════════════════════════════
// Basic Lifecycle
// ════════════════════════════════════════════════════════════

#[test]
fn test_commit_lookup_resize() {
    let vmo = VmObjectPaged::create(PagedOptions::RESIZABLE, 3 * PAGE_SIZE).unwrap();
    vmo.commit_range(0, 3 * PAGE_SIZE).unwrap();

    let mut pages = Vec::new();
    vmo.lookup(0, 3 * PAGE_SIZE, &mut |offset, paddr| {
        pages.push((offset, paddr));
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();
    assert_eq!(pages.iter().map(|&(offset, _)| offset).collect::<Vec<_>>(), [0, PAGE_SIZE, 2 * PAGE_SIZE]);

    vmo.resize(PAGE_SIZE).unwrap();
    assert_eq!(vmo.size(), PAGE_SIZE);
    assert_eq!(vmo.attributed_memory().committed_bytes, PAGE_SIZE);
    assert_eq!(vmo.commit_range(PAGE_SIZE, PAGE_SIZE), Err(VmError::OutOfRange));
}

#[test]
fn test_name_truncates_and_copies() {
    let vmo = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    vmo.set_name("a-rather-long-name-that-keeps-going-past-the-limit");
    assert_eq!(vmo.name().len(), 31);

    let clone = vmo
        .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, PAGE_SIZE, true)
        .unwrap();
    assert_eq!(clone.name(), vmo.name());
    let unnamed = vmo
        .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, PAGE_SIZE, false)
        .unwrap();
    assert!(unnamed.name().is_empty());
}

#[test]
#[should_panic]
fn test_user_id_published_twice() {
    let vmo = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    vmo.set_user_id(10);
    vmo.set_user_id(11);
}

// ════════════════════════════════════════════════════════════
// Clones
// ════════════════════════════════════════════════════════════

#[test]
fn test_on_write_clone_is_live_until_written() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    write_byte(parent.as_ref(), 0, 1);

    let clone = parent
        .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, 2 * PAGE_SIZE, false)
        .unwrap();
    assert_eq!(clone.child_type(), ChildType::CowClone);
    assert_eq!(read_byte(clone.as_ref(), 0), 1);

    write_byte(parent.as_ref(), 0, 2);
    assert_eq!(read_byte(clone.as_ref(), 0), 2);

    write_byte(clone.as_ref(), 0, 3);
    write_byte(parent.as_ref(), 0, 4);
    assert_eq!(read_byte(clone.as_ref(), 0), 3);
    assert_eq!(read_byte(parent.as_ref(), 0), 4);
}

#[test]
fn test_full_clone_is_point_in_time() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    write_byte(parent.as_ref(), 0, 9);

    let clone = parent
        .create_paged_clone(Resizability::NonResizable, SnapshotType::Full, 0, 2 * PAGE_SIZE, false)
        .unwrap();
    write_byte(parent.as_ref(), 0, 10);
    write_byte(parent.as_ref(), PAGE_SIZE, 11);

    assert_eq!(read_byte(clone.as_ref(), 0), 9);
    assert_eq!(read_byte(clone.as_ref(), PAGE_SIZE), 0);
    assert_eq!(clone.debug_lookup_depth(), 0);
}

#[test]
fn test_modified_clone_without_pager_is_full() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    write_byte(parent.as_ref(), 0, 5);
    let clone = parent
        .create_paged_clone(Resizability::NonResizable, SnapshotType::Modified, 0, PAGE_SIZE, false)
        .unwrap();
    write_byte(parent.as_ref(), 0, 6);
    assert_eq!(read_byte(clone.as_ref(), 0), 5);
}

#[test]
fn test_clone_at_offset_past_parent_end_reads_zero() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    write_byte(parent.as_ref(), PAGE_SIZE, 7);

    let clone = parent
        .create_paged_clone(Resizability::Resizable, SnapshotType::OnWrite, PAGE_SIZE, 3 * PAGE_SIZE, false)
        .unwrap();
    assert_eq!(clone.size(), 3 * PAGE_SIZE);
    assert!(clone.is_resizable());
    assert_eq!(read_byte(clone.as_ref(), 0), 7);
    assert_eq!(read_byte(clone.as_ref(), PAGE_SIZE), 0);
    assert_eq!(
        parent
            .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 1, PAGE_SIZE, false)
            .err(),
        Some(VmError::InvalidArgs)
    );
}

#[test]
fn test_deep_clone_chain_tears_down_iteratively() {
    const DEPTH: u32 = 100_000;

    let root = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    write_byte(root.as_ref(), 0, 0x5a);
    let hierarchy = Arc::clone(root.base().hierarchy());

    let mut current = root;
    for _ in 0..DEPTH {
        current = current
            .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, PAGE_SIZE, false)
            .unwrap();
    }
    assert_eq!(current.debug_lookup_depth(), DEPTH);
    assert_eq!(read_byte(current.as_ref(), 0), 0x5a);
    assert_eq!(hierarchy.debug_object_count(), 1);

    VmObjectPaged::release(current);
    assert_eq!(hierarchy.debug_node_count(), 0);
    assert_eq!(hierarchy.debug_object_count(), 0);
}

#[test]
fn test_clone_sees_parent_zero_page_replacement() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    let clone = parent
        .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, 2 * PAGE_SIZE, false)
        .unwrap();
    let mapping = RecordingMapping::new(1, 0, 2 * PAGE_SIZE);
    map(clone.as_ref(), &mapping);

    write_byte(parent.as_ref(), PAGE_SIZE, 1);
    assert!(mapping
        .take()
        .contains(&(PAGE_SIZE, PAGE_SIZE, RangeChangeOp::UnmapZeroPage)));

    unmap(clone.as_ref(), &mapping);
}

#[test]
fn test_clone_regrown_after_shrink_reads_zero() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    write_byte(parent.as_ref(), PAGE_SIZE, 0xab);

    let clone = parent
        .create_paged_clone(Resizability::Resizable, SnapshotType::OnWrite, 0, 2 * PAGE_SIZE, false)
        .unwrap();
    assert_eq!(read_byte(clone.as_ref(), PAGE_SIZE), 0xab);

    clone.resize(PAGE_SIZE).unwrap();
    clone.resize(2 * PAGE_SIZE).unwrap();
    assert_eq!(read_byte(clone.as_ref(), PAGE_SIZE), 0);
    assert_eq!(read_byte(parent.as_ref(), PAGE_SIZE), 0xab);

    // Later parent writes stay invisible past the old shrink point
    write_byte(parent.as_ref(), PAGE_SIZE, 0xcd);
    assert_eq!(read_byte(clone.as_ref(), PAGE_SIZE), 0);
}

// ════════════════════════════════════════════════════════════
// Child Observer
// ════════════════════════════════════════════════════════════

#[test]
fn test_observer_fires_once_per_zero_transition() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    let observer = Arc::new(CountingObserver {
        calls: AtomicUsize::new(0),
    });
    parent.set_child_observer(Some(observer.clone()));

    let first = parent
        .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, PAGE_SIZE, false)
        .unwrap();
    let (second, is_first) = parent
        .create_paged_reference(Resizability::NonResizable, 0, 0, false)
        .unwrap();
    assert!(!is_first);
    assert_eq!(parent.num_children(), 2);

    drop(first);
    assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
    drop(second);
    assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(parent.num_children(), 0);
}

#[test]
fn test_child_outlives_parent() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    parent.set_user_id(42);
    write_byte(parent.as_ref(), 0, 8);
    let clone = parent
        .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, PAGE_SIZE, false)
        .unwrap();
    assert_eq!(clone.parent_user_id(), 42);

    drop(parent);
    assert_eq!(clone.child_type(), ChildType::NotChild);
    assert_eq!(clone.parent_user_id(), 0);
    assert_eq!(read_byte(clone.as_ref(), 0), 8);
}

// ════════════════════════════════════════════════════════════
// Slices and References
// ════════════════════════════════════════════════════════════

#[test]
fn test_slice_shares_pages_within_window() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), 4 * PAGE_SIZE).unwrap();
    let slice = parent.create_paged_slice(PAGE_SIZE, 2 * PAGE_SIZE, false).unwrap();
    assert_eq!(slice.size(), 2 * PAGE_SIZE);
    assert_eq!(slice.child_type(), ChildType::Slice);

    write_byte(parent.as_ref(), PAGE_SIZE + 3, 0x11);
    assert_eq!(read_byte(slice.as_ref(), 3), 0x11);
    write_byte(slice.as_ref(), PAGE_SIZE, 0x22);
    assert_eq!(read_byte(parent.as_ref(), 2 * PAGE_SIZE), 0x22);

    assert_eq!(slice.write(&[0], 2 * PAGE_SIZE), Err(VmError::OutOfRange));
    assert_eq!(parent.create_paged_slice(3 * PAGE_SIZE, 2 * PAGE_SIZE, false).err(), Some(VmError::OutOfRange));
    assert_eq!(parent.create_paged_slice(1, PAGE_SIZE, false).err(), Some(VmError::InvalidArgs));

    let nested = slice.create_paged_slice(PAGE_SIZE, PAGE_SIZE, false).unwrap();
    assert_eq!(read_byte(nested.as_ref(), 0), 0x22);
}

#[test]
fn test_slice_of_resizable_rejected() {
    let parent = VmObjectPaged::create(PagedOptions::RESIZABLE, 2 * PAGE_SIZE).unwrap();
    assert_eq!(parent.create_paged_slice(0, PAGE_SIZE, false).err(), Some(VmError::NotSupported));
}

#[test]
fn test_slice_mapping_sees_parent_changes() {
    let parent = VmObjectPaged::create(PagedOptions::empty(), 4 * PAGE_SIZE).unwrap();
    parent.commit_range(0, 4 * PAGE_SIZE).unwrap();
    let slice = parent.create_paged_slice(2 * PAGE_SIZE, 2 * PAGE_SIZE, false).unwrap();
    let mapping = RecordingMapping::new(2, 0, 2 * PAGE_SIZE);
    map(slice.as_ref(), &mapping);

    parent.decommit_range(0, 4 * PAGE_SIZE).unwrap();
    assert_eq!(mapping.take(), [(0, 2 * PAGE_SIZE, RangeChangeOp::Unmap)]);

    unmap(slice.as_ref(), &mapping);
}

#[test]
fn test_reference_tracks_size_and_hands_off_ownership() {
    let parent = VmObjectPaged::create(PagedOptions::RESIZABLE, 2 * PAGE_SIZE).unwrap();
    let (first, is_first) = parent
        .create_paged_reference(Resizability::Resizable, 0, 0, false)
        .unwrap();
    assert!(is_first);
    let (second, _) = parent
        .create_paged_reference(Resizability::NonResizable, 0, 0, false)
        .unwrap();
    assert_eq!(first.child_type(), ChildType::Reference);

    first.resize(4 * PAGE_SIZE).unwrap();
    assert_eq!(parent.size(), 4 * PAGE_SIZE);
    assert_eq!(second.size(), 4 * PAGE_SIZE);
    assert_eq!(second.resize(PAGE_SIZE), Err(VmError::NotSupported));

    let mapping = RecordingMapping::new(3, 0, 4 * PAGE_SIZE);
    map(second.as_ref(), &mapping);
    drop(parent);

    first.commit_range(0, PAGE_SIZE).unwrap();
    first.decommit_range(0, PAGE_SIZE).unwrap();
    assert!(mapping.take().contains(&(0, PAGE_SIZE, RangeChangeOp::Unmap)));

    unmap(second.as_ref(), &mapping);
    assert_eq!(
        first.create_paged_reference(Resizability::NonResizable, PAGE_SIZE, 0, false).err(),
        Some(VmError::InvalidArgs)
    );
}

// ════════════════════════════════════════════════════════════
// Pinning
// ════════════════════════════════════════════════════════════

#[test]
fn test_pinned_pages_block_decommit_and_shrink() {
    let vmo = VmObjectPaged::create(PagedOptions::RESIZABLE, 4 * PAGE_SIZE).unwrap();
    vmo.commit_range_pinned(PAGE_SIZE, 2 * PAGE_SIZE, true).unwrap();
    assert!(vmo.debug_is_range_pinned(PAGE_SIZE, 2 * PAGE_SIZE));
    assert!(!vmo.debug_is_range_pinned(0, PAGE_SIZE));

    assert_eq!(vmo.decommit_range(0, 4 * PAGE_SIZE), Err(VmError::BadState));
    assert_eq!(vmo.resize(PAGE_SIZE), Err(VmError::BadState));
    assert_eq!(vmo.commit_range_pinned(1, PAGE_SIZE, false), Err(VmError::InvalidArgs));

    vmo.unpin(PAGE_SIZE, 2 * PAGE_SIZE);
    vmo.decommit_range(0, 4 * PAGE_SIZE).unwrap();
    vmo.resize(PAGE_SIZE).unwrap();
}

#[test]
#[should_panic]
fn test_unpin_without_pin_is_fatal() {
    let vmo = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    vmo.commit_range(0, PAGE_SIZE).unwrap();
    vmo.unpin(0, PAGE_SIZE);
}

#[test]
fn test_commit_decommit_round_trip() {
    let size = 4 * PAGE_SIZE;
    let vmo = VmObjectPaged::create(PagedOptions::empty(), size).unwrap();
    vmo.commit_range(0, size).unwrap();
    assert_eq!(vmo.attributed_memory().committed_bytes, size);
    assert!(!vmo.debug_is_range_pinned(0, size));

    vmo.decommit_range(0, size).unwrap();
    assert_eq!(vmo.attributed_memory().committed_bytes, 0);
    assert!(!vmo.debug_is_range_pinned(0, size));
    assert_eq!(read_byte(vmo.as_ref(), 2 * PAGE_SIZE), 0);
}

#[test]
fn test_pin_unpin_symmetry() {
    let vmo = VmObjectPaged::create(PagedOptions::empty(), 4 * PAGE_SIZE).unwrap();
    vmo.commit_range_pinned(0, 3 * PAGE_SIZE, false).unwrap();
    vmo.commit_range_pinned(PAGE_SIZE, PAGE_SIZE, true).unwrap();
    assert!(vmo.debug_is_range_pinned(0, 3 * PAGE_SIZE));

    vmo.unpin(0, 3 * PAGE_SIZE);
    assert!(!vmo.debug_is_range_pinned(0, PAGE_SIZE));
    assert!(vmo.debug_is_range_pinned(PAGE_SIZE, PAGE_SIZE));
    assert!(!vmo.debug_is_range_pinned(2 * PAGE_SIZE, PAGE_SIZE));

    vmo.unpin(PAGE_SIZE, PAGE_SIZE);
    assert!(!vmo.debug_is_range_pinned(PAGE_SIZE, PAGE_SIZE));
    vmo.decommit_range(0, 4 * PAGE_SIZE).unwrap();
}

// ════════════════════════════════════════════════════════════
// Pager-Backed Objects
// ════════════════════════════════════════════════════════════

#[test]
fn test_pager_batches_commit_requests() {
    let pager = TestPager::new(0xab, false);
    let vmo = TestPager::attach(&pager, PagedOptions::empty(), 4 * PAGE_SIZE);
    assert!(vmo.is_user_pager_backed());
    assert_eq!(vmo.page_source_koid(), Some(77));

    vmo.commit_range(0, 4 * PAGE_SIZE).unwrap();
    assert_eq!(pager.requests.load(Ordering::SeqCst), 1);
    assert_eq!(read_byte(vmo.as_ref(), 3 * PAGE_SIZE + 5), 0xab);
    assert_eq!(pager.requests.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pager_fault_through_get_page() {
    let pager = TestPager::new(0x3c, true);
    let vmo = TestPager::attach(&pager, PagedOptions::empty(), 2 * PAGE_SIZE);

    let mut request = MultiPageRequest::new(false);
    let first = vmo.get_page(0, PageFaultFlags::HW_FAULT, Some(&mut request)).unwrap();
    assert_eq!(first, Resolution::ShouldWait);
    request.wait().unwrap();

    let info = vmo.get_page_blocking(0, PageFaultFlags::HW_FAULT).unwrap();
    assert!(!info.writable);
    let info = vmo
        .get_page_blocking(0, PageFaultFlags::HW_FAULT | PageFaultFlags::WRITE)
        .unwrap();
    assert!(info.writable);
    assert_eq!(pager.requests.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dirty_writeback_cycle() {
    let pager = TestPager::new(0, true);
    let vmo = TestPager::attach(&pager, PagedOptions::RESIZABLE, 2 * PAGE_SIZE);
    assert!(vmo.is_dirty_tracked());

    vmo.write(&[1, 2, 3], PAGE_SIZE).unwrap();
    vmo.resize(3 * PAGE_SIZE).unwrap();

    let mut dirty = Vec::new();
    vmo.enumerate_dirty_ranges(0, 3 * PAGE_SIZE, &mut |offset, len, zero| {
        dirty.push((offset, len, zero));
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();
    assert_eq!(dirty, [(PAGE_SIZE, PAGE_SIZE, false), (2 * PAGE_SIZE, PAGE_SIZE, true)]);
    assert!(vmo.query_pager_vmo_stats(true).unwrap().modified);
    assert!(!vmo.query_pager_vmo_stats(false).unwrap().modified);

    vmo.writeback_begin(PAGE_SIZE, 2 * PAGE_SIZE, false).unwrap();
    vmo.writeback_end(PAGE_SIZE, 2 * PAGE_SIZE).unwrap();

    let mut remaining = 0;
    vmo.enumerate_dirty_ranges(0, 3 * PAGE_SIZE, &mut |_, _, _| {
        remaining += 1;
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(read_byte(vmo.as_ref(), 2 * PAGE_SIZE), 0);
}

#[test]
fn test_dirty_pages_then_writeback() {
    let pager = TestPager::new(5, true);
    let vmo = TestPager::attach(&pager, PagedOptions::empty(), 2 * PAGE_SIZE);
    let dirty_ranges = |vmo: &VmObjectPaged| {
        let mut dirty = Vec::new();
        vmo.enumerate_dirty_ranges(0, 2 * PAGE_SIZE, &mut |offset, len, zero| {
            dirty.push((offset, len, zero));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        dirty
    };

    // Only supplied pages can be dirtied
    assert_eq!(vmo.dirty_pages(0, PAGE_SIZE), Err(VmError::NotFound));
    assert_eq!(read_byte(vmo.as_ref(), 0), 5);
    assert!(dirty_ranges(&*vmo).is_empty());

    vmo.dirty_pages(0, PAGE_SIZE).unwrap();
    assert_eq!(dirty_ranges(&*vmo), [(0, PAGE_SIZE, false)]);

    vmo.writeback_begin(0, PAGE_SIZE, false).unwrap();
    assert_eq!(dirty_ranges(&*vmo), [(0, PAGE_SIZE, false)]);

    vmo.writeback_end(0, PAGE_SIZE).unwrap();
    assert!(dirty_ranges(&*vmo).is_empty());
    assert_eq!(read_byte(vmo.as_ref(), 0), 5);
}

#[test]
fn test_pager_failure_reaches_reader() {
    let pager = TestPager::failing(VmError::Io);
    let vmo = TestPager::attach(&pager, PagedOptions::empty(), PAGE_SIZE);
    let mut buf = [0u8; 8];
    assert_eq!(vmo.read(&mut buf, 0), Err(VmError::Io));
    assert_eq!(vmo.fail_page_requests(0, PAGE_SIZE, VmError::OutOfRange), Err(VmError::InvalidArgs));
}

#[test]
fn test_detach_fails_future_requests() {
    let pager = TestPager::new(1, false);
    let vmo = TestPager::attach(&pager, PagedOptions::empty(), 2 * PAGE_SIZE);
    assert_eq!(read_byte(vmo.as_ref(), 0), 1);

    vmo.detach_source();
    assert_eq!(pager.detached.load(Ordering::SeqCst), 1);
    assert_eq!(read_byte(vmo.as_ref(), 0), 1);
    let mut buf = [0u8; 1];
    assert_eq!(vmo.read(&mut buf, PAGE_SIZE), Err(VmError::BadState));

    vmo.detach_source();
    assert_eq!(pager.detached.load(Ordering::SeqCst), 1);
}

#[test]
fn test_full_clone_of_pager_backed_rejected() {
    let pager = TestPager::new(2, false);
    let vmo = TestPager::attach(&pager, PagedOptions::empty(), PAGE_SIZE);
    assert_eq!(
        vmo.create_paged_clone(Resizability::NonResizable, SnapshotType::Full, 0, PAGE_SIZE, false)
            .err(),
        Some(VmError::NotSupported)
    );
    let clone = vmo
        .create_paged_clone(Resizability::NonResizable, SnapshotType::Modified, 0, PAGE_SIZE, false)
        .unwrap();
    assert_eq!(read_byte(clone.as_ref(), 0), 2);
    assert!(clone.is_user_pager_backed());
}

#[test]
fn test_evict_respects_always_need() {
    let pager = TestPager::new(4, false);
    let vmo = TestPager::attach(&pager, PagedOptions::empty(), 2 * PAGE_SIZE);
    vmo.commit_range(0, 2 * PAGE_SIZE).unwrap();

    vmo.hint_range(0, PAGE_SIZE, EvictionHint::AlwaysNeed).unwrap();
    assert!(!vmo.debug_evict(0));
    assert!(vmo.debug_evict(PAGE_SIZE));
    assert_eq!(vmo.reclamation_event_count(), 1);
    assert_eq!(vmo.debug_get_page(PAGE_SIZE), None);

    assert_eq!(read_byte(vmo.as_ref(), PAGE_SIZE), 4);
    assert_eq!(pager.requests.load(Ordering::SeqCst), 2);
}

// ════════════════════════════════════════════════════════════
// Page Transfer
// ════════════════════════════════════════════════════════════

#[test]
fn test_take_then_supply_moves_content() {
    let source = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    write_byte(source.as_ref(), 0, 0x77);
    let mut pages = source.take_pages(0, 2 * PAGE_SIZE).unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(read_byte(source.as_ref(), 0), 0);

    let target = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    target
        .supply_pages(0, 2 * PAGE_SIZE, &mut pages, SupplyOptions::TransferData)
        .unwrap();
    assert_eq!(read_byte(target.as_ref(), 0), 0x77);
    assert_eq!(target.take_pages(1, PAGE_SIZE).err(), Some(VmError::InvalidArgs));
}

// ════════════════════════════════════════════════════════════
// Discardable Objects
// ════════════════════════════════════════════════════════════

#[test]
fn test_discard_cycle() {
    let vmo = VmObjectPaged::create(PagedOptions::DISCARDABLE, 2 * PAGE_SIZE).unwrap();
    let size = vmo.size();
    let locked = vmo.lock_range(0, size).unwrap();
    assert_eq!(locked.discarded_size, 0);
    write_byte(vmo.as_ref(), 0, 3);

    assert_eq!(vmo.debug_discard(), 0);
    vmo.unlock_range(0, size).unwrap();
    assert_eq!(vmo.debug_discard(), 1);
    assert_eq!(vmo.reclamation_event_count(), 1);

    assert_eq!(vmo.try_lock_range(0, size), Err(VmError::Unavailable));
    let relocked = vmo.lock_range(0, size).unwrap();
    assert_eq!(relocked.discarded_size, size);
    assert_eq!(read_byte(vmo.as_ref(), 0), 0);

    assert_eq!(vmo.lock_range(0, PAGE_SIZE), Err(VmError::OutOfRange));
    let plain = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    assert_eq!(plain.try_lock_range(0, PAGE_SIZE), Err(VmError::NotSupported));
}

// ════════════════════════════════════════════════════════════
// User Copies
// ════════════════════════════════════════════════════════════

#[test]
fn test_read_user_reports_partial_progress() {
    let vmo = VmObjectPaged::create(PagedOptions::empty(), 2 * PAGE_SIZE).unwrap();
    vmo.write(&[0x42; 300], 0).unwrap();

    let mut buf = [0u8; 300];
    let mut out = UserOutPtr::with_fault_at(&mut buf, 100);
    let (status, copied) = vmo.read_user(&mut out, 0, 200, ReadWriteOptions::empty());
    assert_eq!(status, Err(VmError::InvalidArgs));
    assert_eq!(copied, 100);
    assert!(buf[..100].iter().all(|&b| b == 0x42));
    assert!(buf[100..].iter().all(|&b| b == 0));
}

#[test]
fn test_user_copies_trim_length() {
    let vmo = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
    let src = [7u8; 64];
    let input = UserInPtr::new(&src);
    let mut seen = Vec::new();
    let mut record = |offset: u64, len: usize| seen.push((offset, len));
    let (status, copied) = vmo.write_user(
        &input,
        PAGE_SIZE - 16,
        64,
        ReadWriteOptions::TRIM_LENGTH,
        Some(&mut record),
    );
    assert_eq!(status, Ok(()));
    assert_eq!(copied, 16);
    assert_eq!(seen, [(PAGE_SIZE - 16, 16)]);

    let mut buf = [0u8; 64];
    let mut out = UserOutPtr::new(&mut buf);
    assert_eq!(
        vmo.read_user(&mut out, PAGE_SIZE + 1, 8, ReadWriteOptions::TRIM_LENGTH),
        (Err(VmError::OutOfRange), 0)
    );
    assert_eq!(
        vmo.read_user(&mut out, PAGE_SIZE - 16, 64, ReadWriteOptions::empty()),
        (Err(VmError::OutOfRange), 0)
    );
}

// ════════════════════════════════════════════════════════════
// Concurrency
// ════════════════════════════════════════════════════════════

#[test]
fn test_concurrent_writers_and_clones() {
    const THREADS: u64 = 4;
    let vmo = VmObjectPaged::create(PagedOptions::empty(), THREADS * PAGE_SIZE).unwrap();

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let vmo = Arc::clone(&vmo);
        handles.push(thread::spawn(move || {
            for round in 0..200u32 {
                let value = (round % 251) as u8;
                vmo.write(&[value; 16], t * PAGE_SIZE).unwrap();
                let mut back = [0u8; 16];
                vmo.read(&mut back, t * PAGE_SIZE).unwrap();
                assert_eq!(back, [value; 16]);
            }
        }));
    }
    let cloner = {
        let vmo = Arc::clone(&vmo);
        thread::spawn(move || {
            for _ in 0..200 {
                let clone = vmo
                    .create_paged_clone(Resizability::NonResizable, SnapshotType::OnWrite, 0, vmo.size(), false)
                    .unwrap();
                clone.write(&[1], 0).unwrap();
                VmObjectPaged::release(clone);
            }
        })
    };
    for handle in handles {
        handle.join().unwrap();
    }
    cloner.join().unwrap();
    assert_eq!(vmo.num_children(), 0);
    assert_eq!(vmo.base().hierarchy().debug_object_count(), 1);
}
