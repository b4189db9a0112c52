//! Copy-on-Write Page Store
//!
//! Backing store for paged objects. Each [`VmCowPages`] handle names a node
//! whose page slots live in the hierarchy's locked state. A node either owns
//! its content outright (a root, optionally fed by a pager) or links to a
//! parent node and reads through it for pages it does not hold itself.
//!
//! Page frames are reference counted. Snapshots share frames with their
//! source, and whichever side writes first gets a private copy.
//!
//! ## Teardown
//!
//! A handle owns its parent handle. Dropping the last reference removes the
//! node and passes the parent to the deferred deleter, so chains of any
//! depth tear down iteratively. Handles must never be dropped while the
//! hierarchy lock is held.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use bitflags::bitflags;

use crate::error::{VmError, VmResult};
use crate::vm::deferred_delete::{deferred_release, DeferredDelete, DeferredDeleteQueue, DeferredDeleteState};
use crate::vm::hierarchy::{HierarchyState, VmHierarchy};
use crate::vm::page_request::{MultiPageRequest, PageRequest, PageSource, Pending, Resolution};
use crate::vm::pmm::VmPage;
use crate::vm::vm_object::{
    AttributionCounts, DirtyRangeFn, EvictionHint, LookupFn, PageInfo, PagerVmoStats, RangeChangeOp, SnapshotType,
    SupplyOptions, VmObjectId, VmoLockState,
};
use crate::vm::PAGE_SIZE;

// ============================================================================
// Types
// ============================================================================

/// Page store node ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CowId(pub u64);

impl CowId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        CowId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A byte range in page store offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowRange {
    pub offset: u64,
    pub len: u64,
}

impl CowRange {
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overlap of two ranges, `None` if disjoint
    pub fn intersect(self, other: CowRange) -> Option<CowRange> {
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        (start < end).then(|| CowRange::new(start, end - start))
    }

    /// Page offsets covered by the range
    pub(crate) fn pages(self) -> impl Iterator<Item = u64> {
        (self.offset..self.end()).step_by(PAGE_SIZE as usize)
    }

    fn page_count(&self) -> u64 {
        self.len / PAGE_SIZE
    }
}

/// Writeback state of a page or zero range in a dirty-tracked store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The store does not track dirtiness
    Untracked,
    /// Matches the pager's copy
    Clean,
    /// Modified since the last writeback
    Dirty,
    /// Writeback started, not yet acknowledged
    AwaitingClean,
}

impl DirtyState {
    fn needs_writeback(self) -> bool {
        matches!(self, DirtyState::Dirty | DirtyState::AwaitingClean)
    }
}

bitflags! {
    /// Page store options
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CowFlags: u32 {
        /// Supplied pages carry writeback state
        const DIRTY_TRACKED = 1 << 0;
        /// Content may be discarded while unlocked
        const DISCARDABLE = 1 << 1;
        /// Pages carry a creation pin that users can never release
        const ALWAYS_PINNED = 1 << 2;
    }
}

/// A page committed in a store
pub(crate) struct CommittedPage {
    pub(crate) page: Arc<VmPage>,
    pub(crate) pin_count: u32,
    pub(crate) dirty: DirtyState,
    pub(crate) always_need: bool,
}

impl CommittedPage {
    fn new(page: Arc<VmPage>, dirty: DirtyState) -> Self {
        Self {
            page,
            pin_count: 0,
            dirty,
            always_need: false,
        }
    }

    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.page) > 1
    }
}

/// Content of a page slot
pub(crate) enum PageSlot {
    Page(CommittedPage),
    /// Known-zero content, no frame allocated
    Zero(DirtyState),
}

/// Link from a child store into its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParentLink {
    pub(crate) node: CowId,
    /// Child offset 0 corresponds to this parent offset
    pub(crate) offset: u64,
    /// Child offsets at or beyond this never read through the parent
    pub(crate) limit: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DiscardableState {
    lock_count: u32,
    discarded: bool,
}

/// Page store node, guarded by the hierarchy lock
pub(crate) struct CowNode {
    pub(crate) size: u64,
    flags: CowFlags,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) children: Vec<CowId>,
    pub(crate) slots: BTreeMap<u64, PageSlot>,
    source: Option<Arc<dyn PageSource>>,
    source_detached: bool,
    /// Offsets at or beyond this read as zero without asking the pager
    supply_zero_offset: u64,
    pending: Vec<Arc<PageRequest>>,
    /// Object receiving range change notifications for this store
    pub(crate) owner: Option<VmObjectId>,
    discardable: Option<DiscardableState>,
    modified: bool,
    reclamation_events: u64,
    high_priority_count: i64,
}

impl CowNode {
    fn new(size: u64, flags: CowFlags) -> Self {
        Self {
            size,
            flags,
            parent: None,
            children: Vec::new(),
            slots: BTreeMap::new(),
            source: None,
            source_detached: false,
            supply_zero_offset: size,
            pending: Vec::new(),
            owner: None,
            discardable: flags.contains(CowFlags::DISCARDABLE).then(DiscardableState::default),
            modified: false,
            reclamation_events: 0,
            high_priority_count: 0,
        }
    }

    fn is_dirty_tracked(&self) -> bool {
        self.flags.contains(CowFlags::DIRTY_TRACKED)
    }

    fn page(&self, offset: u64) -> Option<&CommittedPage> {
        match self.slots.get(&offset) {
            Some(PageSlot::Page(page)) => Some(page),
            _ => None,
        }
    }

    /// Absent offsets in the grown tail of a pager-backed store
    fn in_zero_tail(&self, offset: u64) -> bool {
        self.source.is_some() && offset >= self.supply_zero_offset && offset < self.size
    }

    fn any_pinned(&self, range: CowRange) -> bool {
        self.slots
            .range(range.offset..range.end())
            .any(|(_, slot)| matches!(slot, PageSlot::Page(page) if page.pin_count > 0))
    }

    /// Dirty state for a fresh page committed at `offset`
    fn fresh_page_dirty_state(&self, offset: u64) -> DirtyState {
        if !self.is_dirty_tracked() {
            return DirtyState::Untracked;
        }
        match self.slots.get(&offset) {
            Some(PageSlot::Zero(state)) => *state,
            _ if self.in_zero_tail(offset) => DirtyState::Dirty,
            _ => DirtyState::Clean,
        }
    }
}

/// A range change recorded under the lock, applied to mappings before it is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeChange {
    pub(crate) node: CowId,
    pub(crate) range: CowRange,
    pub(crate) op: RangeChangeOp,
}

pub(crate) type RangeChangeList = Vec<RangeChange>;

/// Where the content for an offset comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageLocation {
    /// A frame in `node` at `offset`
    Committed { node: CowId, offset: u64 },
    /// Zero, no frame
    Zero,
    /// The pager of `node` has to supply `offset`
    NeedsPager { node: CowId, offset: u64 },
}

// ============================================================================
// Splice Lists
// ============================================================================

/// One page worth of content moving between objects
#[derive(Debug)]
pub enum SpliceEntry {
    Page(VmPage),
    Zero,
}

/// Ordered run of pages taken from or supplied to an object
#[derive(Debug, Default)]
pub struct VmPageSpliceList {
    entries: VecDeque<SpliceEntry>,
}

impl VmPageSpliceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&mut self, page: VmPage) {
        self.entries.push_back(SpliceEntry::Page(page));
    }

    pub fn push_zero(&mut self) {
        self.entries.push_back(SpliceEntry::Zero);
    }

    pub fn pop(&mut self) -> Option<SpliceEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// VmCowPages
// ============================================================================

static COW_PAGES_DELETE_QUEUE: DeferredDeleteQueue<VmCowPages> = DeferredDeleteQueue::new();

/// Handle to a page store node
pub struct VmCowPages {
    hierarchy: Arc<VmHierarchy>,
    id: CowId,
    parent: Option<Arc<VmCowPages>>,
    delete_state: DeferredDeleteState,
}

impl VmCowPages {
    /// Create a root store of `size` bytes, optionally fed by `source`
    pub(crate) fn new_root(
        hierarchy: &Arc<VmHierarchy>,
        size: u64,
        flags: CowFlags,
        source: Option<Arc<dyn PageSource>>,
    ) -> Arc<Self> {
        let id = CowId::new();
        let mut node = CowNode::new(size, flags);
        node.source = source;
        hierarchy.lock().nodes.insert(id, node);
        Arc::new(Self {
            hierarchy: Arc::clone(hierarchy),
            id,
            parent: None,
            delete_state: DeferredDeleteState::new(),
        })
    }

    /// Wrap a node created by [`VmCowPages::create_clone_locked`]
    pub(crate) fn new_child(parent: &Arc<VmCowPages>, id: CowId, linked: bool) -> Arc<Self> {
        Arc::new(Self {
            hierarchy: Arc::clone(&parent.hierarchy),
            id,
            parent: linked.then(|| Arc::clone(parent)),
            delete_state: DeferredDeleteState::new(),
        })
    }

    pub fn id(&self) -> CowId {
        self.id
    }

    pub fn hierarchy(&self) -> &Arc<VmHierarchy> {
        &self.hierarchy
    }

    fn node<'a>(&self, state: &'a HierarchyState) -> &'a CowNode {
        state.node(self.id)
    }

    fn node_mut<'a>(&self, state: &'a mut HierarchyState) -> &'a mut CowNode {
        state.node_mut(self.id)
    }

    pub(crate) fn size_locked(&self, state: &HierarchyState) -> u64 {
        self.node(state).size
    }

    pub(crate) fn has_source_locked(&self, state: &HierarchyState) -> bool {
        self.node(state).source.is_some()
    }

    pub(crate) fn has_parent_locked(&self, state: &HierarchyState) -> bool {
        self.node(state).parent.is_some()
    }

    pub(crate) fn is_dirty_tracked_locked(&self, state: &HierarchyState) -> bool {
        self.node(state).is_dirty_tracked()
    }

    pub(crate) fn source_koid_locked(&self, state: &HierarchyState) -> Option<u64> {
        self.node(state).source.as_ref().and_then(|source| source.koid())
    }

    /// Whether the root of the parent chain is fed by a pager
    pub(crate) fn root_has_source_locked(&self, state: &HierarchyState) -> bool {
        let mut node = self.node(state);
        while let Some(link) = node.parent {
            node = state.node(link.node);
        }
        node.source.is_some()
    }

    pub(crate) fn set_owner_locked(&self, state: &mut HierarchyState, owner: Option<VmObjectId>) {
        self.node_mut(state).owner = owner;
    }

    pub(crate) fn owner_locked(&self, state: &HierarchyState) -> Option<VmObjectId> {
        self.node(state).owner
    }

    /// Install `pages` from offset zero, pinning them if requested
    pub(crate) fn populate_locked(&self, state: &mut HierarchyState, pages: Vec<VmPage>, pin: bool) {
        let node = self.node_mut(state);
        for (index, page) in pages.into_iter().enumerate() {
            let mut committed = CommittedPage::new(Arc::new(page), DirtyState::Untracked);
            committed.pin_count = u32::from(pin);
            node.slots.insert(index as u64 * PAGE_SIZE, PageSlot::Page(committed));
        }
    }

    // ------------------------------------------------------------------
    // Page lookup and commit
    // ------------------------------------------------------------------

    /// Walk the parent chain for the content of `offset`
    pub(crate) fn find_page_locked(&self, state: &HierarchyState, offset: u64) -> PageLocation {
        let mut node_id = self.id;
        let mut offset = offset;
        loop {
            let node = state.node(node_id);
            match node.slots.get(&offset) {
                Some(PageSlot::Page(_)) => return PageLocation::Committed { node: node_id, offset },
                Some(PageSlot::Zero(_)) => return PageLocation::Zero,
                None => {}
            }
            match node.parent {
                Some(link) if offset < link.limit => {
                    node_id = link.node;
                    offset += link.offset;
                }
                Some(_) => return PageLocation::Zero,
                None if node.source.is_some() && offset < node.supply_zero_offset => {
                    return PageLocation::NeedsPager { node: node_id, offset };
                }
                None => return PageLocation::Zero,
            }
        }
    }

    /// Record that `offset` of `node_id` must come from its pager
    fn request_page_locked(
        &self,
        state: &mut HierarchyState,
        node_id: CowId,
        offset: u64,
        request: &mut MultiPageRequest,
    ) -> VmResult<Pending> {
        let node = state.node_mut(node_id);
        if node.source_detached {
            return Err(VmError::BadState);
        }
        let Some(source) = node.source.clone() else {
            panic!("page request on store {:?} without a source", node_id);
        };

        if let Some(existing) = node.pending.iter().find(|req| req.covers(offset)) {
            if request.is_tracking(existing) {
                return Ok(Pending::Continue);
            }
            if !request.is_active() {
                request.attach(Arc::clone(existing), source, node_id);
            }
            return Ok(Pending::ShouldWait);
        }

        if let Some(end) = request.open_batch_end(node_id) {
            if end == offset {
                request.extend_batch(PAGE_SIZE);
                return Ok(Pending::Continue);
            }
            return Ok(Pending::ShouldWait);
        }
        if request.is_active() {
            return Ok(Pending::ShouldWait);
        }

        let page_request = PageRequest::new(offset, PAGE_SIZE);
        node.pending.push(Arc::clone(&page_request));
        request.start(page_request, source, node_id);
        Ok(if request.allow_batching() {
            Pending::Continue
        } else {
            Pending::ShouldWait
        })
    }

    /// Locate `offset`, registering a page request if the pager must supply it
    pub(crate) fn locate_page_locked(
        &self,
        state: &mut HierarchyState,
        offset: u64,
        request: &mut MultiPageRequest,
    ) -> VmResult<Resolution<PageLocation>> {
        match self.find_page_locked(state, offset) {
            PageLocation::NeedsPager { node, offset } => Ok(self.request_page_locked(state, node, offset, request)?.into()),
            location => Ok(Resolution::Ready(location)),
        }
    }

    /// Make sure this store holds its own frame for `offset`
    ///
    /// With `unshared` the frame is also made exclusive, so its physical
    /// address is stable and it may be written.
    fn commit_page_locked(
        &self,
        state: &mut HierarchyState,
        offset: u64,
        unshared: bool,
        request: &mut MultiPageRequest,
        changes: &mut RangeChangeList,
    ) -> VmResult<Resolution<()>> {
        match self.find_page_locked(state, offset) {
            PageLocation::Committed { node, .. } if node == self.id => {
                if unshared {
                    self.unshare_page_locked(state, offset, changes);
                }
            }
            PageLocation::Committed { node, offset: parent_offset } => {
                let copy = match state.node(node).page(parent_offset) {
                    Some(parent_page) => VmPage::copy_of(&parent_page.page),
                    None => panic!("committed page vanished from {:?}", node),
                };
                let dirty = self.node(state).fresh_page_dirty_state(offset);
                self.node_mut(state)
                    .slots
                    .insert(offset, PageSlot::Page(CommittedPage::new(Arc::new(copy), dirty)));
                changes.push(self.change(offset, PAGE_SIZE, RangeChangeOp::Unmap));
            }
            PageLocation::Zero => {
                let dirty = self.node(state).fresh_page_dirty_state(offset);
                self.node_mut(state)
                    .slots
                    .insert(offset, PageSlot::Page(CommittedPage::new(Arc::new(VmPage::alloc()), dirty)));
                changes.push(self.change(offset, PAGE_SIZE, RangeChangeOp::UnmapZeroPage));
            }
            PageLocation::NeedsPager { node, offset } => {
                return Ok(self.request_page_locked(state, node, offset, request)?.into());
            }
        }
        Ok(Resolution::Ready(()))
    }

    fn unshare_page_locked(&self, state: &mut HierarchyState, offset: u64, changes: &mut RangeChangeList) {
        if let Some(PageSlot::Page(committed)) = self.node_mut(state).slots.get_mut(&offset) {
            if Arc::get_mut(&mut committed.page).is_none() {
                let copy = VmPage::copy_of(&committed.page);
                committed.page = Arc::new(copy);
                changes.push(self.change(offset, PAGE_SIZE, RangeChangeOp::Unmap));
            }
        }
    }

    /// Make `offset` writable in this store and mark it dirty
    pub(crate) fn writable_page_locked(
        &self,
        state: &mut HierarchyState,
        offset: u64,
        request: &mut MultiPageRequest,
        changes: &mut RangeChangeList,
    ) -> VmResult<Resolution<()>> {
        match self.commit_page_locked(state, offset, true, request, changes)? {
            Resolution::Ready(()) => {}
            pending => return Ok(pending),
        }
        let node = self.node_mut(state);
        let tracked = node.is_dirty_tracked();
        if let Some(PageSlot::Page(committed)) = node.slots.get_mut(&offset) {
            if tracked {
                committed.dirty = DirtyState::Dirty;
            }
        }
        if node.source.is_some() {
            node.modified = true;
        }
        Ok(Resolution::Ready(()))
    }

    /// Bytes of the frame at `offset` in `node`
    pub(crate) fn page_data(state: &HierarchyState, node: CowId, offset: u64) -> &[u8] {
        match state.node(node).page(offset) {
            Some(committed) => committed.page.data(),
            None => panic!("no page committed at {:#x} in {:?}", offset, node),
        }
    }

    /// Physical address of the frame at `offset` in `node`, and whether a
    /// fault through this store may map it writable
    pub(crate) fn page_info_locked(&self, state: &HierarchyState, node: CowId, offset: u64) -> PageInfo {
        let owner = state.node(node);
        match owner.page(offset) {
            Some(committed) => PageInfo {
                paddr: committed.page.paddr(),
                writable: node == self.id
                    && !committed.is_shared()
                    && (!owner.is_dirty_tracked() || committed.dirty == DirtyState::Dirty),
            },
            None => panic!("no page committed at {:#x} in {:?}", offset, node),
        }
    }

    pub(crate) fn any_pinned_locked(&self, state: &HierarchyState) -> bool {
        let node = self.node(state);
        node.any_pinned(CowRange::new(0, node.size))
    }

    /// Writable bytes of this store's frame at `offset`
    ///
    /// The page must have been prepared with `writable_page_locked`.
    pub(crate) fn page_data_mut<'a>(&self, state: &'a mut HierarchyState, offset: u64) -> &'a mut [u8] {
        match self.node_mut(state).slots.get_mut(&offset) {
            Some(PageSlot::Page(committed)) => match Arc::get_mut(&mut committed.page) {
                Some(page) => page.data_mut(),
                None => panic!("page at {:#x} is shared", offset),
            },
            _ => panic!("no page committed at {:#x}", offset),
        }
    }

    /// Commit (and optionally pin) every page of `range`
    pub(crate) fn commit_range_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        pin: bool,
        write: bool,
        request: &mut MultiPageRequest,
        changes: &mut RangeChangeList,
    ) -> VmResult<Resolution<()>> {
        let mut batching = false;
        for offset in range.pages() {
            let result = if write {
                self.writable_page_locked(state, offset, request, changes)?
            } else {
                self.commit_page_locked(state, offset, pin, request, changes)?
            };
            match result {
                Resolution::Ready(()) => {}
                Resolution::Continue => batching = true,
                Resolution::ShouldWait => return Ok(Resolution::ShouldWait),
            }
        }
        if batching {
            return Ok(Resolution::Continue);
        }
        if pin {
            self.pin_range_locked(state, range)?;
        }
        Ok(Resolution::Ready(()))
    }

    /// Fetch pager content for `range` without allocating private pages
    pub(crate) fn prefetch_range_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        request: &mut MultiPageRequest,
    ) -> VmResult<Resolution<()>> {
        let mut batching = false;
        for offset in range.pages() {
            if let PageLocation::NeedsPager { node, offset } = self.find_page_locked(state, offset) {
                match self.request_page_locked(state, node, offset, request)? {
                    Pending::Continue => batching = true,
                    Pending::ShouldWait => return Ok(Resolution::ShouldWait),
                }
            }
        }
        Ok(if batching {
            Resolution::Continue
        } else {
            Resolution::Ready(())
        })
    }

    pub(crate) fn decommit_range_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        changes: &mut RangeChangeList,
    ) -> VmResult<()> {
        let node = self.node(state);
        if node.parent.is_some() || node.source.is_some() || !node.children.is_empty() {
            return Err(VmError::NotSupported);
        }
        if node.any_pinned(range) {
            return Err(VmError::BadState);
        }
        let node = self.node_mut(state);
        let offsets: Vec<u64> = node.slots.range(range.offset..range.end()).map(|(&o, _)| o).collect();
        for offset in offsets {
            node.slots.remove(&offset);
        }
        changes.push(self.change(range.offset, range.len, RangeChangeOp::Unmap));
        Ok(())
    }

    /// Zero whole pages of `range`
    ///
    /// Pinned pages are zeroed in place. Elsewhere frames are released, and
    /// zero markers are left where a parent or pager would otherwise supply
    /// stale content.
    pub(crate) fn zero_range_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        dirty_track: bool,
        changes: &mut RangeChangeList,
    ) {
        let node = self.node_mut(state);
        let needs_marker = node.parent.is_some() || node.source.is_some();
        let tracked = node.is_dirty_tracked() && dirty_track;
        let marker = if tracked { DirtyState::Dirty } else { DirtyState::Untracked };

        for offset in range.pages() {
            if let Some(PageSlot::Page(committed)) = node.slots.get_mut(&offset) {
                if committed.pin_count > 0 {
                    match Arc::get_mut(&mut committed.page) {
                        Some(page) => page.data_mut().fill(0),
                        None => panic!("pinned page at {:#x} is shared", offset),
                    }
                    if tracked {
                        committed.dirty = DirtyState::Dirty;
                    }
                    continue;
                }
            }
            if needs_marker {
                node.slots.insert(offset, PageSlot::Zero(marker));
            } else {
                node.slots.remove(&offset);
            }
        }
        if tracked {
            node.modified = true;
        }
        changes.push(self.change(range.offset, range.len, RangeChangeOp::Unmap));
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    fn pin_range_locked(&self, state: &mut HierarchyState, range: CowRange) -> VmResult<()> {
        let node = self.node_mut(state);
        if range.pages().any(|offset| node.page(offset).is_none()) {
            return Err(VmError::BadState);
        }
        for offset in range.pages() {
            if let Some(PageSlot::Page(committed)) = node.slots.get_mut(&offset) {
                committed.pin_count = match committed.pin_count.checked_add(1) {
                    Some(count) => count,
                    None => panic!("pin count overflow at {:#x}", offset),
                };
            }
        }
        Ok(())
    }

    /// Drop one pin from every page of `range`. Unpinning below zero, or
    /// below the creation pin of an always-pinned store, is fatal.
    pub(crate) fn unpin_locked(&self, state: &mut HierarchyState, range: CowRange) {
        let node = self.node_mut(state);
        let floor = u32::from(node.flags.contains(CowFlags::ALWAYS_PINNED));
        for offset in range.pages() {
            match node.slots.get_mut(&offset) {
                Some(PageSlot::Page(committed)) if committed.pin_count > floor => committed.pin_count -= 1,
                _ => panic!("unpin of page at {:#x} that is not pinned", offset),
            }
        }
    }

    pub(crate) fn debug_is_range_pinned_locked(&self, state: &HierarchyState, range: CowRange) -> bool {
        let node = self.node(state);
        range
            .pages()
            .all(|offset| node.page(offset).is_some_and(|committed| committed.pin_count > 0))
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Call `f(object offset, paddr)` for each exclusive frame in `range`
    pub(crate) fn lookup_locked(
        &self,
        state: &HierarchyState,
        range: CowRange,
        window_offset: u64,
        f: &mut LookupFn<'_>,
    ) -> VmResult<()> {
        for (&offset, slot) in self.node(state).slots.range(range.offset..range.end()) {
            if let PageSlot::Page(committed) = slot {
                if committed.is_shared() {
                    continue;
                }
                if f(offset - window_offset, committed.page.paddr())?.is_break() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Physical address of `range` if it is committed and physically contiguous
    pub(crate) fn lookup_contiguous_locked(&self, state: &HierarchyState, range: CowRange) -> VmResult<u64> {
        let node = self.node(state);
        let mut base = None;
        for (index, offset) in range.pages().enumerate() {
            let paddr = match node.page(offset) {
                Some(committed) if !committed.is_shared() => committed.page.paddr(),
                _ => return Err(VmError::NotFound),
            };
            match base {
                None => base = Some(paddr),
                Some(start) if paddr == start + index as u64 * PAGE_SIZE => {}
                Some(_) => return Err(VmError::NotFound),
            }
        }
        base.ok_or(VmError::NotFound)
    }

    // ------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------

    pub(crate) fn resize_locked(
        &self,
        state: &mut HierarchyState,
        new_size: u64,
        changes: &mut RangeChangeList,
    ) -> VmResult<()> {
        let node = self.node(state);
        let old_size = node.size;
        if new_size < old_size {
            let tail = CowRange::new(new_size, old_size - new_size);
            if node.any_pinned(tail) {
                return Err(VmError::BadState);
            }
            let children = node.children.clone();

            let node = self.node_mut(state);
            drop(node.slots.split_off(&new_size));
            // Regrown tail reads zero, not the parent
            if let Some(link) = node.parent.as_mut() {
                link.limit = link.limit.min(new_size);
            }
            node.supply_zero_offset = node.supply_zero_offset.min(new_size);
            node.pending.retain(|req| {
                if req.overlaps(tail.offset, tail.len) {
                    req.fail(VmError::OutOfRange);
                    false
                } else {
                    true
                }
            });

            // Children never read through beyond the new end
            for child in children {
                let child_node = state.node_mut(child);
                if let Some(link) = child_node.parent.as_mut() {
                    link.limit = link.limit.min(new_size.saturating_sub(link.offset));
                }
            }
            changes.push(self.change(tail.offset, tail.len, RangeChangeOp::Unmap));
        }
        self.node_mut(state).size = new_size;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page transfer
    // ------------------------------------------------------------------

    /// Remove the pages of `range`, leaving it zero
    pub(crate) fn take_pages_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        changes: &mut RangeChangeList,
    ) -> VmResult<VmPageSpliceList> {
        let node = self.node(state);
        if node.parent.is_some() || node.source.is_some() {
            return Err(VmError::NotSupported);
        }
        if node.any_pinned(range) {
            return Err(VmError::BadState);
        }
        let node = self.node_mut(state);
        let mut list = VmPageSpliceList::new();
        for offset in range.pages() {
            match node.slots.remove(&offset) {
                Some(PageSlot::Page(committed)) => match Arc::try_unwrap(committed.page) {
                    Ok(page) => list.push_page(page),
                    Err(shared) => list.push_page(VmPage::copy_of(&shared)),
                },
                _ => list.push_zero(),
            }
        }
        changes.push(self.change(range.offset, range.len, RangeChangeOp::Unmap));
        Ok(list)
    }

    /// Install supplied pages and resolve the page requests they satisfy
    pub(crate) fn supply_pages_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        pages: &mut VmPageSpliceList,
        options: SupplyOptions,
        changes: &mut RangeChangeList,
    ) -> VmResult<()> {
        if pages.len() as u64 != range.page_count() {
            return Err(VmError::InvalidArgs);
        }
        let node = self.node(state);
        match options {
            SupplyOptions::PagerSupply | SupplyOptions::PhysicalPageProvider => {
                if node.source.is_none() {
                    return Err(VmError::NotSupported);
                }
            }
            SupplyOptions::TransferData => {
                if node.parent.is_some() {
                    return Err(VmError::NotSupported);
                }
                if node.any_pinned(range) {
                    return Err(VmError::BadState);
                }
            }
        }

        let node = self.node_mut(state);
        let tracked = node.is_dirty_tracked();
        let supplied_state = match options {
            SupplyOptions::PagerSupply if tracked => DirtyState::Clean,
            SupplyOptions::TransferData if tracked => DirtyState::Dirty,
            _ => DirtyState::Untracked,
        };
        let overwrite = options == SupplyOptions::TransferData;
        let needs_marker = node.source.is_some();

        for offset in range.pages() {
            let Some(entry) = pages.pop() else {
                break;
            };
            if !overwrite && node.slots.contains_key(&offset) {
                // Existing content wins; the supplied page is freed
                continue;
            }
            match entry {
                SpliceEntry::Page(page) => {
                    node.slots
                        .insert(offset, PageSlot::Page(CommittedPage::new(Arc::new(page), supplied_state)));
                }
                SpliceEntry::Zero if needs_marker => {
                    node.slots.insert(offset, PageSlot::Zero(supplied_state));
                }
                SpliceEntry::Zero => {
                    node.slots.remove(&offset);
                }
            }
        }
        if overwrite && tracked {
            node.modified = true;
        }

        let op = if overwrite { RangeChangeOp::Unmap } else { RangeChangeOp::UnmapZeroPage };
        changes.push(self.change(range.offset, range.len, op));
        self.resolve_requests_locked(state);
        Ok(())
    }

    /// Complete every pending request whose range is now populated
    fn resolve_requests_locked(&self, state: &mut HierarchyState) {
        let CowNode {
            pending,
            slots,
            supply_zero_offset,
            size,
            ..
        } = self.node_mut(state);
        pending.retain(|req| {
            let (offset, len) = req.range();
            let populated = CowRange::new(offset, len)
                .pages()
                .all(|page| page >= *supply_zero_offset || page >= *size || slots.contains_key(&page));
            if populated {
                req.complete();
            }
            !populated
        });
    }

    pub(crate) fn fail_page_requests_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        error: VmError,
    ) -> VmResult<()> {
        let node = self.node_mut(state);
        if node.source.is_none() {
            return Err(VmError::NotSupported);
        }
        node.pending.retain(|req| {
            if req.overlaps(range.offset, range.len) {
                req.fail(error);
                false
            } else {
                true
            }
        });
        Ok(())
    }

    /// Disconnect the pager; outstanding and future requests fail
    pub(crate) fn detach_source_locked(&self, state: &mut HierarchyState) -> Option<Arc<dyn PageSource>> {
        let node = self.node_mut(state);
        if node.source.is_none() || node.source_detached {
            return None;
        }
        node.source_detached = true;
        for req in node.pending.drain(..) {
            req.fail(VmError::BadState);
        }
        node.source.clone()
    }

    // ------------------------------------------------------------------
    // Dirty tracking
    // ------------------------------------------------------------------

    /// Mark supplied content in `range` dirty
    pub(crate) fn dirty_pages_locked(&self, state: &mut HierarchyState, range: CowRange) -> VmResult<()> {
        let node = self.node_mut(state);
        if !node.is_dirty_tracked() {
            return Err(VmError::NotSupported);
        }
        if range
            .pages()
            .any(|offset| !node.slots.contains_key(&offset) && !node.in_zero_tail(offset))
        {
            return Err(VmError::NotFound);
        }
        for offset in range.pages() {
            match node.slots.get_mut(&offset) {
                Some(PageSlot::Page(committed)) => committed.dirty = DirtyState::Dirty,
                Some(PageSlot::Zero(marker)) => *marker = DirtyState::Dirty,
                // Zero tail, already dirty
                None => {}
            }
        }
        node.modified = true;
        Ok(())
    }

    /// Report runs of content awaiting writeback, coalescing adjacent runs of
    /// the same kind
    pub(crate) fn enumerate_dirty_ranges_locked(
        &self,
        state: &HierarchyState,
        range: CowRange,
        window_offset: u64,
        f: &mut DirtyRangeFn<'_>,
    ) -> VmResult<()> {
        let node = self.node(state);
        if !node.is_dirty_tracked() {
            return Err(VmError::NotSupported);
        }
        let mut run: Option<(u64, u64, bool)> = None;
        for offset in range.pages() {
            let class = match node.slots.get(&offset) {
                Some(PageSlot::Page(committed)) if committed.dirty.needs_writeback() => Some(false),
                Some(PageSlot::Zero(marker)) if marker.needs_writeback() => Some(true),
                None if node.in_zero_tail(offset) => Some(true),
                _ => None,
            };
            match (run, class) {
                (Some((start, len, zero)), Some(is_zero)) if zero == is_zero && start + len == offset => {
                    run = Some((start, len + PAGE_SIZE, zero));
                }
                (previous, class) => {
                    if let Some((start, len, zero)) = previous {
                        if f(start - window_offset, len, zero)?.is_break() {
                            return Ok(());
                        }
                    }
                    run = class.map(|is_zero| (offset, PAGE_SIZE, is_zero));
                }
            }
        }
        if let Some((start, len, zero)) = run {
            let _ = f(start - window_offset, len, zero)?;
        }
        Ok(())
    }

    /// Start writeback of `range`: dirty content becomes awaiting-clean
    ///
    /// With `is_zero_range` the caller writes the range back as zeros, and
    /// dirty frames that hold only zeros are released in favor of markers.
    pub(crate) fn writeback_begin_locked(
        &self,
        state: &mut HierarchyState,
        range: CowRange,
        is_zero_range: bool,
        changes: &mut RangeChangeList,
    ) -> VmResult<()> {
        let node = self.node_mut(state);
        if !node.is_dirty_tracked() {
            return Err(VmError::NotSupported);
        }
        let mut released = Vec::new();
        for offset in range.pages() {
            if node.in_zero_tail(offset) && !node.slots.contains_key(&offset) {
                node.slots.insert(offset, PageSlot::Zero(DirtyState::AwaitingClean));
                continue;
            }
            let release = is_zero_range
                && node.page(offset).is_some_and(|committed| {
                    committed.dirty == DirtyState::Dirty
                        && committed.pin_count == 0
                        && !committed.is_shared()
                        && committed.page.is_zero()
                });
            if release {
                node.slots.insert(offset, PageSlot::Zero(DirtyState::AwaitingClean));
                released.push(offset);
                continue;
            }
            match node.slots.get_mut(&offset) {
                Some(PageSlot::Page(committed)) if committed.dirty == DirtyState::Dirty => {
                    committed.dirty = DirtyState::AwaitingClean;
                }
                Some(PageSlot::Zero(marker)) if *marker == DirtyState::Dirty => *marker = DirtyState::AwaitingClean,
                _ => {}
            }
        }
        changes.push(self.change(range.offset, range.len, RangeChangeOp::RemoveWrite));
        for offset in released {
            changes.push(self.change(offset, PAGE_SIZE, RangeChangeOp::Unmap));
        }
        Ok(())
    }

    /// Finish writeback of `range`: awaiting-clean content becomes clean
    pub(crate) fn writeback_end_locked(&self, state: &mut HierarchyState, range: CowRange) -> VmResult<()> {
        let node = self.node_mut(state);
        if !node.is_dirty_tracked() {
            return Err(VmError::NotSupported);
        }
        for (_, slot) in node.slots.range_mut(range.offset..range.end()) {
            match slot {
                PageSlot::Page(committed) if committed.dirty == DirtyState::AwaitingClean => {
                    committed.dirty = DirtyState::Clean;
                }
                PageSlot::Zero(marker) if *marker == DirtyState::AwaitingClean => *marker = DirtyState::Clean,
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn query_pager_vmo_stats_locked(
        &self,
        state: &mut HierarchyState,
        reset: bool,
    ) -> VmResult<PagerVmoStats> {
        let node = self.node_mut(state);
        if node.source.is_none() {
            return Err(VmError::NotSupported);
        }
        let stats = PagerVmoStats { modified: node.modified };
        if reset {
            node.modified = false;
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Discardable content
    // ------------------------------------------------------------------

    pub(crate) fn lock_range_locked(&self, state: &mut HierarchyState, try_lock: bool) -> VmResult<VmoLockState> {
        let node = self.node_mut(state);
        let size = node.size;
        let Some(discardable) = node.discardable.as_mut() else {
            return Err(VmError::NotSupported);
        };
        let mut lock_state = VmoLockState {
            offset: 0,
            size,
            ..VmoLockState::default()
        };
        if discardable.discarded {
            if try_lock {
                return Err(VmError::Unavailable);
            }
            discardable.discarded = false;
            lock_state.discarded_size = size;
        }
        discardable.lock_count += 1;
        Ok(lock_state)
    }

    pub(crate) fn unlock_range_locked(&self, state: &mut HierarchyState) -> VmResult<()> {
        let Some(discardable) = self.node_mut(state).discardable.as_mut() else {
            return Err(VmError::NotSupported);
        };
        if discardable.lock_count == 0 {
            return Err(VmError::BadState);
        }
        discardable.lock_count -= 1;
        Ok(())
    }

    /// Throw away the content of an unlocked discardable store
    ///
    /// Returns the number of pages freed.
    pub(crate) fn discard_locked(&self, state: &mut HierarchyState, changes: &mut RangeChangeList) -> u64 {
        let node = self.node_mut(state);
        let eligible = node.discardable.as_ref().is_some_and(|d| d.lock_count == 0 && !d.discarded);
        if !eligible || node.any_pinned(CowRange::new(0, node.size)) {
            return 0;
        }
        let freed = mem::take(&mut node.slots)
            .into_values()
            .filter(|slot| matches!(slot, PageSlot::Page(_)))
            .count() as u64;
        if let Some(discardable) = node.discardable.as_mut() {
            discardable.discarded = true;
        }
        node.reclamation_events += 1;
        let size = node.size;
        changes.push(self.change(0, size, RangeChangeOp::Unmap));
        freed
    }

    /// Evict the clean page at `offset` of a pager-backed store
    pub(crate) fn debug_evict_locked(
        &self,
        state: &mut HierarchyState,
        offset: u64,
        changes: &mut RangeChangeList,
    ) -> bool {
        let node = self.node_mut(state);
        if node.source.is_none() || node.source_detached {
            return false;
        }
        let evictable = node.page(offset).is_some_and(|committed| {
            committed.pin_count == 0
                && !committed.always_need
                && !committed.is_shared()
                && matches!(committed.dirty, DirtyState::Clean | DirtyState::Untracked)
        });
        if !evictable {
            return false;
        }
        node.slots.remove(&offset);
        node.reclamation_events += 1;
        changes.push(self.change(offset, PAGE_SIZE, RangeChangeOp::UnmapAndHarvest));
        true
    }

    pub(crate) fn hint_range_locked(&self, state: &mut HierarchyState, range: CowRange, hint: EvictionHint) {
        let always_need = hint == EvictionHint::AlwaysNeed;
        for (_, slot) in self.node_mut(state).slots.range_mut(range.offset..range.end()) {
            if let PageSlot::Page(committed) = slot {
                committed.always_need = always_need;
            }
        }
    }

    // ------------------------------------------------------------------
    // Clones
    // ------------------------------------------------------------------

    /// Offsets of this store (within `range`) whose content is a frame
    /// somewhere along the parent chain
    fn visible_committed_offsets(&self, state: &HierarchyState, range: CowRange) -> BTreeSet<u64> {
        let mut offsets = BTreeSet::new();
        let mut node_id = self.id;
        let (mut start, mut end) = (range.offset, range.end());
        let mut shift = 0u64;
        loop {
            let node = state.node(node_id);
            for (&offset, slot) in node.slots.range(start..end) {
                if matches!(slot, PageSlot::Page(_)) {
                    offsets.insert(offset - shift);
                }
            }
            let Some(link) = node.parent else {
                break;
            };
            end = end.min(link.limit);
            if start >= end {
                break;
            }
            start += link.offset;
            end += link.offset;
            shift += link.offset;
            node_id = link.node;
        }
        offsets
    }

    /// Create a child store of `size` bytes starting at `offset` of this one
    ///
    /// Only `[offset, offset + limit)` of this store is visible to the
    /// child. Returns the new node and whether it links to this store.
    pub(crate) fn create_clone_locked(
        &self,
        state: &mut HierarchyState,
        snapshot: SnapshotType,
        offset: u64,
        size: u64,
        limit: u64,
        changes: &mut RangeChangeList,
    ) -> (CowId, bool) {
        let child_id = CowId::new();
        let mut child = CowNode::new(size, CowFlags::empty());
        let visible = CowRange::new(offset, size.min(limit));

        let linked = snapshot != SnapshotType::Full;
        if snapshot != SnapshotType::OnWrite {
            for parent_offset in self.visible_committed_offsets(state, visible) {
                let PageLocation::Committed { node, offset: owner_offset } =
                    self.find_page_locked(state, parent_offset)
                else {
                    continue;
                };
                let owner = state.node(node);
                let Some(committed) = owner.page(owner_offset) else {
                    continue;
                };
                if snapshot == SnapshotType::Modified && owner.source.is_some() {
                    // Pager content stays a live view
                    continue;
                }
                let page = if committed.pin_count > 0 {
                    Arc::new(VmPage::copy_of(&committed.page))
                } else {
                    Arc::clone(&committed.page)
                };
                child
                    .slots
                    .insert(parent_offset - offset, PageSlot::Page(CommittedPage::new(page, DirtyState::Untracked)));
            }
            if snapshot == SnapshotType::Modified {
                // Zeroed content is a modification too
                for (&parent_offset, slot) in self.node(state).slots.range(visible.offset..visible.end()) {
                    if matches!(slot, PageSlot::Zero(_)) {
                        child
                            .slots
                            .insert(parent_offset - offset, PageSlot::Zero(DirtyState::Untracked));
                    }
                }
            }
            if !visible.is_empty() {
                changes.push(self.change(visible.offset, visible.len, RangeChangeOp::RemoveWrite));
            }
        }
        if linked {
            child.parent = Some(ParentLink {
                node: self.id,
                offset,
                limit,
            });
            self.node_mut(state).children.push(child_id);
        }
        state.nodes.insert(child_id, child);
        (child_id, linked)
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    pub(crate) fn attributed_memory_locked(&self, state: &HierarchyState, range: CowRange) -> AttributionCounts {
        let mut counts = AttributionCounts::default();
        for (_, slot) in self.node(state).slots.range(range.offset..range.end()) {
            if let PageSlot::Page(committed) = slot {
                counts.committed_bytes += PAGE_SIZE;
                if !committed.is_shared() {
                    counts.private_bytes += PAGE_SIZE;
                }
            }
        }
        counts
    }

    pub(crate) fn heap_allocation_bytes_locked(&self, state: &HierarchyState) -> u64 {
        let node = self.node(state);
        (node.slots.len() * mem::size_of::<(u64, PageSlot)>()
            + node.pending.len() * mem::size_of::<Arc<PageRequest>>()
            + node.children.len() * mem::size_of::<CowId>()) as u64
    }

    pub(crate) fn reclamation_event_count_locked(&self, state: &HierarchyState) -> u64 {
        self.node(state).reclamation_events
    }

    pub(crate) fn lookup_depth_locked(&self, state: &HierarchyState) -> u32 {
        let mut depth = 0;
        let mut node = self.node(state);
        while let Some(link) = node.parent {
            depth += 1;
            node = state.node(link.node);
        }
        depth
    }

    pub(crate) fn change_high_priority_count_locked(&self, state: &mut HierarchyState, delta: i64) {
        let node = self.node_mut(state);
        node.high_priority_count += delta;
        assert!(node.high_priority_count >= 0, "high priority count underflow");
    }

    pub(crate) fn is_high_priority_locked(&self, state: &HierarchyState) -> bool {
        self.node(state).high_priority_count > 0
    }

    pub(crate) fn dump_locked(&self, state: &HierarchyState, depth: u32) {
        let node = self.node(state);
        let committed = node.slots.values().filter(|slot| matches!(slot, PageSlot::Page(_))).count();
        log::info!(
            "{:indent$}cow {:?} size {:#x} committed {} markers {} parent {:?} children {} pending {}",
            "",
            self.id,
            node.size,
            committed,
            node.slots.len() - committed,
            node.parent.map(|link| link.node),
            node.children.len(),
            node.pending.len(),
            indent = depth as usize * 2,
        );
    }

    fn change(&self, offset: u64, len: u64, op: RangeChangeOp) -> RangeChange {
        RangeChange {
            node: self.id,
            range: CowRange::new(offset, len),
            op,
        }
    }
}

impl DeferredDelete for VmCowPages {
    fn delete_queue() -> &'static DeferredDeleteQueue<Self> {
        &COW_PAGES_DELETE_QUEUE
    }

    fn deferred_delete_state(&self) -> &DeferredDeleteState {
        &self.delete_state
    }
}

impl Drop for VmCowPages {
    fn drop(&mut self) {
        let removed = {
            let mut state = self.hierarchy.lock();
            let removed = state.nodes.remove(&self.id);
            if let Some(link) = removed.as_ref().and_then(|node| node.parent) {
                if let Some(parent) = state.nodes.get_mut(&link.node) {
                    parent.children.retain(|&child| child != self.id);
                }
            }
            removed
        };
        // Frames and the pager are released with the lock dropped
        if let Some(node) = removed {
            for req in &node.pending {
                req.fail(VmError::BadState);
            }
            drop(node);
        }
        if let Some(parent) = self.parent.take() {
            deferred_release(parent);
        }
    }
}

impl fmt::Debug for VmCowPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmCowPages")
            .field("id", &self.id)
            .field("hierarchy", &self.hierarchy.id())
            .finish()
    }
}
