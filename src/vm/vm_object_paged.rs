//! Paged VM Objects
//!
//! [`VmObjectPaged`] is a window onto a copy-on-write page store. Fresh
//! objects and copy-on-write clones own a store of their own; slices and
//! references share their parent's store through a window that never
//! widens. Whichever object of a store currently receives its range change
//! notifications is the store's owner, and it keeps the list of the others.
//!
//! ## Waiting on pagers
//!
//! Operations that may need pager content run in a loop: take the
//! hierarchy lock, do as much as possible, and if a page request is
//! outstanding drop the lock, wait on the request and try again. Mappings
//! are updated for every change before the lock is dropped.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::vm::deferred_delete::{deferred_release, DeferredDelete, DeferredDeleteQueue, DeferredDeleteState};
use crate::vm::hierarchy::{HierarchyState, VmHierarchy};
use crate::vm::page_request::{MultiPageRequest, PageSource, Resolution};
use crate::vm::pmm::{self, VmPage, ZERO_PAGE_PADDR};
use crate::vm::registry;
use crate::vm::user_copy::{UserInPtr, UserOutPtr};
use crate::vm::vm_cow_pages::{CowFlags, CowRange, PageLocation, RangeChange, RangeChangeList, VmCowPages, VmPageSpliceList};
use crate::vm::vm_object::{
    round_size, AttributionCounts, CachePolicy, ChildType, ContentSizeManager, DirtyRangeFn, EvictionHint, LookupFn,
    ObjectLockedState, PageFaultFlags, PageInfo, PagerVmoStats, RangeChangeOp, ReadWriteOptions, Resizability,
    SnapshotType, SupplyOptions, VmObject, VmObjectBase, VmObjectId, VmoKind, VmoLockState,
};
use crate::vm::{in_range, is_page_aligned, round_down_page, round_range_out, round_up_page, PAGE_SIZE};

bitflags! {
    /// Paged object options
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagedOptions: u32 {
        const RESIZABLE = 1 << 0;
        const CONTIGUOUS = 1 << 1;
        const SLICE = 1 << 3;
        const DISCARDABLE = 1 << 4;
        const ALWAYS_PINNED = 1 << 5;
        const REFERENCE = 1 << 6;
        const CAN_BLOCK_ON_PAGE_REQUESTS = 1 << 31;
    }
}

static ZERO_PAGE: [u8; PAGE_SIZE as usize] = [0; PAGE_SIZE as usize];

static PAGED_DELETE_QUEUE: DeferredDeleteQueue<VmObjectPaged> = DeferredDeleteQueue::new();

/// Paged virtual memory object
pub struct VmObjectPaged {
    base: VmObjectBase,
    options: PagedOptions,
    cow_pages: Arc<VmCowPages>,
    /// Store offset of object offset zero
    window_offset: u64,
    /// Slice length; other objects track the store size
    window_len: Option<u64>,
    /// Object this one was derived from, never an owning edge
    parent: Mutex<Option<Weak<VmObjectPaged>>>,
    delete_state: DeferredDeleteState,
    self_ref: Weak<VmObjectPaged>,
}

// ============================================================================
// Creation
// ============================================================================

impl VmObjectPaged {
    /// Create an anonymous object of `size` bytes, rounded up to a page
    pub fn create(options: PagedOptions, size: u64) -> VmResult<Arc<Self>> {
        let derived_only = PagedOptions::CONTIGUOUS
            | PagedOptions::SLICE
            | PagedOptions::REFERENCE
            | PagedOptions::ALWAYS_PINNED;
        if options.intersects(derived_only) {
            return Err(VmError::InvalidArgs);
        }
        if options.contains(PagedOptions::DISCARDABLE | PagedOptions::RESIZABLE) {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        let hierarchy = VmHierarchy::new();
        let flags = if options.contains(PagedOptions::DISCARDABLE) {
            CowFlags::DISCARDABLE
        } else {
            CowFlags::empty()
        };
        let cow_pages = VmCowPages::new_root(&hierarchy, size, flags, None);
        let vmo = Self::create_common(options, cow_pages, 0, None, None, true);
        log::trace!("created vmo {:?} size {:#x} options {:?}", vmo.id(), size, options);
        Ok(vmo)
    }

    /// Create an object backed by physically contiguous, committed pages
    pub fn create_contiguous(size: u64, alignment_log2: u8) -> VmResult<Arc<Self>> {
        if size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        let pages = pmm::alloc_contiguous(size / PAGE_SIZE, alignment_log2)?;
        let hierarchy = VmHierarchy::new();
        let cow_pages = VmCowPages::new_root(&hierarchy, size, CowFlags::empty(), None);
        cow_pages.populate_locked(&mut hierarchy.lock(), pages, false);
        Ok(Self::create_common(PagedOptions::CONTIGUOUS, cow_pages, 0, None, None, true))
    }

    /// Create an object over pages the caller already owns and keeps pinned
    pub fn create_from_wired_pages(pages: Vec<VmPage>) -> VmResult<Arc<Self>> {
        let size = round_size(pages.len() as u64 * PAGE_SIZE)?;
        let hierarchy = VmHierarchy::new();
        let cow_pages = VmCowPages::new_root(&hierarchy, size, CowFlags::ALWAYS_PINNED, None);
        cow_pages.populate_locked(&mut hierarchy.lock(), pages, true);
        Ok(Self::create_common(PagedOptions::ALWAYS_PINNED, cow_pages, 0, None, None, true))
    }

    /// Create an object whose content is supplied by `source`
    pub fn create_external(source: Arc<dyn PageSource>, options: PagedOptions, size: u64) -> VmResult<Arc<Self>> {
        if options.intersects(!(PagedOptions::RESIZABLE | PagedOptions::CAN_BLOCK_ON_PAGE_REQUESTS)) {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        let flags = if source.properties().dirty_tracked {
            CowFlags::DIRTY_TRACKED
        } else {
            CowFlags::empty()
        };
        let hierarchy = VmHierarchy::new();
        let cow_pages = VmCowPages::new_root(&hierarchy, size, flags, Some(source));
        let options = options | PagedOptions::CAN_BLOCK_ON_PAGE_REQUESTS;
        let vmo = Self::create_common(options, cow_pages, 0, None, None, true);
        log::trace!("created pager-backed vmo {:?} size {:#x}", vmo.id(), size);
        Ok(vmo)
    }

    fn create_common(
        options: PagedOptions,
        cow_pages: Arc<VmCowPages>,
        window_offset: u64,
        window_len: Option<u64>,
        parent: Option<&VmObjectPaged>,
        owns_store: bool,
    ) -> Arc<Self> {
        let hierarchy = Arc::clone(cow_pages.hierarchy());
        let vmo = Arc::new_cyclic(|self_ref| Self {
            base: VmObjectBase::new(hierarchy),
            options,
            cow_pages,
            window_offset,
            window_len,
            parent: Mutex::new(parent.map(|p| p.self_ref.clone())),
            delete_state: DeferredDeleteState::new(),
            self_ref: self_ref.clone(),
        });

        let id = vmo.id();
        let window = CowRange::new(window_offset, window_len.unwrap_or(u64::MAX - window_offset));
        {
            let mut state = vmo.lock();
            state.objects.insert(id, ObjectLockedState::new(window));
            let owner = vmo.cow_pages.owner_locked(&state);
            match owner {
                Some(owner) if !owns_store => match state.object_mut(owner) {
                    Some(owner_state) => owner_state.references.push(id),
                    None => panic!("store owner {:?} has no locked state", owner),
                },
                _ => vmo.cow_pages.set_owner_locked(&mut state, Some(id)),
            }
        }
        registry::add_to_global_list(&vmo);
        vmo
    }

    /// Release a reference through the deferred deleter
    pub fn release(vmo: Arc<Self>) {
        deferred_release(vmo);
    }

    pub fn options(&self) -> PagedOptions {
        self.options
    }

    fn shares_parent_store(&self) -> bool {
        self.options.intersects(PagedOptions::SLICE | PagedOptions::REFERENCE)
    }

    fn parent_object(&self) -> Option<Arc<VmObjectPaged>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Register `child` and return whether it is the first
    fn link_child(&self, child: &Arc<VmObjectPaged>) -> bool {
        let weak = Arc::downgrade(child);
        let weak: Weak<dyn VmObject> = weak;
        self.add_child(child.id(), weak)
    }
}

// ============================================================================
// Derivation
// ============================================================================

impl VmObjectPaged {
    /// Create a copy-on-write clone of `[offset, offset + size)`
    pub fn create_paged_clone(
        &self,
        resizable: Resizability,
        snapshot: SnapshotType,
        offset: u64,
        size: u64,
        copy_name: bool,
    ) -> VmResult<Arc<VmObjectPaged>> {
        if !is_page_aligned(offset) {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        if self.options.intersects(PagedOptions::CONTIGUOUS | PagedOptions::DISCARDABLE) {
            return Err(VmError::NotSupported);
        }

        let (child_id, linked) = {
            let mut state = self.lock();
            let parent_size = self.size_locked(&state);
            if self.options.contains(PagedOptions::SLICE) && !in_range(offset, size, parent_size) {
                return Err(VmError::OutOfRange);
            }
            let snapshot = match snapshot {
                SnapshotType::OnWrite => SnapshotType::OnWrite,
                requested => {
                    let pager_backed = self.cow_pages.root_has_source_locked(&state);
                    match requested {
                        SnapshotType::Full if pager_backed => return Err(VmError::NotSupported),
                        SnapshotType::Modified if !pager_backed => SnapshotType::Full,
                        other => other,
                    }
                }
            };
            let limit = parent_size.saturating_sub(offset);
            let mut changes = RangeChangeList::new();
            let created = self.cow_pages.create_clone_locked(
                &mut state,
                snapshot,
                self.window_offset + offset,
                size,
                limit,
                &mut changes,
            );
            self.apply_range_changes_locked(&state, &changes);
            created
        };

        let child_cow = VmCowPages::new_child(&self.cow_pages, child_id, linked);
        let mut options = self.options & PagedOptions::CAN_BLOCK_ON_PAGE_REQUESTS;
        if resizable == Resizability::Resizable {
            options |= PagedOptions::RESIZABLE;
        }
        let child = Self::create_common(options, child_cow, 0, None, Some(self), true);
        if copy_name {
            child.set_name(&self.name());
        }
        self.link_child(&child);
        log::debug!(
            "vmo {:?} cloned into {:?} ({:?}, offset {:#x}, size {:#x})",
            self.id(),
            child.id(),
            snapshot,
            offset,
            size
        );
        Ok(child)
    }

    /// Create a slice sharing `[offset, offset + size)` of this object
    pub fn create_paged_slice(&self, offset: u64, size: u64, copy_name: bool) -> VmResult<Arc<VmObjectPaged>> {
        if !is_page_aligned(offset) || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        if self.options.intersects(PagedOptions::RESIZABLE | PagedOptions::DISCARDABLE) {
            return Err(VmError::NotSupported);
        }
        if !in_range(offset, size, self.size()) {
            return Err(VmError::OutOfRange);
        }
        let inherited = self.options
            & (PagedOptions::CONTIGUOUS | PagedOptions::ALWAYS_PINNED | PagedOptions::CAN_BLOCK_ON_PAGE_REQUESTS);
        let child = Self::create_common(
            PagedOptions::SLICE | inherited,
            Arc::clone(&self.cow_pages),
            self.window_offset + offset,
            Some(size),
            Some(self),
            false,
        );
        if copy_name {
            child.set_name(&self.name());
        }
        self.link_child(&child);
        log::debug!("vmo {:?} sliced into {:?} [{:#x}, {:#x})", self.id(), child.id(), offset, offset + size);
        Ok(child)
    }

    /// Create a reference to the whole object
    ///
    /// Returns the reference and whether it is this object's first child.
    pub fn create_paged_reference(
        &self,
        resizable: Resizability,
        offset: u64,
        size: u64,
        copy_name: bool,
    ) -> VmResult<(Arc<VmObjectPaged>, bool)> {
        if offset != 0 || size != 0 {
            return Err(VmError::InvalidArgs);
        }
        if self.options.contains(PagedOptions::SLICE) {
            return Err(VmError::NotSupported);
        }
        if resizable == Resizability::Resizable && !self.is_resizable() {
            return Err(VmError::NotSupported);
        }
        let mut options = PagedOptions::REFERENCE
            | (self.options
                & (PagedOptions::CONTIGUOUS
                    | PagedOptions::DISCARDABLE
                    | PagedOptions::ALWAYS_PINNED
                    | PagedOptions::CAN_BLOCK_ON_PAGE_REQUESTS));
        if resizable == Resizability::Resizable {
            options |= PagedOptions::RESIZABLE;
        }
        let child = Self::create_common(options, Arc::clone(&self.cow_pages), self.window_offset, None, Some(self), false);
        if copy_name {
            child.set_name(&self.name());
        }
        let first = self.link_child(&child);
        log::debug!("vmo {:?} referenced by {:?}", self.id(), child.id());
        Ok((child, first))
    }
}

// ============================================================================
// Range Changes
// ============================================================================

impl VmObjectPaged {
    /// Apply recorded changes to every mapping that can observe them
    ///
    /// A change to a store reaches the store's owner, the owner's slices and
    /// references, and every copy-on-write descendant that reads the changed
    /// range through its parent link.
    pub(crate) fn apply_range_changes_locked(&self, state: &HierarchyState, changes: &[RangeChange]) {
        let mut work: Vec<RangeChange> = changes.to_vec();
        while let Some(change) = work.pop() {
            let Some(node) = state.nodes.get(&change.node) else {
                continue;
            };
            if let Some(owner) = node.owner {
                Self::notify_store_users_locked(state, owner, change.range, change.op);
            }
            for &child in &node.children {
                let Some(link) = state.node(child).parent else {
                    continue;
                };
                if let Some(hit) = change.range.intersect(CowRange::new(link.offset, link.limit)) {
                    work.push(RangeChange {
                        node: child,
                        range: CowRange::new(hit.offset - link.offset, hit.len),
                        op: change.op,
                    });
                }
            }
        }
    }

    fn notify_store_users_locked(state: &HierarchyState, owner: VmObjectId, range: CowRange, op: RangeChangeOp) {
        let Some(owner_state) = state.object(owner) else {
            return;
        };
        owner_state.update_mappings_for_cow_range(range, op);
        for reference in &owner_state.references {
            if let Some(reference_state) = state.object(*reference) {
                reference_state.update_mappings_for_cow_range(range, op);
            }
        }
    }

    /// Apply `op` to mappings of this object and of the other objects
    /// sharing its store, for object range `[offset, offset + len)`
    pub fn range_change_update_locked(&self, state: &HierarchyState, offset: u64, len: u64, op: RangeChangeOp) {
        let range = CowRange::new(self.window_offset + offset, len);
        match self.cow_pages.owner_locked(state) {
            Some(owner) => Self::notify_store_users_locked(state, owner, range, op),
            None => self.range_change_update_mappings_locked(state, offset, len, op),
        }
    }

    /// Apply `op` for object range `[offset, offset + len)` everywhere the
    /// store's content is visible, copy-on-write descendants included
    pub fn forward_range_change_update_locked(&self, state: &HierarchyState, offset: u64, len: u64, op: RangeChangeOp) {
        let change = RangeChange {
            node: self.cow_pages.id(),
            range: CowRange::new(self.window_offset + offset, len),
            op,
        };
        self.apply_range_changes_locked(state, &[change]);
    }

    /// Translate an object range into the store, failing outside the object
    fn translate_locked(&self, state: &HierarchyState, offset: u64, len: u64) -> VmResult<CowRange> {
        if !in_range(offset, len, self.size_locked(state)) {
            return Err(VmError::OutOfRange);
        }
        Ok(CowRange::new(self.window_offset + offset, len))
    }

    /// Translate, first rounding the range out to page boundaries
    fn translate_rounded_locked(&self, state: &HierarchyState, offset: u64, len: u64) -> VmResult<CowRange> {
        if !in_range(offset, len, self.size_locked(state)) {
            return Err(VmError::OutOfRange);
        }
        let (start, rounded) = round_range_out(offset, len).ok_or(VmError::OutOfRange)?;
        self.translate_locked(state, start, rounded)
    }

    fn check_aligned(offset: u64, len: u64) -> VmResult<()> {
        if is_page_aligned(offset) && is_page_aligned(len) {
            Ok(())
        } else {
            Err(VmError::InvalidArgs)
        }
    }

    /// Run `op` under the lock until it completes, waiting on page requests
    /// with the lock dropped
    fn run_with_requests<T, F>(&self, mut op: F) -> VmResult<T>
    where
        F: FnMut(&mut HierarchyState, &mut MultiPageRequest, &mut RangeChangeList) -> VmResult<Resolution<T>>,
    {
        let mut request = MultiPageRequest::new(true);
        loop {
            let result = {
                let mut state = self.lock();
                let mut changes = RangeChangeList::new();
                let result = op(&mut *state, &mut request, &mut changes);
                self.apply_range_changes_locked(&state, &changes);
                result
            };
            match result? {
                Resolution::Ready(value) => return Ok(value),
                Resolution::Continue | Resolution::ShouldWait => request.wait()?,
            }
        }
    }

    /// Run `op` once under the lock and apply its range changes
    fn with_changes<T, F>(&self, op: F) -> VmResult<T>
    where
        F: FnOnce(&mut HierarchyState, &mut RangeChangeList) -> VmResult<T>,
    {
        let mut state = self.lock();
        let mut changes = RangeChangeList::new();
        let result = op(&mut *state, &mut changes);
        self.apply_range_changes_locked(&state, &changes);
        result
    }
}

// ============================================================================
// Data Movement
// ============================================================================

impl VmObjectPaged {
    /// Feed `[offset, offset + len)` to `sink(position, bytes)` a page at a time
    fn read_chunks<F>(&self, offset: u64, len: u64, mut sink: F) -> VmResult<()>
    where
        F: FnMut(usize, &[u8]) -> VmResult<()>,
    {
        let mut request = MultiPageRequest::new(false);
        let mut pos = 0u64;
        while pos < len {
            let current = offset + pos;
            let page_offset = current % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(len - pos);
            let copied = {
                let mut state = self.lock();
                let range = self.translate_locked(&state, current, chunk)?;
                let page = round_down_page(range.offset);
                let start = page_offset as usize;
                let end = start + chunk as usize;
                match self.cow_pages.locate_page_locked(&mut state, page, &mut request)? {
                    Resolution::Ready(PageLocation::Committed { node, offset }) => {
                        sink(pos as usize, &VmCowPages::page_data(&state, node, offset)[start..end])?;
                        true
                    }
                    Resolution::Ready(_) => {
                        sink(pos as usize, &ZERO_PAGE[start..end])?;
                        true
                    }
                    Resolution::ShouldWait | Resolution::Continue => false,
                }
            };
            if copied {
                pos += chunk;
            } else {
                request.wait()?;
            }
        }
        Ok(())
    }

    /// Fill `[offset, offset + len)` from `source(position, bytes)` a page at
    /// a time; `on_chunk(offset, len)` runs under the lock after each chunk
    fn write_chunks<F>(
        &self,
        offset: u64,
        len: u64,
        mut source: F,
        mut on_chunk: Option<&mut dyn FnMut(u64, usize)>,
    ) -> VmResult<()>
    where
        F: FnMut(usize, &mut [u8]) -> VmResult<()>,
    {
        let mut request = MultiPageRequest::new(false);
        let mut pos = 0u64;
        while pos < len {
            let current = offset + pos;
            let page_offset = current % PAGE_SIZE;
            let chunk = (PAGE_SIZE - page_offset).min(len - pos);
            let copied = {
                let mut state = self.lock();
                let range = self.translate_locked(&state, current, chunk)?;
                let page = round_down_page(range.offset);
                let mut changes = RangeChangeList::new();
                let result = self.cow_pages.writable_page_locked(&mut state, page, &mut request, &mut changes);
                self.apply_range_changes_locked(&state, &changes);
                match result? {
                    Resolution::Ready(()) => {
                        let start = page_offset as usize;
                        let data = self.cow_pages.page_data_mut(&mut state, page);
                        source(pos as usize, &mut data[start..start + chunk as usize])?;
                        if let Some(callback) = on_chunk.as_deref_mut() {
                            callback(current, chunk as usize);
                        }
                        true
                    }
                    Resolution::ShouldWait | Resolution::Continue => false,
                }
            };
            if copied {
                pos += chunk;
            } else {
                request.wait()?;
            }
        }
        Ok(())
    }

    /// Length to copy for a user transfer, honoring `TRIM_LENGTH`
    fn user_copy_len(&self, offset: u64, len: usize, options: ReadWriteOptions) -> VmResult<u64> {
        let size = self.size();
        let len = len as u64;
        if options.contains(ReadWriteOptions::TRIM_LENGTH) {
            if offset > size {
                return Err(VmError::OutOfRange);
            }
            return Ok(len.min(size - offset));
        }
        if !in_range(offset, len, size) {
            return Err(VmError::OutOfRange);
        }
        Ok(len)
    }

    fn zero_partial_page(&self, offset: u64, len: u64) -> VmResult<()> {
        self.write_chunks(
            offset,
            len,
            |_, dst| {
                dst.fill(0);
                Ok(())
            },
            None,
        )
    }

    fn zero_range_common(&self, offset: u64, len: u64, dirty_track: bool) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }
        // Stores that must keep their frames are zeroed in place
        if self.options.intersects(PagedOptions::CONTIGUOUS | PagedOptions::ALWAYS_PINNED) {
            return self.zero_partial_page(offset, len);
        }

        let end = offset + len;
        let first_full = round_up_page(offset).ok_or(VmError::OutOfRange)?;
        let last_full = round_down_page(end);
        if first_full >= last_full {
            return self.zero_partial_page(offset, len);
        }
        if offset < first_full {
            self.zero_partial_page(offset, first_full - offset)?;
        }
        self.with_changes(|state, changes| {
            let range = self.translate_locked(state, first_full, last_full - first_full)?;
            self.cow_pages.zero_range_locked(state, range, dirty_track, changes);
            Ok(())
        })?;
        if last_full < end {
            self.zero_partial_page(last_full, end - last_full)?;
        }
        Ok(())
    }
}

// ============================================================================
// Stream Size and Diagnostics
// ============================================================================

impl VmObjectPaged {
    /// Content size reported by the stream size manager, if one is attached
    pub fn user_stream_size_locked(&self, state: &HierarchyState) -> Option<u64> {
        state
            .object(self.id())
            .and_then(|object| object.stream_size.as_ref())
            .map(|csm| csm.content_size())
    }

    /// Stream size clamped to the object size
    pub fn saturating_stream_size_locked(&self, state: &HierarchyState) -> Option<u64> {
        self.user_stream_size_locked(state)
            .map(|content| content.min(self.size_locked(state)))
    }

    /// Physical address of the page committed at `offset`, if any
    pub fn debug_get_page(&self, offset: u64) -> Option<u64> {
        let state = self.lock();
        let range = self.translate_locked(&state, round_down_page(offset), PAGE_SIZE).ok()?;
        match self.cow_pages.find_page_locked(&state, range.offset) {
            PageLocation::Committed { node, offset } => Some(self.cow_pages.page_info_locked(&state, node, offset).paddr),
            _ => None,
        }
    }

    /// Reclaim the content of an unlocked discardable object
    ///
    /// Returns the number of pages freed.
    pub fn debug_discard(&self) -> u64 {
        let freed = self.with_changes(|state, changes| Ok(self.cow_pages.discard_locked(state, changes)));
        let freed = freed.unwrap_or(0);
        if freed > 0 {
            log::debug!("vmo {:?} discarded {} pages", self.id(), freed);
        }
        freed
    }

    /// Evict the clean pager-supplied page at `offset`
    pub fn debug_evict(&self, offset: u64) -> bool {
        self.with_changes(|state, changes| {
            let range = self.translate_locked(state, round_down_page(offset), PAGE_SIZE)?;
            Ok(self.cow_pages.debug_evict_locked(state, range.offset, changes))
        })
        .unwrap_or(false)
    }
}

// ============================================================================
// VmObject
// ============================================================================

impl VmObject for VmObjectPaged {
    fn base(&self) -> &VmObjectBase {
        &self.base
    }

    fn kind(&self) -> VmoKind {
        VmoKind::Paged
    }

    fn size_locked(&self, state: &HierarchyState) -> u64 {
        let store = self.cow_pages.size_locked(state).saturating_sub(self.window_offset);
        self.window_len.map_or(store, |len| len.min(store))
    }

    fn is_contiguous(&self) -> bool {
        self.options.contains(PagedOptions::CONTIGUOUS)
    }

    fn is_resizable(&self) -> bool {
        self.options.contains(PagedOptions::RESIZABLE)
    }

    fn is_discardable(&self) -> bool {
        self.options.contains(PagedOptions::DISCARDABLE)
    }

    fn is_user_pager_backed(&self) -> bool {
        let state = self.lock();
        self.cow_pages.root_has_source_locked(&state)
    }

    fn is_dirty_tracked(&self) -> bool {
        let state = self.lock();
        self.cow_pages.is_dirty_tracked_locked(&state)
    }

    fn resize(&self, size: u64) -> VmResult<()> {
        if !self.is_resizable() {
            return Err(VmError::NotSupported);
        }
        let size = round_size(size)?;
        self.with_changes(|state, changes| {
            let store_size = self.window_offset.checked_add(size).ok_or(VmError::OutOfRange)?;
            self.cow_pages.resize_locked(state, store_size, changes)
        })?;
        log::trace!("vmo {:?} resized to {:#x}", self.id(), size);
        Ok(())
    }

    fn commit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.run_with_requests(|state, request, changes| {
            let range = self.translate_rounded_locked(state, offset, len)?;
            self.cow_pages.commit_range_locked(state, range, false, false, request, changes)
        })
    }

    fn prefetch_range(&self, offset: u64, len: u64) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.run_with_requests(|state, request, _| {
            let range = self.translate_rounded_locked(state, offset, len)?;
            self.cow_pages.prefetch_range_locked(state, range, request)
        })
    }

    fn commit_range_pinned(&self, offset: u64, len: u64, write: bool) -> VmResult<()> {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        Self::check_aligned(offset, len)?;
        self.run_with_requests(|state, request, changes| {
            let range = self.translate_locked(state, offset, len)?;
            self.cow_pages.commit_range_locked(state, range, true, write, request, changes)
        })
    }

    fn decommit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        if self.options.intersects(PagedOptions::CONTIGUOUS | PagedOptions::ALWAYS_PINNED) {
            return Err(VmError::NotSupported);
        }
        if len == 0 {
            return Ok(());
        }
        self.with_changes(|state, changes| {
            let range = self.translate_rounded_locked(state, offset, len)?;
            self.cow_pages.decommit_range_locked(state, range, changes)
        })
    }

    fn zero_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.zero_range_common(offset, len, true)
    }

    fn zero_range_untracked(&self, offset: u64, len: u64) -> VmResult<()> {
        Self::check_aligned(offset, len)?;
        self.zero_range_common(offset, len, false)
    }

    fn unpin(&self, offset: u64, len: u64) {
        assert!(is_page_aligned(offset) && is_page_aligned(len), "unpin range must be page aligned");
        if len == 0 {
            return;
        }
        let mut state = self.lock();
        let range = match self.translate_locked(&state, offset, len) {
            Ok(range) => range,
            Err(_) => panic!("unpin of [{:#x}, +{:#x}) outside vmo {:?}", offset, len, self.id()),
        };
        self.cow_pages.unpin_locked(&mut state, range);
        #[cfg(debug_assertions)]
        self.range_change_update_locked(&state, offset, len, RangeChangeOp::DebugUnpin);
    }

    fn debug_is_range_pinned(&self, offset: u64, len: u64) -> bool {
        let state = self.lock();
        match self.translate_locked(&state, offset, len) {
            Ok(range) => self.cow_pages.debug_is_range_pinned_locked(&state, range),
            Err(_) => false,
        }
    }

    fn try_lock_range(&self, offset: u64, len: u64) -> VmResult<()> {
        if !self.is_discardable() {
            return Err(VmError::NotSupported);
        }
        let mut state = self.lock();
        if offset != 0 || len != self.size_locked(&state) {
            return Err(VmError::OutOfRange);
        }
        self.cow_pages.lock_range_locked(&mut state, true).map(|_| ())
    }

    fn lock_range(&self, offset: u64, len: u64) -> VmResult<VmoLockState> {
        if !self.is_discardable() {
            return Err(VmError::NotSupported);
        }
        let mut state = self.lock();
        if offset != 0 || len != self.size_locked(&state) {
            return Err(VmError::OutOfRange);
        }
        self.cow_pages.lock_range_locked(&mut state, false)
    }

    fn unlock_range(&self, offset: u64, len: u64) -> VmResult<()> {
        if !self.is_discardable() {
            return Err(VmError::NotSupported);
        }
        let mut state = self.lock();
        if offset != 0 || len != self.size_locked(&state) {
            return Err(VmError::OutOfRange);
        }
        self.cow_pages.unlock_range_locked(&mut state)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> VmResult<()> {
        let len = buf.len() as u64;
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }
        self.read_chunks(offset, len, |pos, src| {
            buf[pos..pos + src.len()].copy_from_slice(src);
            Ok(())
        })
    }

    fn write(&self, buf: &[u8], offset: u64) -> VmResult<()> {
        let len = buf.len() as u64;
        if !in_range(offset, len, self.size()) {
            return Err(VmError::OutOfRange);
        }
        self.write_chunks(
            offset,
            len,
            |pos, dst| {
                let count = dst.len();
                dst.copy_from_slice(&buf[pos..pos + count]);
                Ok(())
            },
            None,
        )
    }

    fn lookup(&self, offset: u64, len: u64, f: &mut LookupFn<'_>) -> VmResult<()> {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        let state = self.lock();
        let range = self.translate_rounded_locked(&state, offset, len)?;
        self.cow_pages.lookup_locked(&state, range, self.window_offset, f)
    }

    fn lookup_contiguous(&self, offset: u64, len: u64) -> VmResult<u64> {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        Self::check_aligned(offset, len)?;
        if !self.is_contiguous() && len != PAGE_SIZE {
            return Err(VmError::NotFound);
        }
        let state = self.lock();
        let range = self.translate_locked(&state, offset, len)?;
        self.cow_pages.lookup_contiguous_locked(&state, range)
    }

    fn read_user(
        &self,
        dst: &mut UserOutPtr<'_>,
        offset: u64,
        len: usize,
        options: ReadWriteOptions,
    ) -> (VmResult<()>, usize) {
        let len = match self.user_copy_len(offset, len, options) {
            Ok(len) => len,
            Err(err) => return (Err(err), 0),
        };
        let mut copied = 0usize;
        let result = self.read_chunks(offset, len, |pos, src| {
            let (status, count) = dst.copy_to_user(pos, src);
            copied += count;
            status
        });
        (result, copied)
    }

    fn write_user(
        &self,
        src: &UserInPtr<'_>,
        offset: u64,
        len: usize,
        options: ReadWriteOptions,
        on_bytes_transferred: Option<&mut dyn FnMut(u64, usize)>,
    ) -> (VmResult<()>, usize) {
        let len = match self.user_copy_len(offset, len, options) {
            Ok(len) => len,
            Err(err) => return (Err(err), 0),
        };
        let mut copied = 0usize;
        let result = self.write_chunks(
            offset,
            len,
            |pos, dst| {
                let (status, count) = src.copy_from_user(pos, dst);
                copied += count;
                status
            },
            on_bytes_transferred,
        );
        (result, copied)
    }

    fn take_pages(&self, offset: u64, len: u64) -> VmResult<VmPageSpliceList> {
        Self::check_aligned(offset, len)?;
        if self.options.intersects(PagedOptions::CONTIGUOUS | PagedOptions::ALWAYS_PINNED) {
            return Err(VmError::NotSupported);
        }
        self.with_changes(|state, changes| {
            let range = self.translate_locked(state, offset, len)?;
            self.cow_pages.take_pages_locked(state, range, changes)
        })
    }

    fn supply_pages(
        &self,
        offset: u64,
        len: u64,
        pages: &mut VmPageSpliceList,
        options: SupplyOptions,
    ) -> VmResult<()> {
        Self::check_aligned(offset, len)?;
        self.with_changes(|state, changes| {
            let range = self.translate_locked(state, offset, len)?;
            self.cow_pages.supply_pages_locked(state, range, pages, options, changes)
        })
    }

    fn fail_page_requests(&self, offset: u64, len: u64, error: VmError) -> VmResult<()> {
        Self::check_aligned(offset, len)?;
        if !error.is_valid_page_request_failure() {
            return Err(VmError::InvalidArgs);
        }
        let mut state = self.lock();
        let range = self.translate_locked(&state, offset, len)?;
        self.cow_pages.fail_page_requests_locked(&mut state, range, error)
    }

    fn dirty_pages(&self, offset: u64, len: u64) -> VmResult<()> {
        Self::check_aligned(offset, len)?;
        let mut state = self.lock();
        let range = self.translate_locked(&state, offset, len)?;
        self.cow_pages.dirty_pages_locked(&mut state, range)
    }

    fn enumerate_dirty_ranges(&self, offset: u64, len: u64, f: &mut DirtyRangeFn<'_>) -> VmResult<()> {
        Self::check_aligned(offset, len)?;
        let state = self.lock();
        let range = self.translate_locked(&state, offset, len)?;
        self.cow_pages.enumerate_dirty_ranges_locked(&state, range, self.window_offset, f)
    }

    fn query_pager_vmo_stats(&self, reset: bool) -> VmResult<PagerVmoStats> {
        let mut state = self.lock();
        self.cow_pages.query_pager_vmo_stats_locked(&mut state, reset)
    }

    fn writeback_begin(&self, offset: u64, len: u64, is_zero_range: bool) -> VmResult<()> {
        Self::check_aligned(offset, len)?;
        self.with_changes(|state, changes| {
            let range = self.translate_locked(state, offset, len)?;
            self.cow_pages.writeback_begin_locked(state, range, is_zero_range, changes)
        })
    }

    fn writeback_end(&self, offset: u64, len: u64) -> VmResult<()> {
        Self::check_aligned(offset, len)?;
        let mut state = self.lock();
        let range = self.translate_locked(&state, offset, len)?;
        self.cow_pages.writeback_end_locked(&mut state, range)
    }

    fn detach_source(&self) {
        let source = {
            let mut state = self.lock();
            self.cow_pages.detach_source_locked(&mut state)
        };
        if let Some(source) = source {
            log::debug!("vmo {:?} detached from its pager", self.id());
            source.on_detach();
        }
    }

    fn page_source_koid(&self) -> Option<u64> {
        let state = self.lock();
        self.cow_pages.source_koid_locked(&state)
    }

    fn hint_range(&self, offset: u64, len: u64, hint: EvictionHint) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        if hint == EvictionHint::AlwaysNeed {
            // Best effort; the hint stands even if content can't be fetched
            let _ = self.prefetch_range(offset, len);
        }
        let mut state = self.lock();
        let range = self.translate_rounded_locked(&state, offset, len)?;
        self.cow_pages.hint_range_locked(&mut state, range, hint);
        Ok(())
    }

    fn change_high_priority_count_locked(&self, state: &mut HierarchyState, delta: i64) {
        self.cow_pages.change_high_priority_count_locked(state, delta);
    }

    fn commit_high_priority_pages(&self, offset: u64, len: u64) {
        let high_priority = {
            let state = self.lock();
            self.cow_pages.is_high_priority_locked(&state)
        };
        if high_priority {
            let _ = self.prefetch_range(offset, len);
        }
    }

    fn get_page(
        &self,
        offset: u64,
        pf_flags: PageFaultFlags,
        request: Option<&mut MultiPageRequest>,
    ) -> VmResult<Resolution<PageInfo>> {
        let write = pf_flags.contains(PageFaultFlags::WRITE);
        let faulting = pf_flags.intersects(PageFaultFlags::FAULT_MASK);
        let mut state = self.lock();
        let range = self.translate_locked(&state, round_down_page(offset), PAGE_SIZE)?;
        let page = range.offset;

        let mut scratch;
        let request = match request {
            Some(request) => request,
            None => {
                let location = self.cow_pages.find_page_locked(&state, page);
                match location {
                    PageLocation::NeedsPager { .. } if faulting => {
                        panic!("fault on pager-backed vmo {:?} without a request token", self.id())
                    }
                    PageLocation::NeedsPager { .. } => return Err(VmError::NotFound),
                    PageLocation::Zero if !write && !faulting => return Err(VmError::NotFound),
                    _ => {}
                }
                scratch = MultiPageRequest::new(false);
                &mut scratch
            }
        };

        let mut changes = RangeChangeList::new();
        let result = if write {
            self.cow_pages
                .writable_page_locked(&mut state, page, request, &mut changes)
                .map(|resolution| {
                    resolution.map(|()| {
                        let mut info = self.cow_pages.page_info_locked(&state, self.cow_pages.id(), page);
                        info.writable = true;
                        info
                    })
                })
        } else {
            self.cow_pages.locate_page_locked(&mut state, page, request).and_then(|resolution| match resolution {
                Resolution::Ready(PageLocation::Committed { node, offset }) => {
                    Ok(Resolution::Ready(self.cow_pages.page_info_locked(&state, node, offset)))
                }
                Resolution::Ready(PageLocation::Zero) if faulting => Ok(Resolution::Ready(PageInfo {
                    paddr: ZERO_PAGE_PADDR,
                    writable: false,
                })),
                Resolution::Ready(PageLocation::Zero) => Err(VmError::NotFound),
                Resolution::Ready(PageLocation::NeedsPager { .. }) => {
                    panic!("page request not registered for vmo {:?}", self.id())
                }
                Resolution::ShouldWait => Ok(Resolution::ShouldWait),
                Resolution::Continue => Ok(Resolution::Continue),
            })
        };
        self.apply_range_changes_locked(&state, &changes);
        result
    }

    fn create_clone(
        &self,
        resizable: Resizability,
        snapshot: SnapshotType,
        offset: u64,
        size: u64,
        copy_name: bool,
    ) -> VmResult<Arc<dyn VmObject>> {
        let child: Arc<dyn VmObject> = self.create_paged_clone(resizable, snapshot, offset, size, copy_name)?;
        Ok(child)
    }

    fn create_child_slice(&self, offset: u64, size: u64, copy_name: bool) -> VmResult<Arc<dyn VmObject>> {
        let child: Arc<dyn VmObject> = self.create_paged_slice(offset, size, copy_name)?;
        Ok(child)
    }

    fn create_child_reference(
        &self,
        resizable: Resizability,
        offset: u64,
        size: u64,
        copy_name: bool,
    ) -> VmResult<(Arc<dyn VmObject>, bool)> {
        let (child, first) = self.create_paged_reference(resizable, offset, size, copy_name)?;
        let child: Arc<dyn VmObject> = child;
        Ok((child, first))
    }

    fn child_type(&self) -> ChildType {
        if self.parent.lock().is_none() {
            ChildType::NotChild
        } else if self.options.contains(PagedOptions::SLICE) {
            ChildType::Slice
        } else if self.options.contains(PagedOptions::REFERENCE) {
            ChildType::Reference
        } else {
            ChildType::CowClone
        }
    }

    fn parent_user_id(&self) -> u64 {
        self.parent_object().map_or(0, |parent| parent.user_id())
    }

    fn on_parent_destroyed(&self) {
        *self.parent.lock() = None;
    }

    fn dump(&self, depth: u32, verbose: bool) {
        let state = self.lock();
        log::info!(
            "{:indent$}vmo {:?} name {:?} size {:#x} options {:?} window {:#x} mappings {} children {}",
            "",
            self.id(),
            self.name().as_str(),
            self.size_locked(&state),
            self.options,
            self.window_offset,
            self.num_mappings_locked(&state),
            self.num_children(),
            indent = depth as usize * 2,
        );
        if verbose {
            self.cow_pages.dump_locked(&state, depth + 1);
        }
    }

    fn debug_lookup_depth(&self) -> u32 {
        let state = self.lock();
        self.cow_pages.lookup_depth_locked(&state)
    }

    fn heap_allocation_bytes(&self) -> u64 {
        let state = self.lock();
        self.cow_pages.heap_allocation_bytes_locked(&state)
    }

    fn reclamation_event_count(&self) -> u64 {
        let state = self.lock();
        self.cow_pages.reclamation_event_count_locked(&state)
    }

    fn attributed_memory_in_range(&self, offset: u64, len: u64) -> AttributionCounts {
        let state = self.lock();
        match self.translate_rounded_locked(&state, offset, len) {
            Ok(range) => self.cow_pages.attributed_memory_locked(&state, range),
            Err(_) => AttributionCounts::default(),
        }
    }

    fn set_mapping_cache_policy(&self, policy: CachePolicy) -> VmResult<()> {
        let mut state = self.lock();
        let mapped = state
            .object(self.id())
            .is_some_and(|object| object.mappings.values().any(|mapping| mapping.strong_count() > 0));
        if mapped || self.num_children() > 0 || self.parent.lock().is_some() || self.shares_parent_store() {
            return Err(VmError::BadState);
        }
        if self.cow_pages.any_pinned_locked(&state) {
            return Err(VmError::BadState);
        }
        if let Some(object) = state.object_mut(self.id()) {
            object.cache_policy = policy;
        }
        Ok(())
    }

    fn set_user_stream_size(&self, csm: Option<Arc<dyn ContentSizeManager>>) {
        let previous = {
            let mut state = self.lock();
            match state.object_mut(self.id()) {
                Some(object) => core::mem::replace(&mut object.stream_size, csm),
                None => csm,
            }
        };
        drop(previous);
    }
}

impl DeferredDelete for VmObjectPaged {
    fn delete_queue() -> &'static DeferredDeleteQueue<Self> {
        &PAGED_DELETE_QUEUE
    }

    fn deferred_delete_state(&self) -> &DeferredDeleteState {
        &self.delete_state
    }
}

impl Drop for VmObjectPaged {
    fn drop(&mut self) {
        let id = self.base.id();
        let removed = {
            let mut state = self.base.hierarchy().lock();
            let removed = state.objects.remove(&id);
            if let Some(object) = removed.as_ref() {
                debug_assert!(
                    object.mappings.values().all(|mapping| mapping.strong_count() == 0),
                    "vmo {:?} destroyed while still mapped",
                    id
                );
            }

            match self.cow_pages.owner_locked(&state) {
                Some(owner) if owner == id => {
                    // Hand the store to the oldest surviving sharer
                    let mut references = removed.as_ref().map(|o| o.references.clone()).unwrap_or_default();
                    let heir = if references.is_empty() { None } else { Some(references.remove(0)) };
                    self.cow_pages.set_owner_locked(&mut state, heir);
                    if let Some(heir) = heir {
                        if let Some(heir_state) = state.object_mut(heir) {
                            heir_state.references = references;
                        }
                    }
                }
                Some(owner) => {
                    if let Some(owner_state) = state.object_mut(owner) {
                        owner_state.references.retain(|&reference| reference != id);
                    }
                }
                None => {}
            }
            removed
        };
        drop(removed);

        if let Some(parent) = self.parent_object() {
            *self.parent.lock() = None;
            parent.remove_child(id);
            Self::release(parent);
        }
        log::trace!("vmo {:?} released", id);
    }
}

impl fmt::Debug for VmObjectPaged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObjectPaged")
            .field("id", &self.base.id())
            .field("options", &self.options)
            .field("window_offset", &self.window_offset)
            .field("window_len", &self.window_len)
            .finish()
    }
}
