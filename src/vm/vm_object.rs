//! VM Object - Abstract Memory Object Contract
//!
//! A VMO is a byte-addressable, optionally resizable span of memory. This
//! module defines the contract every object kind implements
//! ([`VmObject`]), the state every object carries ([`VmObjectBase`]), and
//! the collaborator interfaces objects talk to: mappings that observe a
//! range of the object, child observers, and content-size managers.
//!
//! ## Locking
//!
//! Range operations and mapping bookkeeping run under the lock of the
//! object's [`VmHierarchy`]. Children, the child observer and the name are
//! guarded by their own small locks. When both are needed the observer lock
//! is taken before the children lock.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ops::ControlFlow;
use core::sync::atomic::{AtomicU64, Ordering};
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::vm::hierarchy::{HierarchyGuard, HierarchyState, VmHierarchy};
use crate::vm::page_request::{MultiPageRequest, Resolution};
use crate::vm::registry;
use crate::vm::user_copy::{UserInPtr, UserOutPtr};
use crate::vm::vm_cow_pages::{CowRange, VmPageSpliceList};
use crate::vm::{is_page_aligned, round_up_page, MAX_NAME_LEN, MAX_SIZE};

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);

    /// Allocate a fresh object ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        VmObjectId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Closed set of object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmoKind {
    /// Pages managed by the VM, possibly with clones and a pager
    Paged,
    /// A fixed physical address range
    Physical,
}

/// Whether a derived object may be resized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resizability {
    Resizable,
    NonResizable,
}

/// Copy-on-write clone flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    /// Point-in-time copy of the whole range
    Full,
    /// Point-in-time copy of pages the parent modified, live view of the rest
    Modified,
    /// Live view of the parent until the child writes a page
    OnWrite,
}

/// How supplied pages are installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyOptions {
    /// Pager supplying content, existing pages win
    PagerSupply,
    /// Moving data between objects, supplied pages win
    TransferData,
    /// Physical page provider, no dirty tracking
    PhysicalPageProvider,
}

/// Relationship of an object to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    NotChild,
    CowClone,
    Slice,
    Reference,
}

/// Operation applied to mappings when object contents change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeChangeOp {
    /// Remove the translations
    Unmap,
    /// Remove only translations that point at the shared zero page
    UnmapZeroPage,
    /// Remove translations and harvest accessed bits
    UnmapAndHarvest,
    /// Downgrade translations to read-only
    RemoveWrite,
    /// Sanity check that no translation for the range is still pinned
    DebugUnpin,
}

/// Hint about future access to a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionHint {
    DontNeed,
    AlwaysNeed,
}

/// Cache policy applied to mappings of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Cached,
    Uncached,
    UncachedDevice,
    WriteCombining,
}

bitflags! {
    /// Page fault flags passed to `get_page`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultFlags: u32 {
        /// Access is a write
        const WRITE = 1 << 0;
        /// Access came from user mode
        const USER = 1 << 1;
        /// Instruction fetch
        const INSTRUCTION = 1 << 2;
        /// No translation was present
        const NOT_PRESENT = 1 << 3;
        /// Hardware fault
        const HW_FAULT = 1 << 4;
        /// Software fault (kernel access on behalf of a syscall)
        const SW_FAULT = 1 << 5;
        /// Any fault, as opposed to a plain lookup
        const FAULT_MASK = Self::HW_FAULT.bits() | Self::SW_FAULT.bits();
    }
}

bitflags! {
    /// Options for user reads and writes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadWriteOptions: u32 {
        /// Trim the length to the object size instead of failing
        const TRIM_LENGTH = 1 << 0;
    }
}

/// Result of a successful page lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Physical address of the page
    pub paddr: u64,
    /// Whether the page may be mapped writable
    pub writable: bool,
}

/// Memory attributed to an object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributionCounts {
    /// Bytes committed in the object's own page store
    pub committed_bytes: u64,
    /// Subset of those not shared with any other store
    pub private_bytes: u64,
}

/// Pager statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagerVmoStats {
    /// Content was modified since the last reset
    pub modified: bool,
}

/// Outcome of locking a discardable object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmoLockState {
    pub offset: u64,
    pub size: u64,
    /// Range discarded since the previous lock, zero length if none
    pub discarded_offset: u64,
    pub discarded_size: u64,
}

// ============================================================================
// Collaborator Interfaces
// ============================================================================

/// A mapping of some range of an object into an address space
///
/// Mappings are not owned by the object. They must be removed with
/// [`VmObject::remove_mapping_locked`] before they are dropped.
pub trait VmMapping: Send + Sync {
    /// Mapping identifier
    fn id(&self) -> u64;
    /// Offset of the mapping within the object
    fn object_offset(&self) -> u64;
    /// Length of the mapping
    fn size(&self) -> u64;
    /// Address space the mapping lives in
    fn aspace_id(&self) -> u64;
    /// Whether the address space belongs to user mode
    fn is_user(&self) -> bool;
    /// Apply `op` to translations of object range `[offset, offset + len)`
    ///
    /// Called with the hierarchy lock held.
    fn apply_range_change(&self, offset: u64, len: u64, op: RangeChangeOp);
}

/// Notified when an object's child count drops to zero
pub trait VmObjectChildObserver: Send + Sync {
    /// Called with the observer lock held. Must not call
    /// [`VmObject::set_child_observer`] on the same object.
    fn on_zero_child(&self);
}

/// Source of the user-visible stream size of an object
pub trait ContentSizeManager: Send + Sync {
    fn content_size(&self) -> u64;
}

// ============================================================================
// Per-Object Locked State
// ============================================================================

/// Mapping tree key: `(object offset, mapping id)`
type MappingKey = (u64, u64);

/// Per-object state guarded by the hierarchy lock
pub(crate) struct ObjectLockedState {
    /// Window into the backing store
    pub(crate) window: CowRange,
    pub(crate) mappings: BTreeMap<MappingKey, Weak<dyn VmMapping>>,
    /// Reference siblings, kept by the owner of the page store
    pub(crate) references: Vec<VmObjectId>,
    pub(crate) cache_policy: CachePolicy,
    pub(crate) stream_size: Option<Arc<dyn ContentSizeManager>>,
}

impl ObjectLockedState {
    pub(crate) fn new(window: CowRange) -> Self {
        Self {
            window,
            mappings: BTreeMap::new(),
            references: Vec::new(),
            cache_policy: CachePolicy::Cached,
            stream_size: None,
        }
    }

    /// Apply `op` to every mapping overlapping object range `[offset, offset + len)`
    pub(crate) fn update_mappings(&self, offset: u64, len: u64, op: RangeChangeOp) {
        let end = offset.saturating_add(len);
        for mapping in self.mappings.values().filter_map(Weak::upgrade) {
            let map_start = mapping.object_offset();
            let map_end = map_start.saturating_add(mapping.size());
            let start = offset.max(map_start);
            let stop = end.min(map_end);
            if start >= stop {
                continue;
            }
            #[cfg(feature = "detailed-logging")]
            log::trace!("mapping {} range change {:?} [{:#x}, {:#x})", mapping.id(), op, start, stop);
            mapping.apply_range_change(start, stop - start, op);
        }
    }

    /// Apply `op` for a change to backing store range `range`, clipped to the window
    pub(crate) fn update_mappings_for_cow_range(&self, range: CowRange, op: RangeChangeOp) {
        if self.mappings.is_empty() {
            return;
        }
        if let Some(clipped) = range.intersect(self.window) {
            self.update_mappings(clipped.offset - self.window.offset, clipped.len, op);
        }
    }
}

// ============================================================================
// VmObjectBase
// ============================================================================

/// State carried by every object kind
pub struct VmObjectBase {
    id: VmObjectId,
    user_id: AtomicU64,
    name: Mutex<heapless::String<MAX_NAME_LEN>>,
    children: Mutex<BTreeMap<VmObjectId, Weak<dyn VmObject>>>,
    child_observer: Mutex<Option<Arc<dyn VmObjectChildObserver>>>,
    hierarchy: Arc<VmHierarchy>,
    /// Registry key, zero while not registered
    registry_key: AtomicU64,
}

impl VmObjectBase {
    /// Create base state for an object living in `hierarchy`
    pub fn new(hierarchy: Arc<VmHierarchy>) -> Self {
        Self {
            id: VmObjectId::new(),
            user_id: AtomicU64::new(0),
            name: Mutex::new(heapless::String::new()),
            children: Mutex::new(BTreeMap::new()),
            child_observer: Mutex::new(None),
            hierarchy,
            registry_key: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub fn hierarchy(&self) -> &Arc<VmHierarchy> {
        &self.hierarchy
    }

    pub(crate) fn registry_key(&self) -> u64 {
        self.registry_key.load(Ordering::SeqCst)
    }

    pub(crate) fn set_registry_key(&self, key: u64) {
        self.registry_key.store(key, Ordering::SeqCst);
    }
}

impl Drop for VmObjectBase {
    fn drop(&mut self) {
        let key = self.registry_key.swap(0, Ordering::SeqCst);
        if key != 0 {
            registry::remove_from_global_list(key);
        }

        // Children outlive their parent; tell them it is gone
        let children: Vec<Arc<dyn VmObject>> =
            self.children.lock().values().filter_map(Weak::upgrade).collect();
        for child in &children {
            child.on_parent_destroyed();
        }
        drop(children);
        log::trace!("vmo {:?} destroyed", self.id);
    }
}

// ============================================================================
// VmObject
// ============================================================================

/// Round `size` up to a page, failing if it exceeds the maximum object size
pub fn round_size(size: u64) -> VmResult<u64> {
    match round_up_page(size) {
        Some(rounded) if rounded <= MAX_SIZE => Ok(rounded),
        _ => Err(VmError::OutOfRange),
    }
}

/// Largest supported object size
pub const fn max_size() -> u64 {
    MAX_SIZE
}

/// Callback for `lookup`: `(object offset, physical address)`
pub type LookupFn<'a> = dyn FnMut(u64, u64) -> VmResult<ControlFlow<()>> + 'a;

/// Callback for `enumerate_dirty_ranges`: `(offset, len, is_zero_range)`
pub type DirtyRangeFn<'a> = dyn FnMut(u64, u64, bool) -> VmResult<ControlFlow<()>> + 'a;

/// Abstract contract of a virtual memory object
///
/// Operations a kind does not support return [`VmError::NotSupported`].
pub trait VmObject: Send + Sync {
    /// Shared object state
    fn base(&self) -> &VmObjectBase;

    /// Object kind
    fn kind(&self) -> VmoKind;

    /// Size in bytes, with the hierarchy lock held
    fn size_locked(&self, state: &HierarchyState) -> u64;

    fn is_contiguous(&self) -> bool {
        false
    }
    fn is_resizable(&self) -> bool {
        false
    }
    fn is_discardable(&self) -> bool {
        false
    }
    fn is_user_pager_backed(&self) -> bool {
        false
    }
    fn is_dirty_tracked(&self) -> bool {
        false
    }

    fn resize(&self, _size: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    // ------------------------------------------------------------------
    // Residency
    // ------------------------------------------------------------------

    /// Commit pages backing `[offset, offset + len)`
    fn commit_range(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Bring content in without necessarily allocating private pages
    fn prefetch_range(&self, offset: u64, len: u64) -> VmResult<()>;

    /// Commit and pin `[offset, offset + len)`
    fn commit_range_pinned(&self, offset: u64, len: u64, write: bool) -> VmResult<()>;

    fn decommit_range(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Zero the range, tracking the result for dirty writeback
    fn zero_range(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Zero the page-aligned range without dirty tracking
    fn zero_range_untracked(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Release a pin taken by `commit_range_pinned`. Unpinning a page that
    /// is not pinned is fatal.
    fn unpin(&self, offset: u64, len: u64);

    fn debug_is_range_pinned(&self, offset: u64, len: u64) -> bool;

    fn try_lock_range(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn lock_range(&self, _offset: u64, _len: u64) -> VmResult<VmoLockState> {
        Err(VmError::NotSupported)
    }
    fn unlock_range(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    // ------------------------------------------------------------------
    // Data access
    // ------------------------------------------------------------------

    fn read(&self, _buf: &mut [u8], _offset: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn write(&self, _buf: &[u8], _offset: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Enumerate `(offset, paddr)` of committed, writable pages in the range
    fn lookup(&self, _offset: u64, _len: u64, _f: &mut LookupFn<'_>) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    /// Physical address of a physically contiguous committed range
    fn lookup_contiguous(&self, _offset: u64, _len: u64) -> VmResult<u64> {
        Err(VmError::NotSupported)
    }

    /// Copy into a user buffer; returns the status and bytes copied
    fn read_user(
        &self,
        _dst: &mut UserOutPtr<'_>,
        _offset: u64,
        _len: usize,
        _options: ReadWriteOptions,
    ) -> (VmResult<()>, usize) {
        (Err(VmError::NotSupported), 0)
    }

    /// Copy from a user buffer; returns the status and bytes copied
    ///
    /// `on_bytes_transferred(offset, len)` runs under the hierarchy lock
    /// after each chunk lands.
    fn write_user(
        &self,
        _src: &UserInPtr<'_>,
        _offset: u64,
        _len: usize,
        _options: ReadWriteOptions,
        _on_bytes_transferred: Option<&mut dyn FnMut(u64, usize)>,
    ) -> (VmResult<()>, usize) {
        (Err(VmError::NotSupported), 0)
    }

    // ------------------------------------------------------------------
    // Pager plumbing
    // ------------------------------------------------------------------

    fn take_pages(&self, _offset: u64, _len: u64) -> VmResult<VmPageSpliceList> {
        Err(VmError::NotSupported)
    }
    fn supply_pages(
        &self,
        _offset: u64,
        _len: u64,
        _pages: &mut VmPageSpliceList,
        _options: SupplyOptions,
    ) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn fail_page_requests(&self, _offset: u64, _len: u64, _error: VmError) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn dirty_pages(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn enumerate_dirty_ranges(&self, _offset: u64, _len: u64, _f: &mut DirtyRangeFn<'_>) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn query_pager_vmo_stats(&self, _reset: bool) -> VmResult<PagerVmoStats> {
        Err(VmError::NotSupported)
    }
    fn writeback_begin(&self, _offset: u64, _len: u64, _is_zero_range: bool) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn writeback_end(&self, _offset: u64, _len: u64) -> VmResult<()> {
        Err(VmError::NotSupported)
    }
    fn detach_source(&self) {}
    fn page_source_koid(&self) -> Option<u64> {
        None
    }

    fn hint_range(&self, _offset: u64, _len: u64, _hint: EvictionHint) -> VmResult<()> {
        Ok(())
    }

    /// Adjust the count of high-priority users of the object
    fn change_high_priority_count_locked(&self, _state: &mut HierarchyState, _delta: i64) {}

    /// Best-effort commit of a range for high-priority users
    fn commit_high_priority_pages(&self, _offset: u64, _len: u64) {}

    // ------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------

    /// Resolve the page at `offset` for a lookup or fault
    ///
    /// Faulting lookups on pager-backed objects must pass a request token.
    fn get_page(
        &self,
        offset: u64,
        pf_flags: PageFaultFlags,
        request: Option<&mut MultiPageRequest>,
    ) -> VmResult<Resolution<PageInfo>>;

    /// `get_page`, waiting on page requests until the page is available
    fn get_page_blocking(&self, offset: u64, pf_flags: PageFaultFlags) -> VmResult<PageInfo> {
        let mut request = MultiPageRequest::new(false);
        loop {
            match self.get_page(offset, pf_flags, Some(&mut request))? {
                Resolution::Ready(info) => return Ok(info),
                Resolution::ShouldWait | Resolution::Continue => request.wait()?,
            }
        }
    }

    // ------------------------------------------------------------------
    // Derivation
    // ------------------------------------------------------------------

    fn create_clone(
        &self,
        _resizable: Resizability,
        _snapshot: SnapshotType,
        _offset: u64,
        _size: u64,
        _copy_name: bool,
    ) -> VmResult<Arc<dyn VmObject>> {
        Err(VmError::NotSupported)
    }

    fn create_child_slice(&self, _offset: u64, _size: u64, _copy_name: bool) -> VmResult<Arc<dyn VmObject>> {
        Err(VmError::NotSupported)
    }

    /// Returns the reference and whether it is the parent's first child
    fn create_child_reference(
        &self,
        _resizable: Resizability,
        _offset: u64,
        _size: u64,
        _copy_name: bool,
    ) -> VmResult<(Arc<dyn VmObject>, bool)> {
        Err(VmError::NotSupported)
    }

    fn child_type(&self) -> ChildType;

    /// User id of the parent, zero if none
    fn parent_user_id(&self) -> u64;

    /// Called on a child when its parent is destroyed
    fn on_parent_destroyed(&self) {}

    // ------------------------------------------------------------------
    // Diagnostics and accounting
    // ------------------------------------------------------------------

    fn dump(&self, depth: u32, verbose: bool);

    /// Number of page stores between this object and its root
    fn debug_lookup_depth(&self) -> u32 {
        0
    }
    fn heap_allocation_bytes(&self) -> u64 {
        0
    }
    fn reclamation_event_count(&self) -> u64 {
        0
    }
    fn attributed_memory_in_range(&self, _offset: u64, _len: u64) -> AttributionCounts {
        AttributionCounts::default()
    }
    fn attributed_memory(&self) -> AttributionCounts {
        self.attributed_memory_in_range(0, self.size())
    }

    // ------------------------------------------------------------------
    // Cache policy and stream size
    // ------------------------------------------------------------------

    fn set_mapping_cache_policy(&self, _policy: CachePolicy) -> VmResult<()> {
        Err(VmError::NotSupported)
    }

    fn mapping_cache_policy(&self) -> CachePolicy {
        let state = self.lock();
        state.object(self.id()).map_or(CachePolicy::Cached, |object| object.cache_policy)
    }

    /// Attach or detach the user stream size manager
    fn set_user_stream_size(&self, csm: Option<Arc<dyn ContentSizeManager>>);

    // ------------------------------------------------------------------
    // Shared behavior
    // ------------------------------------------------------------------

    fn id(&self) -> VmObjectId {
        self.base().id()
    }

    /// Acquire the hierarchy lock
    fn lock(&self) -> HierarchyGuard<'_> {
        self.base().hierarchy().lock()
    }

    fn size(&self) -> u64 {
        let state = self.lock();
        self.size_locked(&state)
    }

    fn is_paged(&self) -> bool {
        self.kind() == VmoKind::Paged
    }

    fn user_id(&self) -> u64 {
        self.base().user_id.load(Ordering::SeqCst)
    }

    /// Publish the user-visible id. Publishing twice is fatal.
    fn set_user_id(&self, user_id: u64) {
        assert_ne!(user_id, 0, "user id must be non-zero");
        if self
            .base()
            .user_id
            .compare_exchange(0, user_id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("vmo {:?} user id published twice", self.id());
        }
    }

    /// Object name
    fn name(&self) -> heapless::String<MAX_NAME_LEN> {
        self.base().name.lock().clone()
    }

    /// Set the name, truncating at a character boundary to leave the
    /// terminator slot free
    fn set_name(&self, name: &str) {
        let mut end = name.len().min(MAX_NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut stored = self.base().name.lock();
        stored.clear();
        // Cannot fail: `end` is below the capacity
        let _ = stored.push_str(&name[..end]);
    }

    fn add_mapping_locked(&self, state: &mut HierarchyState, mapping: &Arc<dyn VmMapping>) {
        let id = self.id();
        match state.object_mut(id) {
            Some(object) => {
                object
                    .mappings
                    .insert((mapping.object_offset(), mapping.id()), Arc::downgrade(mapping));
            }
            None => panic!("vmo {:?} has no locked state", id),
        }
    }

    fn remove_mapping_locked(&self, state: &mut HierarchyState, mapping: &dyn VmMapping) {
        if let Some(object) = state.object_mut(self.id()) {
            object.mappings.remove(&(mapping.object_offset(), mapping.id()));
        }
    }

    fn num_mappings_locked(&self, state: &HierarchyState) -> u32 {
        state.object(self.id()).map_or(0, |object| object.mappings.len() as u32)
    }

    fn num_mappings(&self) -> u32 {
        let state = self.lock();
        self.num_mappings_locked(&state)
    }

    fn is_mapped_by_user(&self) -> bool {
        let state = self.lock();
        state.object(self.id()).is_some_and(|object| {
            object
                .mappings
                .values()
                .filter_map(Weak::upgrade)
                .any(|mapping| mapping.is_user())
        })
    }

    /// Number of distinct address spaces mapping the object, at least one
    fn share_count(&self) -> u32 {
        let state = self.lock();
        let Some(object) = state.object(self.id()) else {
            return 1;
        };
        let aspaces: BTreeSet<u64> = object
            .mappings
            .values()
            .filter_map(Weak::upgrade)
            .map(|mapping| mapping.aspace_id())
            .collect();
        (aspaces.len() as u32).max(1)
    }

    /// Apply `op` to this object's mappings covering `[offset, offset + len)`
    fn range_change_update_mappings_locked(&self, state: &HierarchyState, offset: u64, len: u64, op: RangeChangeOp) {
        assert!(is_page_aligned(offset) && is_page_aligned(len), "range change must be page aligned");
        if let Some(object) = state.object(self.id()) {
            object.update_mappings(offset, len, op);
        }
    }

    /// Register a child; returns whether it is the first
    fn add_child(&self, id: VmObjectId, child: Weak<dyn VmObject>) -> bool {
        let mut children = self.base().children.lock();
        children.insert(id, child);
        children.len() == 1
    }

    /// Unregister a child without notifying the observer
    ///
    /// Removing a child that is not registered is fatal.
    fn drop_child_locked(&self, children: &mut BTreeMap<VmObjectId, Weak<dyn VmObject>>, id: VmObjectId) {
        if children.remove(&id).is_none() {
            panic!("vmo {:?} child count underflow removing {:?}", self.id(), id);
        }
    }

    /// Unregister a child, notifying the observer if it was the last
    fn remove_child(&self, id: VmObjectId) {
        let observer = self.base().child_observer.lock();
        let mut children = self.base().children.lock();
        self.drop_child_locked(&mut children, id);
        let now_empty = children.is_empty();
        drop(children);
        if now_empty {
            if let Some(observer) = observer.as_ref() {
                observer.on_zero_child();
            }
        }
    }

    fn num_children(&self) -> u32 {
        self.base().children.lock().len() as u32
    }

    fn set_child_observer(&self, observer: Option<Arc<dyn VmObjectChildObserver>>) {
        *self.base().child_observer.lock() = observer;
    }
}
