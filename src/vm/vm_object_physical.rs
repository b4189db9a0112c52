//! Physical VM Objects
//!
//! A [`VmObjectPhysical`] names a fixed, page-aligned physical address
//! range. Every page is present and pinned for the object's lifetime, so
//! there is nothing to commit, decommit or page in. Slices share the
//! parent's hierarchy and cover a sub-range of its addresses.

use alloc::sync::{Arc, Weak};
use core::fmt;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::vm::hierarchy::{HierarchyState, VmHierarchy};
use crate::vm::page_request::{MultiPageRequest, Resolution};
use crate::vm::registry;
use crate::vm::vm_cow_pages::CowRange;
use crate::vm::vm_object::{
    round_size, CachePolicy, ChildType, ContentSizeManager, LookupFn, ObjectLockedState, PageFaultFlags, PageInfo,
    VmObject, VmObjectBase, VmoKind,
};
use crate::vm::{in_range, is_page_aligned, round_down_page, round_range_out, PAGE_SIZE};

/// Fixed physical range object
pub struct VmObjectPhysical {
    base: VmObjectBase,
    base_paddr: u64,
    size: u64,
    parent: Mutex<Option<Weak<VmObjectPhysical>>>,
    self_ref: Weak<VmObjectPhysical>,
}

impl VmObjectPhysical {
    /// Create an object over `[base_paddr, base_paddr + size)`
    pub fn create(base_paddr: u64, size: u64) -> VmResult<Arc<Self>> {
        if !is_page_aligned(base_paddr) || !is_page_aligned(size) || size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let size = round_size(size)?;
        if base_paddr.checked_add(size).is_none() {
            return Err(VmError::InvalidArgs);
        }
        let vmo = Self::create_common(VmHierarchy::new(), base_paddr, size, None);
        log::trace!("created physical vmo {:?} at {:#x} size {:#x}", vmo.id(), base_paddr, size);
        Ok(vmo)
    }

    fn create_common(
        hierarchy: Arc<VmHierarchy>,
        base_paddr: u64,
        size: u64,
        parent: Option<&VmObjectPhysical>,
    ) -> Arc<Self> {
        let vmo = Arc::new_cyclic(|self_ref| Self {
            base: VmObjectBase::new(hierarchy),
            base_paddr,
            size,
            parent: Mutex::new(parent.map(|p| p.self_ref.clone())),
            self_ref: self_ref.clone(),
        });
        vmo.lock()
            .objects
            .insert(vmo.id(), ObjectLockedState::new(CowRange::new(0, size)));
        registry::add_to_global_list(&vmo);
        vmo
    }

    pub fn base_paddr(&self) -> u64 {
        self.base_paddr
    }

    fn check_range(&self, offset: u64, len: u64) -> VmResult<()> {
        if in_range(offset, len, self.size) {
            Ok(())
        } else {
            Err(VmError::OutOfRange)
        }
    }
}

impl VmObject for VmObjectPhysical {
    fn base(&self) -> &VmObjectBase {
        &self.base
    }

    fn kind(&self) -> VmoKind {
        VmoKind::Physical
    }

    fn size_locked(&self, _state: &HierarchyState) -> u64 {
        self.size
    }

    fn is_contiguous(&self) -> bool {
        true
    }

    fn prefetch_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.check_range(offset, len)
    }

    fn commit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.check_range(offset, len)
    }

    fn commit_range_pinned(&self, offset: u64, len: u64, _write: bool) -> VmResult<()> {
        if !is_page_aligned(offset) || !is_page_aligned(len) || len == 0 {
            return Err(VmError::InvalidArgs);
        }
        self.check_range(offset, len)
    }

    fn unpin(&self, offset: u64, len: u64) {
        assert!(
            in_range(offset, len, self.size),
            "unpin of [{:#x}, +{:#x}) outside physical vmo {:?}",
            offset,
            len,
            self.id()
        );
    }

    fn debug_is_range_pinned(&self, offset: u64, len: u64) -> bool {
        in_range(offset, len, self.size)
    }

    fn lookup(&self, offset: u64, len: u64, f: &mut LookupFn<'_>) -> VmResult<()> {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        self.check_range(offset, len)?;
        let (start, rounded) = round_range_out(offset, len).ok_or(VmError::OutOfRange)?;
        let mut page = start;
        while page < start + rounded {
            if f(page, self.base_paddr + page)?.is_break() {
                break;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    fn lookup_contiguous(&self, offset: u64, len: u64) -> VmResult<u64> {
        if len == 0 || !is_page_aligned(offset) || !is_page_aligned(len) {
            return Err(VmError::InvalidArgs);
        }
        self.check_range(offset, len)?;
        Ok(self.base_paddr + offset)
    }

    fn get_page(
        &self,
        offset: u64,
        _pf_flags: PageFaultFlags,
        _request: Option<&mut MultiPageRequest>,
    ) -> VmResult<Resolution<PageInfo>> {
        if offset >= self.size {
            return Err(VmError::OutOfRange);
        }
        Ok(Resolution::Ready(PageInfo {
            paddr: self.base_paddr + round_down_page(offset),
            writable: true,
        }))
    }

    fn create_child_slice(&self, offset: u64, size: u64, copy_name: bool) -> VmResult<Arc<dyn VmObject>> {
        if !is_page_aligned(offset) || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        self.check_range(offset, size)?;
        let child = Self::create_common(
            Arc::clone(self.base.hierarchy()),
            self.base_paddr + offset,
            size,
            Some(self),
        );
        if copy_name {
            child.set_name(&self.name());
        }
        let weak = Arc::downgrade(&child);
        let weak: Weak<dyn VmObject> = weak;
        self.add_child(child.id(), weak);
        log::debug!("physical vmo {:?} sliced into {:?}", self.id(), child.id());
        let child: Arc<dyn VmObject> = child;
        Ok(child)
    }

    fn child_type(&self) -> ChildType {
        if self.parent.lock().is_some() {
            ChildType::Slice
        } else {
            ChildType::NotChild
        }
    }

    fn parent_user_id(&self) -> u64 {
        self.parent
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(0, |parent| parent.user_id())
    }

    fn on_parent_destroyed(&self) {
        *self.parent.lock() = None;
    }

    fn dump(&self, depth: u32, _verbose: bool) {
        log::info!(
            "{:indent$}physical vmo {:?} name {:?} base {:#x} size {:#x} mappings {}",
            "",
            self.id(),
            self.name().as_str(),
            self.base_paddr,
            self.size,
            self.num_mappings(),
            indent = depth as usize * 2,
        );
    }

    fn set_mapping_cache_policy(&self, policy: CachePolicy) -> VmResult<()> {
        let mut state = self.lock();
        let id = self.id();
        match state.object_mut(id) {
            Some(object) if object.mappings.values().any(|mapping| mapping.strong_count() > 0) => {
                Err(VmError::BadState)
            }
            Some(object) => {
                object.cache_policy = policy;
                Ok(())
            }
            None => Err(VmError::BadState),
        }
    }

    fn set_user_stream_size(&self, _csm: Option<Arc<dyn ContentSizeManager>>) {}
}

impl Drop for VmObjectPhysical {
    fn drop(&mut self) {
        let id = self.base.id();
        let removed = self.base.hierarchy().lock().objects.remove(&id);
        drop(removed);

        let parent = self.parent.lock().take().and_then(|weak| weak.upgrade());
        if let Some(parent) = parent {
            parent.remove_child(id);
        }
    }
}

impl fmt::Debug for VmObjectPhysical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObjectPhysical")
            .field("id", &self.base.id())
            .field("base_paddr", &self.base_paddr)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::ops::ControlFlow;

    const BASE: u64 = 0x4000_0000;

    #[test]
    fn test_create_validates_alignment() {
        assert_eq!(VmObjectPhysical::create(BASE + 1, PAGE_SIZE).err(), Some(VmError::InvalidArgs));
        assert_eq!(VmObjectPhysical::create(BASE, PAGE_SIZE + 1).err(), Some(VmError::InvalidArgs));
        assert_eq!(VmObjectPhysical::create(BASE, 0).err(), Some(VmError::InvalidArgs));
    }

    #[test]
    fn test_lookup_reports_fixed_addresses() {
        let vmo = VmObjectPhysical::create(BASE, 4 * PAGE_SIZE).unwrap();
        let mut seen = Vec::new();
        vmo.lookup(PAGE_SIZE, 2 * PAGE_SIZE, &mut |offset, paddr| {
            seen.push((offset, paddr));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();
        assert_eq!(seen, [(PAGE_SIZE, BASE + PAGE_SIZE), (2 * PAGE_SIZE, BASE + 2 * PAGE_SIZE)]);
        assert_eq!(vmo.lookup_contiguous(PAGE_SIZE, PAGE_SIZE), Ok(BASE + PAGE_SIZE));

        let info = vmo.get_page_blocking(3 * PAGE_SIZE + 12, PageFaultFlags::HW_FAULT).unwrap();
        assert_eq!(info.paddr, BASE + 3 * PAGE_SIZE);
        assert!(info.writable);
    }

    #[test]
    fn test_unsupported_operations() {
        let vmo = VmObjectPhysical::create(BASE, PAGE_SIZE).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vmo.read(&mut buf, 0), Err(VmError::NotSupported));
        assert_eq!(vmo.decommit_range(0, PAGE_SIZE), Err(VmError::NotSupported));
        assert_eq!(vmo.resize(2 * PAGE_SIZE), Err(VmError::NotSupported));
        assert!(vmo.create_clone(
            crate::vm::Resizability::NonResizable,
            crate::vm::SnapshotType::Full,
            0,
            PAGE_SIZE,
            false
        )
        .is_err());
        assert_eq!(vmo.kind(), VmoKind::Physical);
        assert!(!vmo.is_paged());
    }

    #[test]
    fn test_slice_shares_hierarchy() {
        let vmo = VmObjectPhysical::create(BASE, 4 * PAGE_SIZE).unwrap();
        vmo.set_name("mmio");
        let slice = vmo.create_child_slice(2 * PAGE_SIZE, PAGE_SIZE, true).unwrap();
        assert_eq!(slice.child_type(), ChildType::Slice);
        assert_eq!(slice.name().as_str(), "mmio");
        assert_eq!(slice.lookup_contiguous(0, PAGE_SIZE), Ok(BASE + 2 * PAGE_SIZE));
        assert_eq!(vmo.num_children(), 1);
        assert_eq!(vmo.base().hierarchy().id(), slice.base().hierarchy().id());

        drop(slice);
        assert_eq!(vmo.num_children(), 0);
    }

    #[test]
    fn test_pin_is_range_checked() {
        let vmo = VmObjectPhysical::create(BASE, 2 * PAGE_SIZE).unwrap();
        vmo.commit_range_pinned(0, 2 * PAGE_SIZE, true).unwrap();
        assert!(vmo.debug_is_range_pinned(0, 2 * PAGE_SIZE));
        assert_eq!(vmo.commit_range_pinned(PAGE_SIZE, 2 * PAGE_SIZE, false), Err(VmError::OutOfRange));
        vmo.unpin(0, 2 * PAGE_SIZE);
        assert_eq!(vmo.set_mapping_cache_policy(CachePolicy::Uncached), Ok(()));
        assert_eq!(vmo.mapping_cache_policy(), CachePolicy::Uncached);
    }
}
