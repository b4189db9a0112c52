//! Object Hierarchy Lock
//!
//! Every object derived from one root (copy-on-write clones, slices and
//! references) shares a single [`VmHierarchy`]. Its lock guards all of the
//! page stores and per-object mapping state of the hierarchy, so an
//! operation on any view observes and mutates a consistent picture. Objects
//! hold the hierarchy by `Arc`; it lives as long as any of them.
//!
//! Methods named `*_locked` across the subsystem take the
//! [`HierarchyState`] reached through the guard as proof that the lock is
//! held.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::vm::vm_cow_pages::{CowId, CowNode};
use crate::vm::vm_object::{ObjectLockedState, VmObjectId};

/// Guard for a hierarchy lock
pub type HierarchyGuard<'a> = MutexGuard<'a, HierarchyState>;

/// State guarded by the hierarchy lock
pub struct HierarchyState {
    /// Page stores, by node
    pub(crate) nodes: BTreeMap<CowId, CowNode>,
    /// Mapping and sibling bookkeeping, by object
    pub(crate) objects: BTreeMap<VmObjectId, ObjectLockedState>,
}

impl HierarchyState {
    const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            objects: BTreeMap::new(),
        }
    }

    pub(crate) fn node(&self, id: CowId) -> &CowNode {
        match self.nodes.get(&id) {
            Some(node) => node,
            None => panic!("page store {:?} missing from its hierarchy", id),
        }
    }

    pub(crate) fn node_mut(&mut self, id: CowId) -> &mut CowNode {
        match self.nodes.get_mut(&id) {
            Some(node) => node,
            None => panic!("page store {:?} missing from its hierarchy", id),
        }
    }

    pub(crate) fn object(&self, id: VmObjectId) -> Option<&ObjectLockedState> {
        self.objects.get(&id)
    }

    pub(crate) fn object_mut(&mut self, id: VmObjectId) -> Option<&mut ObjectLockedState> {
        self.objects.get_mut(&id)
    }
}

/// Lock owner shared by an object hierarchy
pub struct VmHierarchy {
    id: u64,
    state: Mutex<HierarchyState>,
}

impl VmHierarchy {
    /// Create a hierarchy for a new root object
    pub fn new() -> Arc<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(HierarchyState::new()),
        })
    }

    /// Hierarchy identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire the hierarchy lock
    pub fn lock(&self) -> HierarchyGuard<'_> {
        self.state.lock()
    }

    /// Number of live page store nodes
    pub fn debug_node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Number of live objects
    pub fn debug_object_count(&self) -> usize {
        self.lock().objects.len()
    }
}

impl core::fmt::Debug for VmHierarchy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmHierarchy").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_ids_unique() {
        let a = VmHierarchy::new();
        let b = VmHierarchy::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.debug_node_count(), 0);
        assert_eq!(b.debug_object_count(), 0);
    }
}
