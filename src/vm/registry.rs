//! Global Object Registry
//!
//! Every live object sits in one process-wide list, oldest first, for
//! whole-system enumeration. Short scans use [`for_each`], which holds the
//! registry lock throughout. Long scans use a [`VmoCursor`], which takes the
//! lock once per step.
//!
//! Cursors are registered alongside the list. Removing an object advances
//! every cursor positioned on it before the lock is released, so a cursor
//! never hands out an object that has left the list.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Bound;
use spin::Mutex;

use crate::error::VmResult;
use crate::vm::vm_object::VmObject;

// ============================================================================
// Global List
// ============================================================================

struct GlobalList {
    /// Registry key to object; keys grow with insertion order
    objects: BTreeMap<u64, Weak<dyn VmObject>>,
    next_key: u64,
    /// Cursor id to the key of the next object it returns, `None` at the end
    cursors: BTreeMap<u64, Option<u64>>,
    next_cursor: u64,
}

impl GlobalList {
    const fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_key: 1,
            cursors: BTreeMap::new(),
            next_cursor: 1,
        }
    }

    fn key_after(&self, key: u64) -> Option<u64> {
        self.objects
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(&next, _)| next)
    }

    fn first_key(&self) -> Option<u64> {
        self.objects.keys().next().copied()
    }

    /// Move every cursor positioned on `key` to the following entry
    fn advance_cursors(&mut self, key: u64) {
        let next = self.key_after(key);
        for position in self.cursors.values_mut() {
            if *position == Some(key) {
                *position = next;
            }
        }
    }
}

static GLOBAL_LIST: Mutex<GlobalList> = Mutex::new(GlobalList::new());

/// Register a freshly created object
pub(crate) fn add_to_global_list<T: VmObject + 'static>(object: &Arc<T>) {
    let weak = Arc::downgrade(object);
    let weak: Weak<dyn VmObject> = weak;
    let mut list = GLOBAL_LIST.lock();
    let key = list.next_key;
    list.next_key += 1;
    list.objects.insert(key, weak);
    object.base().set_registry_key(key);
}

/// Unregister the object with registry key `key`
pub(crate) fn remove_from_global_list(key: u64) {
    let mut list = GLOBAL_LIST.lock();
    list.advance_cursors(key);
    if list.objects.remove(&key).is_none() {
        panic!("registry key {} not in the global list", key);
    }
}

/// Run `f` over every live object, oldest first, with the registry lock held
///
/// Stops at and returns the first error. `f` must not create or destroy
/// objects.
pub fn for_each<F>(mut f: F) -> VmResult<()>
where
    F: FnMut(&dyn VmObject) -> VmResult<()>,
{
    let mut live: Vec<Arc<dyn VmObject>> = Vec::new();
    let result = {
        let list = GLOBAL_LIST.lock();
        let mut result = Ok(());
        for object in list.objects.values().filter_map(Weak::upgrade) {
            let status = f(object.as_ref());
            // Released once the lock is dropped
            live.push(object);
            if status.is_err() {
                result = status;
                break;
            }
        }
        result
    };
    drop(live);
    result
}

/// Number of registered objects
pub fn count() -> usize {
    GLOBAL_LIST.lock().objects.len()
}

// ============================================================================
// Cursor
// ============================================================================

/// Resumable position in the global list
///
/// Each call to [`VmoCursor::next`] takes the registry lock, so other
/// threads may create and destroy objects between steps.
pub struct VmoCursor {
    id: u64,
}

impl VmoCursor {
    /// Register a cursor at the oldest object
    pub fn new() -> Self {
        let mut list = GLOBAL_LIST.lock();
        let id = list.next_cursor;
        list.next_cursor += 1;
        let first = list.first_key();
        list.cursors.insert(id, first);
        Self { id }
    }

    /// Next live object, or `None` once the end is reached
    ///
    /// The returned reference must be dropped without the registry lock held,
    /// which is always the case for callers outside this module.
    pub fn next(&mut self) -> Option<Arc<dyn VmObject>> {
        let mut list = GLOBAL_LIST.lock();
        loop {
            let key = list.cursors.get(&self.id).copied().flatten()?;
            let next = list.key_after(key);
            list.cursors.insert(self.id, next);
            // Objects mid-destruction are still listed but can't be upgraded
            if let Some(object) = list.objects.get(&key).and_then(Weak::upgrade) {
                return Some(object);
            }
        }
    }

    /// Step past `object` if the cursor is positioned on it
    pub fn advance_if(&mut self, object: &dyn VmObject) {
        let key = object.base().registry_key();
        if key == 0 {
            return;
        }
        let mut list = GLOBAL_LIST.lock();
        if list.cursors.get(&self.id).copied().flatten() == Some(key) {
            let next = list.key_after(key);
            list.cursors.insert(self.id, next);
        }
    }
}

impl Drop for VmoCursor {
    fn drop(&mut self) {
        GLOBAL_LIST.lock().cursors.remove(&self.id);
    }
}

impl fmt::Debug for VmoCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position = GLOBAL_LIST.lock().cursors.get(&self.id).copied().flatten();
        f.debug_struct("VmoCursor").field("id", &self.id).field("position", &position).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::vm_object_paged::{PagedOptions, VmObjectPaged};
    use crate::vm::PAGE_SIZE;

    fn contains(id: crate::vm::VmObjectId) -> bool {
        let mut found = false;
        for_each(|object| {
            found |= object.id() == id;
            Ok(())
        })
        .unwrap();
        found
    }

    #[test]
    fn test_registration_follows_lifetime() {
        let vmo = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
        let id = vmo.id();
        assert!(contains(id));
        drop(vmo);
        assert!(!contains(id));
    }

    #[test]
    fn test_for_each_stops_at_first_error() {
        let _vmo = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
        let mut calls = 0;
        let result = for_each(|_| {
            calls += 1;
            Err(crate::VmError::BadState)
        });
        assert_eq!(result, Err(crate::VmError::BadState));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_cursor_skips_removed_object() {
        let a = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
        let b = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
        let c = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
        let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());

        let mut cursor = VmoCursor::new();
        loop {
            let object = cursor.next().expect("cursor ended before reaching a");
            if object.id() == a_id {
                break;
            }
        }
        drop(b);

        let mut seen_c = false;
        while let Some(object) = cursor.next() {
            assert_ne!(object.id(), b_id);
            if object.id() == c_id {
                seen_c = true;
                break;
            }
        }
        assert!(seen_c);
        drop(a);
        drop(c);
    }

    #[test]
    fn test_cursor_end_is_terminal() {
        let mut cursor = VmoCursor::new();
        while cursor.next().is_some() {}
        let _late = VmObjectPaged::create(PagedOptions::empty(), PAGE_SIZE).unwrap();
        assert!(cursor.next().is_none());
    }
}
