//! Deferred Deletion
//!
//! Dropping the last reference to an object that owns a reference to its
//! parent would recurse once per ancestor. Clone chains can be arbitrarily
//! deep, so instead of dropping the parent reference directly, destructors
//! hand it to [`deferred_release`]. Releases are queued on a per-type
//! worklist and drained iteratively by whichever thread got there first, so
//! a chain of any length tears down with constant extra stack depth.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

// ============================================================================
// Types
// ============================================================================

/// Queue membership state embedded in each deferrable object
///
/// Only changed while the owning type's queue lock is held.
#[derive(Debug, Default)]
pub struct DeferredDeleteState {
    queued: AtomicBool,
}

impl DeferredDeleteState {
    pub const fn new() -> Self {
        Self {
            queued: AtomicBool::new(false),
        }
    }

    /// Whether the object is sitting on its type's worklist
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }
}

/// Types whose last reference may be released through the worklist
pub trait DeferredDelete: Send + Sync + Sized + 'static {
    /// The per-type worklist
    fn delete_queue() -> &'static DeferredDeleteQueue<Self>;

    /// Membership state embedded in the object
    fn deferred_delete_state(&self) -> &DeferredDeleteState;

    /// Hook run right before the drainer drops its reference
    fn maybe_dead_transition(&self) {}
}

struct QueueInner<T> {
    list: VecDeque<Arc<T>>,
    running: bool,
}

/// Per-type worklist of objects waiting to be released
pub struct DeferredDeleteQueue<T> {
    inner: Mutex<QueueInner<T>>,
}

impl<T> DeferredDeleteQueue<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                list: VecDeque::new(),
                running: false,
            }),
        }
    }

    /// Number of queued objects
    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Release
// ============================================================================

/// Release a reference without recursing into the object's destructor chain
///
/// If the calling thread becomes the drainer it keeps popping and dropping
/// queued objects until the worklist is empty. Any releases triggered by
/// those drops are queued and handled by the same loop.
pub fn deferred_release<T: DeferredDelete>(object: Arc<T>) {
    let queue = T::delete_queue();
    let mut inner = queue.inner.lock();

    let state = object.deferred_delete_state();
    if state.queued.load(Ordering::SeqCst) {
        // The queue holds its own reference, so this is not the last one
        drop(object);
    } else {
        state.queued.store(true, Ordering::SeqCst);
        inner.list.push_front(object);
    }

    if inner.running {
        return;
    }
    inner.running = true;

    while let Some(next) = inner.list.pop_front() {
        next.deferred_delete_state().queued.store(false, Ordering::SeqCst);
        drop(inner);

        next.maybe_dead_transition();
        drop(next);

        inner = queue.inner.lock();
    }
    inner.running = false;
}
