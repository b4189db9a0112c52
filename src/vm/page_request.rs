//! Page Requests - Pager Contract and Resumable Faults
//!
//! A pager-backed object asks its [`PageSource`] for content it does not
//! hold. Requests are recorded on the backing store while its lock is held,
//! then sent and waited on by the faulting caller after the lock is dropped.
//!
//! ## Protocol
//!
//! Operations that may need a pager return a [`Resolution`]:
//! - `Ready`: the work completed
//! - `ShouldWait`: a request is outstanding; call [`MultiPageRequest::wait`]
//!   with no lock held, then retry
//! - `Continue`: a batch request is still open and was extended; keep going,
//!   and once the range is exhausted call [`MultiPageRequest::finalize`] and
//!   wait before retrying
//!
//! Requests are resolved by the pager supplying pages or failing the range
//! out of band.

use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::vm::vm_cow_pages::CowId;

// ============================================================================
// Pager Contract
// ============================================================================

/// A request delivered to a pager, in offsets of the pager-backed object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequestInfo {
    pub offset: u64,
    pub len: u64,
}

/// Static properties of a page source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSourceProperties {
    /// Track dirty state of supplied pages for writeback
    pub dirty_tracked: bool,
}

/// User-mode pager endpoint
///
/// `send_request` is always invoked with no VM lock held, so the pager may
/// resolve the request synchronously by calling back into the object.
pub trait PageSource: Send + Sync {
    /// Ask the pager to supply `[offset, offset + len)`
    fn send_request(&self, request: PageRequestInfo);

    /// Source properties
    fn properties(&self) -> PageSourceProperties {
        PageSourceProperties::default()
    }

    /// Kernel object id of the pager, if any
    fn koid(&self) -> Option<u64> {
        None
    }

    /// The object detached from this source
    fn on_detach(&self) {}
}

// ============================================================================
// Resolution
// ============================================================================

/// Outcome of an operation that may have to wait on a pager
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Completed
    Ready(T),
    /// A request is outstanding, wait and retry
    ShouldWait,
    /// A batch request was extended, keep going then finalize
    Continue,
}

impl<T> Resolution<T> {
    /// Whether the operation completed
    pub fn is_ready(&self) -> bool {
        matches!(self, Resolution::Ready(_))
    }

    /// Map the ready value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Resolution::Ready(value) => Resolution::Ready(f(value)),
            Resolution::ShouldWait => Resolution::ShouldWait,
            Resolution::Continue => Resolution::Continue,
        }
    }
}

/// Non-ready outcome of registering a page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pending {
    ShouldWait,
    Continue,
}

impl<T> From<Pending> for Resolution<T> {
    fn from(pending: Pending) -> Self {
        match pending {
            Pending::ShouldWait => Resolution::ShouldWait,
            Pending::Continue => Resolution::Continue,
        }
    }
}

// ============================================================================
// Outstanding Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStatus {
    Pending,
    Complete,
    Failed(VmError),
}

struct PageRequestInner {
    offset: u64,
    len: u64,
    status: RequestStatus,
}

/// An outstanding request, registered on the backing store until resolved
pub(crate) struct PageRequest {
    inner: Mutex<PageRequestInner>,
}

impl PageRequest {
    pub(crate) fn new(offset: u64, len: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PageRequestInner {
                offset,
                len,
                status: RequestStatus::Pending,
            }),
        })
    }

    /// `(offset, len)` in backing store offsets
    pub(crate) fn range(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.offset, inner.len)
    }

    pub(crate) fn covers(&self, offset: u64) -> bool {
        let (start, len) = self.range();
        offset >= start && offset - start < len
    }

    pub(crate) fn overlaps(&self, offset: u64, len: u64) -> bool {
        let (start, req_len) = self.range();
        offset < start.saturating_add(req_len) && start < offset.saturating_add(len)
    }

    fn extend(&self, len: u64) {
        self.inner.lock().len += len;
    }

    pub(crate) fn complete(&self) {
        let mut inner = self.inner.lock();
        if inner.status == RequestStatus::Pending {
            inner.status = RequestStatus::Complete;
        }
    }

    pub(crate) fn fail(&self, error: VmError) {
        let mut inner = self.inner.lock();
        if inner.status == RequestStatus::Pending {
            inner.status = RequestStatus::Failed(error);
        }
    }

    fn status(&self) -> RequestStatus {
        self.inner.lock().status
    }
}

impl fmt::Debug for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PageRequest")
            .field("offset", &inner.offset)
            .field("len", &inner.len)
            .field("status", &inner.status)
            .finish()
    }
}

// ============================================================================
// MultiPageRequest
// ============================================================================

struct ActiveRequest {
    request: Arc<PageRequest>,
    source: Arc<dyn PageSource>,
    node: CowId,
    /// Created by this token and not yet delivered to the pager
    needs_send: bool,
    /// Still accepting contiguous pages
    open: bool,
}

/// Caller-owned token tracking at most one outstanding page request
///
/// A token that is dropped with an unsent request delivers it, so other
/// faulting threads that attached to the request are not left waiting.
pub struct MultiPageRequest {
    allow_batching: bool,
    active: Option<ActiveRequest>,
}

impl MultiPageRequest {
    /// Create an empty token
    pub fn new(allow_batching: bool) -> Self {
        Self {
            allow_batching,
            active: None,
        }
    }

    /// Whether the token tracks an outstanding request
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub(crate) fn allow_batching(&self) -> bool {
        self.allow_batching
    }

    /// Close the batch and deliver it to the pager
    ///
    /// Must be called with no VM lock held.
    pub fn finalize(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.open = false;
            if active.needs_send {
                active.needs_send = false;
                let (offset, len) = active.request.range();
                active.source.send_request(PageRequestInfo { offset, len });
            }
        }
    }

    /// Finalize, then block until the pager resolves the request
    ///
    /// Returns the failure status the pager reported, if any. Must be called
    /// with no VM lock held.
    pub fn wait(&mut self) -> VmResult<()> {
        self.finalize();
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        loop {
            match active.request.status() {
                RequestStatus::Pending => core::hint::spin_loop(),
                RequestStatus::Complete => return Ok(()),
                RequestStatus::Failed(error) => {
                    log::warn!("page request on {:?} failed: {}", active.node, error);
                    return Err(error);
                }
            }
        }
    }

    /// The request this token is tracking, if it is the given one
    pub(crate) fn is_tracking(&self, request: &Arc<PageRequest>) -> bool {
        self.active.as_ref().is_some_and(|active| Arc::ptr_eq(&active.request, request))
    }

    /// End offset of the open batch on `node`
    pub(crate) fn open_batch_end(&self, node: CowId) -> Option<u64> {
        let active = self.active.as_ref()?;
        if !active.open || active.node != node {
            return None;
        }
        let (offset, len) = active.request.range();
        Some(offset + len)
    }

    /// Grow the open batch by `len` bytes
    pub(crate) fn extend_batch(&mut self, len: u64) {
        if let Some(active) = self.active.as_ref() {
            active.request.extend(len);
        }
    }

    /// Track a request this token created
    pub(crate) fn start(&mut self, request: Arc<PageRequest>, source: Arc<dyn PageSource>, node: CowId) {
        self.active = Some(ActiveRequest {
            request,
            source,
            node,
            needs_send: true,
            open: self.allow_batching,
        });
    }

    /// Wait on a request someone else created
    pub(crate) fn attach(&mut self, request: Arc<PageRequest>, source: Arc<dyn PageSource>, node: CowId) {
        self.active = Some(ActiveRequest {
            request,
            source,
            node,
            needs_send: false,
            open: false,
        });
    }
}

impl Drop for MultiPageRequest {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl fmt::Debug for MultiPageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiPageRequest")
            .field("allow_batching", &self.allow_batching)
            .field("active", &self.active.as_ref().map(|a| &a.request))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Recorder {
        sent: Mutex<Vec<PageRequestInfo>>,
    }

    impl PageSource for Recorder {
        fn send_request(&self, request: PageRequestInfo) {
            self.sent.lock().push(request);
        }
    }

    #[test]
    fn test_batch_finalize_sends_once() {
        let source = Arc::new(Recorder { sent: Mutex::new(Vec::new()) });
        let node = CowId::new();
        let request = PageRequest::new(0, 4096);

        let mut token = MultiPageRequest::new(true);
        token.start(request.clone(), source.clone(), node);
        assert_eq!(token.open_batch_end(node), Some(4096));
        token.extend_batch(4096);
        assert_eq!(token.open_batch_end(node), Some(8192));

        token.finalize();
        token.finalize();
        assert_eq!(token.open_batch_end(node), None);
        assert_eq!(source.sent.lock().as_slice(), &[PageRequestInfo { offset: 0, len: 8192 }]);

        request.complete();
        assert_eq!(token.wait(), Ok(()));
        assert!(!token.is_active());
    }

    #[test]
    fn test_failed_request_reports_error() {
        let source = Arc::new(Recorder { sent: Mutex::new(Vec::new()) });
        let request = PageRequest::new(0, 4096);
        let mut token = MultiPageRequest::new(false);
        token.attach(request.clone(), source.clone(), CowId::new());
        request.fail(VmError::Io);
        assert_eq!(token.wait(), Err(VmError::Io));
        // Attached requests are never re-sent
        assert!(source.sent.lock().is_empty());
    }

    #[test]
    fn test_dropped_token_delivers_request() {
        let source = Arc::new(Recorder { sent: Mutex::new(Vec::new()) });
        {
            let mut token = MultiPageRequest::new(false);
            token.start(PageRequest::new(4096, 4096), source.clone(), CowId::new());
        }
        assert_eq!(source.sent.lock().len(), 1);
    }

    #[test]
    fn test_resolution_map() {
        let ready: Resolution<u32> = Resolution::Ready(2);
        assert_eq!(ready.map(|v| v * 2), Resolution::Ready(4));
        let wait: Resolution<u32> = Pending::ShouldWait.into();
        assert!(!wait.is_ready());
    }
}
