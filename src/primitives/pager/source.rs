use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::types::{Result, VmError, PAGE_SIZE};

/// What a [`PageRequest`] asks the provider to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RequestKind {
    /// Supply page contents for the range.
    Read,
    /// Acknowledge that the range may transition to Dirty.
    Dirty,
}

/// Resumable token describing an outstanding request to a page source.
///
/// Returned inside [`VmError::WouldBlock`]; the caller waits on it with
/// [`PageSource::wait`] and then retries the same operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageRequest {
    id: u64,
    kind: RequestKind,
    offset: u64,
    len: u64,
}

impl PageRequest {
    /// Builds a request token.
    pub fn new(id: u64, kind: RequestKind, offset: u64, len: u64) -> Self {
        Self {
            id,
            kind,
            offset,
            len,
        }
    }

    /// Unique id assigned by the source.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request kind.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// First byte covered.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the request covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    fn overlaps(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        self.offset < end && offset < self.end()
    }

    fn covers(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }
}

/// Capabilities a provider advertises for dirty tracking.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageSourceProperties {
    /// Pages carry Clean/Dirty/AwaitingClean state and take part in writeback.
    pub tracks_dirty: bool,
    /// Clean to Dirty transitions require an acknowledged dirty request.
    pub traps_dirty: bool,
}

impl PageSourceProperties {
    /// Source with no dirty tracking; every page is Untracked.
    pub const fn untracked() -> Self {
        Self {
            tracks_dirty: false,
            traps_dirty: false,
        }
    }

    /// Source that tracks dirty state without trapping transitions.
    pub const fn tracking() -> Self {
        Self {
            tracks_dirty: true,
            traps_dirty: false,
        }
    }

    /// Source that tracks dirty state and traps every Clean to Dirty transition.
    pub const fn trapping() -> Self {
        Self {
            tracks_dirty: true,
            traps_dirty: true,
        }
    }
}

/// External party that supplies page contents and acknowledges dirty transitions.
pub trait PageProvider: Send + Sync {
    /// Dirty-tracking behaviour of this provider.
    fn properties(&self) -> PageSourceProperties;

    /// Delivers a new outstanding request. Must not call back into the object
    /// synchronously.
    fn send_request(&self, request: &PageRequest);

    /// Called once when the source is detached.
    fn on_detach(&self) {}
}

enum Failure {
    Detached,
    Io(String),
}

#[derive(Default)]
struct SourceState {
    outstanding: Vec<PageRequest>,
    failed: FxHashMap<u64, Failure>,
    detached: bool,
}

/// Core-side handle to a [`PageProvider`].
pub struct PageSource {
    provider: Arc<dyn PageProvider>,
    properties: PageSourceProperties,
    next_id: AtomicU64,
    state: Mutex<SourceState>,
    resolved: Condvar,
}

impl PageSource {
    /// Wraps a provider.
    pub fn new(provider: Arc<dyn PageProvider>) -> Arc<Self> {
        let mut properties = provider.properties();
        if properties.traps_dirty {
            properties.tracks_dirty = true;
        }
        Arc::new(Self {
            provider,
            properties,
            next_id: AtomicU64::new(1),
            state: Mutex::new(SourceState::default()),
            resolved: Condvar::new(),
        })
    }

    /// Properties captured when the source was created.
    pub fn properties(&self) -> PageSourceProperties {
        self.properties
    }

    /// True after [`PageSource::detach`].
    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Snapshot of the requests that have not been resolved yet.
    pub fn outstanding(&self) -> Vec<PageRequest> {
        self.state.lock().outstanding.clone()
    }

    /// Issues (or joins) a read request for `[offset, offset + len)`.
    pub fn request_read(&self, offset: u64, len: u64) -> Result<PageRequest> {
        self.request(RequestKind::Read, offset, len)
    }

    /// Issues (or joins) a dirty request for `[offset, offset + len)`.
    pub fn request_dirty(&self, offset: u64, len: u64) -> Result<PageRequest> {
        self.request(RequestKind::Dirty, offset, len)
    }

    fn request(&self, kind: RequestKind, offset: u64, len: u64) -> Result<PageRequest> {
        let request = {
            let mut state = self.state.lock();
            if state.detached {
                return Err(VmError::BadState("page source detached"));
            }
            if let Some(existing) = state
                .outstanding
                .iter()
                .find(|r| r.kind == kind && r.covers(offset))
            {
                return Ok(existing.clone());
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = PageRequest::new(id, kind, offset, len.max(PAGE_SIZE));
            state.outstanding.push(request.clone());
            request
        };
        debug!(
            id = request.id,
            kind = ?kind,
            offset,
            len = request.len,
            "pager.source.request"
        );
        self.provider.send_request(&request);
        Ok(request)
    }

    /// Blocks until `request` is resolved or `timeout` elapses.
    ///
    /// Returns `WouldBlock` again on timeout, `Io` when the provider failed the
    /// range and `BadState` when the source was detached.
    pub fn wait(&self, request: &PageRequest, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(failure) = state.failed.remove(&request.id) {
                return Err(match failure {
                    Failure::Detached => VmError::BadState("page source detached"),
                    Failure::Io(reason) => VmError::Io(reason),
                });
            }
            if !state.outstanding.iter().any(|r| r.id == request.id) {
                return Ok(());
            }
            if self.resolved.wait_until(&mut state, deadline).timed_out() {
                return Err(VmError::WouldBlock(request.clone()));
            }
        }
    }

    /// Resolves read requests overlapping a supplied range.
    pub fn on_pages_supplied(&self, offset: u64, len: u64) {
        self.resolve(offset, len, Some(RequestKind::Read));
    }

    /// Resolves dirty requests overlapping an acknowledged range.
    pub fn on_pages_dirtied(&self, offset: u64, len: u64) {
        self.resolve(offset, len, Some(RequestKind::Dirty));
    }

    /// Wakes every request overlapping a range that no longer exists.
    pub fn on_range_invalidated(&self, offset: u64, len: u64) {
        self.resolve(offset, len, None);
    }

    /// Fails every request overlapping the range.
    pub fn on_pages_failed(&self, offset: u64, len: u64, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        let (failed, kept): (Vec<_>, Vec<_>) = state
            .outstanding
            .drain(..)
            .partition(|r| r.overlaps(offset, len));
        state.outstanding = kept;
        for request in failed {
            warn!(id = request.id, offset, len, reason = %reason, "pager.source.failed");
            state.failed.insert(request.id, Failure::Io(reason.clone()));
        }
        drop(state);
        self.resolved.notify_all();
    }

    fn resolve(&self, offset: u64, len: u64, kind: Option<RequestKind>) {
        let mut state = self.state.lock();
        let before = state.outstanding.len();
        state
            .outstanding
            .retain(|r| !(r.overlaps(offset, len) && kind.map_or(true, |k| k == r.kind)));
        let resolved = before - state.outstanding.len();
        drop(state);
        if resolved > 0 {
            self.resolved.notify_all();
        }
    }

    /// Detaches the provider. Outstanding requests fail with `BadState` and new
    /// requests are refused.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        if state.detached {
            return;
        }
        state.detached = true;
        let pending: Vec<_> = state.outstanding.drain(..).collect();
        for request in pending {
            state.failed.insert(request.id, Failure::Detached);
        }
        drop(state);
        self.resolved.notify_all();
        self.provider.on_detach();
        debug!("pager.source.detached");
    }
}
