use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::source::{PageProvider, PageRequest, PageSourceProperties};

/// Provider that records every request and never answers on its own.
///
/// Tests and tools drain [`TestPager::take_requests`] and answer through the
/// owning object's `supply_pages` / `dirty_pages`.
pub struct TestPager {
    properties: PageSourceProperties,
    requests: Mutex<Vec<PageRequest>>,
    detached: AtomicBool,
}

impl TestPager {
    /// Creates a recording provider with the given properties.
    pub fn new(properties: PageSourceProperties) -> Arc<Self> {
        Arc::new(Self {
            properties,
            requests: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
        })
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }

    /// Drains the recorded requests.
    pub fn take_requests(&self) -> Vec<PageRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// True once the owning source detached.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

impl PageProvider for TestPager {
    fn properties(&self) -> PageSourceProperties {
        self.properties
    }

    fn send_request(&self, request: &PageRequest) {
        self.requests.lock().push(request.clone());
    }

    fn on_detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}
