//! Physical page allocation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{PageId, Result, VmError, PAGE_SIZE_BYTES};

/// One physical page frame.
pub struct Page {
    id: PageId,
    data: Box<[u8]>,
    loaned: bool,
}

impl Page {
    /// Creates a zero-filled frame.
    pub fn new(id: PageId, loaned: bool) -> Self {
        Self {
            id,
            data: vec![0u8; PAGE_SIZE_BYTES].into_boxed_slice(),
            loaned,
        }
    }

    /// Frame identifier.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Frame contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable frame contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// True when the frame is borrowed from a loan pool and may be reclaimed
    /// by its lender.
    pub fn is_loaned(&self) -> bool {
        self.loaned
    }

    /// True when every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("loaned", &self.loaned)
            .finish()
    }
}

/// Allocation flags.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AllocFlags {
    /// Contents must be zero.
    pub zeroed: bool,
    /// A loaned frame is acceptable.
    pub loaned_ok: bool,
}

impl AllocFlags {
    /// Zeroed, non-loaned frame.
    pub const ZEROED: AllocFlags = AllocFlags {
        zeroed: true,
        loaned_ok: false,
    };

    /// Frame whose contents the caller overwrites immediately.
    pub const UNINIT: AllocFlags = AllocFlags {
        zeroed: false,
        loaned_ok: false,
    };
}

/// Source of physical frames.
pub trait PageAllocator: Send + Sync {
    /// Allocates one frame. May fail with `OutOfMemory` or `WouldBlock`.
    fn alloc_page(&self, flags: AllocFlags) -> Result<Page>;

    /// Returns a frame.
    fn free_page(&self, page: Page);
}

/// Heap-backed allocator with optional limits, used for tests and tools.
///
/// Frames come from the global heap and are always zeroed. A limit turns the
/// allocator into a bounded pool that fails with `OutOfMemory` when exhausted.
#[derive(Default)]
pub struct HeapAllocator {
    next_id: AtomicU64,
    limit: Option<u64>,
    loan_pool: AtomicU64,
    outstanding: AtomicU64,
    loaned_outstanding: AtomicU64,
    allocated_total: AtomicU64,
    freed_total: AtomicU64,
}

impl HeapAllocator {
    /// Unbounded allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that refuses to hold more than `pages` frames at once.
    pub fn with_limit(pages: u64) -> Self {
        Self {
            limit: Some(pages),
            ..Self::default()
        }
    }

    /// Makes `pages` loaned frames available to callers passing `loaned_ok`.
    pub fn with_loaned_pages(self, pages: u64) -> Self {
        self.loan_pool.store(pages, Ordering::Relaxed);
        self
    }

    /// Frames currently allocated.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Loaned frames currently allocated.
    pub fn loaned_outstanding(&self) -> u64 {
        self.loaned_outstanding.load(Ordering::Acquire)
    }

    /// Frames handed out over the allocator's lifetime.
    pub fn allocated_total(&self) -> u64 {
        self.allocated_total.load(Ordering::Relaxed)
    }

    /// Frames returned over the allocator's lifetime.
    pub fn freed_total(&self) -> u64 {
        self.freed_total.load(Ordering::Relaxed)
    }

    fn reserve(&self) -> Result<()> {
        let Some(limit) = self.limit else {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| VmError::OutOfMemory)
    }

    fn take_loan(&self) -> bool {
        self.loan_pool
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PageAllocator for HeapAllocator {
    fn alloc_page(&self, flags: AllocFlags) -> Result<Page> {
        self.reserve()?;
        let loaned = flags.loaned_ok && self.take_loan();
        if loaned {
            self.loaned_outstanding.fetch_add(1, Ordering::AcqRel);
        }
        self.allocated_total.fetch_add(1, Ordering::Relaxed);
        let id = PageId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        Ok(Page::new(id, loaned))
    }

    fn free_page(&self, page: Page) {
        if page.is_loaned() {
            self.loaned_outstanding.fetch_sub(1, Ordering::AcqRel);
            self.loan_pool.fetch_add(1, Ordering::AcqRel);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.freed_total.fetch_add(1, Ordering::Relaxed);
    }
}
