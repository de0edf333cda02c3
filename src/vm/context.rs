use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::primitives::alloc::{AllocFlags, HeapAllocator, Page, PageAllocator};
use crate::primitives::compress::{Compression, PageCompressor};
use crate::types::{NodeId, Result};
use crate::vm::metrics::{NoopMetrics, VmMetrics};
use crate::vm::options::VmOptions;
use crate::vm::page_list::ContentSlot;
use crate::vm::queues::PageQueues;

/// Kind of translation removal requested from a [`MappingObserver`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnmapOp {
    /// Remove every translation.
    Remove,
    /// Downgrade writable translations to read-only.
    RemoveWrite,
}

/// Receives requests to tear down hardware translations of a node's pages.
pub trait MappingObserver: Send + Sync {
    /// Unmaps `[offset, offset + len)` of `node`.
    fn unmap(&self, node: NodeId, offset: u64, len: u64, op: UnmapOp);
}

/// Collaborators and shared state for every object created from it.
pub struct VmContext {
    allocator: Arc<dyn PageAllocator>,
    compression: Option<Compression>,
    queues: PageQueues,
    metrics: Arc<dyn VmMetrics>,
    observer: Option<Arc<dyn MappingObserver>>,
    options: VmOptions,
    next_node_id: AtomicU64,
}

impl VmContext {
    /// Starts building a context.
    pub fn builder() -> VmContextBuilder {
        VmContextBuilder::default()
    }

    /// Context with a heap allocator and no compressor.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Engine options.
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Resident page queues.
    pub fn queues(&self) -> &PageQueues {
        &self.queues
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &dyn VmMetrics {
        self.metrics.as_ref()
    }

    /// Compression state, when a compressor is present and enabled.
    pub(crate) fn compression(&self) -> Option<&Compression> {
        self.compression
            .as_ref()
            .filter(|_| self.options.compression_enabled)
    }

    /// Compression state regardless of the enable flag, for releasing
    /// references created before it was turned off.
    pub(crate) fn compression_state(&self) -> Option<&Compression> {
        self.compression.as_ref()
    }

    /// Pages parked while the codec runs on them.
    pub fn compressions_in_flight(&self) -> usize {
        self.compression.as_ref().map_or(0, |c| c.in_flight())
    }

    pub(crate) fn next_node_id(&self) -> NodeId {
        NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn alloc_page(&self, flags: AllocFlags) -> Result<Page> {
        self.allocator.alloc_page(flags)
    }

    /// Frees a page that is not tracked by the queues.
    pub(crate) fn free_page(&self, page: Page) {
        self.allocator.free_page(page);
    }

    /// Releases whatever a slot owns.
    pub(crate) fn release_slot(&self, slot: ContentSlot) {
        match slot {
            ContentSlot::Page(page) => {
                debug_assert_eq!(page.pin_count, 0, "releasing a pinned page");
                self.queues.remove(page.id());
                self.allocator.free_page(page.page);
            }
            ContentSlot::Reference(reference) => match self.compression_state() {
                Some(compression) if reference.handle.is_temporary() => {
                    if let Some(page) = compression.take_page(reference.handle) {
                        self.allocator.free_page(page);
                    }
                }
                Some(compression) => compression.free(reference.handle),
                None => warn!(handle = reference.handle.raw(), "vm.release.orphan_reference"),
            },
            ContentSlot::Marker | ContentSlot::Interval(_) => {}
        }
    }

    pub(crate) fn unmap(&self, node: NodeId, offset: u64, len: u64, op: UnmapOp) {
        if let Some(observer) = &self.observer {
            observer.unmap(node, offset, len, op);
        }
    }
}

/// Builder for [`VmContext`].
#[derive(Default)]
pub struct VmContextBuilder {
    allocator: Option<Arc<dyn PageAllocator>>,
    compressor: Option<Arc<dyn PageCompressor>>,
    metrics: Option<Arc<dyn VmMetrics>>,
    observer: Option<Arc<dyn MappingObserver>>,
    options: VmOptions,
}

impl VmContextBuilder {
    /// Sets the physical allocator. Defaults to an unbounded [`HeapAllocator`].
    pub fn allocator(mut self, allocator: Arc<dyn PageAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Enables compression of anonymous pages through `compressor`.
    pub fn compressor(mut self, compressor: Arc<dyn PageCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Sets the metrics sink. Defaults to [`NoopMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn VmMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the mapping observer.
    pub fn observer(mut self, observer: Arc<dyn MappingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sets engine options.
    pub fn options(mut self, options: VmOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the context.
    pub fn build(self) -> Arc<VmContext> {
        Arc::new(VmContext {
            allocator: self
                .allocator
                .unwrap_or_else(|| Arc::new(HeapAllocator::new()) as Arc<dyn PageAllocator>),
            compression: self.compressor.map(Compression::new),
            queues: PageQueues::new(),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(NoopMetrics) as Arc<dyn VmMetrics>),
            observer: self.observer,
            options: self.options,
            next_node_id: AtomicU64::new(1),
        })
    }
}
