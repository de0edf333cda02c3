use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::primitives::pager::RequestKind;

/// Hooks for counting engine activity.
pub trait VmMetrics: Send + Sync {
    /// A page was resolved for `intent` ("read", "write" or "own").
    fn page_fault(&self, intent: &'static str);

    /// A page was forked into a node; `zero_copy` when it moved without a copy.
    fn page_forked(&self, zero_copy: bool);

    /// A request was sent to a page source.
    fn pager_request(&self, kind: RequestKind);

    /// A page was reclaimed by `strategy` ("evict", "compress" or "discard").
    fn page_reclaimed(&self, strategy: &'static str);

    /// Compression of a page failed and the page was reinstated.
    fn compression_failed(&self);

    /// A reclaim candidate was declined for `reason`.
    fn reclaim_declined(&self, reason: &'static str);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl VmMetrics for NoopMetrics {
    fn page_fault(&self, _intent: &'static str) {}
    fn page_forked(&self, _zero_copy: bool) {}
    fn pager_request(&self, _kind: RequestKind) {}
    fn page_reclaimed(&self, _strategy: &'static str) {}
    fn compression_failed(&self) {}
    fn reclaim_declined(&self, _reason: &'static str) {}
}

/// Atomic counters for every hook.
#[derive(Default)]
pub struct CounterMetrics {
    /// Read faults resolved.
    pub read_faults: AtomicU64,
    /// Write faults resolved.
    pub write_faults: AtomicU64,
    /// Own (pin/commit) faults resolved.
    pub own_faults: AtomicU64,
    /// Pages copied into a node.
    pub forks_copied: AtomicU64,
    /// Pages moved into a node without copying.
    pub forks_zero_copy: AtomicU64,
    /// Read requests sent.
    pub read_requests: AtomicU64,
    /// Dirty requests sent.
    pub dirty_requests: AtomicU64,
    /// Pages evicted.
    pub evictions: AtomicU64,
    /// Pages compressed.
    pub compressions: AtomicU64,
    /// Compressions that failed.
    pub compression_failures: AtomicU64,
    /// Pages dropped by discard.
    pub discards: AtomicU64,
    /// Reclaim candidates declined.
    pub reclaim_declines: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Read faults resolved.
    pub read_faults: u64,
    /// Write faults resolved.
    pub write_faults: u64,
    /// Own faults resolved.
    pub own_faults: u64,
    /// Pages copied into a node.
    pub forks_copied: u64,
    /// Pages moved without copying.
    pub forks_zero_copy: u64,
    /// Read requests sent.
    pub read_requests: u64,
    /// Dirty requests sent.
    pub dirty_requests: u64,
    /// Pages evicted.
    pub evictions: u64,
    /// Pages compressed.
    pub compressions: u64,
    /// Compressions that failed.
    pub compression_failures: u64,
    /// Pages dropped by discard.
    pub discards: u64,
    /// Reclaim candidates declined.
    pub reclaim_declines: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            read_faults: load(&self.read_faults),
            write_faults: load(&self.write_faults),
            own_faults: load(&self.own_faults),
            forks_copied: load(&self.forks_copied),
            forks_zero_copy: load(&self.forks_zero_copy),
            read_requests: load(&self.read_requests),
            dirty_requests: load(&self.dirty_requests),
            evictions: load(&self.evictions),
            compressions: load(&self.compressions),
            compression_failures: load(&self.compression_failures),
            discards: load(&self.discards),
            reclaim_declines: load(&self.reclaim_declines),
        }
    }
}

impl VmMetrics for CounterMetrics {
    fn page_fault(&self, intent: &'static str) {
        let counter = match intent {
            "write" => &self.write_faults,
            "own" => &self.own_faults,
            _ => &self.read_faults,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn page_forked(&self, zero_copy: bool) {
        if zero_copy {
            self.forks_zero_copy.fetch_add(1, Ordering::Relaxed);
        } else {
            self.forks_copied.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn pager_request(&self, kind: RequestKind) {
        match kind {
            RequestKind::Read => self.read_requests.fetch_add(1, Ordering::Relaxed),
            RequestKind::Dirty => self.dirty_requests.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn page_reclaimed(&self, strategy: &'static str) {
        let counter = match strategy {
            "evict" => &self.evictions,
            "compress" => &self.compressions,
            _ => &self.discards,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn compression_failed(&self) {
        self.compression_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn reclaim_declined(&self, _reason: &'static str) {
        self.reclaim_declines.fetch_add(1, Ordering::Relaxed);
    }
}
