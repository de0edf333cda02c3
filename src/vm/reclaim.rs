//! Page reclamation.
//!
//! The reclaimer walks the oldest entries of the reclaim queues and frees
//! each page the way its owning node allows: pager-backed roots evict clean
//! pages, anonymous nodes compress, discardable nodes drop everything at
//! once. The page found in the slot must still be the one the queue named,
//! otherwise the candidate is stale and skipped.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, trace};

use crate::primitives::compress::{CompressResult, Compression};
use crate::primitives::concurrency::OrderedGuard;
use crate::types::{PageId, Result, VmError, PAGE_SIZE};
use crate::vm::context::{UnmapOp, VmContext};
use crate::vm::node::{
    child_seeds, release_range, unmap_descendants, CowPageNode, LifeCycle, NodeState,
    ReclaimStrategy,
};
use crate::vm::object::VmObject;
use crate::vm::options::EvictionPolicy;
use crate::vm::page_list::{ContentSlot, DirtyState, PageSlot, RefSlot};
use crate::vm::queues::QueueKind;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DiscardState {
    Reclaimable,
    Unreclaimable,
    Discarded,
}

/// Lock state of a discardable node.
///
/// Unlocked nodes may be discarded as a whole. Locking pins the contents in
/// place and reports whether they were lost since the last unlock.
#[derive(Debug)]
pub(crate) struct DiscardTracker {
    state: DiscardState,
    lock_count: u64,
}

impl DiscardTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: DiscardState::Reclaimable,
            lock_count: 0,
        }
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.state == DiscardState::Discarded
    }

    pub(crate) fn is_reclaimable(&self) -> bool {
        self.state == DiscardState::Reclaimable
    }

    /// Locks the contents. Returns true if they had been discarded.
    pub(crate) fn lock(&mut self) -> bool {
        let was_discarded = self.is_discarded();
        self.lock_count += 1;
        self.state = DiscardState::Unreclaimable;
        was_discarded
    }

    /// Locks the contents only if they are still present.
    pub(crate) fn try_lock(&mut self) -> Result<()> {
        if self.is_discarded() {
            return Err(VmError::NotFound);
        }
        self.lock_count += 1;
        self.state = DiscardState::Unreclaimable;
        Ok(())
    }

    pub(crate) fn unlock(&mut self) -> Result<()> {
        if self.lock_count == 0 {
            return Err(VmError::NotFound);
        }
        self.lock_count -= 1;
        if self.lock_count == 0 {
            self.state = DiscardState::Reclaimable;
        }
        Ok(())
    }

    fn mark_discarded(&mut self) {
        debug_assert!(self.is_reclaimable());
        self.state = DiscardState::Discarded;
    }
}

/// What happened to one reclaim candidate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReclaimOutcome {
    /// A clean pager-backed page was dropped.
    Evicted,
    /// An anonymous page was compressed (or found to be zero).
    Compressed,
    /// A discardable node lost all of its pages.
    Discarded {
        /// Pages freed with the node's contents.
        pages: u64,
    },
    /// The page stays resident for the given reason.
    Declined(&'static str),
    /// The slot no longer holds the page that was queued.
    Stale,
}

/// Totals of one [`Reclaimer::reclaim`] pass.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ReclaimStats {
    /// Candidates looked at.
    pub scanned: u64,
    /// Pages evicted.
    pub evicted: u64,
    /// Pages compressed.
    pub compressed: u64,
    /// Pages freed by discarding whole nodes.
    pub discarded: u64,
    /// Candidates declined.
    pub declined: u64,
    /// Candidates that had changed since they were queued.
    pub stale: u64,
}

impl ReclaimStats {
    /// Pages freed in total.
    pub fn reclaimed(&self) -> u64 {
        self.evicted + self.compressed + self.discarded
    }

    fn record(&mut self, outcome: ReclaimOutcome) {
        match outcome {
            ReclaimOutcome::Evicted => self.evicted += 1,
            ReclaimOutcome::Compressed => self.compressed += 1,
            ReclaimOutcome::Discarded { pages } => self.discarded += pages,
            ReclaimOutcome::Declined(_) => self.declined += 1,
            ReclaimOutcome::Stale => self.stale += 1,
        }
    }
}

/// Frees resident pages of a context under memory pressure.
#[derive(Clone)]
pub struct Reclaimer {
    ctx: Arc<VmContext>,
}

impl Reclaimer {
    /// Reclaimer over every object of `ctx`.
    pub fn new(ctx: Arc<VmContext>) -> Self {
        Self { ctx }
    }

    /// Tries to free `target` pages, oldest first. Stops once every page that
    /// was reclaimable at the start has been looked at.
    pub fn reclaim(&self, target: u64, policy: EvictionPolicy) -> ReclaimStats {
        let budget = self.ctx.queues().reclaimable() as u64;
        let batch = self.ctx.options().reclaim_batch.max(1) as u64;
        let mut stats = ReclaimStats::default();
        'outer: while stats.reclaimed() < target && stats.scanned < budget {
            let take = batch.min(budget - stats.scanned) as usize;
            let candidates = self.ctx.queues().reclaim_candidates(take);
            if candidates.is_empty() {
                break;
            }
            for candidate in candidates {
                stats.scanned += 1;
                let outcome = match candidate.node.upgrade() {
                    Some(node) => self.reclaim_at(&node, candidate.offset, Some(candidate.page), policy),
                    None => ReclaimOutcome::Stale,
                };
                if let ReclaimOutcome::Declined(reason) = outcome {
                    self.ctx.metrics().reclaim_declined(reason);
                    self.ctx.queues().touch(candidate.page);
                }
                stats.record(outcome);
                if stats.reclaimed() >= target {
                    break 'outer;
                }
            }
        }
        debug!(
            target,
            scanned = stats.scanned,
            reclaimed = stats.reclaimed(),
            declined = stats.declined,
            "vm.reclaim.pass"
        );
        stats
    }

    /// Reclaims the page `object` itself owns at `offset`.
    pub fn reclaim_page(
        &self,
        object: &VmObject,
        offset: u64,
        policy: EvictionPolicy,
    ) -> Result<ReclaimOutcome> {
        if offset >= object.size() {
            return Err(VmError::OutOfRange);
        }
        let outcome = self.reclaim_at(&object.current_node(), offset, None, policy);
        if let ReclaimOutcome::Declined(reason) = outcome {
            self.ctx.metrics().reclaim_declined(reason);
        }
        Ok(outcome)
    }

    /// Runs [`Reclaimer::reclaim`] every `interval` on a background thread.
    pub fn spawn(self, interval: Duration, target: u64) -> ReclaimerHandle {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::spawn(move || self.reclaim_loop(receiver, interval, target));
        ReclaimerHandle {
            sender,
            worker: Some(worker),
        }
    }

    fn reclaim_loop(&self, receiver: Receiver<ReclaimMessage>, interval: Duration, target: u64) {
        info!(interval_ms = interval.as_millis() as u64, target, "vm.reclaim.worker_started");
        loop {
            match receiver.recv_timeout(interval) {
                Ok(ReclaimMessage::Trigger) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    let policy = self.ctx.options().eviction_policy;
                    self.reclaim(target, policy);
                }
                Ok(ReclaimMessage::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("vm.reclaim.worker_stopped");
    }

    fn reclaim_at(
        &self,
        node: &Arc<CowPageNode>,
        offset: u64,
        expected: Option<PageId>,
        policy: EvictionPolicy,
    ) -> ReclaimOutcome {
        let mut state = node.lock();
        if state.life != LifeCycle::Alive {
            return ReclaimOutcome::Stale;
        }
        let Some(slot) = state.pages.page(offset) else {
            return ReclaimOutcome::Stale;
        };
        let id = slot.id();
        if expected.is_some_and(|e| e != id) {
            return ReclaimOutcome::Stale;
        }
        if slot.pin_count > 0 {
            return ReclaimOutcome::Declined("pinned");
        }
        if state.high_priority > 0 {
            return ReclaimOutcome::Declined("high_priority");
        }
        if slot.always_need && policy == EvictionPolicy::FollowHints {
            return ReclaimOutcome::Declined("always_need");
        }
        match node.strategy() {
            ReclaimStrategy::Evict => {
                if slot.holds_unsaved() {
                    return ReclaimOutcome::Declined("dirty");
                }
                self.ctx.unmap(node.id(), offset, PAGE_SIZE, UnmapOp::Remove);
                let evicted = state.pages.remove(offset);
                let seeds = child_seeds(&state, offset, offset + PAGE_SIZE);
                drop(state);
                unmap_descendants(&self.ctx, seeds, UnmapOp::Remove);
                if let Some(slot) = evicted {
                    self.ctx.release_slot(slot);
                }
                self.ctx.metrics().page_reclaimed("evict");
                trace!(node = %node.id(), offset, "vm.reclaim.evict");
                ReclaimOutcome::Evicted
            }
            ReclaimStrategy::Discard => self.discard(node, &mut state),
            ReclaimStrategy::Compress => match self.ctx.compression() {
                Some(compression) => self.compress(node, state, offset, compression),
                None => ReclaimOutcome::Declined("no_compressor"),
            },
            ReclaimStrategy::Never => ReclaimOutcome::Declined("unreclaimable"),
        }
    }

    fn discard(&self, node: &Arc<CowPageNode>, state: &mut NodeState) -> ReclaimOutcome {
        if !state.discard.as_ref().is_some_and(|d| d.is_reclaimable()) {
            return ReclaimOutcome::Declined("locked");
        }
        if state.pinned_pages > 0 {
            return ReclaimOutcome::Declined("pinned");
        }
        let size = state.size;
        self.ctx.unmap(node.id(), 0, size, UnmapOp::Remove);
        let pages = state.pages.len() as u64;
        release_range(&self.ctx, state, 0, size);
        if let Some(tracker) = state.discard.as_mut() {
            tracker.mark_discarded();
        }
        for _ in 0..pages {
            self.ctx.metrics().page_reclaimed("discard");
        }
        debug!(node = %node.id(), pages, "vm.reclaim.discard");
        ReclaimOutcome::Discarded { pages }
    }

    /// Compresses the page at `offset`. The codec runs with the node unlocked;
    /// a placeholder keeps the slot until the result is installed.
    fn compress(
        &self,
        node: &Arc<CowPageNode>,
        mut state: OrderedGuard<NodeState>,
        offset: u64,
        compression: &Compression,
    ) -> ReclaimOutcome {
        let Some(ContentSlot::Page(slot)) = state.pages.remove(offset) else {
            return ReclaimOutcome::Stale;
        };
        let share_count = slot.share_count;
        self.ctx.queues().remove(slot.id());
        let temp = compression.start(slot.page);
        state.pages.insert(
            offset,
            ContentSlot::Reference(RefSlot {
                handle: temp,
                share_count,
            }),
        );
        self.ctx.unmap(node.id(), offset, PAGE_SIZE, UnmapOp::Remove);
        let seeds = child_seeds(&state, offset, offset + PAGE_SIZE);
        drop(state);
        unmap_descendants(&self.ctx, seeds, UnmapOp::Remove);

        let result = compression.compress(temp);

        let mut state = node.lock();
        let still_placed = matches!(
            state.pages.get(offset),
            Some(ContentSlot::Reference(r)) if r.handle == temp
        );
        let Some(page) = compression.take_page(temp) else {
            if let CompressResult::Compressed(handle) = result {
                compression.free(handle);
            }
            return ReclaimOutcome::Stale;
        };
        if !still_placed {
            self.ctx.free_page(page);
            if let CompressResult::Compressed(handle) = result {
                compression.free(handle);
            }
            return ReclaimOutcome::Stale;
        }
        match result {
            CompressResult::Compressed(handle) => {
                self.ctx.free_page(page);
                state.pages.insert(
                    offset,
                    ContentSlot::Reference(RefSlot {
                        handle,
                        share_count,
                    }),
                );
                self.ctx.metrics().page_reclaimed("compress");
                trace!(node = %node.id(), offset, "vm.reclaim.compress");
                ReclaimOutcome::Compressed
            }
            CompressResult::Zero => {
                self.ctx.free_page(page);
                if state.parent.is_some() || state.hidden {
                    state.pages.insert(offset, ContentSlot::Marker);
                } else {
                    state.pages.remove(offset);
                }
                self.ctx.metrics().page_reclaimed("compress");
                trace!(node = %node.id(), offset, "vm.reclaim.zero");
                ReclaimOutcome::Compressed
            }
            CompressResult::Fail => {
                let mut slot = PageSlot::new(page, DirtyState::Untracked);
                slot.share_count = share_count;
                self.ctx
                    .queues()
                    .insert(slot.id(), node, offset, QueueKind::FailedReclaim);
                state.pages.insert(offset, ContentSlot::Page(slot));
                self.ctx.metrics().compression_failed();
                trace!(node = %node.id(), offset, "vm.reclaim.compress_failed");
                ReclaimOutcome::Declined("compression_failed")
            }
        }
    }
}

enum ReclaimMessage {
    Trigger,
    Shutdown,
}

/// Controls a background reclaimer started by [`Reclaimer::spawn`].
pub struct ReclaimerHandle {
    sender: Sender<ReclaimMessage>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ReclaimerHandle {
    /// Runs a pass now instead of waiting for the interval.
    pub fn trigger(&self) -> Result<()> {
        self.sender
            .send(ReclaimMessage::Trigger)
            .map_err(|_| VmError::BadState("reclaimer channel closed"))
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let _ = self.sender.send(ReclaimMessage::Shutdown);
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| VmError::BadState("reclaimer thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for ReclaimerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
