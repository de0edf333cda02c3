//! Consumer-facing handle over one visible node.
//!
//! A [`VmObject`] owns the single external reference to a visible node.
//! Bidirectional clones may hide that node and hand the handle a successor;
//! every operation therefore reloads the handle when it finds its node
//! hidden and retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::primitives::pager::{PageSource, RequestKind};
use crate::types::{checked_page_range, is_page_aligned, NodeId, Result, VmError, PAGE_SIZE, PAGE_SIZE_BYTES};
use crate::vm::clone::{clone_node, CloneMode};
use crate::vm::context::VmContext;
use crate::vm::dirty::{self, DirtyRange, Pending};
use crate::vm::lookup::{issue_request, owner_of, resolve, Access, Fault, Found, Intent, Resolved, ResolvedPage};
use crate::vm::node::{
    Chain, CowPageNode, LifeCycle, Locked, NodeSpec, ReclaimStrategy, FIRST_ANON_ORDER,
    PAGER_ROOT_ORDER,
};
use crate::vm::options::CreateOptions;
use crate::vm::page_list::{ContentSlot, DirtyState};
use crate::vm::range;
use crate::vm::reclaim::DiscardTracker;
use crate::vm::verify;

/// Access-pattern hint for [`VmObject::hint_range`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EvictionHint {
    /// The range will not be needed soon; reclaim it first.
    DontNeed,
    /// Keep resident pager-backed pages of the range out of eviction.
    AlwaysNeed,
}

/// Result of locking a discardable object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LockState {
    /// The contents were discarded while the object was unlocked.
    pub was_discarded: bool,
}

/// A memory object.
pub struct VmObject {
    ctx: Arc<VmContext>,
    node: RwLock<Arc<CowPageNode>>,
    high_priority: AtomicBool,
}

fn pages(offset: u64, end: u64) -> impl Iterator<Item = u64> {
    (offset..end).step_by(PAGE_SIZE_BYTES)
}

impl VmObject {
    fn from_node(ctx: Arc<VmContext>, node: Arc<CowPageNode>) -> Self {
        Self {
            ctx,
            node: RwLock::new(node),
            high_priority: AtomicBool::new(false),
        }
    }

    /// Creates an anonymous object of `size` bytes reading as zero.
    pub fn create(ctx: &Arc<VmContext>, size: u64, options: CreateOptions) -> Result<Self> {
        if !is_page_aligned(size) {
            return Err(VmError::InvalidArgs("size must be page aligned"));
        }
        let strategy = if options.discardable {
            ReclaimStrategy::Discard
        } else {
            ReclaimStrategy::Compress
        };
        let (node, mut state) = CowPageNode::new(
            ctx,
            NodeSpec {
                order: FIRST_ANON_ORDER,
                size,
                source: None,
                strategy,
                pager_backed: false,
                resizable: options.resizable,
            },
        );
        if options.discardable {
            state.discard = Some(DiscardTracker::new());
        }
        state.life = LifeCycle::Alive;
        drop(state);
        debug!(node = %node.id(), size, discardable = options.discardable, "vm.object.create");
        Ok(Self::from_node(ctx.clone(), node))
    }

    /// Creates an object whose content comes from `source`.
    pub fn create_from_source(
        ctx: &Arc<VmContext>,
        size: u64,
        source: Arc<PageSource>,
        options: CreateOptions,
    ) -> Result<Self> {
        if !is_page_aligned(size) {
            return Err(VmError::InvalidArgs("size must be page aligned"));
        }
        if options.discardable {
            return Err(VmError::BadState("pager-backed objects cannot be discardable"));
        }
        if source.is_detached() {
            return Err(VmError::BadState("page source is detached"));
        }
        let props = source.properties();
        let (node, mut state) = CowPageNode::new(
            ctx,
            NodeSpec {
                order: PAGER_ROOT_ORDER,
                size,
                source: Some(source),
                strategy: ReclaimStrategy::Evict,
                pager_backed: true,
                resizable: options.resizable,
            },
        );
        state.life = LifeCycle::Alive;
        drop(state);
        debug!(
            node = %node.id(),
            size,
            tracks_dirty = props.tracks_dirty,
            traps_dirty = props.traps_dirty,
            "vm.object.create_from_source"
        );
        Ok(Self::from_node(ctx.clone(), node))
    }

    /// Context the object belongs to.
    pub fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    /// Identifier of the node currently behind the handle.
    pub fn id(&self) -> NodeId {
        self.current_node().id()
    }

    /// Page source of a pager-backed root.
    pub fn source(&self) -> Option<Arc<PageSource>> {
        self.current_node().source().cloned()
    }

    pub(crate) fn current_node(&self) -> Arc<CowPageNode> {
        self.node.read().clone()
    }

    /// Runs `op` against the node behind the handle until it does not report
    /// the node as hidden.
    fn with_node<T>(&self, mut op: impl FnMut(&Arc<CowPageNode>) -> Result<Option<T>>) -> Result<T> {
        loop {
            let node = self.current_node();
            if let Some(value) = op(&node)? {
                return Ok(value);
            }
            trace!(node = %node.id(), "vm.object.handle_moved");
        }
    }

    fn with_resolved<T>(
        &self,
        offset: u64,
        access: Access,
        op: impl FnOnce(&mut Resolved) -> Result<T>,
    ) -> Result<T> {
        loop {
            let node = self.current_node();
            match resolve(&self.ctx, &node, offset, access)? {
                Fault::Ready(mut resolved) => return op(&mut resolved),
                Fault::Stale => trace!(node = %node.id(), "vm.object.handle_moved"),
                Fault::NeedRead { source, offset, len } => {
                    return Err(issue_request(&self.ctx, RequestKind::Read, &source, offset, len));
                }
                Fault::NeedDirty { source, offset, len } => {
                    return Err(issue_request(&self.ctx, RequestKind::Dirty, &source, offset, len));
                }
            }
        }
    }

    fn pending(&self, pending: Pending) -> VmError {
        let node = self.current_node();
        let Some(source) = node.source() else {
            return VmError::BadState("not a pager-backed root");
        };
        match pending {
            Pending::Read { offset, len } => {
                issue_request(&self.ctx, RequestKind::Read, source, offset, len)
            }
            Pending::Dirty { offset, len } => {
                issue_request(&self.ctx, RequestKind::Dirty, source, offset, len)
            }
        }
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.current_node().lock().size
    }

    /// Changes the size. Shrinking drops content beyond the new size; growing
    /// exposes zero content.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        self.with_node(|node| range::resize(&self.ctx, node, new_size))
    }

    /// Resolves one page for `intent`.
    ///
    /// Returns [`VmError::WouldBlock`] when the page source must supply the
    /// page or acknowledge a dirty transition first; retry the same offset
    /// once the carried request completes.
    pub fn require_page(&self, offset: u64, intent: Intent) -> Result<ResolvedPage> {
        self.with_resolved(offset, intent.into(), |resolved| Ok(resolved.describe()))
    }

    /// Copies bytes out of the object.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(VmError::OutOfRange)?;
        let mut cursor = offset;
        while cursor < end {
            let in_page = (cursor % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE_BYTES - in_page).min((end - cursor) as usize);
            let dst_start = (cursor - offset) as usize;
            let dst = &mut buf[dst_start..dst_start + chunk];
            self.with_resolved(cursor, Access::Read, |resolved| {
                match resolved.page() {
                    Some(slot) => dst.copy_from_slice(&slot.page.data()[in_page..in_page + chunk]),
                    None => dst.fill(0),
                }
                Ok(())
            })?;
            cursor += chunk as u64;
        }
        Ok(())
    }

    /// Copies bytes into the object, forking shared pages first.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(VmError::OutOfRange)?;
        let mut cursor = offset;
        while cursor < end {
            let in_page = (cursor % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE_BYTES - in_page).min((end - cursor) as usize);
            let src_start = (cursor - offset) as usize;
            let src = &data[src_start..src_start + chunk];
            self.with_resolved(cursor, Access::Write, |resolved| {
                let slot = resolved
                    .page_mut()
                    .ok_or(VmError::BadState("write resolved to no page"))?;
                slot.page.data_mut()[in_page..in_page + chunk].copy_from_slice(src);
                Ok(())
            })?;
            cursor += chunk as u64;
        }
        Ok(())
    }

    /// Creates a clone of `[offset, offset + len)`.
    pub fn clone(&self, offset: u64, len: u64, mode: CloneMode) -> Result<VmObject> {
        checked_page_range(offset, len)?;
        let node = self.with_node(|_| clone_node(&self.ctx, &self.node, offset, len, mode))?;
        Ok(Self::from_node(self.ctx.clone(), node))
    }

    /// Makes every page of the range resident and owned by this object.
    pub fn commit_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = checked_page_range(offset, len)?;
        let access = if self.current_node().is_pager_root() {
            Access::Read
        } else {
            Access::Own
        };
        for at in pages(offset, end) {
            self.with_resolved(at, access, |_| Ok(()))?;
        }
        Ok(())
    }

    /// Frees committed pages of an anonymous root.
    pub fn decommit_range(&self, offset: u64, len: u64) -> Result<()> {
        self.with_node(|node| range::decommit_range(&self.ctx, node, offset, len))
    }

    /// Makes the range read as zero.
    pub fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        self.with_node(|node| range::zero_range(&self.ctx, node, offset, len))
    }

    /// Pins every page of the range. On failure no page stays pinned by this call.
    pub fn pin(&self, offset: u64, len: u64) -> Result<()> {
        let end = checked_page_range(offset, len)?;
        let mut pinned = Vec::new();
        for at in pages(offset, end) {
            match self.pin_page(at) {
                Ok(()) => pinned.push(at),
                Err(err) => {
                    for done in pinned {
                        if let Err(rollback) = self.unpin(done, PAGE_SIZE) {
                            warn!(offset = done, error = %rollback, "vm.object.pin_rollback_failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn pin_page(&self, offset: u64) -> Result<()> {
        let ctx = self.ctx.clone();
        self.with_resolved(offset, Access::Own, |resolved| {
            let Found::Page { level: 0, offset } = resolved.found else {
                return Err(VmError::BadState("pin resolved to a shared page"));
            };
            let target = resolved.chain.level_mut(0);
            let node = target.node.clone();
            let state = &mut *target.state;
            let slot = state
                .pages
                .page_mut(offset)
                .ok_or(VmError::BadState("pin resolved to no page"))?;
            slot.pin_count = slot
                .pin_count
                .checked_add(1)
                .ok_or(VmError::BadState("pin count overflow"))?;
            state.pinned_pages += 1;
            if let Some(slot) = state.pages.page(offset) {
                ctx.queues().set_kind(slot.id(), node.queue_kind(state, slot));
            }
            Ok(())
        })
    }

    /// Drops one pin from every page of the range. Fails with
    /// [`VmError::NotFound`], changing nothing, if any page is not pinned.
    pub fn unpin(&self, offset: u64, len: u64) -> Result<()> {
        let end = checked_page_range(offset, len)?;
        self.with_node(|node| {
            let Some(mut chain) = Chain::lock_visible(node) else {
                return Ok(None);
            };
            let target = chain.level_mut(0);
            if end > target.state.size {
                return Err(VmError::OutOfRange);
            }
            let all_pinned = pages(offset, end)
                .all(|at| target.state.pages.page(at).is_some_and(|p| p.pin_count > 0));
            if !all_pinned {
                return Err(VmError::NotFound);
            }
            let state = &mut *target.state;
            for at in pages(offset, end) {
                let Some(slot) = state.pages.page_mut(at) else {
                    continue;
                };
                slot.pin_count -= 1;
                let unpinned = slot.pin_count == 0;
                state.pinned_pages -= 1;
                if unpinned {
                    if let Some(slot) = state.pages.page(at) {
                        self.ctx
                            .queues()
                            .set_kind(slot.id(), node.queue_kind(state, slot));
                    }
                }
            }
            Ok(Some(()))
        })
    }

    /// Marks the object high priority, keeping its pages and every ancestor
    /// page it can reach out of reclamation.
    pub fn set_high_priority(&self, enable: bool) {
        loop {
            let node = self.current_node();
            let Some(mut chain) = Chain::lock_visible(&node) else {
                continue;
            };
            if self.high_priority.load(Ordering::Acquire) == enable {
                return;
            }
            self.high_priority.store(enable, Ordering::Release);
            propagate_high_priority(&self.ctx, &mut chain, enable);
            debug!(node = %node.id(), enable, "vm.object.high_priority");
            return;
        }
    }

    /// Applies an access hint to resident pages of the range.
    pub fn hint_range(&self, offset: u64, len: u64, hint: EvictionHint) -> Result<()> {
        let end = checked_page_range(offset, len)?;
        self.with_node(|node| {
            let Some(mut chain) = Chain::lock_visible(node) else {
                return Ok(None);
            };
            if end > chain.level(0).state.size {
                return Err(VmError::OutOfRange);
            }
            chain.lock_to_root();
            for at in pages(offset, end) {
                let Some((level, key)) = owner_of(&chain, at) else {
                    continue;
                };
                let owner = chain.level_mut(level);
                let pager_root = owner.node.is_pager_root();
                let Some(slot) = owner.state.pages.page_mut(key) else {
                    continue;
                };
                match hint {
                    EvictionHint::DontNeed => self.ctx.queues().mark_dont_need(slot.id()),
                    EvictionHint::AlwaysNeed if pager_root => {
                        slot.always_need = true;
                        self.ctx.queues().touch(slot.id());
                    }
                    EvictionHint::AlwaysNeed => {}
                }
            }
            trace!(node = %node.id(), offset, len, ?hint, "vm.object.hint");
            Ok(Some(()))
        })
    }

    fn with_discard<T>(
        &self,
        op: impl Fn(&mut DiscardTracker) -> Result<T>,
    ) -> Result<T> {
        self.with_node(|node| {
            let mut state = node.lock();
            if state.hidden {
                return Ok(None);
            }
            let tracker = state
                .discard
                .as_mut()
                .ok_or(VmError::BadState("object is not discardable"))?;
            op(tracker).map(Some)
        })
    }

    /// Locks a discardable object's contents against discard.
    pub fn lock_discardable(&self) -> Result<LockState> {
        self.with_discard(|tracker| {
            Ok(LockState {
                was_discarded: tracker.lock(),
            })
        })
    }

    /// Locks a discardable object only if its contents are still present.
    pub fn try_lock_discardable(&self) -> Result<()> {
        self.with_discard(|tracker| tracker.try_lock())
    }

    /// Releases one lock taken with [`VmObject::lock_discardable`] or
    /// [`VmObject::try_lock_discardable`].
    pub fn unlock_discardable(&self) -> Result<()> {
        self.with_discard(|tracker| tracker.unlock())
    }

    /// Supplies content for empty pages of a pager-backed root.
    pub fn supply_pages(&self, offset: u64, data: &[u8]) -> Result<()> {
        dirty::supply_pages(&self.ctx, &self.current_node(), offset, data)
    }

    /// Acknowledges a dirty request for the range.
    pub fn dirty_pages(&self, offset: u64, len: u64) -> Result<()> {
        dirty::dirty_pages(&self.ctx, &self.current_node(), offset, len)
    }

    /// Marks the range Dirty, asking the source first when it traps dirty
    /// transitions.
    pub fn mark_dirty(&self, offset: u64, len: u64) -> Result<()> {
        match dirty::mark_dirty(&self.ctx, &self.current_node(), offset, len)? {
            None => Ok(()),
            Some(pending) => Err(self.pending(pending)),
        }
    }

    /// Starts writeback of the range.
    pub fn writeback_begin(&self, offset: u64, len: u64) -> Result<()> {
        dirty::writeback_begin(&self.ctx, &self.current_node(), offset, len)
    }

    /// Finishes writeback of the range.
    pub fn writeback_end(&self, offset: u64, len: u64) -> Result<()> {
        dirty::writeback_end(&self.ctx, &self.current_node(), offset, len)
    }

    /// Ranges that still need writeback.
    pub fn enumerate_dirty_ranges(&self, offset: u64, len: u64) -> Result<Vec<DirtyRange>> {
        dirty::enumerate_dirty_ranges(&self.current_node(), offset, len)
    }

    /// Dirty state of the resident content at `offset`.
    pub fn dirty_state(&self, offset: u64) -> Result<Option<DirtyState>> {
        dirty::dirty_state(&self.current_node(), offset)
    }

    /// Pages attributed to this object: its own pages, plus each page it
    /// shares through hidden ancestors divided among everyone sharing it.
    pub fn attributed_pages(&self) -> f64 {
        loop {
            let node = self.current_node();
            let Some(mut chain) = Chain::lock_visible(&node) else {
                continue;
            };
            chain.lock_hidden_ancestors();
            let size = chain.level(0).state.size;
            return attributed(&chain, 0, 0, size);
        }
    }

    /// Logs the chain from this object to its root.
    pub fn dump(&self) {
        loop {
            let node = self.current_node();
            let Some(mut chain) = Chain::lock_visible(&node) else {
                continue;
            };
            chain.lock_to_root();
            for level in 0..chain.len() {
                dump_level(level, chain.level(level));
            }
            return;
        }
    }

    /// Checks share counts and structural invariants of the whole hierarchy
    /// this object belongs to.
    pub fn verify_hierarchy(&self) -> Result<()> {
        verify::verify_from(&self.current_node())
    }
}

fn propagate_high_priority(ctx: &VmContext, chain: &mut Chain, enable: bool) {
    let mut level = 0;
    loop {
        let locked = chain.level_mut(level);
        let old = locked.state.high_priority;
        let new = if enable {
            old + 1
        } else {
            debug_assert!(old > 0, "high priority count underflow");
            old.saturating_sub(1)
        };
        locked.state.high_priority = new;
        if (old == 0) == (new == 0) {
            return;
        }
        let node = locked.node.clone();
        let state = &*locked.state;
        for (_, slot) in state.pages.iter() {
            if let ContentSlot::Page(page) = slot {
                ctx.queues().set_kind(page.id(), node.queue_kind(state, page));
            }
        }
        if !chain.push_parent() {
            return;
        }
        level += 1;
    }
}

fn attributed(chain: &Chain, level: usize, start: u64, end: u64) -> f64 {
    let state = &chain.level(level).state;
    let mut total = 0.0;
    for key in state.pages.keys_in(start, end) {
        let share = match state.pages.get(key) {
            Some(ContentSlot::Page(page)) => page.share_count,
            Some(ContentSlot::Reference(reference)) => reference.share_count,
            _ => continue,
        };
        total += 1.0 / f64::from(share + 1);
    }
    if level + 1 < chain.len() && chain.level(level + 1).state.hidden {
        for (gap_start, gap_end) in state.pages.gaps(start, end) {
            let gap_end = gap_end.min(state.parent_limit);
            if gap_start < gap_end {
                total += attributed(
                    chain,
                    level + 1,
                    gap_start + state.parent_offset,
                    gap_end + state.parent_offset,
                );
            }
        }
    }
    total
}

fn dump_level(level: usize, locked: &Locked) {
    let state = &locked.state;
    info!(
        level,
        node = %locked.node.id(),
        hidden = state.hidden,
        size = state.size,
        parent_offset = state.parent_offset,
        parent_limit = state.parent_limit,
        slots = state.pages.len(),
        children = state.children.len(),
        pinned = state.pinned_pages,
        high_priority = state.high_priority,
        "vm.object.dump"
    );
    for (offset, slot) in state.pages.iter() {
        debug!(
            level,
            offset,
            kind = slot.kind_name(),
            span = slot.span(),
            share = slot.share_count(),
            "vm.object.dump_slot"
        );
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        self.set_high_priority(false);
        let node = self.current_node();
        trace!(node = %node.id(), "vm.object.drop");
        node.release_handle(&self.ctx);
    }
}
