//! Copy-on-write hierarchy nodes.
//!
//! A node owns a sparse [`PageList`] and an optional strong reference to its
//! parent. Parents know their children only through weak references. Visible
//! nodes are reachable from a [`crate::VmObject`] handle; hidden nodes exist
//! only to hold content shared by their two children.
//!
//! Locking: each node has its own [`OrderedMutex`]. A child's lock order is
//! always below its parent's, so walking from a node towards the root takes
//! locks in increasing order. Siblings share an order and are ordered by id.
//! Anything else is taken with `try_lock`, falling back to dropping every
//! lock, relocking in sorted order and revalidating.

use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::primitives::concurrency::{LockKey, OrderedGuard, OrderedMutex};
use crate::primitives::pager::PageSource;
use crate::types::{NodeId, PAGE_SIZE};
use crate::vm::context::{UnmapOp, VmContext};
use crate::vm::page_list::{ContentSlot, DirtyState, PageList, PageSlot, RefSlot};
use crate::vm::queues::QueueKind;
use crate::vm::reclaim::DiscardTracker;

/// Distance between a parent's lock order and its children's.
pub(crate) const LOCK_ORDER_DELTA: u64 = 3;
/// Lock order of pager-backed roots.
pub(crate) const PAGER_ROOT_ORDER: u64 = u64::MAX / 2;
/// Lock order of anonymous roots.
pub(crate) const FIRST_ANON_ORDER: u64 = PAGER_ROOT_ORDER - LOCK_ORDER_DELTA;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LifeCycle {
    Init,
    Alive,
    Dying,
    Dead,
}

/// How the reclaimer frees this node's pages. Fixed at creation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReclaimStrategy {
    Evict,
    Compress,
    Discard,
    Never,
}

pub(crate) struct ChildRef {
    pub(crate) id: NodeId,
    pub(crate) node: Weak<CowPageNode>,
}

pub(crate) struct NodeState {
    pub(crate) life: LifeCycle,
    pub(crate) hidden: bool,
    pub(crate) has_handle: bool,
    pub(crate) size: u64,
    pub(crate) parent: Option<Arc<CowPageNode>>,
    pub(crate) parent_offset: u64,
    pub(crate) parent_limit: u64,
    pub(crate) root_parent_offset: u64,
    pub(crate) children: SmallVec<[ChildRef; 2]>,
    pub(crate) pages: PageList,
    /// Outstanding pins on this node's own pages.
    pub(crate) pinned_pages: u64,
    /// Handle flag plus one per child with a non-zero count.
    pub(crate) high_priority: u64,
    pub(crate) discard: Option<DiscardTracker>,
}

impl NodeState {
    fn new(size: u64) -> Self {
        Self {
            life: LifeCycle::Init,
            hidden: false,
            has_handle: true,
            size,
            parent: None,
            parent_offset: 0,
            parent_limit: 0,
            root_parent_offset: 0,
            children: SmallVec::new(),
            pages: PageList::new(),
            pinned_pages: 0,
            high_priority: 0,
            discard: None,
        }
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.discard.as_ref().is_some_and(|d| d.is_discarded())
    }

    pub(crate) fn has_pins_in(&self, start: u64, end: u64) -> bool {
        self.pinned_pages > 0
            && self.pages.keys_in(start, end).into_iter().any(|k| {
                self.pages.page(k).is_some_and(|p| p.pin_count > 0)
            })
    }

    /// Children still alive, upgraded.
    pub(crate) fn live_children(&self) -> Vec<Arc<CowPageNode>> {
        self.children.iter().filter_map(|c| c.node.upgrade()).collect()
    }
}

pub(crate) struct CowPageNode {
    id: NodeId,
    lock: OrderedMutex<NodeState>,
    source: Option<Arc<PageSource>>,
    strategy: ReclaimStrategy,
    pager_backed: bool,
    resizable: bool,
}

/// Parameters for a node about to be created.
pub(crate) struct NodeSpec {
    pub(crate) order: u64,
    pub(crate) size: u64,
    pub(crate) source: Option<Arc<PageSource>>,
    pub(crate) strategy: ReclaimStrategy,
    pub(crate) pager_backed: bool,
    pub(crate) resizable: bool,
}

impl CowPageNode {
    pub(crate) fn new(ctx: &VmContext, shape: NodeSpec) -> (Arc<Self>, OrderedGuard<NodeState>) {
        let id = ctx.next_node_id();
        let (lock, guard) =
            OrderedMutex::new_locked(LockKey::new(shape.order, id.0), NodeState::new(shape.size));
        let node = Arc::new(Self {
            id,
            lock,
            source: shape.source,
            strategy: shape.strategy,
            pager_backed: shape.pager_backed,
            resizable: shape.resizable,
        });
        (node, guard)
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Arc<Self> {
        let ctx = VmContext::new();
        let (node, guard) = Self::new(
            &ctx,
            NodeSpec {
                order: FIRST_ANON_ORDER,
                size: PAGE_SIZE,
                source: None,
                strategy: ReclaimStrategy::Never,
                pager_backed: false,
                resizable: false,
            },
        );
        drop(guard);
        node
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn key(&self) -> LockKey {
        self.lock.key()
    }

    pub(crate) fn order(&self) -> u64 {
        self.lock.key().order
    }

    pub(crate) fn lock(&self) -> OrderedGuard<NodeState> {
        self.lock.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<OrderedGuard<NodeState>> {
        self.lock.try_lock()
    }

    pub(crate) fn source(&self) -> Option<&Arc<PageSource>> {
        self.source.as_ref()
    }

    pub(crate) fn is_pager_root(&self) -> bool {
        self.source.is_some()
    }

    pub(crate) fn is_pager_backed(&self) -> bool {
        self.pager_backed
    }

    pub(crate) fn strategy(&self) -> ReclaimStrategy {
        self.strategy
    }

    pub(crate) fn is_resizable(&self) -> bool {
        self.resizable
    }

    pub(crate) fn tracks_dirty(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|s| s.properties().tracks_dirty)
    }

    pub(crate) fn traps_dirty(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|s| s.properties().traps_dirty)
    }

    /// Queue a page held by this node belongs on.
    pub(crate) fn queue_kind(&self, state: &NodeState, slot: &PageSlot) -> QueueKind {
        if slot.pin_count > 0 {
            QueueKind::Wired
        } else if state.high_priority > 0 {
            QueueKind::HighPriority
        } else if self.is_pager_root() {
            if slot.holds_unsaved() {
                QueueKind::PagerBackedDirty
            } else {
                QueueKind::Reclaim
            }
        } else {
            QueueKind::Anonymous
        }
    }

    /// Drops the handle's reference and runs the dead transition as far as it goes.
    pub(crate) fn release_handle(self: &Arc<Self>, ctx: &VmContext) {
        {
            let mut state = self.lock();
            state.has_handle = false;
        }
        let mut next = Some(self.clone());
        while let Some(node) = next.take() {
            next = node.dead_transition(ctx);
        }
    }
}

/// A node together with its held lock.
pub(crate) struct Locked {
    pub(crate) state: OrderedGuard<NodeState>,
    pub(crate) node: Arc<CowPageNode>,
}

/// Locks held along a path from a node towards the root.
///
/// Level 0 is the node the operation started from; each following level is
/// the parent of the previous one.
pub(crate) struct Chain {
    levels: SmallVec<[Locked; 4]>,
}

impl Chain {
    pub(crate) fn lock(node: &Arc<CowPageNode>) -> Self {
        let state = node.lock();
        Self::from_locked(Locked {
            state,
            node: node.clone(),
        })
    }

    /// Locks a handle's node, or returns `None` if a clone hid it meanwhile.
    pub(crate) fn lock_visible(node: &Arc<CowPageNode>) -> Option<Self> {
        let chain = Self::lock(node);
        if chain.levels[0].state.hidden || chain.levels[0].state.life != LifeCycle::Alive {
            return None;
        }
        Some(chain)
    }

    pub(crate) fn from_locked(locked: Locked) -> Self {
        let mut levels = SmallVec::new();
        levels.push(locked);
        Self { levels }
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.len()
    }

    pub(crate) fn level(&self, level: usize) -> &Locked {
        &self.levels[level]
    }

    pub(crate) fn level_mut(&mut self, level: usize) -> &mut Locked {
        &mut self.levels[level]
    }

    pub(crate) fn top(&self) -> &Locked {
        &self.levels[self.levels.len() - 1]
    }

    /// Mutable access to two levels at once, `low < high`.
    pub(crate) fn pair_mut(&mut self, low: usize, high: usize) -> (&mut Locked, &mut Locked) {
        debug_assert!(low < high);
        let (left, right) = self.levels.split_at_mut(high);
        (&mut left[low], &mut right[0])
    }

    /// Locks the parent of the top level. Returns false at a root.
    pub(crate) fn push_parent(&mut self) -> bool {
        let Some(parent) = self.top().state.parent.clone() else {
            return false;
        };
        let state = parent.lock();
        self.levels.push(Locked {
            state,
            node: parent,
        });
        true
    }

    /// Extends the chain until the top is visible or a root. Every hidden
    /// ancestor reachable through hidden nodes ends up locked.
    pub(crate) fn lock_hidden_ancestors(&mut self) {
        while self.push_parent() {
            if !self.top().state.hidden {
                break;
            }
        }
    }

    /// Extends the chain to the hierarchy root.
    pub(crate) fn lock_to_root(&mut self) {
        while self.push_parent() {}
    }

    /// Ancestors above `chain[level]`, counting at most `cap` of them. Levels
    /// above the chain's top are locked one at a time while counting.
    pub(crate) fn depth_of(&self, level: usize, cap: u32) -> u32 {
        let mut depth = (self.levels.len() - 1 - level) as u32;
        let mut next = self.top().state.parent.clone();
        while let Some(node) = next {
            if depth >= cap {
                break;
            }
            depth += 1;
            next = node.lock().parent.clone();
        }
        depth
    }

    pub(crate) fn into_levels(self) -> SmallVec<[Locked; 4]> {
        self.levels
    }
}

/// Locks every node in `nodes` in ascending key order.
pub(crate) fn lock_sorted(mut nodes: Vec<Arc<CowPageNode>>) -> Vec<Locked> {
    nodes.sort_by_key(|n| n.key());
    nodes.dedup_by(|a, b| Arc::ptr_eq(a, b));
    nodes
        .into_iter()
        .map(|node| Locked {
            state: node.lock(),
            node,
        })
        .collect()
}

fn take_locked(locked: &mut Vec<Locked>, node: &Arc<CowPageNode>) -> Option<Locked> {
    let pos = locked.iter().position(|l| Arc::ptr_eq(&l.node, node))?;
    Some(locked.remove(pos))
}

/// Adds `delta` to the share count of every page visible through
/// `[start, end)` of `chain[level]` in hidden nodes.
///
/// Content at `level` itself is adjusted only when `include_level` is set.
/// Gaps are followed into the parent while it is hidden. A page whose count
/// would drop below zero has no remaining viewer and is freed.
pub(crate) fn adjust_shares(
    ctx: &VmContext,
    chain: &mut Chain,
    level: usize,
    start: u64,
    end: u64,
    delta: i32,
    include_level: bool,
) {
    if start >= end {
        return;
    }
    let (gaps, parent_offset, parent_limit) = {
        let locked = &mut chain.levels[level];
        if include_level {
            apply_share_delta(ctx, locked, start, end, delta);
        }
        let state = &locked.state;
        (
            state.pages.gaps(start, end),
            state.parent_offset,
            state.parent_limit,
        )
    };
    if level + 1 >= chain.len() || !chain.levels[level + 1].state.hidden {
        return;
    }
    for (gap_start, gap_end) in gaps {
        let gap_end = gap_end.min(parent_limit);
        if gap_start < gap_end {
            adjust_shares(
                ctx,
                chain,
                level + 1,
                gap_start + parent_offset,
                gap_end + parent_offset,
                delta,
                true,
            );
        }
    }
}

fn apply_share_delta(ctx: &VmContext, locked: &mut Locked, start: u64, end: u64, delta: i32) {
    let state = &mut locked.state;
    for key in state.pages.keys_in(start, end) {
        let freed = match state.pages.get_mut(key) {
            Some(ContentSlot::Page(PageSlot { share_count, .. }))
            | Some(ContentSlot::Reference(RefSlot { share_count, .. })) => {
                match share_count.checked_add_signed(delta) {
                    Some(count) => {
                        *share_count = count;
                        false
                    }
                    None => true,
                }
            }
            _ => false,
        };
        if freed {
            if let Some(slot) = state.pages.remove(key) {
                trace!(node = %locked.node.id(), offset = key, "vm.share.freed");
                ctx.release_slot(slot);
            }
        }
    }
}

/// Releases every slot in `[start, end)` of a locked node. Pins on released
/// pages are dropped.
pub(crate) fn release_range(ctx: &VmContext, state: &mut NodeState, start: u64, end: u64) {
    for (_, slot) in state.pages.take_range(start, end) {
        release_unpinned(ctx, state, slot);
    }
}

/// Takes every slot in `[start, end)` out of a node with no pins in the
/// range. The caller releases them once translations are gone.
pub(crate) fn detach_range(state: &mut NodeState, start: u64, end: u64) -> Vec<ContentSlot> {
    debug_assert!(!state.has_pins_in(start, end));
    state
        .pages
        .take_range(start, end)
        .into_iter()
        .map(|(_, slot)| slot)
        .collect()
}

/// A node that may see `[start, end)` of its parent through its window.
pub(crate) struct UnmapSeed {
    node: Arc<CowPageNode>,
    start: u64,
    end: u64,
}

/// Sub-ranges of `[start, end)` in the parent that `state` reads through its
/// window, in the node's own offsets.
fn seen_through_window(state: &NodeState, start: u64, end: u64) -> Vec<(u64, u64)> {
    let window_end = state.parent_offset.saturating_add(state.parent_limit);
    let (lo, hi) = (start.max(state.parent_offset), end.min(window_end));
    if lo >= hi {
        return Vec::new();
    }
    state
        .pages
        .gaps(lo - state.parent_offset, hi - state.parent_offset)
}

/// Seeds for every child of a locked node that may see `[start, end)` of it.
pub(crate) fn child_seeds(state: &NodeState, start: u64, end: u64) -> Vec<UnmapSeed> {
    if start >= end {
        return Vec::new();
    }
    state
        .live_children()
        .into_iter()
        .map(|node| UnmapSeed { node, start, end })
        .collect()
}

/// Removes translations of `[start, end)` of a locked child, before its
/// window changes, and returns seeds for the child's own descendants.
pub(crate) fn unmap_locked_child(
    ctx: &VmContext,
    child: &Locked,
    start: u64,
    end: u64,
    op: UnmapOp,
) -> Vec<UnmapSeed> {
    let mut seeds = Vec::new();
    for (lo, hi) in seen_through_window(&child.state, start, end) {
        if !child.state.hidden {
            ctx.unmap(child.node.id(), lo, hi - lo, op);
        }
        seeds.extend(child_seeds(&child.state, lo, hi));
    }
    seeds
}

/// Removes translations from every descendant that reads the seeded ranges
/// through its ancestors. Nodes are locked one at a time, so the caller must
/// hold no node lock.
pub(crate) fn unmap_descendants(ctx: &VmContext, mut pending: Vec<UnmapSeed>, op: UnmapOp) {
    while let Some(UnmapSeed { node, start, end }) = pending.pop() {
        let state = node.lock();
        if state.life == LifeCycle::Dead {
            continue;
        }
        for (lo, hi) in seen_through_window(&state, start, end) {
            if !state.hidden {
                trace!(node = %node.id(), offset = lo, len = hi - lo, "vm.unmap.descendant");
                ctx.unmap(node.id(), lo, hi - lo, op);
            }
            pending.extend(child_seeds(&state, lo, hi));
        }
    }
}

fn release_all(ctx: &VmContext, state: &mut NodeState) {
    for (_, slot) in state.pages.take_all() {
        release_unpinned(ctx, state, slot);
    }
    debug_assert_eq!(state.pinned_pages, 0);
}

fn release_unpinned(ctx: &VmContext, state: &mut NodeState, slot: ContentSlot) {
    match slot {
        ContentSlot::Page(mut page) => {
            state.pinned_pages -= u64::from(page.pin_count);
            page.pin_count = 0;
            ctx.release_slot(ContentSlot::Page(page));
        }
        other => ctx.release_slot(other),
    }
}

/// Locks taken for one dead-transition attempt.
struct DeathLocks {
    chain: Chain,
    sibling: Option<Locked>,
}

impl CowPageNode {
    /// Attempts the dead transition of `self`. Returns an ancestor that may
    /// now be able to die as well.
    fn dead_transition(self: &Arc<Self>, ctx: &VmContext) -> Option<Arc<CowPageNode>> {
        loop {
            let state = self.lock();
            if state.life == LifeCycle::Dead || state.has_handle || !state.children.is_empty() {
                return None;
            }
            if state.parent.is_none() {
                self.die_as_root(ctx, state);
                return None;
            }
            let mut chain = Chain::from_locked(Locked {
                state,
                node: self.clone(),
            });
            chain.lock_hidden_ancestors();
            let locks = match self.lock_sibling(chain) {
                Ok(locks) => locks,
                Err(snapshot) => match self.relock_for_death(snapshot) {
                    Some(locks) => locks,
                    None => {
                        trace!(node = %self.id, "vm.node.death_retry");
                        continue;
                    }
                },
            };
            return self.finish_death(ctx, locks);
        }
    }

    fn die_as_root(self: &Arc<Self>, ctx: &VmContext, mut state: OrderedGuard<NodeState>) {
        state.life = LifeCycle::Dying;
        release_all(ctx, &mut state);
        state.life = LifeCycle::Dead;
        drop(state);
        debug!(node = %self.id, "vm.node.dead");
        if let Some(source) = &self.source {
            source.detach();
        }
    }

    /// Takes the sibling's lock out of order with `try_lock`. On contention the
    /// nodes involved are returned so the caller can relock them in order.
    fn lock_sibling(
        self: &Arc<Self>,
        chain: Chain,
    ) -> std::result::Result<DeathLocks, Vec<Arc<CowPageNode>>> {
        let parent = chain.level(1);
        if !parent.state.hidden {
            return Ok(DeathLocks {
                chain,
                sibling: None,
            });
        }
        let Some(sibling) = parent
            .state
            .live_children()
            .into_iter()
            .find(|c| !Arc::ptr_eq(c, self))
        else {
            return Ok(DeathLocks {
                chain,
                sibling: None,
            });
        };
        match sibling.try_lock() {
            Some(state) => Ok(DeathLocks {
                chain,
                sibling: Some(Locked {
                    state,
                    node: sibling,
                }),
            }),
            None => {
                let mut nodes: Vec<_> = chain
                    .into_levels()
                    .into_iter()
                    .map(|l| l.node)
                    .collect();
                nodes.push(sibling);
                Err(nodes)
            }
        }
    }

    /// Relocks `[self, ancestors.., sibling]` in key order and checks that the
    /// structure observed before is unchanged.
    fn relock_for_death(self: &Arc<Self>, snapshot: Vec<Arc<CowPageNode>>) -> Option<DeathLocks> {
        let (path, sibling) = {
            let mut path = snapshot;
            let sibling = path.pop()?;
            (path, sibling)
        };
        let mut locked = lock_sorted(path.iter().cloned().chain(Some(sibling.clone())).collect());
        let mut levels = Vec::with_capacity(path.len());
        for node in &path {
            levels.push(take_locked(&mut locked, node)?);
        }
        let sibling = take_locked(&mut locked, &sibling)?;

        let me = &levels[0].state;
        if me.life == LifeCycle::Dead || me.has_handle || !me.children.is_empty() {
            return None;
        }
        for pair in levels.windows(2) {
            let linked = pair[0]
                .state
                .parent
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, &pair[1].node));
            if !linked || pair[1].state.life == LifeCycle::Dead {
                return None;
            }
        }
        let top = &levels[levels.len() - 1].state;
        if top.hidden && top.parent.is_some() {
            return None;
        }
        let parent = &levels[1];
        let sibling_linked = sibling
            .state
            .parent
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &parent.node));
        if !parent.state.hidden || !sibling_linked || sibling.state.life == LifeCycle::Dead {
            return None;
        }

        let mut iter = levels.into_iter();
        let mut chain = Chain::from_locked(iter.next()?);
        chain.levels.extend(iter);
        Some(DeathLocks {
            chain,
            sibling: Some(sibling),
        })
    }

    fn finish_death(self: &Arc<Self>, ctx: &VmContext, locks: DeathLocks) -> Option<Arc<CowPageNode>> {
        let DeathLocks {
            mut chain,
            mut sibling,
        } = locks;
        let mut detached: Vec<Arc<CowPageNode>> = Vec::new();

        {
            let me = &mut chain.level_mut(0).state;
            me.life = LifeCycle::Dying;
            debug_assert_eq!(me.high_priority, 0);
        }
        let parent_hidden = chain.level(1).state.hidden;
        if parent_hidden {
            let limit = {
                let me = &chain.level(0).state;
                me.parent_limit.min(me.size)
            };
            adjust_shares(ctx, &mut chain, 0, 0, limit, -1, false);
        }
        {
            let me = &mut chain.level_mut(0).state;
            release_all(ctx, me);
            if let Some(parent) = me.parent.take() {
                detached.push(parent);
            }
            me.life = LifeCycle::Dead;
        }
        let remaining = {
            let parent = &mut chain.level_mut(1).state;
            parent.children.retain(|c| c.id != self.id);
            parent.children.len()
        };
        debug!(node = %self.id, remaining, "vm.node.dead");

        let parent = chain.level(1).node.clone();
        let cascade = if parent_hidden {
            match (remaining, sibling.as_mut()) {
                (1, Some(survivor)) => {
                    merge_into_child(ctx, &mut chain, survivor, &mut detached);
                    None
                }
                (0, _) => Some(parent),
                _ => None,
            }
        } else {
            let state = &chain.level(1).state;
            (remaining == 0 && !state.has_handle).then_some(parent)
        };

        drop(sibling);
        drop(chain);
        drop(detached);
        cascade
    }
}

/// Folds hidden `chain[1]` into its last child and splices the child into
/// the grandparent's place.
fn merge_into_child(
    ctx: &VmContext,
    chain: &mut Chain,
    survivor: &mut Locked,
    detached: &mut Vec<Arc<CowPageNode>>,
) {
    let has_grandparent = chain.len() > 2;
    let hidden_id = chain.level(1).node.id();
    let survivor_id = survivor.node.id();
    let (window_start, window_len) = (survivor.state.parent_offset, survivor.state.parent_limit);

    let (parent_offset, parent_limit, grandparent) = {
        let hidden = &mut chain.level_mut(1).state;
        let mut moved = 0usize;
        for (offset, slot) in hidden.pages.take_all() {
            let inside = offset >= window_start && offset - window_start < window_len;
            let target = offset.wrapping_sub(window_start);
            if !inside || survivor.state.pages.lookup(target).is_some() {
                ctx.release_slot(slot);
                continue;
            }
            let slot = settle_in_flight(ctx, slot);
            if let ContentSlot::Page(page) = &slot {
                let kind = survivor.node.queue_kind(&survivor.state, page);
                ctx.queues().relink(page.id(), &survivor.node, target, kind);
            }
            survivor.state.pages.insert(target, slot);
            moved += 1;
        }
        debug_assert!(
            hidden.high_priority == u64::from(survivor.state.high_priority > 0),
            "high priority count out of sync at merge"
        );
        hidden.children.clear();
        hidden.life = LifeCycle::Dead;
        trace!(hidden = %hidden_id, survivor = %survivor_id, moved, "vm.node.merge");
        (
            hidden.parent_offset,
            hidden.parent_limit,
            hidden.parent.take(),
        )
    };

    let state = &mut survivor.state;
    let old_parent = match grandparent {
        Some(grandparent) => {
            debug_assert!(has_grandparent);
            state.parent_offset = window_start + parent_offset;
            state.parent_limit = window_len.min(parent_limit.saturating_sub(window_start));
            let grand = &mut chain.level_mut(2).state;
            for child in grand.children.iter_mut().filter(|c| c.id == hidden_id) {
                *child = ChildRef {
                    id: survivor_id,
                    node: Arc::downgrade(&survivor.node),
                };
            }
            state.parent.replace(grandparent)
        }
        None => {
            state.parent_offset = 0;
            state.parent_limit = 0;
            state.parent.take()
        }
    };
    detached.extend(old_parent);
}

/// A compressed-in-flight placeholder cannot change nodes: the compression
/// worker finds it by position. Reinstall the parked page instead.
fn settle_in_flight(ctx: &VmContext, slot: ContentSlot) -> ContentSlot {
    match slot {
        ContentSlot::Reference(reference) if reference.handle.is_temporary() => {
            match ctx.compression_state().and_then(|c| c.take_page(reference.handle)) {
                Some(page) => {
                    let mut restored = PageSlot::new(page, DirtyState::Untracked);
                    restored.share_count = reference.share_count;
                    ContentSlot::Page(restored)
                }
                None => ContentSlot::Reference(reference),
            }
        }
        other => other,
    }
}
