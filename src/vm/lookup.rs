//! Fault resolution.
//!
//! [`resolve`] locks the target node, walks up through parent windows until it
//! finds content, and then makes that content usable for the requested
//! access: compressed pages are decompressed in place, ancestor pages are
//! forked into the target for writes, zero content is materialised, and
//! pager-backed roots raise read or dirty requests when the page source must
//! act first. Requests are issued by the caller after every lock is dropped.

use std::sync::Arc;

use tracing::trace;

use crate::primitives::alloc::AllocFlags;
use crate::primitives::pager::{PageSource, RequestKind};
use crate::types::{page_align_down, NodeId, PageId, Result, VmError, PAGE_SIZE};
use crate::vm::context::VmContext;
use crate::vm::dirty::write_traps;
use crate::vm::node::{Chain, CowPageNode, Locked};
use crate::vm::page_list::{ContentSlot, DirtyState, PageSlot};

/// Access requested from [`crate::VmObject::require_page`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Intent {
    /// The caller only reads the page.
    Read,
    /// The caller writes the page.
    Write,
}

/// Result of resolving one page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResolvedPage {
    /// The offset reads as zero and no page backs it.
    Zero,
    /// A physical page backs the offset.
    Page {
        /// Frame holding the content.
        id: PageId,
        /// Node owning the frame; an ancestor for shared reads.
        owner: NodeId,
        /// The frame may be written through this object without a further fault.
        writable: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Access {
    Read,
    Write,
    /// Make the page resident and owned by the target without dirtying it.
    Own,
}

impl Access {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Own => "own",
        }
    }
}

impl From<Intent> for Access {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Read => Access::Read,
            Intent::Write => Access::Write,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Found {
    Page { level: usize, offset: u64 },
    Zero,
}

/// A resolved offset with the locks that keep it valid.
pub(crate) struct Resolved {
    pub(crate) chain: Chain,
    pub(crate) found: Found,
}

impl Resolved {
    pub(crate) fn page(&self) -> Option<&PageSlot> {
        match self.found {
            Found::Page { level, offset } => self.chain.level(level).state.pages.page(offset),
            Found::Zero => None,
        }
    }

    pub(crate) fn page_mut(&mut self) -> Option<&mut PageSlot> {
        match self.found {
            Found::Page { level, offset } => {
                self.chain.level_mut(level).state.pages.page_mut(offset)
            }
            Found::Zero => None,
        }
    }

    pub(crate) fn describe(&self) -> ResolvedPage {
        match self.found {
            Found::Zero => ResolvedPage::Zero,
            Found::Page { level, offset } => {
                let locked = self.chain.level(level);
                match locked.state.pages.page(offset) {
                    Some(slot) => ResolvedPage::Page {
                        id: slot.id(),
                        owner: locked.node.id(),
                        writable: level == 0
                            && (!locked.node.is_pager_root()
                                || matches!(slot.dirty, DirtyState::Dirty | DirtyState::Untracked)),
                    },
                    None => ResolvedPage::Zero,
                }
            }
        }
    }
}

pub(crate) enum Fault {
    Ready(Resolved),
    /// The handle's node was hidden by a concurrent clone; reload and retry.
    Stale,
    NeedRead {
        source: Arc<PageSource>,
        offset: u64,
        len: u64,
    },
    NeedDirty {
        source: Arc<PageSource>,
        offset: u64,
        len: u64,
    },
}

/// Level and key of the slot that supplies `offset` of `chain[0]`, if any.
/// Only levels already locked in `chain` are searched.
pub(crate) fn owner_of(chain: &Chain, offset: u64) -> Option<(usize, u64)> {
    let mut at = offset;
    for level in 0..chain.len() {
        let state = &chain.level(level).state;
        if let Some((key, _)) = state.pages.lookup(at) {
            return Some((level, key));
        }
        if state.parent.is_none() || at >= state.parent_limit {
            return None;
        }
        at += state.parent_offset;
    }
    None
}

/// Sends the request a [`Fault`] asked for and turns it into `WouldBlock`.
pub(crate) fn issue_request(
    ctx: &VmContext,
    kind: RequestKind,
    source: &PageSource,
    offset: u64,
    len: u64,
) -> VmError {
    ctx.metrics().pager_request(kind);
    let request = match kind {
        RequestKind::Read => source.request_read(offset, len),
        RequestKind::Dirty => source.request_dirty(offset, len),
    };
    match request {
        Ok(request) => VmError::WouldBlock(request),
        Err(err) => err,
    }
}

enum Hit {
    Page,
    Marker,
    Interval,
    Empty,
}

enum Step {
    Hit(Hit),
    Decompress,
    Ascend(u64),
}

/// Resolves `offset` of the visible `node` for `access`.
pub(crate) fn resolve(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    access: Access,
) -> Result<Fault> {
    let offset = page_align_down(offset);
    let Some(mut chain) = Chain::lock_visible(node) else {
        return Ok(Fault::Stale);
    };
    {
        let state = &chain.level(0).state;
        if state.is_discarded() {
            return Err(VmError::NotFound);
        }
        if offset >= state.size {
            return Err(VmError::OutOfRange);
        }
    }
    let (level, at, hit) = walk(ctx, &mut chain, offset)?;
    let mut fault = match hit {
        Hit::Page => resolve_page(ctx, chain, level, at, offset, access)?,
        Hit::Empty if chain.level(level).node.is_pager_root() => {
            let locked = chain.level(level);
            let max = ctx.options().read_ahead_pages.saturating_mul(PAGE_SIZE);
            let len = locked
                .state
                .pages
                .empty_run(at, max)
                .min(locked.state.size - at)
                .max(PAGE_SIZE);
            match locked.node.source() {
                Some(source) => Fault::NeedRead {
                    source: source.clone(),
                    offset: at,
                    len,
                },
                None => return Err(VmError::BadState("pager root without a source")),
            }
        }
        Hit::Marker | Hit::Empty => resolve_zero(ctx, chain, level, offset, access)?,
        Hit::Interval => resolve_interval(ctx, chain, level, offset, access)?,
    };
    if let Fault::Ready(resolved) = &mut fault {
        if access == Access::Write {
            note_untracked_write(ctx, resolved);
        }
        ctx.metrics().page_fault(access.name());
    }
    Ok(fault)
}

/// A write through a root whose source keeps no dirty state leaves the only
/// copy of the content in the page.
fn note_untracked_write(ctx: &VmContext, resolved: &mut Resolved) {
    let Found::Page { level: 0, offset } = resolved.found else {
        return;
    };
    let target = resolved.chain.level_mut(0);
    if !target.node.is_pager_root() || target.node.tracks_dirty() {
        return;
    }
    let node = target.node.clone();
    let state = &mut *target.state;
    match state.pages.page_mut(offset) {
        Some(slot) if !slot.written => slot.written = true,
        _ => return,
    }
    if let Some(slot) = state.pages.page(offset) {
        ctx.queues().set_kind(slot.id(), node.queue_kind(state, slot));
    }
}

fn walk(ctx: &VmContext, chain: &mut Chain, offset: u64) -> Result<(usize, u64, Hit)> {
    let mut level = 0;
    let mut at = offset;
    loop {
        let step = {
            let state = &chain.level(level).state;
            match state.pages.lookup(at) {
                Some((_, ContentSlot::Page(_))) => Step::Hit(Hit::Page),
                Some((_, ContentSlot::Reference(_))) => Step::Decompress,
                Some((_, ContentSlot::Marker)) => Step::Hit(Hit::Marker),
                Some((_, ContentSlot::Interval(_))) => Step::Hit(Hit::Interval),
                None if state.parent.is_some() && at < state.parent_limit => {
                    Step::Ascend(state.parent_offset)
                }
                None => Step::Hit(Hit::Empty),
            }
        };
        match step {
            Step::Hit(hit) => return Ok((level, at, hit)),
            Step::Decompress => decompress_in_place(ctx, chain.level_mut(level), at)?,
            Step::Ascend(parent_offset) => {
                chain.push_parent();
                level += 1;
                at += parent_offset;
            }
        }
    }
}

fn resolve_page(
    ctx: &VmContext,
    mut chain: Chain,
    level: usize,
    at: u64,
    offset: u64,
    access: Access,
) -> Result<Fault> {
    if level == 0 {
        if access != Access::Read && chain.level(0).node.is_pager_root() {
            if let Some(fault) = prepare_root_write(ctx, chain.level_mut(0), offset, access)? {
                return Ok(fault);
            }
        }
        if let Some(slot) = chain.level(0).state.pages.page(offset) {
            ctx.queues().touch(slot.id());
        }
        return Ok(Fault::Ready(Resolved {
            chain,
            found: Found::Page { level: 0, offset },
        }));
    }
    if access == Access::Read {
        if let Some(slot) = chain.level(level).state.pages.page(at) {
            ctx.queues().touch(slot.id());
        }
        return Ok(Fault::Ready(Resolved {
            chain,
            found: Found::Page { level, offset: at },
        }));
    }
    fork_into_target(ctx, &mut chain, level, at, offset)?;
    Ok(Fault::Ready(Resolved {
        chain,
        found: Found::Page { level: 0, offset },
    }))
}

fn resolve_zero(
    ctx: &VmContext,
    mut chain: Chain,
    level: usize,
    offset: u64,
    access: Access,
) -> Result<Fault> {
    if access == Access::Read {
        return Ok(Fault::Ready(Resolved {
            chain,
            found: Found::Zero,
        }));
    }
    let target = chain.level_mut(0);
    let dirty = if level == 0 && target.node.is_pager_root() {
        match (target.node.tracks_dirty(), access) {
            (false, _) => DirtyState::Untracked,
            (true, Access::Write)
                if target.node.traps_dirty() && write_traps(&target.state, offset) =>
            {
                return Ok(need_dirty(target, offset));
            }
            (true, Access::Write) => DirtyState::Dirty,
            (true, _) => DirtyState::Clean,
        }
    } else {
        DirtyState::Untracked
    };
    if level == 0 {
        target.state.pages.remove(offset);
    }
    insert_zero_page(ctx, target, offset, dirty)?;
    Ok(Fault::Ready(Resolved {
        chain,
        found: Found::Page { level: 0, offset },
    }))
}

fn resolve_interval(
    ctx: &VmContext,
    mut chain: Chain,
    level: usize,
    offset: u64,
    access: Access,
) -> Result<Fault> {
    if access == Access::Read {
        return Ok(Fault::Ready(Resolved {
            chain,
            found: Found::Zero,
        }));
    }
    let target = chain.level_mut(0);
    if level == 0
        && access == Access::Write
        && target.node.traps_dirty()
        && write_traps(&target.state, offset)
    {
        return Ok(need_dirty(target, offset));
    }
    let dirty = if level == 0 {
        let carved = target
            .state
            .pages
            .carve_interval_page(offset)
            .unwrap_or(DirtyState::Dirty);
        if !target.node.tracks_dirty() {
            DirtyState::Untracked
        } else if access == Access::Write {
            DirtyState::Dirty
        } else {
            carved
        }
    } else {
        DirtyState::Untracked
    };
    if let Err(err) = insert_zero_page(ctx, target, offset, dirty) {
        if level == 0 {
            target.state.pages.insert_interval(offset, PAGE_SIZE);
        }
        return Err(err);
    }
    Ok(Fault::Ready(Resolved {
        chain,
        found: Found::Page { level: 0, offset },
    }))
}

fn need_dirty(target: &Locked, offset: u64) -> Fault {
    match target.node.source() {
        Some(source) => Fault::NeedDirty {
            source: source.clone(),
            offset,
            len: PAGE_SIZE,
        },
        None => Fault::Stale,
    }
}

/// Applies dirty-tracking rules before a pager root's own page is written or
/// owned. Returns a fault when the source must acknowledge the transition.
fn prepare_root_write(
    ctx: &VmContext,
    target: &mut Locked,
    offset: u64,
    access: Access,
) -> Result<Option<Fault>> {
    let Some(slot) = target.state.pages.page(offset) else {
        return Ok(None);
    };
    let needs_transition = access == Access::Write
        && matches!(slot.dirty, DirtyState::Clean | DirtyState::AwaitingClean);
    if needs_transition && target.node.traps_dirty() && write_traps(&target.state, offset) {
        return Ok(Some(need_dirty(target, offset)));
    }
    replace_loaned(ctx, target, offset)?;
    if needs_transition {
        let node = target.node.clone();
        let state = &mut *target.state;
        if let Some(slot) = state.pages.page_mut(offset) {
            slot.dirty = DirtyState::Dirty;
        }
        if let Some(slot) = state.pages.page(offset) {
            ctx.queues().set_kind(slot.id(), node.queue_kind(state, slot));
        }
    }
    Ok(None)
}

/// Swaps a loaned frame at `offset` for a regular one with the same contents.
pub(crate) fn replace_loaned(ctx: &VmContext, target: &mut Locked, offset: u64) -> Result<()> {
    let node = target.node.clone();
    let state = &mut *target.state;
    let Some(slot) = state.pages.page_mut(offset) else {
        return Ok(());
    };
    if !slot.page.is_loaned() {
        return Ok(());
    }
    let mut fresh = ctx.alloc_page(AllocFlags::UNINIT)?;
    fresh.data_mut().copy_from_slice(slot.page.data());
    let old = std::mem::replace(&mut slot.page, fresh);
    ctx.queues().remove(old.id());
    ctx.free_page(old);
    if let Some(slot) = state.pages.page(offset) {
        ctx.queues()
            .insert(slot.id(), &node, offset, node.queue_kind(state, slot));
    }
    trace!(node = %node.id(), offset, "vm.fault.replace_loaned");
    Ok(())
}

/// Inserts a freshly zeroed page at `offset` of the target.
pub(crate) fn insert_zero_page(
    ctx: &VmContext,
    target: &mut Locked,
    offset: u64,
    dirty: DirtyState,
) -> Result<()> {
    let page = ctx.alloc_page(AllocFlags::ZEROED)?;
    insert_page(ctx, target, offset, PageSlot::new(page, dirty));
    Ok(())
}

/// Inserts `slot` at `offset` and queues its page.
pub(crate) fn insert_page(ctx: &VmContext, target: &mut Locked, offset: u64, slot: PageSlot) {
    let kind = target.node.queue_kind(&target.state, &slot);
    ctx.queues().insert(slot.id(), &target.node, offset, kind);
    target.state.pages.insert(offset, ContentSlot::Page(slot));
}

/// Replaces a compressed reference with a resident page, keeping its share count.
fn decompress_in_place(ctx: &VmContext, locked: &mut Locked, offset: u64) -> Result<()> {
    let Some(ContentSlot::Reference(reference)) = locked.state.pages.get(offset) else {
        return Ok(());
    };
    let (handle, share_count) = (reference.handle, reference.share_count);
    let compression = ctx
        .compression_state()
        .ok_or(VmError::BadState("compressed page without a compressor"))?;
    let page = if handle.is_temporary() {
        compression
            .take_page(handle)
            .ok_or(VmError::BadState("in-flight compression lost its page"))?
    } else {
        let mut page = ctx.alloc_page(AllocFlags::UNINIT)?;
        if let Err(err) = compression.decompress(handle, page.data_mut()) {
            ctx.free_page(page);
            return Err(err);
        }
        compression.free(handle);
        page
    };
    locked.state.pages.remove(offset);
    let mut slot = PageSlot::new(page, DirtyState::Untracked);
    slot.share_count = share_count;
    trace!(node = %locked.node.id(), offset, temporary = handle.is_temporary(), "vm.fault.decompress");
    insert_page(ctx, locked, offset, slot);
    Ok(())
}

/// Gives the target (level 0) its own copy of the page at `at` in `chain[level]`.
fn fork_into_target(
    ctx: &VmContext,
    chain: &mut Chain,
    level: usize,
    at: u64,
    offset: u64,
) -> Result<()> {
    let (owner_hidden, share_count) = {
        let owner = chain.level(level);
        let share = owner
            .state
            .pages
            .page(at)
            .map(|p| p.share_count)
            .ok_or(VmError::BadState("fork source vanished"))?;
        (owner.state.hidden, share)
    };

    if owner_hidden && level == 1 && share_count == 0 {
        let (target, owner) = chain.pair_mut(0, 1);
        let Some(ContentSlot::Page(mut slot)) = owner.state.pages.remove(at) else {
            return Err(VmError::BadState("fork source vanished"));
        };
        slot.share_count = 0;
        slot.dirty = DirtyState::Untracked;
        slot.always_need = false;
        let kind = target.node.queue_kind(&target.state, &slot);
        ctx.queues().relink(slot.id(), &target.node, offset, kind);
        target.state.pages.insert(offset, ContentSlot::Page(slot));
        ctx.metrics().page_forked(true);
        trace!(node = %target.node.id(), offset, from = %owner.node.id(), "vm.fault.migrate");
        return Ok(());
    }

    let mut page = ctx.alloc_page(AllocFlags::UNINIT)?;
    if let Some(src) = chain.level(level).state.pages.page(at) {
        page.data_mut().copy_from_slice(src.page.data());
    }
    if owner_hidden {
        let owner = chain.level_mut(level);
        if share_count == 0 {
            if let Some(slot) = owner.state.pages.remove(at) {
                ctx.release_slot(slot);
            }
        } else if let Some(slot) = owner.state.pages.page_mut(at) {
            slot.share_count -= 1;
        }
    }
    let target = chain.level_mut(0);
    insert_page(ctx, target, offset, PageSlot::new(page, DirtyState::Untracked));
    ctx.metrics().page_forked(false);
    trace!(node = %target.node.id(), offset, level, "vm.fault.fork");
    Ok(())
}
