//! Size changes and bulk range operations.

use std::sync::Arc;

use tracing::debug;

use crate::types::{checked_page_range, is_page_aligned, Result, VmError, PAGE_SIZE};
use crate::vm::context::{UnmapOp, VmContext};
use crate::vm::node::{
    adjust_shares, child_seeds, detach_range, lock_sorted, release_range, unmap_descendants,
    unmap_locked_child, Chain, CowPageNode, Locked,
};
use crate::vm::page_list::ContentSlot;

/// Changes the size of the node behind a handle. Returns `None` when the
/// node was hidden meanwhile and the caller must reload the handle.
pub(crate) fn resize(ctx: &VmContext, node: &Arc<CowPageNode>, new_size: u64) -> Result<Option<()>> {
    if !is_page_aligned(new_size) {
        return Err(VmError::InvalidArgs("size must be page aligned"));
    }
    if !node.is_resizable() {
        return Err(VmError::BadState("object is not resizable"));
    }
    if node.is_pager_root() {
        resize_pager_root(ctx, node, new_size).map(Some)
    } else {
        resize_anonymous(ctx, node, new_size)
    }
}

fn resize_pager_root(ctx: &VmContext, node: &Arc<CowPageNode>, new_size: u64) -> Result<()> {
    let (mut root, mut children) = loop {
        let snapshot = node.lock().live_children();
        let mut ids: Vec<_> = snapshot.iter().map(|c| c.id()).collect();
        ids.sort();
        let mut locked = lock_sorted(snapshot.into_iter().chain(Some(node.clone())).collect());
        let Some(pos) = locked.iter().position(|l| Arc::ptr_eq(&l.node, node)) else {
            continue;
        };
        let root = locked.remove(pos);
        let mut current: Vec<_> = root.state.children.iter().map(|c| c.id).collect();
        current.sort();
        if current == ids {
            break (root, locked);
        }
        debug!(node = %node.id(), "vm.resize.children_changed");
    };

    let old_size = root.state.size;
    if new_size < old_size {
        if root.state.has_pins_in(new_size, old_size) {
            return Err(VmError::BadState("pinned pages beyond the new size"));
        }
        ctx.unmap(node.id(), new_size, old_size - new_size, UnmapOp::Remove);
        let released = detach_range(&mut root.state, new_size, old_size);
        let mut seeds = Vec::new();
        for child in children.iter_mut() {
            seeds.extend(unmap_locked_child(ctx, child, new_size, old_size, UnmapOp::Remove));
            clamp_window(child, new_size);
        }
        root.state.size = new_size;
        drop(children);
        drop(root);
        unmap_descendants(ctx, seeds, UnmapOp::Remove);
        released.into_iter().for_each(|slot| ctx.release_slot(slot));
        debug!(node = %node.id(), old_size, new_size, "vm.resize.shrink");
        if let Some(source) = node.source() {
            source.on_range_invalidated(new_size, old_size - new_size);
        }
        return Ok(());
    }

    root.state.size = new_size;
    if new_size > old_size {
        root.state
            .pages
            .insert_interval(old_size, new_size - old_size);
    }
    debug!(node = %node.id(), old_size, new_size, "vm.resize.grow");
    Ok(())
}

fn clamp_window(child: &mut Locked, parent_size: u64) {
    let state = &mut child.state;
    state.parent_limit = if state.parent_offset >= parent_size {
        0
    } else {
        state.parent_limit.min(parent_size - state.parent_offset)
    };
}

fn resize_anonymous(ctx: &VmContext, node: &Arc<CowPageNode>, new_size: u64) -> Result<Option<()>> {
    let Some(mut chain) = Chain::lock_visible(node) else {
        return Ok(None);
    };
    let old_size = chain.level(0).state.size;
    if new_size < old_size {
        release_child_range(ctx, &mut chain, new_size, old_size)?;
        let state = &mut chain.level_mut(0).state;
        state.parent_limit = state.parent_limit.min(new_size);
        debug!(node = %node.id(), old_size, new_size, "vm.resize.shrink");
    } else {
        debug!(node = %node.id(), old_size, new_size, "vm.resize.grow");
    }
    chain.level_mut(0).state.size = new_size;
    Ok(Some(()))
}

/// Drops everything `chain[0]` sees in `[start, end)`: its own content and
/// its shares of hidden ancestors' pages.
fn release_child_range(ctx: &VmContext, chain: &mut Chain, start: u64, end: u64) -> Result<()> {
    let node = chain.level(0).node.clone();
    if chain.level(0).state.has_pins_in(start, end) {
        return Err(VmError::BadState("pinned pages in range"));
    }
    ctx.unmap(node.id(), start, end - start, UnmapOp::Remove);
    if chain.len() == 1 {
        chain.lock_hidden_ancestors();
    }
    if chain.len() > 1 && chain.level(1).state.hidden {
        let limit = chain.level(0).state.parent_limit;
        adjust_shares(ctx, chain, 0, start, end.min(limit), -1, false);
    }
    release_range(ctx, &mut chain.level_mut(0).state, start, end);
    Ok(())
}

/// Makes `[offset, offset + len)` read as zero.
pub(crate) fn zero_range(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    len: u64,
) -> Result<Option<()>> {
    let end = checked_page_range(offset, len)?;
    let Some(mut chain) = Chain::lock_visible(node) else {
        return Ok(None);
    };
    {
        let state = &chain.level(0).state;
        if state.is_discarded() {
            return Err(VmError::NotFound);
        }
        if end > state.size {
            return Err(VmError::OutOfRange);
        }
        if state.has_pins_in(offset, end) {
            return Err(VmError::BadState("pinned pages in range"));
        }
    }

    if node.is_pager_root() {
        if node.traps_dirty() {
            return Err(VmError::BadState("zeroing needs a dirty acknowledgement"));
        }
        ctx.unmap(node.id(), offset, len, UnmapOp::Remove);
        let state = &mut chain.level_mut(0).state;
        let released = detach_range(state, offset, end);
        if node.tracks_dirty() {
            state.pages.insert_interval(offset, len);
        } else {
            for at in (offset..end).step_by(PAGE_SIZE as usize) {
                state.pages.insert(at, ContentSlot::Marker);
            }
        }
        let seeds = child_seeds(state, offset, end);
        drop(chain);
        unmap_descendants(ctx, seeds, UnmapOp::Remove);
        released.into_iter().for_each(|slot| ctx.release_slot(slot));
    } else if chain.level(0).state.parent.is_none() {
        ctx.unmap(node.id(), offset, len, UnmapOp::Remove);
        release_range(ctx, &mut chain.level_mut(0).state, offset, end);
    } else {
        release_child_range(ctx, &mut chain, offset, end)?;
        let state = &mut chain.level_mut(0).state;
        if end >= state.size {
            state.parent_limit = state.parent_limit.min(offset);
        } else {
            let covered = end.min(state.parent_limit);
            for at in (offset..covered).step_by(PAGE_SIZE as usize) {
                state.pages.insert(at, ContentSlot::Marker);
            }
        }
    }
    debug!(node = %node.id(), offset, len, "vm.range.zero");
    Ok(Some(()))
}

/// Frees the committed pages of an anonymous root in the range.
pub(crate) fn decommit_range(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    len: u64,
) -> Result<Option<()>> {
    let end = checked_page_range(offset, len)?;
    if node.is_pager_backed() {
        return Err(VmError::BadState("decommit of pager-backed memory"));
    }
    let Some(mut chain) = Chain::lock_visible(node) else {
        return Ok(None);
    };
    let state = &mut chain.level_mut(0).state;
    if state.parent.is_some() {
        return Err(VmError::BadState("decommit of a clone"));
    }
    if end > state.size {
        return Err(VmError::OutOfRange);
    }
    if state.has_pins_in(offset, end) {
        return Err(VmError::BadState("pinned pages in range"));
    }
    ctx.unmap(node.id(), offset, len, UnmapOp::Remove);
    release_range(ctx, state, offset, end);
    debug!(node = %node.id(), offset, len, "vm.range.decommit");
    Ok(Some(()))
}
