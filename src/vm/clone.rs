//! Clone engine.
//!
//! A clone either hangs directly off a pager-backed root (unidirectional:
//! the clone keeps seeing the root's live content wherever it has none of its
//! own) or freezes the source's current content in a hidden node shared by
//! the source and the clone (bidirectional).
//!
//! Bidirectional clones hide the source node in place. A fresh visible node
//! takes over the source's handle with an empty page list and a window over
//! the whole of the now-hidden node; the clone gets a window over the
//! requested range. Pages both children can reach gain one share.
//!
//! A source with nothing of its own in the range needs no new hidden node:
//! the clone hangs off the nearest hidden ancestor that supplies the range.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Result, VmError};
use crate::vm::context::{UnmapOp, VmContext};
use crate::vm::node::{
    adjust_shares, Chain, ChildRef, CowPageNode, LifeCycle, NodeSpec, ReclaimStrategy,
    LOCK_ORDER_DELTA,
};

/// Snapshot semantics requested from [`crate::VmObject::clone`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneMode {
    /// The clone must not see writes made after it was taken to pages it has
    /// written itself; it may keep seeing untouched pager content live.
    OnWrite,
    /// The clone freezes every modification the source made so far.
    Modified,
    /// A complete snapshot. Not available for pager-backed hierarchies.
    Full,
}

/// Creates a clone of `[offset, offset + len)` of the node currently held by
/// `handle`. Returns `None` if the node was hidden by a concurrent clone.
pub(crate) fn clone_node(
    ctx: &VmContext,
    handle: &RwLock<Arc<CowPageNode>>,
    offset: u64,
    len: u64,
    mode: CloneMode,
) -> Result<Option<Arc<CowPageNode>>> {
    let node = handle.read().clone();
    let Some(mut chain) = Chain::lock_visible(&node) else {
        return Ok(None);
    };
    {
        let state = &chain.level(0).state;
        if state.discard.is_some() {
            return Err(VmError::BadState("discardable objects cannot be cloned"));
        }
        if mode == CloneMode::Full && node.is_pager_backed() {
            return Err(VmError::BadState("full snapshots of pager-backed objects"));
        }
    }

    if node.is_pager_root() {
        check_depth(ctx, &chain, 0)?;
        return unidirectional(ctx, chain, 0, offset, len).map(Some);
    }
    if mode == CloneMode::OnWrite && node.is_pager_backed() {
        let untouched = {
            let state = &chain.level(0).state;
            let end = offset.saturating_add(len);
            !state.pages.has_content_in(offset, end) && state.parent.is_some()
        };
        if untouched {
            chain.push_parent();
            if !chain.level(1).state.hidden {
                check_depth(ctx, &chain, 1)?;
                let (parent_offset, parent_limit) = {
                    let state = &chain.level(0).state;
                    (state.parent_offset, state.parent_limit)
                };
                let root_offset = parent_offset
                    .checked_add(offset)
                    .ok_or(VmError::OutOfRange)?;
                let limit = len.min(parent_limit.saturating_sub(offset));
                return unidirectional_at(ctx, chain, 1, root_offset, len, limit, &node).map(Some);
            }
        }
    }
    if let Some(target) = shared_ancestor(&mut chain, offset, len)? {
        check_depth(ctx, &chain, target.level)?;
        return attach_to_hidden(ctx, chain, target, len).map(Some);
    }
    check_depth(ctx, &chain, 0)?;
    bidirectional(ctx, chain, handle, offset, len).map(Some)
}

fn check_depth(ctx: &VmContext, chain: &Chain, level: usize) -> Result<()> {
    let max = ctx.options().max_depth;
    if chain.depth_of(level, max) >= max {
        return Err(VmError::BadState("clone hierarchy too deep"));
    }
    Ok(())
}

/// Where a clone can hang off an existing hidden node.
struct Attach {
    level: usize,
    offset: u64,
    limit: u64,
}

/// Climbs from the visible `chain[0]` through hidden ancestors for as long as
/// the current level holds nothing in the range, so the clone reads exactly
/// what the source reads without hiding it. Returns `None` when the source
/// itself must be hidden.
fn shared_ancestor(chain: &mut Chain, offset: u64, len: u64) -> Result<Option<Attach>> {
    let size = chain.level(0).state.size;
    let mut at = Attach {
        level: 0,
        offset,
        limit: if offset >= size { 0 } else { len.min(size - offset) },
    };
    loop {
        let (parent_offset, parent_limit) = {
            let state = &chain.level(at.level).state;
            let end = at.offset.saturating_add(at.limit);
            if state.pages.has_content_in(at.offset, end) || state.parent.is_none() {
                break;
            }
            (state.parent_offset, state.parent_limit)
        };
        if at.level + 1 == chain.len() {
            chain.push_parent();
        }
        if !chain.level(at.level + 1).state.hidden {
            break;
        }
        let offset = at.offset.checked_add(parent_offset).ok_or(VmError::OutOfRange)?;
        let root_offset = chain
            .level(at.level + 1)
            .state
            .root_parent_offset
            .checked_add(offset)
            .and_then(|o| o.checked_add(len));
        if root_offset.is_none() {
            break;
        }
        at = Attach {
            level: at.level + 1,
            offset,
            limit: at.limit.min(parent_limit.saturating_sub(at.offset)),
        };
    }
    Ok((at.level > 0).then_some(at))
}

/// Adds a visible clone as one more child of the hidden `chain[target.level]`.
fn attach_to_hidden(
    ctx: &VmContext,
    mut chain: Chain,
    target: Attach,
    len: u64,
) -> Result<Arc<CowPageNode>> {
    let Attach {
        level,
        offset,
        limit,
    } = target;
    if chain.top().state.hidden {
        chain.lock_hidden_ancestors();
    }
    let (hidden, root_offset) = {
        let locked = chain.level(level);
        let root_offset = locked
            .state
            .root_parent_offset
            .checked_add(offset)
            .ok_or(VmError::OutOfRange)?;
        (locked.node.clone(), root_offset)
    };
    let (clone, mut clone_state) = CowPageNode::new(
        ctx,
        NodeSpec {
            order: hidden.order() - LOCK_ORDER_DELTA,
            size: len,
            source: None,
            strategy: ReclaimStrategy::Compress,
            pager_backed: hidden.is_pager_backed(),
            resizable: chain.level(0).node.is_resizable(),
        },
    );
    adjust_shares(ctx, &mut chain, level, offset, offset + limit, 1, true);
    clone_state.parent = Some(hidden.clone());
    clone_state.parent_offset = offset;
    clone_state.parent_limit = limit;
    clone_state.root_parent_offset = root_offset;
    clone_state.life = LifeCycle::Alive;
    chain.level_mut(level).state.children.push(ChildRef {
        id: clone.id(),
        node: Arc::downgrade(&clone),
    });
    debug!(
        hidden = %hidden.id(),
        source = %chain.level(0).node.id(),
        clone = %clone.id(),
        offset,
        limit,
        "vm.clone.attach"
    );
    drop(clone_state);
    drop(chain);
    Ok(clone)
}

/// Clone attached directly below `chain[level]`, a pager-backed root.
fn unidirectional(
    ctx: &VmContext,
    chain: Chain,
    level: usize,
    offset: u64,
    len: u64,
) -> Result<Arc<CowPageNode>> {
    let size = chain.level(level).state.size;
    let limit = if offset >= size {
        0
    } else {
        len.min(size - offset)
    };
    let source = chain.level(level).node.clone();
    unidirectional_at(ctx, chain, level, offset, len, limit, &source)
}

fn unidirectional_at(
    ctx: &VmContext,
    mut chain: Chain,
    level: usize,
    parent_offset: u64,
    len: u64,
    parent_limit: u64,
    source: &Arc<CowPageNode>,
) -> Result<Arc<CowPageNode>> {
    parent_offset
        .checked_add(len)
        .ok_or(VmError::OutOfRange)?;
    let parent = chain.level_mut(level);
    let (child, mut child_state) = CowPageNode::new(
        ctx,
        NodeSpec {
            order: parent.node.order() - LOCK_ORDER_DELTA,
            size: len,
            source: None,
            strategy: ReclaimStrategy::Compress,
            pager_backed: true,
            resizable: source.is_resizable(),
        },
    );
    child_state.parent = Some(parent.node.clone());
    child_state.parent_offset = parent_offset;
    child_state.parent_limit = parent_limit;
    child_state.root_parent_offset = parent_offset;
    child_state.life = LifeCycle::Alive;
    parent.state.children.push(ChildRef {
        id: child.id(),
        node: Arc::downgrade(&child),
    });
    debug!(
        parent = %parent.node.id(),
        child = %child.id(),
        parent_offset,
        parent_limit,
        "vm.clone.unidirectional"
    );
    Ok(child)
}

/// Hides `chain[0]` and gives it two visible children: one taking over the
/// handle and the requested clone.
fn bidirectional(
    ctx: &VmContext,
    mut chain: Chain,
    handle: &RwLock<Arc<CowPageNode>>,
    offset: u64,
    len: u64,
) -> Result<Arc<CowPageNode>> {
    let node = chain.level(0).node.clone();
    let (size, root_offset, high_priority) = {
        let state = &chain.level(0).state;
        if state.pinned_pages > 0 {
            return Err(VmError::BadState("pinned pages in a clone source"));
        }
        let root_offset = state
            .root_parent_offset
            .checked_add(offset)
            .ok_or(VmError::OutOfRange)?;
        root_offset.checked_add(len).ok_or(VmError::OutOfRange)?;
        (state.size, root_offset, state.high_priority)
    };
    let clone_limit = if offset >= size {
        0
    } else {
        len.min(size - offset)
    };
    let order = node.order() - LOCK_ORDER_DELTA;
    let shape = |size| NodeSpec {
        order,
        size,
        source: None,
        strategy: ReclaimStrategy::Compress,
        pager_backed: node.is_pager_backed(),
        resizable: node.is_resizable(),
    };
    chain.lock_hidden_ancestors();
    ctx.unmap(node.id(), 0, size, UnmapOp::RemoveWrite);
    let (left, mut left_state) = CowPageNode::new(ctx, shape(size));
    let (clone, mut clone_state) = CowPageNode::new(ctx, shape(len));

    adjust_shares(ctx, &mut chain, 0, offset, offset + clone_limit, 1, true);

    let root_parent_offset = chain.level(0).state.root_parent_offset;
    left_state.parent = Some(node.clone());
    left_state.parent_limit = size;
    left_state.root_parent_offset = root_parent_offset;
    left_state.high_priority = high_priority;
    left_state.life = LifeCycle::Alive;

    clone_state.parent = Some(node.clone());
    clone_state.parent_offset = offset;
    clone_state.parent_limit = clone_limit;
    clone_state.root_parent_offset = root_offset;
    clone_state.life = LifeCycle::Alive;

    {
        let state = &mut chain.level_mut(0).state;
        state.hidden = true;
        state.has_handle = false;
        state.high_priority = u64::from(high_priority > 0);
        state.children.push(ChildRef {
            id: left.id(),
            node: Arc::downgrade(&left),
        });
        state.children.push(ChildRef {
            id: clone.id(),
            node: Arc::downgrade(&clone),
        });
    }
    *handle.write() = left.clone();
    debug!(
        hidden = %node.id(),
        left = %left.id(),
        clone = %clone.id(),
        offset,
        clone_limit,
        "vm.clone.bidirectional"
    );
    drop(left_state);
    drop(clone_state);
    drop(chain);
    Ok(clone)
}
