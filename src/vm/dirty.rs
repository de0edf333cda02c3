//! Pager-facing operations and dirty tracking on pager-backed roots.
//!
//! Page states move `Clean -> Dirty -> AwaitingClean -> Clean`. Zero
//! intervals are always Dirty; writeback of an interval marks a prefix of it
//! AwaitingClean and only that prefix is cleaned when writeback ends. On
//! roots whose source does not track dirty state, intervals only stand for
//! zero content and never take part in writeback.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use crate::primitives::alloc::{AllocFlags, Page};
use crate::types::{checked_page_range, Result, VmError, PAGE_SIZE, PAGE_SIZE_BYTES};
use crate::vm::context::{UnmapOp, VmContext};
use crate::vm::lookup::insert_page;
use crate::vm::node::{CowPageNode, Locked, NodeState};
use crate::vm::page_list::{ContentSlot, DirtyState, PageSlot, ZeroInterval};

/// A run of content that must be written back.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DirtyRange {
    /// Start of the run.
    pub offset: u64,
    /// Length of the run in bytes.
    pub len: u64,
    /// The run is implicit zero content rather than resident pages.
    pub is_zero: bool,
}

/// Something the page source must do before a dirty operation can finish.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Pending {
    Read { offset: u64, len: u64 },
    Dirty { offset: u64, len: u64 },
}

fn lock_root(node: &Arc<CowPageNode>) -> Result<Locked> {
    if !node.is_pager_root() {
        return Err(VmError::BadState("not a pager-backed root"));
    }
    Ok(Locked {
        state: node.lock(),
        node: node.clone(),
    })
}

fn check_range(state: &NodeState, offset: u64, len: u64) -> Result<u64> {
    let end = checked_page_range(offset, len)?;
    if end > state.size {
        return Err(VmError::OutOfRange);
    }
    Ok(end)
}

fn pages(offset: u64, end: u64) -> impl Iterator<Item = u64> {
    (offset..end).step_by(PAGE_SIZE_BYTES)
}

fn requeue(ctx: &VmContext, root: &Locked, offset: u64) {
    if let Some(slot) = root.state.pages.page(offset) {
        ctx.queues()
            .set_kind(slot.id(), root.node.queue_kind(&root.state, slot));
    }
}

/// True when writing `at` of a trapping root needs an acknowledged dirty
/// request first. Fault and explicit dirtying paths both ask this.
pub(crate) fn write_traps(state: &NodeState, at: u64) -> bool {
    match state.pages.lookup(at) {
        Some((_, ContentSlot::Page(slot))) => {
            matches!(slot.dirty, DirtyState::Clean | DirtyState::AwaitingClean)
        }
        Some((start, ContentSlot::Interval(interval))) => {
            interval.state_at(start, at) == DirtyState::AwaitingClean
        }
        Some((_, ContentSlot::Marker)) => true,
        Some((_, ContentSlot::Reference(_))) | None => false,
    }
}

/// Installs supplied content into every empty page of the range. Pages that
/// already hold content are left alone.
pub(crate) fn supply_pages(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let len = data.len() as u64;
    let mut root = lock_root(node)?;
    let end = check_range(&root.state, offset, len)?;
    let dirty = if node.tracks_dirty() {
        DirtyState::Clean
    } else {
        DirtyState::Untracked
    };
    let flags = AllocFlags {
        zeroed: false,
        loaned_ok: ctx.options().supply_loaned,
    };
    let mut supplied = 0u64;
    for (index, at) in pages(offset, end).enumerate() {
        if root.state.pages.lookup(at).is_some() {
            continue;
        }
        let mut page = ctx.alloc_page(flags)?;
        let start = index * PAGE_SIZE_BYTES;
        page.data_mut()
            .copy_from_slice(&data[start..start + PAGE_SIZE_BYTES]);
        insert_page(ctx, &mut root, at, PageSlot::new(page, dirty));
        supplied += 1;
    }
    drop(root);
    debug!(node = %node.id(), offset, len, supplied, "vm.pager.supply");
    if let Some(source) = node.source() {
        source.on_pages_supplied(offset, len);
    }
    Ok(())
}

/// Acknowledges a dirty request. Either every page of the range becomes
/// Dirty or nothing changes.
pub(crate) fn dirty_pages(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    len: u64,
) -> Result<()> {
    let mut root = lock_root(node)?;
    let end = check_range(&root.state, offset, len)?;

    let mut needed = 0usize;
    for at in pages(offset, end) {
        match root.state.pages.lookup(at) {
            None | Some((_, ContentSlot::Reference(_))) => return Err(VmError::NotFound),
            Some((_, ContentSlot::Marker)) => needed += 1,
            Some((_, ContentSlot::Page(slot))) if slot.page.is_loaned() => needed += 1,
            Some(_) => {}
        }
    }
    let mut spare: Vec<Page> = Vec::with_capacity(needed);
    for _ in 0..needed {
        match ctx.alloc_page(AllocFlags::ZEROED) {
            Ok(page) => spare.push(page),
            Err(err) => {
                spare.into_iter().for_each(|p| ctx.free_page(p));
                return Err(err);
            }
        }
    }

    root.state.pages.split_interval_at(offset);
    root.state.pages.split_interval_at(end);
    for at in pages(offset, end) {
        match root.state.pages.get_mut(at) {
            Some(ContentSlot::Interval(interval)) => interval.awaiting_clean_len = 0,
            Some(ContentSlot::Page(slot)) => {
                if slot.page.is_loaned() {
                    if let Some(mut fresh) = spare.pop() {
                        fresh.data_mut().copy_from_slice(slot.page.data());
                        let old = std::mem::replace(&mut slot.page, fresh);
                        ctx.queues().remove(old.id());
                        ctx.free_page(old);
                    }
                }
                slot.dirty = DirtyState::Dirty;
                let id = slot.id();
                if let Some(slot) = root.state.pages.page(at) {
                    let kind = root.node.queue_kind(&root.state, slot);
                    ctx.queues().insert(id, &root.node, at, kind);
                }
            }
            Some(ContentSlot::Marker) => {
                if let Some(page) = spare.pop() {
                    root.state.pages.remove(at);
                    insert_page(ctx, &mut root, at, PageSlot::new(page, DirtyState::Dirty));
                }
            }
            Some(ContentSlot::Reference(_)) | None => {}
        }
    }
    debug_assert!(spare.is_empty());
    spare.into_iter().for_each(|p| ctx.free_page(p));
    drop(root);
    trace!(node = %node.id(), offset, len, "vm.pager.dirtied");
    if let Some(source) = node.source() {
        source.on_pages_dirtied(offset, len);
    }
    Ok(())
}

/// Moves the range to Dirty, or reports what the source must do first.
pub(crate) fn mark_dirty(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    len: u64,
) -> Result<Option<Pending>> {
    let mut root = lock_root(node)?;
    let end = check_range(&root.state, offset, len)?;
    if !node.tracks_dirty() {
        return Ok(None);
    }
    if let Some(at) = pages(offset, end).find(|at| root.state.pages.lookup(*at).is_none()) {
        let run = root.state.pages.empty_run(at, end - at);
        return Ok(Some(Pending::Read {
            offset: at,
            len: run.max(PAGE_SIZE),
        }));
    }

    if node.traps_dirty() {
        let Some(first) = pages(offset, end).find(|at| write_traps(&root.state, *at)) else {
            return Ok(None);
        };
        let last = pages(first, end)
            .take_while(|at| write_traps(&root.state, *at))
            .last()
            .unwrap_or(first);
        return Ok(Some(Pending::Dirty {
            offset: first,
            len: last + PAGE_SIZE - first,
        }));
    }

    root.state.pages.split_interval_at(offset);
    root.state.pages.split_interval_at(end);
    for at in pages(offset, end) {
        match root.state.pages.get_mut(at) {
            Some(ContentSlot::Page(slot))
                if matches!(slot.dirty, DirtyState::Clean | DirtyState::AwaitingClean) =>
            {
                slot.dirty = DirtyState::Dirty;
                requeue(ctx, &root, at);
            }
            Some(ContentSlot::Interval(interval)) => interval.awaiting_clean_len = 0,
            _ => {}
        }
    }
    trace!(node = %node.id(), offset, len, "vm.pager.mark_dirty");
    Ok(None)
}

/// Starts writeback: Dirty content in the range becomes AwaitingClean and
/// write mappings are removed.
pub(crate) fn writeback_begin(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    len: u64,
) -> Result<()> {
    let mut root = lock_root(node)?;
    let end = check_range(&root.state, offset, len)?;
    let tracked = node.tracks_dirty();
    root.state.pages.split_interval_at(offset);
    root.state.pages.split_interval_at(end);
    for key in root.state.pages.keys_in(offset, end) {
        match root.state.pages.get_mut(key) {
            Some(ContentSlot::Page(slot)) if slot.dirty == DirtyState::Dirty => {
                slot.dirty = DirtyState::AwaitingClean;
            }
            Some(ContentSlot::Interval(interval)) if tracked => {
                interval.awaiting_clean_len = interval.len;
            }
            _ => {}
        }
    }
    ctx.unmap(node.id(), offset, len, UnmapOp::RemoveWrite);
    trace!(node = %node.id(), offset, len, "vm.pager.writeback_begin");
    Ok(())
}

/// Finishes writeback: AwaitingClean content in the range becomes Clean.
/// Content dirtied again since writeback began stays Dirty.
pub(crate) fn writeback_end(
    ctx: &VmContext,
    node: &Arc<CowPageNode>,
    offset: u64,
    len: u64,
) -> Result<()> {
    let mut root = lock_root(node)?;
    let end = check_range(&root.state, offset, len)?;
    root.state.pages.split_interval_at(offset);
    root.state.pages.split_interval_at(end);
    let mut cleaned = 0u64;
    for key in root.state.pages.keys_in(offset, end) {
        let interval = match root.state.pages.get_mut(key) {
            Some(ContentSlot::Page(slot)) => {
                if slot.dirty == DirtyState::AwaitingClean {
                    slot.dirty = DirtyState::Clean;
                    requeue(ctx, &root, key);
                    cleaned += PAGE_SIZE;
                }
                continue;
            }
            Some(ContentSlot::Interval(interval)) => *interval,
            _ => continue,
        };
        if interval.awaiting_clean_len == 0 {
            continue;
        }
        root.state.pages.remove(key);
        let done = interval.awaiting_clean_len.min(interval.len);
        if done < interval.len {
            root.state.pages.insert(
                key + done,
                ContentSlot::Interval(ZeroInterval::new(interval.len - done)),
            );
        }
        cleaned += done;
    }
    trace!(node = %node.id(), offset, len, cleaned, "vm.pager.writeback_end");
    Ok(())
}

/// Runs of Dirty or AwaitingClean content in the range, coalesced.
pub(crate) fn enumerate_dirty_ranges(
    node: &Arc<CowPageNode>,
    offset: u64,
    len: u64,
) -> Result<Vec<DirtyRange>> {
    let root = lock_root(node)?;
    let end = check_range(&root.state, offset, len)?;
    let mut ranges: Vec<DirtyRange> = Vec::new();
    let mut push = |start: u64, stop: u64, is_zero: bool| {
        let (start, stop) = (start.max(offset), stop.min(end));
        if start >= stop {
            return;
        }
        match ranges.last_mut() {
            Some(last) if last.offset + last.len == start && last.is_zero == is_zero => {
                last.len += stop - start;
            }
            _ => ranges.push(DirtyRange {
                offset: start,
                len: stop - start,
                is_zero,
            }),
        }
    };
    for key in root.state.pages.keys_in(offset, end) {
        match root.state.pages.get(key) {
            Some(ContentSlot::Page(slot)) if slot.dirty.is_dirty() => {
                push(key, key + PAGE_SIZE, false)
            }
            Some(ContentSlot::Interval(interval)) if node.tracks_dirty() => {
                push(key, key + interval.len, true)
            }
            _ => {}
        }
    }
    Ok(ranges)
}

/// Dirty state of the content at `offset`, `None` when nothing is resident.
pub(crate) fn dirty_state(node: &Arc<CowPageNode>, offset: u64) -> Result<Option<DirtyState>> {
    let root = lock_root(node)?;
    let offset = crate::types::page_align_down(offset);
    if offset >= root.state.size {
        return Err(VmError::OutOfRange);
    }
    Ok(match root.state.pages.lookup(offset) {
        Some((_, ContentSlot::Page(slot))) => Some(slot.dirty),
        Some((_, ContentSlot::Interval(_) | ContentSlot::Marker)) if !node.tracks_dirty() => {
            Some(DirtyState::Untracked)
        }
        Some((start, ContentSlot::Interval(interval))) => Some(interval.state_at(start, offset)),
        Some((_, ContentSlot::Marker)) => Some(DirtyState::Clean),
        Some((_, ContentSlot::Reference(_))) | None => None,
    })
}
