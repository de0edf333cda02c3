//! Whole-hierarchy consistency check.
//!
//! Nodes are snapshotted one lock at a time, so the result is only
//! meaningful while no other thread mutates the hierarchy.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::types::{NodeId, Result, VmError};
use crate::vm::node::{CowPageNode, LifeCycle};
use crate::vm::page_list::ContentSlot;

struct Snapshot {
    hidden: bool,
    pager_root: bool,
    alive: bool,
    size: u64,
    order: u64,
    parent: Option<NodeId>,
    parent_offset: u64,
    parent_limit: u64,
    children: Vec<NodeId>,
    /// Keys of every slot, with the share count of pages and references.
    slots: Vec<(u64, Option<u32>)>,
    has_interval: bool,
}

impl Snapshot {
    fn take(node: &CowPageNode) -> (Self, Vec<Arc<CowPageNode>>) {
        let state = node.lock();
        let slots = state
            .pages
            .iter()
            .map(|(key, slot)| {
                let share = match slot {
                    ContentSlot::Page(_) | ContentSlot::Reference(_) => Some(slot.share_count()),
                    ContentSlot::Marker | ContentSlot::Interval(_) => None,
                };
                (key, share)
            })
            .collect();
        let snapshot = Self {
            hidden: state.hidden,
            pager_root: node.is_pager_root(),
            alive: state.life == LifeCycle::Alive,
            size: state.size,
            order: node.order(),
            parent: state.parent.as_ref().map(|p| p.id()),
            parent_offset: state.parent_offset,
            parent_limit: state.parent_limit,
            children: state.children.iter().map(|c| c.id).collect(),
            slots,
            has_interval: state
                .pages
                .iter()
                .any(|(_, slot)| matches!(slot, ContentSlot::Interval(_))),
        };
        (snapshot, state.live_children())
    }

    fn has_slot(&self, key: u64) -> bool {
        self.slots.binary_search_by_key(&key, |(k, _)| *k).is_ok()
    }
}

fn fail(node: NodeId, what: &'static str) -> VmError {
    warn!(node = %node, problem = what, "vm.verify.failed");
    VmError::BadState(what)
}

/// Verifies the hierarchy containing `start`.
pub(crate) fn verify_from(start: &Arc<CowPageNode>) -> Result<()> {
    let mut root = start.clone();
    loop {
        let parent = root.lock().parent.clone();
        match parent {
            Some(parent) => root = parent,
            None => break,
        }
    }

    let mut nodes: FxHashMap<NodeId, Snapshot> = FxHashMap::default();
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(node) = queue.pop_front() {
        let (snapshot, children) = Snapshot::take(&node);
        nodes.insert(node.id(), snapshot);
        queue.extend(children);
    }

    for (id, node) in &nodes {
        check_structure(*id, node, &nodes)?;
    }
    for (id, node) in &nodes {
        if !node.hidden {
            continue;
        }
        for (key, share) in &node.slots {
            let Some(share) = share else {
                continue;
            };
            let reachers = reachers(node, *key, &nodes);
            if u64::from(*share) + 1 != reachers {
                warn!(node = %id, offset = key, share, reachers, "vm.verify.share_mismatch");
                return Err(VmError::BadState("share count does not match reachers"));
            }
        }
    }
    Ok(())
}

fn check_structure(id: NodeId, node: &Snapshot, nodes: &FxHashMap<NodeId, Snapshot>) -> Result<()> {
    if !node.alive {
        return Err(fail(id, "reachable node is not alive"));
    }
    if !node.hidden && node.slots.iter().any(|(_, share)| share.is_some_and(|s| s > 0)) {
        return Err(fail(id, "visible node holds a shared page"));
    }
    if node.hidden && node.children.len() == 1 {
        return Err(fail(id, "hidden node with a single child"));
    }
    if !node.hidden && !node.pager_root && node.parent.is_some() && !node.children.is_empty() {
        return Err(fail(id, "visible clone with children"));
    }
    if node.has_interval && (!node.pager_root || node.parent.is_some()) {
        return Err(fail(id, "zero interval outside a pager-backed root"));
    }
    if node.parent_limit > node.size {
        return Err(fail(id, "parent limit beyond size"));
    }
    for child_id in &node.children {
        let Some(child) = nodes.get(child_id) else {
            return Err(fail(id, "child missing from hierarchy"));
        };
        if child.parent != Some(id) {
            return Err(fail(*child_id, "child does not point back at its parent"));
        }
        if child.order >= node.order {
            return Err(fail(*child_id, "child lock order not below parent"));
        }
        if child.parent_limit > 0 && child.parent_offset + child.parent_limit > node.size {
            return Err(fail(*child_id, "child window beyond parent size"));
        }
    }
    Ok(())
}

/// Visible nodes that see `key` of `node` through their ancestors' gaps.
fn reachers(node: &Snapshot, key: u64, nodes: &FxHashMap<NodeId, Snapshot>) -> u64 {
    let mut total = 0;
    for child_id in &node.children {
        let Some(child) = nodes.get(child_id) else {
            continue;
        };
        if key < child.parent_offset || key - child.parent_offset >= child.parent_limit {
            continue;
        }
        let local = key - child.parent_offset;
        if child.has_slot(local) {
            continue;
        }
        total += if child.hidden {
            reachers(child, local, nodes)
        } else {
            1
        };
    }
    total
}
