//! Reclaim queues.
//!
//! Every resident page is tracked with a backlink to the node and offset
//! holding it, the queue it currently belongs to, and an access sequence.
//! Larger sequences are more recently used. `DontNeed` hints hand out
//! sequences below every normal access so hinted pages are reclaimed first.
//!
//! The queue lock is a leaf: it is taken while node locks are held, never the
//! other way around.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::PageId;
use crate::vm::node::CowPageNode;

const SEQ_SPLIT: u64 = 1 << 62;

/// Queue a resident page belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueueKind {
    /// Pinned; never reclaimed.
    Wired,
    /// Anonymous content, reclaimed by compression.
    Anonymous,
    /// Clean or untracked pager-backed content, reclaimed by eviction.
    Reclaim,
    /// Pager-backed content awaiting writeback.
    PagerBackedDirty,
    /// Owned by a high-priority node.
    HighPriority,
    /// Compression already failed once.
    FailedReclaim,
}

impl QueueKind {
    const ALL: [QueueKind; 6] = [
        QueueKind::Wired,
        QueueKind::Anonymous,
        QueueKind::Reclaim,
        QueueKind::PagerBackedDirty,
        QueueKind::HighPriority,
        QueueKind::FailedReclaim,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

struct Entry {
    node: Weak<CowPageNode>,
    offset: u64,
    kind: QueueKind,
    seq: u64,
}

struct QueueState {
    entries: FxHashMap<PageId, Entry>,
    lists: [BTreeMap<u64, PageId>; 6],
    next_mru: u64,
    next_lru: u64,
}

impl QueueState {
    fn unlink(&mut self, page: PageId) -> Option<Entry> {
        let entry = self.entries.remove(&page)?;
        self.lists[entry.kind.index()].remove(&entry.seq);
        Some(entry)
    }

    fn link(&mut self, page: PageId, mut entry: Entry, dont_need: bool) {
        entry.seq = if dont_need {
            self.next_lru -= 1;
            self.next_lru
        } else {
            self.next_mru += 1;
            self.next_mru
        };
        self.lists[entry.kind.index()].insert(entry.seq, page);
        self.entries.insert(page, entry);
    }
}

/// A page the reclaimer may try to reclaim.
#[derive(Clone)]
pub(crate) struct Candidate {
    pub(crate) node: Weak<CowPageNode>,
    pub(crate) offset: u64,
    pub(crate) page: PageId,
}

/// Resident-page tracking shared by every object in a context.
pub struct PageQueues {
    state: Mutex<QueueState>,
}

impl Default for PageQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl PageQueues {
    /// Empty queues.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: FxHashMap::default(),
                lists: Default::default(),
                next_mru: SEQ_SPLIT,
                next_lru: SEQ_SPLIT,
            }),
        }
    }

    /// Pages tracked in total.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when no page is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pages in one queue.
    pub fn count(&self, kind: QueueKind) -> usize {
        self.state.lock().lists[kind.index()].len()
    }

    /// Per-queue page counts.
    pub fn counts(&self) -> Vec<(QueueKind, usize)> {
        let state = self.state.lock();
        QueueKind::ALL
            .iter()
            .map(|k| (*k, state.lists[k.index()].len()))
            .collect()
    }

    /// Queue a page is on.
    pub fn kind_of(&self, page: PageId) -> Option<QueueKind> {
        self.state.lock().entries.get(&page).map(|e| e.kind)
    }

    pub(crate) fn insert(&self, page: PageId, node: &Arc<CowPageNode>, offset: u64, kind: QueueKind) {
        let mut state = self.state.lock();
        state.unlink(page);
        let entry = Entry {
            node: Arc::downgrade(node),
            offset,
            kind,
            seq: 0,
        };
        state.link(page, entry, false);
    }

    pub(crate) fn remove(&self, page: PageId) {
        self.state.lock().unlink(page);
    }

    /// Moves a page to the most-recently-used end of its queue.
    pub(crate) fn touch(&self, page: PageId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.unlink(page) {
            state.link(page, entry, false);
        }
    }

    /// Moves a page to the least-recently-used end of its queue.
    pub(crate) fn mark_dont_need(&self, page: PageId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.unlink(page) {
            state.link(page, entry, true);
        }
    }

    /// Moves a page to another queue, keeping its position class.
    pub(crate) fn set_kind(&self, page: PageId, kind: QueueKind) {
        let mut state = self.state.lock();
        let Some(mut entry) = state.unlink(page) else {
            return;
        };
        let dont_need = entry.seq < SEQ_SPLIT;
        entry.kind = kind;
        state.link(page, entry, dont_need);
    }

    /// Updates the backlink of a page that moved between nodes.
    pub(crate) fn relink(&self, page: PageId, node: &Arc<CowPageNode>, offset: u64, kind: QueueKind) {
        let mut state = self.state.lock();
        let Some(mut entry) = state.unlink(page) else {
            return;
        };
        entry.node = Arc::downgrade(node);
        entry.offset = offset;
        entry.kind = kind;
        state.link(page, entry, false);
    }

    /// Oldest reclaimable pages: pager-backed `Reclaim` first, then `Anonymous`.
    pub(crate) fn reclaim_candidates(&self, max: usize) -> Vec<Candidate> {
        let state = self.state.lock();
        [QueueKind::Reclaim, QueueKind::Anonymous]
            .iter()
            .flat_map(|kind| state.lists[kind.index()].values())
            .take(max)
            .filter_map(|page| {
                state.entries.get(page).map(|entry| Candidate {
                    node: entry.node.clone(),
                    offset: entry.offset,
                    page: *page,
                })
            })
            .collect()
    }

    /// Pages currently eligible for reclamation.
    pub fn reclaimable(&self) -> usize {
        let state = self.state.lock();
        state.lists[QueueKind::Reclaim.index()].len() + state.lists[QueueKind::Anonymous.index()].len()
    }
}
