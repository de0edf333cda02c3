//! Sparse per-node content storage.
//!
//! Every node keeps an ordered map from page offset to [`ContentSlot`]. A
//! missing key means the offset is empty. Zero intervals are stored once,
//! keyed at their first page, and cover `len` bytes.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::primitives::alloc::Page;
use crate::primitives::compress::CompressedRef;
use crate::types::{PageId, PAGE_SIZE};

/// Writeback state of pager-backed content.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DirtyState {
    /// The source does not track dirty state, or the page is anonymous.
    Untracked,
    /// Matches what the source holds.
    Clean,
    /// Writeback started; reverts to Dirty if written again.
    AwaitingClean,
    /// Modified since the source last saw it.
    Dirty,
}

impl DirtyState {
    /// True for content the source has not yet cleaned (Dirty or AwaitingClean).
    pub fn is_dirty(self) -> bool {
        matches!(self, DirtyState::Dirty | DirtyState::AwaitingClean)
    }
}

/// A resident page and its bookkeeping.
#[derive(Debug)]
pub(crate) struct PageSlot {
    pub(crate) page: Page,
    pub(crate) pin_count: u32,
    pub(crate) share_count: u32,
    pub(crate) dirty: DirtyState,
    pub(crate) always_need: bool,
    /// Written through a root whose source does not track dirty state. The
    /// source has no copy of the content.
    pub(crate) written: bool,
}

impl PageSlot {
    pub(crate) fn new(page: Page, dirty: DirtyState) -> Self {
        Self {
            page,
            pin_count: 0,
            share_count: 0,
            dirty,
            always_need: false,
            written: false,
        }
    }

    pub(crate) fn id(&self) -> PageId {
        self.page.id()
    }

    /// Content that would be lost if the page were dropped.
    pub(crate) fn holds_unsaved(&self) -> bool {
        self.written || self.dirty.is_dirty()
    }
}

/// A compressed page.
#[derive(Debug)]
pub(crate) struct RefSlot {
    pub(crate) handle: CompressedRef,
    pub(crate) share_count: u32,
}

/// Dirty zero content on a pager-backed root.
///
/// Intervals are always Dirty. The first `awaiting_clean_len` bytes are
/// AwaitingClean once writeback of the interval has begun.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ZeroInterval {
    pub(crate) len: u64,
    pub(crate) awaiting_clean_len: u64,
}

impl ZeroInterval {
    pub(crate) fn new(len: u64) -> Self {
        Self {
            len,
            awaiting_clean_len: 0,
        }
    }

    pub(crate) fn state_at(&self, start: u64, offset: u64) -> DirtyState {
        if offset < start + self.awaiting_clean_len {
            DirtyState::AwaitingClean
        } else {
            DirtyState::Dirty
        }
    }

    /// Splits at `at` bytes from the interval start.
    fn split(self, at: u64) -> (ZeroInterval, ZeroInterval) {
        debug_assert!(at > 0 && at < self.len);
        let left = ZeroInterval {
            len: at,
            awaiting_clean_len: self.awaiting_clean_len.min(at),
        };
        let right = ZeroInterval {
            len: self.len - at,
            awaiting_clean_len: self.awaiting_clean_len.saturating_sub(at),
        };
        (left, right)
    }
}

/// What a node holds at one offset.
#[derive(Debug)]
pub(crate) enum ContentSlot {
    Page(PageSlot),
    Reference(RefSlot),
    Marker,
    Interval(ZeroInterval),
}

impl ContentSlot {
    pub(crate) fn share_count(&self) -> u32 {
        match self {
            ContentSlot::Page(p) => p.share_count,
            ContentSlot::Reference(r) => r.share_count,
            ContentSlot::Marker | ContentSlot::Interval(_) => 0,
        }
    }

    pub(crate) fn span(&self) -> u64 {
        match self {
            ContentSlot::Interval(interval) => interval.len,
            _ => PAGE_SIZE,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            ContentSlot::Page(_) => "page",
            ContentSlot::Reference(_) => "reference",
            ContentSlot::Marker => "marker",
            ContentSlot::Interval(_) => "interval",
        }
    }
}

/// Ordered sparse map of a node's content.
#[derive(Debug, Default)]
pub(crate) struct PageList {
    slots: BTreeMap<u64, ContentSlot>,
}

impl PageList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, &ContentSlot)> {
        self.slots.iter().map(|(k, v)| (*k, v))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut ContentSlot)> {
        self.slots.iter_mut().map(|(k, v)| (*k, v))
    }

    /// Start of the interval covering `offset` when it begins before it.
    fn covering_interval_start(&self, offset: u64) -> Option<u64> {
        let (start, slot) = self.slots.range(..offset).next_back()?;
        match slot {
            ContentSlot::Interval(interval) if start + interval.len > offset => Some(*start),
            _ => None,
        }
    }

    /// Slot covering `offset`, with the key it is stored under.
    pub(crate) fn lookup(&self, offset: u64) -> Option<(u64, &ContentSlot)> {
        if let Some(slot) = self.slots.get(&offset) {
            return Some((offset, slot));
        }
        let start = self.covering_interval_start(offset)?;
        self.slots.get(&start).map(|slot| (start, slot))
    }

    /// Slot stored exactly at `offset`.
    pub(crate) fn get(&self, offset: u64) -> Option<&ContentSlot> {
        self.slots.get(&offset)
    }

    pub(crate) fn get_mut(&mut self, offset: u64) -> Option<&mut ContentSlot> {
        self.slots.get_mut(&offset)
    }

    pub(crate) fn page(&self, offset: u64) -> Option<&PageSlot> {
        match self.slots.get(&offset) {
            Some(ContentSlot::Page(page)) => Some(page),
            _ => None,
        }
    }

    pub(crate) fn page_mut(&mut self, offset: u64) -> Option<&mut PageSlot> {
        match self.slots.get_mut(&offset) {
            Some(ContentSlot::Page(page)) => Some(page),
            _ => None,
        }
    }

    pub(crate) fn insert(&mut self, offset: u64, slot: ContentSlot) -> Option<ContentSlot> {
        debug_assert_eq!(offset % PAGE_SIZE, 0);
        debug_assert!(self.covering_interval_start(offset).is_none());
        self.slots.insert(offset, slot)
    }

    pub(crate) fn remove(&mut self, offset: u64) -> Option<ContentSlot> {
        self.slots.remove(&offset)
    }

    /// True when any slot overlaps `[start, end)`.
    pub(crate) fn has_content_in(&self, start: u64, end: u64) -> bool {
        start < end
            && (self.covering_interval_start(start).is_some()
                || self.slots.range(start..end).next().is_some())
    }

    /// Keys of slots overlapping `[start, end)`, in order.
    pub(crate) fn keys_in(&self, start: u64, end: u64) -> Vec<u64> {
        if start >= end {
            return Vec::new();
        }
        let mut keys: Vec<u64> = self.covering_interval_start(start).into_iter().collect();
        keys.extend(self.slots.range(start..end).map(|(k, _)| *k));
        keys
    }

    /// Sub-ranges of `[start, end)` with no slot.
    pub(crate) fn gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        if start >= end {
            return gaps;
        }
        let mut cursor = start;
        if let Some(s) = self.covering_interval_start(start) {
            cursor = s + self.slots[&s].span();
        }
        for (key, slot) in self.slots.range(start..end) {
            if *key > cursor {
                gaps.push((cursor, *key));
            }
            cursor = cursor.max(key + slot.span());
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// Length of the empty run starting at `offset`, capped at `max`.
    pub(crate) fn empty_run(&self, offset: u64, max: u64) -> u64 {
        if self.lookup(offset).is_some() {
            return 0;
        }
        let limit = offset.saturating_add(max);
        match self
            .slots
            .range((Bound::Excluded(offset), Bound::Excluded(limit)))
            .next()
        {
            Some((key, _)) => key - offset,
            None => max,
        }
    }

    /// Splits any interval straddling `offset` so that a key starts there.
    pub(crate) fn split_interval_at(&mut self, offset: u64) {
        let Some(start) = self.covering_interval_start(offset) else {
            return;
        };
        if let Some(ContentSlot::Interval(interval)) = self.slots.remove(&start) {
            let (left, right) = interval.split(offset - start);
            self.slots.insert(start, ContentSlot::Interval(left));
            self.slots.insert(offset, ContentSlot::Interval(right));
        }
    }

    /// Removes and returns every slot in `[start, end)`, splitting intervals at
    /// the edges.
    pub(crate) fn take_range(&mut self, start: u64, end: u64) -> Vec<(u64, ContentSlot)> {
        if start >= end {
            return Vec::new();
        }
        self.split_interval_at(start);
        self.split_interval_at(end);
        let keys: Vec<u64> = self.slots.range(start..end).map(|(k, _)| *k).collect();
        keys.into_iter()
            .filter_map(|k| self.slots.remove(&k).map(|slot| (k, slot)))
            .collect()
    }

    /// Removes and returns every slot.
    pub(crate) fn take_all(&mut self) -> Vec<(u64, ContentSlot)> {
        std::mem::take(&mut self.slots).into_iter().collect()
    }

    /// Removes one page from the interval covering `offset` and reports the
    /// state that page had.
    pub(crate) fn carve_interval_page(&mut self, offset: u64) -> Option<DirtyState> {
        let state = match self.lookup(offset) {
            Some((start, ContentSlot::Interval(interval))) => interval.state_at(start, offset),
            _ => return None,
        };
        self.split_interval_at(offset);
        self.split_interval_at(offset + PAGE_SIZE);
        self.slots.remove(&offset);
        Some(state)
    }

    /// Inserts a fresh Dirty interval over an empty range, merging with
    /// adjacent intervals.
    pub(crate) fn insert_interval(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        debug_assert!(!self.has_content_in(start, start + len));
        let mut begin = start;
        let mut merged = ZeroInterval::new(len);
        if let Some((left_start, ContentSlot::Interval(left))) = self.slots.range(..start).next_back() {
            if left_start + left.len == start {
                let left = *left;
                begin = *left_start;
                merged = ZeroInterval {
                    len: left.len + len,
                    awaiting_clean_len: left.awaiting_clean_len,
                };
            }
        }
        let end = start + len;
        if let Some(ContentSlot::Interval(right)) = self.slots.get(&end) {
            if right.awaiting_clean_len == 0 {
                merged.len += right.len;
                self.slots.remove(&end);
            }
        }
        self.slots.insert(begin, ContentSlot::Interval(merged));
    }
}
