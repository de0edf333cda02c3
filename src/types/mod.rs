//! Identifiers, page geometry and the crate-wide error type.

use std::fmt;

use crate::primitives::pager::PageRequest;

/// Size in bytes of one physical page frame.
pub const PAGE_SIZE: u64 = 4096;

/// [`PAGE_SIZE`] as a `usize`, for buffer lengths.
pub const PAGE_SIZE_BYTES: usize = PAGE_SIZE as usize;

/// Identifier of a physical page frame handed out by a [`crate::primitives::alloc::PageAllocator`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Identifier of a node in a copy-on-write hierarchy.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Errors surfaced by the page-ownership engine.
///
/// Only [`VmError::OutOfMemory`] and [`VmError::WouldBlock`] are expected to be
/// retried by the immediate caller; see [`VmError::is_retryable`].
#[derive(thiserror::Error, Debug)]
pub enum VmError {
    /// Offset or length falls outside the object.
    #[error("out of range")]
    OutOfRange,
    /// The allocator could not supply a page.
    #[error("out of memory")]
    OutOfMemory,
    /// The operation is not valid for the object's current state or topology.
    #[error("bad state: {0}")]
    BadState(&'static str),
    /// Content was discarded, or an unpin/unlock had no matching pin/lock.
    #[error("not found")]
    NotFound,
    /// An external collaborator must act first; retry after the request completes.
    #[error("would block on {0:?}")]
    WouldBlock(PageRequest),
    /// Misaligned or otherwise malformed arguments.
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),
    /// A page source or compressor reported a failure.
    #[error("io: {0}")]
    Io(String),
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

impl VmError {
    /// Returns true for the error kinds the immediate caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VmError::OutOfMemory | VmError::WouldBlock(_))
    }

    /// Returns the pending request carried by a [`VmError::WouldBlock`].
    pub fn request(&self) -> Option<&PageRequest> {
        match self {
            VmError::WouldBlock(request) => Some(request),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VmError>;

/// Returns true when `value` is a multiple of [`PAGE_SIZE`].
pub const fn is_page_aligned(value: u64) -> bool {
    value % PAGE_SIZE == 0
}

/// Rounds `value` down to a page boundary.
pub const fn page_align_down(value: u64) -> u64 {
    value - value % PAGE_SIZE
}

/// Rounds `value` up to a page boundary, or `None` on overflow.
pub fn page_align_up(value: u64) -> Option<u64> {
    value.checked_add(PAGE_SIZE - 1).map(page_align_down)
}

/// Validates that `[offset, offset + len)` is page aligned and returns its end.
pub(crate) fn checked_page_range(offset: u64, len: u64) -> Result<u64> {
    if !is_page_aligned(offset) || !is_page_aligned(len) {
        return Err(VmError::InvalidArgs("range must be page aligned"));
    }
    offset.checked_add(len).ok_or(VmError::OutOfRange)
}
