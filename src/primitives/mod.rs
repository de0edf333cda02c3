//! Collaborator plumbing for the page-ownership engine.
//!
//! Includes the physical allocator interface, the compression codec, the page
//! source protocol used by pager-backed objects, and the lock-ordering
//! primitives every multi-node operation is built on.

/// Physical page frames and the allocator interface.
pub mod alloc;

/// Page compression codec and the in-flight compression protocol.
pub mod compress;

/// Lock ordering.
///
/// Owned mutex guards tagged with a global acquisition order.
pub mod concurrency;

/// Page sources for pager-backed objects.
pub mod pager;
