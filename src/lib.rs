//! Copy-on-write page-ownership engine.
//!
//! Tracks which physical pages every anonymous or pager-backed memory object
//! owns, shares them between clones through hidden bookkeeping nodes, and
//! reclaims them under pressure by eviction, compression or discard.
//!
//! ```
//! use cowvm::{CloneMode, CreateOptions, VmContext, VmObject, PAGE_SIZE};
//!
//! let ctx = VmContext::new();
//! let parent = VmObject::create(&ctx, 2 * PAGE_SIZE, CreateOptions::new())?;
//! parent.write(0, b"hello")?;
//! let child = parent.clone(0, PAGE_SIZE, CloneMode::Modified)?;
//! child.write(0, b"HELLO")?;
//!
//! let mut buf = [0u8; 5];
//! parent.read(0, &mut buf)?;
//! assert_eq!(&buf, b"hello");
//! # Ok::<(), cowvm::VmError>(())
//! ```

#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod types;
pub mod vm;

pub use primitives::alloc::{AllocFlags, HeapAllocator, Page, PageAllocator};
pub use primitives::compress::{CompressResult, CompressedRef, PageCompressor, SnapCompressor};
pub use primitives::pager::{
    PageProvider, PageRequest, PageSource, PageSourceProperties, RequestKind, TestPager,
};
pub use types::{NodeId, PageId, Result, VmError, PAGE_SIZE};
pub use vm::{
    CloneMode, CounterMetrics, CreateOptions, DirtyRange, DirtyState, EvictionHint,
    EvictionPolicy, Intent, LockState, MappingObserver, MetricsSnapshot, NoopMetrics, QueueKind,
    ReclaimOutcome, ReclaimStats, Reclaimer, ReclaimerHandle, ResolvedPage, UnmapOp, VmContext,
    VmContextBuilder, VmMetrics, VmObject, VmOptions,
};
