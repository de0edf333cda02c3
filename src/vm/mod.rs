//! Copy-on-write page ownership.
//!
//! [`VmObject`] is the handle consumers hold. Behind it sits a tree of
//! [`node`] values sharing pages through hidden ancestors; [`lookup`]
//! resolves faults against that tree, [`clone`] grows it, and [`reclaim`]
//! frees pages under pressure. Pager-backed roots additionally track dirty
//! state for writeback ([`dirty`]).

pub mod clone;
pub mod context;
pub mod dirty;
pub mod lookup;
pub mod metrics;
pub(crate) mod node;
pub mod object;
pub mod options;
pub mod page_list;
pub mod queues;
mod range;
pub mod reclaim;
mod verify;

pub use clone::CloneMode;
pub use context::{MappingObserver, UnmapOp, VmContext, VmContextBuilder};
pub use dirty::DirtyRange;
pub use lookup::{Intent, ResolvedPage};
pub use metrics::{CounterMetrics, MetricsSnapshot, NoopMetrics, VmMetrics};
pub use object::{EvictionHint, LockState, VmObject};
pub use options::{CreateOptions, EvictionPolicy, VmOptions};
pub use page_list::DirtyState;
pub use queues::{PageQueues, QueueKind};
pub use reclaim::{ReclaimOutcome, ReclaimStats, Reclaimer, ReclaimerHandle};
