//! Page-source plumbing for pager-backed objects.
//!
//! A [`PageSource`] sits between the core and an external [`PageProvider`]. The
//! core asks it for read and dirty requests; the provider answers
//! asynchronously by calling back into the owning object, which in turn
//! resolves the outstanding requests here.

mod source;
mod testing;

pub use source::{PageProvider, PageRequest, PageSource, PageSourceProperties, RequestKind};
pub use testing::TestPager;
