//! Id ranges for batch id allocation.
//!
//! A range is a lease on a set of free ids that a batch consumes in order.
//! Batches that may be retried `mark` the range before starting and
//! `reset_to_mark` to replay the same ids.
//!
//! # Usage
//!
//! ```ignore
//! use gbtree::id_range::{IdRange, IdRangeAllocator};
//!
//! let allocator = IdRangeAllocator::new(0);
//! let mut range = allocator.next_page_range(128)?;
//! range.mark();
//! let id = range.next_id()?;
//! allocator.release_page_range(range);
//! ```

mod allocator;
mod range;

pub use allocator::{IdRangeAllocator, PageIdRange, RESERVED_ID};
pub use range::{ArrayRange, ContinuousRange, IdRange, RangeExhaustedError};
