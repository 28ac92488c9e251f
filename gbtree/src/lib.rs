// Life of a write:
// 1. A writer takes the exclusive writer lease
// 2. It descends from the root, recording the path
// 3. The leaf is rewritten in place if it was created in the unstable
//    generation, otherwise copied to a new page
// 4. Splits, merges and copies propagate up the recorded path; a stable
//    parent is redirected through the unstable slot of its pointer pair
// 5. A checkpoint flushes every page, writes the other tree state page, and
//    advances the generations
//
// System components:
//  - Page storage (file or in-memory with crash simulation) and page cache
//  - The tree: writer, seekers, checkpoints, recovery cleanup
//  - Id ranges for batch id allocation
#![cfg_attr(test, allow(clippy::disallowed_methods, clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod id_range;
#[cfg(test)]
mod simulation;
pub mod storage;
#[cfg(test)]
mod testing;
pub mod tree;

pub use config::{ConfigError, TreeConfig};
pub use id_range::{IdRange, IdRangeAllocator, RangeExhaustedError};
pub use tree::{
    BytesLayout, GBTree, GroupingCollector, IgnoreCollector, ImmediateCollector, Layout,
    RecoveryCleanupWorkCollector, Seeker, TreeError, TreeMonitor, U64Layout, Writer,
};
