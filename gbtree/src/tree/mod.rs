//! Crash-safe, concurrent, copy-on-write B+tree.
//!
//! One writer at a time mutates the tree while any number of seekers read
//! it without locks. Changes become durable at checkpoints; everything
//! written since the last checkpoint is discarded by a crash.
//!
//! # Generations
//!
//! Every node and pointer slot is stamped with a generation. The tree keeps
//! two: `stable`, the generation of the last durable checkpoint, and
//! `unstable`, the generation being written. A node stamped `stable` is never
//! modified in place; the writer copies it first. Pointers are slot pairs so
//! a stable page can point at both its stable and its unstable successor.
//! After a crash, slots stamped with a generation between the durable
//! `stable` and the crashed `unstable` are ignored and later zeroed by the
//! recovery cleanup.
//!
//! # File Layout
//!
//! ```text
//! page 0     meta (magic, format version, layout)
//! page 1, 2  tree state A and B, alternated by checkpoints
//! page 3..   nodes and free-list pages
//! ```

mod cleanup;
mod consistency;
mod engine;
mod error;
mod free_list;
mod generation;
mod layout;
mod monitor;
mod node;
mod pointer;
mod seeker;
mod state;
mod writer;

pub use cleanup::{
    CleanupJob, CleanupPhase, GroupingCollector, IgnoreCollector, ImmediateCollector,
    RecoveryCleanupWorkCollector,
};
pub use consistency::ConsistencyReport;
pub use engine::GBTree;
pub use error::TreeError;
pub use generation::{Generation, Generations};
pub use layout::{BytesLayout, Layout, U64Layout};
pub use monitor::{CleanupStats, LoggingMonitor, NoopMonitor, TreeMonitor};
pub use node::{CorruptReason, MAX_ENTRY_SIZE};
pub use seeker::Seeker;
pub use state::StateError;
pub use writer::Writer;
