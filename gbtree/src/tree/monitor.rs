//! Tree lifecycle notifications.

use std::time::Duration;

use crate::tree::error::TreeError;
use crate::tree::generation::Generations;

/// Statistics of one recovery cleanup run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    /// Pages inspected, reachable or not.
    pub pages_visited: u64,
    /// Nodes reachable from the root.
    pub tree_nodes: u64,
    /// Pointer slots written by the crashed session that were zeroed.
    pub crashed_pointers_cleaned: u64,
    /// Unreachable pages returned to the free list.
    pub pages_reclaimed: u64,
    /// Unreachable nodes stamped with a crashed generation.
    pub crashed_leftovers: u64,
    /// Wall time of the run.
    pub duration: Duration,
}

/// Receives tree lifecycle events.
///
/// Every method has a no-op default; implement only what you need.
#[allow(unused_variables)]
pub trait TreeMonitor: Send + Sync {
    /// A tree was opened; `clean` is false after an unclean shutdown.
    fn startup_state(&self, clean: bool) {}

    /// A checkpoint made `generations.stable` durable.
    fn checkpoint_completed(&self, generations: Generations, pages_flushed: usize) {}

    /// Recovery cleanup started.
    fn cleanup_started(&self) {}

    /// Recovery cleanup finished.
    fn cleanup_finished(&self, stats: &CleanupStats) {}

    /// Recovery cleanup failed; the tree stays unusable.
    fn cleanup_failed(&self, error: &TreeError) {}

    /// The root split; the tree now has `height` levels.
    fn tree_growth(&self, height: usize) {}

    /// The root collapsed; the tree now has `height` levels.
    fn tree_shrink(&self, height: usize) {}
}

/// Monitor that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl TreeMonitor for NoopMonitor {}

/// Monitor that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMonitor;

impl TreeMonitor for LoggingMonitor {
    fn startup_state(&self, clean: bool) {
        if clean {
            tracing::info!("tree opened after clean shutdown");
        } else {
            tracing::warn!("tree opened after unclean shutdown, recovery cleanup required");
        }
    }

    fn checkpoint_completed(&self, generations: Generations, pages_flushed: usize) {
        tracing::info!(
            stable = generations.stable,
            unstable = generations.unstable,
            pages_flushed,
            "checkpoint completed"
        );
    }

    fn cleanup_started(&self) {
        tracing::info!("recovery cleanup started");
    }

    fn cleanup_finished(&self, stats: &CleanupStats) {
        tracing::info!(
            pages_visited = stats.pages_visited,
            tree_nodes = stats.tree_nodes,
            crashed_pointers_cleaned = stats.crashed_pointers_cleaned,
            pages_reclaimed = stats.pages_reclaimed,
            crashed_leftovers = stats.crashed_leftovers,
            duration_ms = stats.duration.as_millis(),
            "recovery cleanup finished"
        );
    }

    fn cleanup_failed(&self, error: &TreeError) {
        tracing::error!(error = %error, "recovery cleanup failed");
    }

    fn tree_growth(&self, height: usize) {
        tracing::debug!(height, "tree grew");
    }

    fn tree_shrink(&self, height: usize) {
        tracing::debug!(height, "tree shrank");
    }
}
