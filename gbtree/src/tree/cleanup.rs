//! Recovery cleanup after an unclean shutdown.
//!
//! Opening a tree that was not closed cleanly leaves two kinds of debris:
//!
//! - Pointer slots written by the crashed session. They are already ignored
//!   by readers (their generation falls in the crash gap) but would become
//!   valid once the gap is checkpointed past, so they must be zeroed before
//!   the next checkpoint.
//! - Pages allocated or released by the crashed session, plus the whole free
//!   list (only persisted on clean close). Every page that is not reachable
//!   from the root is returned to the free list.
//!
//! Cleanup runs as a job handed to a `RecoveryCleanupWorkCollector`, so the
//! caller decides whether it runs during `open`, later in a batch, or not at
//! all. Until it completes, the tree refuses writers, seekers, and
//! checkpoints.
//!
//! # Phases
//!
//! ```text
//! NotStarted -> Scanning -> Repairing -> Done
//! ```
//!
//! A failed run returns to `NotStarted` and may be retried.

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;

use crate::storage::{PageId, PageType};
use crate::tree::consistency::scan_tree;
use crate::tree::engine::{TreeInner, WriterState};
use crate::tree::error::TreeError;
use crate::tree::generation::Generations;
use crate::tree::layout::Layout;
use crate::tree::monitor::CleanupStats;
use crate::tree::node;
use crate::tree::pointer::{clean_crashed_slots, has_crashed_slots};
use crate::tree::state::FIRST_DATA_PAGE;

/// Progress of the recovery cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CleanupPhase {
    NotStarted = 0,
    Scanning = 1,
    Repairing = 2,
    Done = 3,
}

impl CleanupPhase {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Scanning,
            2 => Self::Repairing,
            3 => Self::Done,
            _ => Self::NotStarted,
        }
    }
}

type CleanupTask = Box<dyn FnOnce() -> Result<CleanupStats, TreeError> + Send>;

/// A unit of recovery work.
pub struct CleanupJob {
    task: CleanupTask,
}

impl CleanupJob {
    /// Wrap a cleanup task.
    pub fn new(task: impl FnOnce() -> Result<CleanupStats, TreeError> + Send + 'static) -> Self {
        Self {
            task: Box::new(task),
        }
    }

    /// Run the job to completion.
    pub fn run(self) -> Result<CleanupStats, TreeError> {
        (self.task)()
    }
}

impl std::fmt::Debug for CleanupJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupJob").finish_non_exhaustive()
    }
}

/// Decides when recovery cleanup jobs run.
pub trait RecoveryCleanupWorkCollector: Send + Sync {
    /// Accept a job. Collectors that run the job right away return its error.
    fn add(&self, job: CleanupJob) -> Result<(), TreeError>;
}

/// Runs each job as soon as it is added, failing `open` if cleanup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateCollector;

impl RecoveryCleanupWorkCollector for ImmediateCollector {
    fn add(&self, job: CleanupJob) -> Result<(), TreeError> {
        job.run().map(|_| ())
    }
}

/// Stores jobs until `start` runs them all, one thread per job.
#[derive(Debug, Default)]
pub struct GroupingCollector {
    jobs: Mutex<Vec<CleanupJob>>,
}

impl GroupingCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Run every collected job and wait for all of them.
    pub fn start(&self) -> Vec<Result<CleanupStats, TreeError>> {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        std::thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|job| scope.spawn(move || job.run()))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(TreeError::TreeCorruption(
                            "cleanup job panicked".to_string(),
                        ))
                    })
                })
                .collect()
        })
    }
}

impl RecoveryCleanupWorkCollector for GroupingCollector {
    fn add(&self, job: CleanupJob) -> Result<(), TreeError> {
        self.jobs.lock().push(job);
        Ok(())
    }
}

/// Drops every job. Trees opened with it stay unusable until
/// `GBTree::run_recovery` is called.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreCollector;

impl RecoveryCleanupWorkCollector for IgnoreCollector {
    fn add(&self, _job: CleanupJob) -> Result<(), TreeError> {
        tracing::debug!("recovery cleanup job ignored");
        Ok(())
    }
}

/// Run recovery cleanup on `tree` if it is still pending.
pub(crate) fn run<L: Layout>(tree: &TreeInner<L>) -> Result<CleanupStats, TreeError> {
    let mut state = tree.lock_writer()?;
    if tree.cleanup_phase() == CleanupPhase::Done {
        return Ok(CleanupStats::default());
    }

    tree.monitor.cleanup_started();
    match execute(tree, &mut state) {
        Ok(stats) => {
            tree.set_cleanup_phase(CleanupPhase::Done);
            tree.monitor.cleanup_finished(&stats);
            Ok(stats)
        }
        Err(e) => {
            tree.set_cleanup_phase(CleanupPhase::NotStarted);
            tree.monitor.cleanup_failed(&e);
            Err(e)
        }
    }
}

fn execute<L: Layout>(
    tree: &TreeInner<L>,
    state: &mut WriterState,
) -> Result<CleanupStats, TreeError> {
    let started = Instant::now();
    let generations = tree.generations();
    let mut stats = CleanupStats::default();

    tree.set_cleanup_phase(CleanupPhase::Scanning);
    let scan = scan_tree(tree, generations, tree.root())?;
    stats.tree_nodes = scan.reachable.len() as u64;
    stats.pages_visited = stats.tree_nodes;

    tree.set_cleanup_phase(CleanupPhase::Repairing);
    for &page_id in &scan.reachable {
        stats.crashed_pointers_cleaned += repair_node(tree, page_id, generations)?;
    }

    let mut known: HashSet<PageId> = scan.reachable.iter().copied().collect();
    known.extend(state.free_list.iter().map(|entry| entry.page_id));
    for page_id in FIRST_DATA_PAGE..state.last_id {
        if known.contains(&page_id) {
            continue;
        }
        stats.pages_visited += 1;
        if is_crashed_leftover(tree, page_id, generations)? {
            stats.crashed_leftovers += 1;
        }
        state.free_list.release(page_id, generations.stable);
        stats.pages_reclaimed += 1;
    }

    stats.duration = started.elapsed();
    Ok(stats)
}

/// Zero crashed pointer slots of a reachable node.
fn repair_node<L: Layout>(
    tree: &TreeInner<L>,
    page_id: PageId,
    generations: Generations,
) -> Result<u64, TreeError> {
    let offsets = {
        let page = tree.cache.read(page_id)?;
        let offsets = node::pointer_offsets(&page).map_err(|e| TreeError::CorruptNode {
            page_id,
            reason: e.into_reason(node::peek_generation(&page)),
        })?;
        let dirty = offsets
            .iter()
            .any(|&offset| has_crashed_slots(&page, offset, generations));
        if !dirty {
            return Ok(0);
        }
        offsets
    };

    let mut page = tree.cache.write(page_id)?;
    let cleaned: usize = offsets
        .iter()
        .map(|&offset| clean_crashed_slots(&mut page, offset, generations))
        .sum();
    Ok(cleaned as u64)
}

/// True if an unreachable page holds a node written by the crashed session.
fn is_crashed_leftover<L: Layout>(
    tree: &TreeInner<L>,
    page_id: PageId,
    generations: Generations,
) -> Result<bool, TreeError> {
    let page = tree.cache.read(page_id)?;
    let is_node = matches!(
        PageType::try_from(page.read_u8(0)),
        Ok(PageType::TreeLeaf | PageType::TreeInternal)
    );
    Ok(is_node && node::peek_generation(&page) > generations.stable)
}
