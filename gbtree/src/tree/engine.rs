//! Tree lifecycle: create, open, checkpoint, close.
//!
//! # Sessions
//!
//! A session starts at `create` or `open` and ends at `close` (or a crash).
//! Opening always writes an unclean copy of the state before anything else,
//! so a crash during the session is detected by the next open no matter
//! which checkpoints completed in between.
//!
//! # Concurrency
//!
//! - One writer at a time, through the writer lease (`WriterState` mutex);
//!   checkpoint and close take the same lease
//! - Any number of seekers, which only read generations, the root, and pages
//! - Generations are one atomic word; the root sits behind a `RwLock`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::TreeConfig;
use crate::storage::{META_PAGE_ID, Meta, PageCache, PageCacheStats, PageId, PageStore};
use crate::tree::cleanup::{self, CleanupJob, CleanupPhase, RecoveryCleanupWorkCollector};
use crate::tree::consistency::{self, ConsistencyReport};
use crate::tree::error::TreeError;
use crate::tree::free_list::FreeList;
use crate::tree::generation::{Generation, Generations, SharedGenerations};
use crate::tree::layout::Layout;
use crate::tree::monitor::{CleanupStats, LoggingMonitor, TreeMonitor};
use crate::tree::node::{self, Node, NodeCapacity};
use crate::tree::pointer::NO_PAGE;
use crate::tree::seeker::Seeker;
use crate::tree::state::{
    FIRST_DATA_PAGE, STATE_PAGE_A, STATE_PAGE_B, StateSlot, TreeState, select_newest_valid_state,
};
use crate::tree::writer::Writer;

/// Deepest tree any traversal will follow before declaring a cycle.
pub(crate) const MAX_TREE_HEIGHT: usize = 64;

/// The current root and the generation its pointer was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Root {
    pub id: PageId,
    pub generation: Generation,
}

/// State owned by whoever holds the writer lease.
#[derive(Debug)]
pub(crate) struct WriterState {
    pub free_list: FreeList,
    /// One past the highest page id ever allocated.
    pub last_id: PageId,
    /// State slot holding the newest written state.
    pub selected: StateSlot,
}

/// Everything shared between a tree handle, its writer, its seekers, and
/// its cleanup job.
pub(crate) struct TreeInner<L: Layout> {
    pub layout: L,
    pub cache: PageCache,
    pub capacity: NodeCapacity,
    pub config: TreeConfig,
    pub generations: SharedGenerations,
    pub root: RwLock<Root>,
    pub height: AtomicUsize,
    pub writer: Mutex<WriterState>,
    pub monitor: Arc<dyn TreeMonitor>,
    pub phase: AtomicU8,
    pub poisoned: AtomicBool,
}

impl<L: Layout> TreeInner<L> {
    pub fn generations(&self) -> Generations {
        self.generations.load()
    }

    pub fn root(&self) -> Root {
        *self.root.read()
    }

    pub fn cleanup_phase(&self) -> CleanupPhase {
        CleanupPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_cleanup_phase(&self, phase: CleanupPhase) {
        tracing::debug!(?phase, "cleanup phase");
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Fails unless recovery has completed.
    pub fn ensure_recovered(&self) -> Result<(), TreeError> {
        if self.cleanup_phase() == CleanupPhase::Done {
            Ok(())
        } else {
            Err(TreeError::RecoveryPending)
        }
    }

    /// Fails unless the tree accepts writes.
    pub fn ensure_writable(&self) -> Result<(), TreeError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(TreeError::Poisoned);
        }
        self.ensure_recovered()
    }

    /// Take the writer lease, waiting at most the configured timeout.
    pub fn lock_writer(&self) -> Result<MutexGuard<'_, WriterState>, TreeError> {
        let timeout = self.config.writer_lock_timeout;
        self.writer
            .try_lock_for(timeout)
            .ok_or(TreeError::WriterLockTimeout(timeout))
    }

    /// Read and decode a node whose generations are known to be current.
    pub fn read_node(
        &self,
        page_id: PageId,
        generations: Generations,
    ) -> Result<Node<L::Key, L::Value>, TreeError> {
        let page = self.cache.read(page_id)?;
        node::decode(&page, &self.layout, generations).map_err(|e| TreeError::CorruptNode {
            page_id,
            reason: e.into_reason(node::peek_generation(&page)),
        })
    }

    /// Number of levels, measured along the leftmost path.
    pub fn measure_height(&self, generations: Generations) -> Result<usize, TreeError> {
        let mut page_id = self.root().id;
        for height in 1..=MAX_TREE_HEIGHT {
            match self.read_node(page_id, generations)? {
                Node::Leaf(_) => return Ok(height),
                Node::Internal(internal) => {
                    page_id = internal.children.first().map_or(NO_PAGE, |c| c.page_id);
                }
            }
        }
        Err(TreeError::TreeCorruption(format!(
            "tree deeper than {MAX_TREE_HEIGHT} levels"
        )))
    }

    /// Make everything written so far durable and advance the generations.
    ///
    /// With `clean`, the free list is persisted and the state marks an orderly
    /// shutdown. A failure poisons the tree.
    pub fn checkpoint(&self, state: &mut WriterState, clean: bool) -> Result<(), TreeError> {
        self.ensure_writable()?;
        let result = self.write_checkpoint(state, clean);
        if let Err(e) = &result {
            tracing::error!(error = %e, "checkpoint failed, tree poisoned");
            self.poisoned.store(true, Ordering::Release);
        }
        result
    }

    fn write_checkpoint(&self, state: &mut WriterState, clean: bool) -> Result<(), TreeError> {
        let generations = self.generations();
        let free_list_head = if clean {
            self.persist_free_list(state, generations)?
        } else {
            NO_PAGE
        };

        let pages_flushed = self.cache.flush()?;

        let root = self.root();
        let next = generations.after_checkpoint();
        let tree_state = TreeState {
            generations: next,
            root_id: root.id,
            root_generation: root.generation,
            last_id: state.last_id,
            free_list_head,
            clean,
        };
        let slot = state.selected.other();
        {
            let mut page = self.cache.write_new(slot.page_id())?;
            tree_state.write_to(&mut page);
        }
        self.cache.flush()?;

        state.selected = slot;
        self.generations.store(next);
        self.monitor.checkpoint_completed(next, pages_flushed);
        Ok(())
    }

    /// Write the free list to chain pages and return the chain head.
    ///
    /// Chain pages are taken from reusable pages first, then from fresh ones.
    fn persist_free_list(
        &self,
        state: &mut WriterState,
        generations: Generations,
    ) -> Result<PageId, TreeError> {
        let mut chain = Vec::new();
        while chain.len() < FreeList::chain_pages_needed(state.free_list.len()) {
            let page_id = state
                .free_list
                .take_reusable(generations.stable)
                .unwrap_or_else(|| {
                    let id = state.last_id;
                    state.last_id += 1;
                    id
                });
            chain.push(page_id);
        }
        tracing::debug!(
            entries = state.free_list.len(),
            chain_pages = chain.len(),
            "persisting free list"
        );
        Ok(state.free_list.write_chain(&self.cache, &chain)?)
    }
}

/// A crash-safe B-tree over a page store.
///
/// # Example
///
/// ```ignore
/// use gbtree::{GBTree, TreeConfig, U64Layout, ImmediateCollector};
///
/// let tree = GBTree::create(store.clone(), U64Layout, TreeConfig::default())?;
/// {
///     let mut writer = tree.writer()?;
///     writer.put(1, 10)?;
/// }
/// tree.checkpoint()?;
/// let entries: Vec<_> = tree.seek(&0, &10)?.collect::<Result<_, _>>()?;
/// tree.close()?;
///
/// let tree = GBTree::open(store, U64Layout, TreeConfig::default(), &ImmediateCollector)?;
/// ```
///
/// Dropping a tree without `close` leaves the file marked unclean, exactly as
/// if the process had crashed.
pub struct GBTree<L: Layout> {
    inner: Arc<TreeInner<L>>,
}

impl<L: Layout> GBTree<L> {
    /// Create an empty tree in `store`.
    pub fn create(
        store: Arc<dyn PageStore>,
        layout: L,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        Self::create_with_monitor(store, layout, config, Arc::new(LoggingMonitor))
    }

    /// Create an empty tree reporting to `monitor`.
    pub fn create_with_monitor(
        store: Arc<dyn PageStore>,
        layout: L,
        config: TreeConfig,
        monitor: Arc<dyn TreeMonitor>,
    ) -> Result<Self, TreeError> {
        let cache = PageCache::new(store, config.page_cache_pages);
        let generations = Generations::initial();
        let root_id = FIRST_DATA_PAGE;

        {
            let mut page = cache.write_new(META_PAGE_ID)?;
            Meta::new(layout.identifier(), layout.version()).write_to(&mut page);
        }
        {
            let mut page = cache.write_new(root_id)?;
            node::encode_leaf(&mut page, &layout, &[], generations.stable, NO_PAGE);
        }
        let state = TreeState {
            generations,
            root_id,
            root_generation: generations.stable,
            last_id: root_id + 1,
            free_list_head: NO_PAGE,
            clean: false,
        };
        {
            let mut page = cache.write_new(StateSlot::A.page_id())?;
            state.write_to(&mut page);
        }
        cache.flush()?;

        tracing::info!(layout = layout.identifier(), "tree created");
        let writer = WriterState {
            free_list: FreeList::new(),
            last_id: state.last_id,
            selected: StateSlot::A,
        };
        Ok(Self::assemble(
            layout,
            cache,
            config,
            monitor,
            generations,
            &state,
            writer,
            1,
            CleanupPhase::Done,
        ))
    }

    /// Open an existing tree.
    ///
    /// After an unclean shutdown the recovery cleanup is handed to
    /// `collector`; until it has run, writers and seekers fail with
    /// `RecoveryPending`.
    pub fn open(
        store: Arc<dyn PageStore>,
        layout: L,
        config: TreeConfig,
        collector: &dyn RecoveryCleanupWorkCollector,
    ) -> Result<Self, TreeError> {
        Self::open_with_monitor(store, layout, config, collector, Arc::new(LoggingMonitor))
    }

    /// Open an existing tree reporting to `monitor`.
    pub fn open_with_monitor(
        store: Arc<dyn PageStore>,
        layout: L,
        config: TreeConfig,
        collector: &dyn RecoveryCleanupWorkCollector,
        monitor: Arc<dyn TreeMonitor>,
    ) -> Result<Self, TreeError> {
        let cache = PageCache::new(store, config.page_cache_pages);

        let meta_page = cache.read(META_PAGE_ID)?;
        let meta = Meta::from_page(&meta_page)?;
        drop(meta_page);
        if meta.layout_identifier != layout.identifier() || meta.layout_version != layout.version()
        {
            return Err(TreeError::LayoutMismatch {
                expected: layout.identifier(),
                found: meta.layout_identifier,
            });
        }

        let page_a = cache.read(STATE_PAGE_A)?.clone();
        let page_b = cache.read(STATE_PAGE_B)?.clone();
        let selected = select_newest_valid_state(&page_a, &page_b)?;
        let stored = selected.state;

        let mut clean = stored.clean;
        let mut free_list = FreeList::new();
        if clean {
            match FreeList::read_chain(&cache, stored.free_list_head, stored.last_id) {
                Ok((list, chain)) => {
                    free_list = list;
                    for page_id in chain {
                        free_list.release(page_id, stored.generations.stable);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "free list unreadable, recovering instead");
                    clean = false;
                }
            }
        }

        let generations = if clean {
            stored.generations
        } else {
            stored.generations.after_crash()
        };
        let session_state = TreeState {
            generations,
            free_list_head: NO_PAGE,
            clean: false,
            ..stored
        };
        let slot = selected.slot.other();
        {
            let mut page = cache.write_new(slot.page_id())?;
            session_state.write_to(&mut page);
        }
        cache.flush()?;

        monitor.startup_state(clean);
        let writer = WriterState {
            free_list,
            last_id: stored.last_id,
            selected: slot,
        };
        let phase = if clean {
            CleanupPhase::Done
        } else {
            CleanupPhase::NotStarted
        };
        let tree = Self::assemble(
            layout,
            cache,
            config,
            monitor,
            generations,
            &stored,
            writer,
            0,
            phase,
        );
        let height = tree.inner.measure_height(generations)?;
        tree.inner.height.store(height, Ordering::Relaxed);

        if !clean {
            let inner = Arc::clone(&tree.inner);
            collector.add(CleanupJob::new(move || cleanup::run(&inner)))?;
        }
        Ok(tree)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        layout: L,
        cache: PageCache,
        config: TreeConfig,
        monitor: Arc<dyn TreeMonitor>,
        generations: Generations,
        state: &TreeState,
        writer: WriterState,
        height: usize,
        phase: CleanupPhase,
    ) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                layout,
                cache,
                capacity: NodeCapacity::from_max_keys(config.max_node_keys),
                config,
                generations: SharedGenerations::new(generations),
                root: RwLock::new(Root {
                    id: state.root_id,
                    generation: state.root_generation,
                }),
                height: AtomicUsize::new(height),
                writer: Mutex::new(writer),
                monitor,
                phase: AtomicU8::new(phase as u8),
                poisoned: AtomicBool::new(false),
            }),
        }
    }

    /// Take the writer lease.
    ///
    /// Fails with `WriterLockTimeout` if another writer holds it for longer
    /// than the configured timeout.
    pub fn writer(&self) -> Result<Writer<'_, L>, TreeError> {
        Writer::new(&self.inner)
    }

    /// Entries with `from <= key < to`, ascending.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<Seeker<'_, L>, TreeError> {
        Seeker::new(&self.inner, Some(from.clone()), Some(to.clone()))
    }

    /// Entries with `from <= key`, ascending.
    pub fn seek_from(&self, from: &L::Key) -> Result<Seeker<'_, L>, TreeError> {
        Seeker::new(&self.inner, Some(from.clone()), None)
    }

    /// Every entry, ascending.
    pub fn seek_all(&self) -> Result<Seeker<'_, L>, TreeError> {
        Seeker::new(&self.inner, None, None)
    }

    /// Look up a single key.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>, TreeError> {
        match self.seek_from(key)?.next() {
            Some(Ok((found, value)))
                if self.inner.layout.compare(&found, key) == std::cmp::Ordering::Equal =>
            {
                Ok(Some(value))
            }
            Some(Err(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Make all changes so far durable.
    pub fn checkpoint(&self) -> Result<(), TreeError> {
        let mut state = self.inner.lock_writer()?;
        self.inner.checkpoint(&mut state, false)
    }

    /// Final checkpoint: persist the free list and mark the tree clean.
    pub fn close(self) -> Result<(), TreeError> {
        let mut state = self.inner.lock_writer()?;
        self.inner.checkpoint(&mut state, true)?;
        let stats = self.cache_stats();
        tracing::info!(
            generation = self.inner.generations().stable,
            cache_hits = stats.hits,
            cache_misses = stats.misses,
            cache_evictions = stats.evictions,
            "tree closed"
        );
        Ok(())
    }

    /// True once the tree is usable: it was shut down cleanly or recovery has
    /// completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.inner.cleanup_phase() == CleanupPhase::Done
    }

    /// Current phase of the recovery cleanup.
    #[must_use]
    pub fn cleanup_phase(&self) -> CleanupPhase {
        self.inner.cleanup_phase()
    }

    /// Run the recovery cleanup now if it is still pending.
    ///
    /// Returns `None` if there was nothing to recover.
    pub fn run_recovery(&self) -> Result<Option<CleanupStats>, TreeError> {
        if self.is_clean() {
            return Ok(None);
        }
        cleanup::run(&self.inner).map(Some)
    }

    /// Walk the whole tree and verify its structure.
    pub fn consistency_check(&self) -> Result<ConsistencyReport, TreeError> {
        consistency::check(&self.inner)
    }

    /// Current generations.
    #[must_use]
    pub fn generations(&self) -> Generations {
        self.inner.generations()
    }

    /// Number of levels, 1 for a tree that is a single leaf.
    #[must_use]
    pub fn height(&self) -> usize {
        self.inner.height.load(Ordering::Relaxed)
    }

    /// The layout the tree was opened with.
    #[must_use]
    pub fn layout(&self) -> &L {
        &self.inner.layout
    }

    /// Page cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> PageCacheStats {
        self.inner.cache.stats()
    }
}

#[cfg(test)]
impl<L: Layout> GBTree<L> {
    pub(crate) fn inner(&self) -> &TreeInner<L> {
        &self.inner
    }
}

impl<L: Layout> std::fmt::Debug for GBTree<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GBTree")
            .field("generations", &self.inner.generations())
            .field("root", &self.inner.root())
            .field("height", &self.height())
            .field("phase", &self.inner.cleanup_phase())
            .finish_non_exhaustive()
    }
}
