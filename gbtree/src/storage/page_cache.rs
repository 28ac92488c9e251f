//! Page cache with page-level latches and RAII page leases.
//!
//! Every page handed out by the cache is wrapped in a lease that owns the
//! page latch for exactly as long as the lease is alive:
//!
//! - `PageRead`: shared latch, many at once per page
//! - `PageWrite`: exclusive latch, marks the page dirty
//!
//! A page can therefore never be touched after its latch is released; the
//! borrow checker enforces what callers would otherwise do by discipline.
//!
//! # Design
//!
//! - Frames are `Arc<RwLock<Page>>`, indexed by page id
//! - Dirty pages are written back on `flush` (then fsynced) or when an
//!   unpinned frame is evicted to stay within capacity (no fsync)
//! - Frames pinned by a live lease are never evicted
//!
//! # Invariants
//!
//! - A frame is in the dirty set only while its content differs from what the
//!   store returns for that page
//! - While the frame map lock is held exclusively, no new lease can be taken,
//!   so `Arc::strong_count == 1` proves a frame is unpinned

use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::{Page, PageId};

/// Default cache capacity in pages (8MB of 8KB pages).
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

type Frame = Arc<RwLock<Page>>;

/// Shared lease on a cached page.
pub struct PageRead {
    page_id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
}

impl PageRead {
    /// The id of the leased page.
    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageRead {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

/// Exclusive lease on a cached page.
///
/// The page is marked dirty when the lease is taken.
pub struct PageWrite {
    page_id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
}

impl PageWrite {
    /// The id of the leased page.
    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageWrite {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWrite {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

/// Counters describing cache behaviour.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageCacheStats {
    /// Leases served from a cached frame.
    pub hits: u64,
    /// Leases that had to load or create a frame.
    pub misses: u64,
    /// Frames dropped to stay within capacity.
    pub evictions: u64,
    /// Dirty pages written to the store.
    pub write_backs: u64,
}

/// A page cache over a `PageStore`.
///
/// # Pre-conditions
/// - `capacity` > 0 (a zero capacity is raised to 1)
///
/// # Post-conditions
/// - Every lease observes the latest content written through the cache
pub struct PageCache {
    store: Arc<dyn PageStore>,
    frames: RwLock<HashMap<PageId, Frame>>,
    dirty: Mutex<BTreeSet<PageId>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

impl PageCache {
    /// Create a cache over `store` holding at most `capacity` unpinned frames.
    #[must_use]
    pub fn new(store: Arc<dyn PageStore>, capacity: usize) -> Self {
        Self {
            store,
            frames: RwLock::new(HashMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
        }
    }

    /// The store backing this cache.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Take a shared lease on a page, loading it from the store if needed.
    pub fn read(&self, page_id: PageId) -> Result<PageRead, StorageError> {
        let frame = self.frame(page_id)?;
        Ok(PageRead {
            page_id,
            guard: frame.read_arc(),
        })
    }

    /// Take an exclusive lease on a page, loading it from the store if needed.
    pub fn write(&self, page_id: PageId) -> Result<PageWrite, StorageError> {
        let frame = self.frame(page_id)?;
        let guard = frame.write_arc();
        self.dirty.lock().insert(page_id);
        Ok(PageWrite { page_id, guard })
    }

    /// Take an exclusive lease on a page whose previous content is irrelevant.
    ///
    /// The page is zeroed instead of being read from the store.
    pub fn write_new(&self, page_id: PageId) -> Result<PageWrite, StorageError> {
        let frame = self.frame_with(page_id, |_| Ok(Page::new()))?;
        let mut guard = frame.write_arc();
        guard.clear();
        self.dirty.lock().insert(page_id);
        Ok(PageWrite { page_id, guard })
    }

    /// Write every dirty page back to the store and fsync it.
    ///
    /// Returns the number of pages written.
    pub fn flush(&self) -> Result<usize, StorageError> {
        let written = self.write_back()?;
        self.store.sync()?;
        Ok(written)
    }

    /// Write every dirty page back to the store without syncing.
    ///
    /// Returns the number of pages written.
    pub fn write_back(&self) -> Result<usize, StorageError> {
        let dirty: Vec<PageId> = self.dirty.lock().iter().copied().collect();
        let mut written = 0;

        for page_id in dirty {
            let Some(frame) = self.frames.read().get(&page_id).cloned() else {
                // Evicted after the snapshot, which already wrote it back.
                continue;
            };
            let page = frame.read();
            self.dirty.lock().remove(&page_id);
            if let Err(e) = self.store.write_page(page_id, &page) {
                self.dirty.lock().insert(page_id);
                return Err(e);
            }
            written += 1;
        }

        self.write_backs.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    /// Number of pages currently marked dirty.
    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Number of frames currently cached.
    #[must_use]
    pub fn cached_pages(&self) -> usize {
        self.frames.read().len()
    }

    /// Get a snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> PageCacheStats {
        PageCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
        }
    }

    fn frame(&self, page_id: PageId) -> Result<Frame, StorageError> {
        self.frame_with(page_id, |store| {
            let mut page = Page::new();
            store.read_page(page_id, &mut page)?;
            Ok(page)
        })
    }

    fn frame_with(
        &self,
        page_id: PageId,
        load: impl FnOnce(&dyn PageStore) -> Result<Page, StorageError>,
    ) -> Result<Frame, StorageError> {
        if let Some(frame) = self.frames.read().get(&page_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(frame));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let page = load(self.store.as_ref())?;

        let mut frames = self.frames.write();
        // Another thread may have loaded the page while the store was read.
        let frame = Arc::clone(
            frames
                .entry(page_id)
                .or_insert_with(|| Arc::new(RwLock::new(page))),
        );
        if frames.len() > self.capacity {
            self.evict(&mut frames, page_id);
        }
        Ok(frame)
    }

    /// Drop unpinned frames until the cache is back within capacity.
    ///
    /// Dirty victims are written back first; a victim whose write-back fails
    /// stays cached and dirty.
    fn evict(&self, frames: &mut HashMap<PageId, Frame>, keep: PageId) {
        let excess = frames.len().saturating_sub(self.capacity);
        let victims: Vec<PageId> = frames
            .iter()
            .filter(|(id, frame)| **id != keep && Arc::strong_count(frame) == 1)
            .map(|(id, _)| *id)
            .take(excess)
            .collect();

        for page_id in victims {
            if self.dirty.lock().contains(&page_id) {
                let Some(frame) = frames.get(&page_id) else {
                    continue;
                };
                let page = frame.read();
                if let Err(e) = self.store.write_page(page_id, &page) {
                    tracing::warn!(page_id, error = %e, "write-back during eviction failed");
                    continue;
                }
                drop(page);
                self.dirty.lock().remove(&page_id);
                self.write_backs.fetch_add(1, Ordering::Relaxed);
            }
            frames.remove(&page_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("capacity", &self.capacity)
            .field("cached_pages", &self.cached_pages())
            .field("dirty_pages", &self.dirty_pages())
            .finish_non_exhaustive()
    }
}
