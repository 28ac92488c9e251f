//! In-memory page store for deterministic crash testing.
//!
//! Writes land in a volatile "written but not synced" layer and only move to
//! the durable layer on `sync`. A simulated crash keeps a random subset of the
//! volatile writes (as an OS writing back dirty pages would) and can tear one
//! of them at a sector boundary. Fault injection:
//! - Page-level read/write errors
//! - Sync failures
//! - Byte-level corruption of durable pages (bit flips)

// Simulation code legitimately needs cloning for page images
#![allow(clippy::disallowed_methods)]

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::{PAGE_SIZE, Page, PageId};

/// Granularity at which a torn write mixes old and new bytes.
pub const SECTOR_SIZE: usize = 512;

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config where every write fails.
    #[must_use]
    pub const fn failing_writes() -> Self {
        Self {
            read_error_rate: 0.0,
            write_error_rate: 1.0,
            sync_error_rate: 0.0,
        }
    }

    /// Create a fault config where every sync fails.
    #[must_use]
    pub const fn failing_syncs() -> Self {
        Self {
            read_error_rate: 0.0,
            write_error_rate: 0.0,
            sync_error_rate: 1.0,
        }
    }
}

/// How a simulated crash treats writes that were never synced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CrashMode {
    /// Every unsynced write is lost.
    DropUnsynced,
    /// Each unsynced write survives with the given probability, and one
    /// surviving write is torn.
    Partial { survival_rate: f64 },
}

/// Summary of what a simulated crash did to unsynced writes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// Unsynced writes that reached durable storage intact.
    pub persisted: Vec<PageId>,
    /// Unsynced writes that were lost.
    pub dropped: Vec<PageId>,
    /// The write that was torn, if any.
    pub torn: Option<PageId>,
}

/// Statistics about memory store operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of simulated crashes.
    pub crashes: u64,
    /// Number of injected faults of any kind.
    pub injected_faults: u64,
}

struct Inner {
    durable: HashMap<PageId, Page>,
    /// Latest unsynced image of each page, in page order so crashes replay
    /// deterministically for a given seed.
    volatile: BTreeMap<PageId, Page>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl Inner {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let hit = self.rng.random::<f64>() < rate;
        if hit {
            self.stats.injected_faults += 1;
        }
        hit
    }
}

/// In-memory page store with crash simulation.
///
/// # Thread Safety
///
/// All state sits behind one mutex; the store is shared between the page
/// cache of a tree and the test driving it.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create a new empty store with the given seed.
    ///
    /// The seed makes crash outcomes and injected faults reproducible.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                durable: HashMap::new(),
                volatile: BTreeMap::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            }),
        }
    }

    /// Get a snapshot of the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        self.inner.lock().stats.clone()
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.inner.lock().fault_config = config;
    }

    /// Number of pages written since the last sync.
    #[must_use]
    pub fn unsynced_pages(&self) -> usize {
        self.inner.lock().volatile.len()
    }

    /// Simulate a power loss.
    ///
    /// Unsynced writes are dropped or persisted according to `mode`; afterwards
    /// the store only holds durable content, as a freshly restarted process
    /// would see it.
    pub fn crash(&self, mode: CrashMode) -> CrashReport {
        let mut inner = self.inner.lock();
        inner.stats.crashes += 1;
        let volatile = std::mem::take(&mut inner.volatile);
        let mut report = CrashReport::default();

        let survival_rate = match mode {
            CrashMode::DropUnsynced => 0.0,
            CrashMode::Partial { survival_rate } => survival_rate,
        };

        let mut survivors = Vec::new();
        for (page_id, page) in volatile {
            if survival_rate > 0.0 && inner.rng.random::<f64>() < survival_rate {
                survivors.push((page_id, page));
            } else {
                report.dropped.push(page_id);
            }
        }

        if matches!(mode, CrashMode::Partial { .. }) && !survivors.is_empty() {
            let victim = inner.rng.random_range(0..survivors.len());
            let cut = inner.rng.random_range(1..PAGE_SIZE / SECTOR_SIZE) * SECTOR_SIZE;
            let page_id = survivors[victim].0;
            let old = inner.durable.get(&page_id).cloned().unwrap_or_default();
            // New sectors up to the cut, old sectors after it.
            survivors[victim].1.as_bytes_mut()[cut..].copy_from_slice(&old.as_bytes()[cut..]);
            report.torn = Some(page_id);
        }

        for (page_id, page) in survivors {
            if report.torn != Some(page_id) {
                report.persisted.push(page_id);
            }
            inner.durable.insert(page_id, page);
        }

        report
    }

    /// Flip random bits in the durable image of a page.
    pub fn corrupt_page(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        let flips = inner.rng.random_range(1..=8);
        let offsets: Vec<(usize, u8)> = (0..flips)
            .map(|_| {
                (
                    inner.rng.random_range(0..PAGE_SIZE),
                    inner.rng.random_range(0..8u8),
                )
            })
            .collect();
        let page = inner.durable.entry(page_id).or_default();
        for (offset, bit) in offsets {
            page.as_bytes_mut()[offset] ^= 1 << bit;
        }
    }

    /// Overwrite the durable image of a page directly.
    pub fn write_durable(&self, page_id: PageId, page: &Page) {
        self.inner.lock().durable.insert(page_id, page.clone());
    }

    /// Read the durable image of a page, ignoring unsynced writes.
    #[must_use]
    pub fn read_durable(&self, page_id: PageId) -> Page {
        self.inner
            .lock()
            .durable
            .get(&page_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl PageStore for MemoryStore {
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.stats.reads += 1;

        let rate = inner.fault_config.read_error_rate;
        if inner.should_inject_fault(rate) {
            return Err(StorageError::InjectedFault(format!(
                "simulated read error on page {page_id}"
            )));
        }

        match inner
            .volatile
            .get(&page_id)
            .or_else(|| inner.durable.get(&page_id))
        {
            Some(stored) => page.as_bytes_mut().copy_from_slice(stored.as_bytes()),
            None => page.clear(),
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.stats.writes += 1;

        let rate = inner.fault_config.write_error_rate;
        if inner.should_inject_fault(rate) {
            return Err(StorageError::InjectedFault(format!(
                "simulated write error on page {page_id}"
            )));
        }

        inner.volatile.insert(page_id, page.clone());
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.stats.syncs += 1;

        let rate = inner.fault_config.sync_error_rate;
        if inner.should_inject_fault(rate) {
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        let volatile = std::mem::take(&mut inner.volatile);
        inner.durable.extend(volatile);
        Ok(())
    }

    fn page_count(&self) -> Result<u64, StorageError> {
        let inner = self.inner.lock();
        let highest = inner
            .durable
            .keys()
            .chain(inner.volatile.keys())
            .max()
            .copied();
        Ok(highest.map_or(0, |id| id + 1))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("durable_pages", &inner.durable.len())
            .field("unsynced_pages", &inner.volatile.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(byte: u8) -> Page {
        let mut page = Page::new();
        page.as_bytes_mut().fill(byte);
        page
    }

    #[test]
    fn test_unsynced_writes_visible_before_crash() {
        let store = MemoryStore::new(1);
        store.write_page(4, &page_with(7)).expect("write");

        let mut page = Page::new();
        store.read_page(4, &mut page).expect("read");
        assert_eq!(page.read_u8(0), 7);
        assert_eq!(store.unsynced_pages(), 1);
    }

    #[test]
    fn test_crash_drops_unsynced_writes() {
        let store = MemoryStore::new(1);
        store.write_page(1, &page_with(1)).expect("write");
        store.sync().expect("sync");
        store.write_page(1, &page_with(2)).expect("write");
        store.write_page(2, &page_with(3)).expect("write");

        let report = store.crash(CrashMode::DropUnsynced);
        assert_eq!(report.dropped, vec![1, 2]);
        assert!(report.torn.is_none());

        let mut page = Page::new();
        store.read_page(1, &mut page).expect("read");
        assert_eq!(page.read_u8(0), 1);
        store.read_page(2, &mut page).expect("read");
        assert!(page.is_zeroed());
    }

    #[test]
    fn test_partial_crash_tears_one_page() {
        let store = MemoryStore::new(42);
        for id in 0..16 {
            store.write_page(id, &page_with(0xAB)).expect("write");
        }

        let report = store.crash(CrashMode::Partial { survival_rate: 1.0 });
        let torn = report.torn.expect("one write is torn");
        assert_eq!(report.persisted.len(), 15);

        let page = store.read_durable(torn);
        assert_eq!(page.read_u8(0), 0xAB);
        assert_eq!(page.read_u8(PAGE_SIZE - 1), 0);
    }

    #[test]
    fn test_crash_is_deterministic_for_seed() {
        let run = |seed| {
            let store = MemoryStore::new(seed);
            for id in 0..32 {
                store.write_page(id, &page_with(1)).expect("write");
            }
            store.crash(CrashMode::Partial { survival_rate: 0.5 })
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn test_injected_write_fault() {
        let store = MemoryStore::with_config(3, FaultConfig::failing_writes());
        assert!(matches!(
            store.write_page(0, &Page::new()),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(store.stats().injected_faults, 1);
    }

    #[test]
    fn test_page_count_covers_both_layers() {
        let store = MemoryStore::new(0);
        assert_eq!(store.page_count().expect("count"), 0);
        store.write_page(2, &Page::new()).expect("write");
        store.sync().expect("sync");
        store.write_page(6, &Page::new()).expect("write");
        assert_eq!(store.page_count().expect("count"), 7);
    }
}
