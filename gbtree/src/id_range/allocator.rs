//! Page range leases over a shared id space.
//!
//! Ids are grouped into pages of `ids_per_page`. A caller leases one page
//! worth of ids at a time; while a page is leased no other lease is handed
//! out for it. Freed ids are preferred over new ones, and new ids are carved
//! from a high-id watermark up to the end of the current page.

use std::collections::{BTreeSet, HashSet};

use parking_lot::Mutex;

use crate::id_range::range::{ArrayRange, ContinuousRange, IdRange, RangeExhaustedError};

/// An id that is never handed out.
pub const RESERVED_ID: u64 = 0xFFFF_FFFF;

/// A leased page of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageIdRange {
    Continuous(ContinuousRange),
    Array(ArrayRange),
}

impl IdRange for PageIdRange {
    fn next_id(&mut self) -> Result<u64, RangeExhaustedError> {
        match self {
            Self::Continuous(range) => range.next_id(),
            Self::Array(range) => range.next_id(),
        }
    }

    fn mark(&mut self) {
        match self {
            Self::Continuous(range) => range.mark(),
            Self::Array(range) => range.mark(),
        }
    }

    fn reset_to_mark(&mut self) {
        match self {
            Self::Continuous(range) => range.reset_to_mark(),
            Self::Array(range) => range.reset_to_mark(),
        }
    }

    fn remaining(&self) -> usize {
        match self {
            Self::Continuous(range) => range.remaining(),
            Self::Array(range) => range.remaining(),
        }
    }

    fn page_id(&self) -> u64 {
        match self {
            Self::Continuous(range) => range.page_id(),
            Self::Array(range) => range.page_id(),
        }
    }

    fn unallocate(&mut self) -> Vec<u64> {
        match self {
            Self::Continuous(range) => range.unallocate(),
            Self::Array(range) => range.unallocate(),
        }
    }
}

#[derive(Debug)]
struct AllocatorState {
    high_id: u64,
    free: BTreeSet<u64>,
    leased_pages: HashSet<u64>,
}

impl AllocatorState {
    /// Take every free id on the page of the lowest free id.
    fn drain_page(&mut self, stride: u64) -> Option<ArrayRange> {
        let first = *self.free.first()?;
        let page_end = (first / stride).saturating_add(1).saturating_mul(stride);
        let ids: Vec<u64> = self.free.range(first..page_end).copied().collect();
        for id in &ids {
            self.free.remove(id);
        }
        Some(ArrayRange::new(ids, stride))
    }
}

/// Thread-safe lease manager for page id ranges.
#[derive(Debug)]
pub struct IdRangeAllocator {
    max_id: u64,
    state: Mutex<AllocatorState>,
}

impl IdRangeAllocator {
    /// Allocator whose next new id is `high_id`.
    #[must_use]
    pub fn new(high_id: u64) -> Self {
        Self::with_max_id(high_id, u64::MAX)
    }

    /// Allocator that never hands out ids at or above `max_id`.
    #[must_use]
    pub fn with_max_id(high_id: u64, max_id: u64) -> Self {
        Self {
            max_id,
            state: Mutex::new(AllocatorState {
                high_id,
                free: BTreeSet::new(),
                leased_pages: HashSet::new(),
            }),
        }
    }

    /// The next id that has never been handed out.
    #[must_use]
    pub fn high_id(&self) -> u64 {
        self.state.lock().high_id
    }

    /// Number of freed ids waiting for reuse.
    #[must_use]
    pub fn free_ids(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Return `id` for reuse.
    pub fn free(&self, id: u64) {
        if id == RESERVED_ID {
            return;
        }
        self.state.lock().free.insert(id);
    }

    /// Lease the ids of one page.
    ///
    /// Freed ids are preferred, provided their page is not already leased;
    /// otherwise the rest of the page at the high-id watermark is leased.
    /// Fails once the watermark reaches the maximum id.
    pub fn next_page_range(&self, ids_per_page: u64) -> Result<PageIdRange, RangeExhaustedError> {
        let stride = ids_per_page.max(1);
        let mut state = self.state.lock();

        if let Some(mut reused) = state.drain_page(stride) {
            if state.leased_pages.insert(reused.page_id()) {
                tracing::trace!(
                    page_id = reused.page_id(),
                    ids = reused.remaining(),
                    "leased reused ids"
                );
                return Ok(PageIdRange::Array(reused));
            }
            let ids = reused.unallocate();
            state.free.extend(ids);
        }

        loop {
            let start = state.high_id;
            let end = start.saturating_add(stride - start % stride).min(self.max_id);
            if start >= end {
                return Err(RangeExhaustedError {
                    page_id: start / stride,
                });
            }
            state.high_id = end;

            let range = if (start..end).contains(&RESERVED_ID) {
                let ids: Vec<u64> = (start..end).filter(|&id| id != RESERVED_ID).collect();
                if ids.is_empty() {
                    continue;
                }
                PageIdRange::Array(ArrayRange::new(ids, stride))
            } else {
                PageIdRange::Continuous(ContinuousRange::new(start, end, stride))
            };
            state.leased_pages.insert(range.page_id());
            tracing::trace!(page_id = range.page_id(), start, end, "leased ids from high id");
            return Ok(range);
        }
    }

    /// End a lease, returning the ids it did not hand out.
    pub fn release_page_range(&self, mut range: PageIdRange) {
        let leftover = range.unallocate();
        let mut state = self.state.lock();
        state.free.extend(leftover.into_iter().filter(|&id| id != RESERVED_ID));
        state.leased_pages.remove(&range.page_id());
    }
}
