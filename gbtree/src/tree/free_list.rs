//! Released pages awaiting reuse.
//!
//! A page released in generation `g` may still be referenced by the durable
//! tree until a checkpoint makes `g` stable, so it is only handed out again
//! once `g <= stable`. Release generations never decrease, so the list is a
//! FIFO queue and only its front needs to be checked.
//!
//! The list lives in memory. An orderly close persists it as a chain of
//! free-list pages:
//!
//! ```text
//! 0..8     page header (type = FreeList, checksum)
//! 8..16    next chain page, 0 if last
//! 16..20   entry count
//! 24..     entries: [page id u64][release generation u64]
//! ```

// Entry counts per page are bounded by ENTRIES_PER_PAGE.
#![allow(clippy::cast_possible_truncation)]

use std::collections::{HashSet, VecDeque};

use crate::storage::{
    PAGE_SIZE, Page, PageCache, PageError, PageHeader, PageId, PageType, StorageError,
};
use crate::tree::generation::Generation;

const NEXT_OFFSET: usize = PageHeader::SIZE;
const COUNT_OFFSET: usize = NEXT_OFFSET + 8;
const ENTRIES_OFFSET: usize = COUNT_OFFSET + 8;
const ENTRY_SIZE: usize = 16;

/// Entries stored per free-list page.
pub const ENTRIES_PER_PAGE: usize = (PAGE_SIZE - ENTRIES_OFFSET) / ENTRY_SIZE;

/// A released page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    pub page_id: PageId,
    pub released_in: Generation,
}

/// Pages released by the writer, oldest first.
#[derive(Debug, Default, Clone)]
pub struct FreeList {
    entries: VecDeque<FreeEntry>,
}

impl FreeList {
    /// Create an empty free list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of released pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no page is waiting for reuse.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that `page_id` stopped being referenced in `generation`.
    pub fn release(&mut self, page_id: PageId, generation: Generation) {
        debug_assert!(
            self.entries
                .back()
                .is_none_or(|last| last.released_in <= generation)
        );
        self.entries.push_back(FreeEntry {
            page_id,
            released_in: generation,
        });
    }

    /// Take the oldest page that the durable tree no longer references.
    pub fn take_reusable(&mut self, stable: Generation) -> Option<PageId> {
        if self.entries.front()?.released_in > stable {
            return None;
        }
        self.entries.pop_front().map(|entry| entry.page_id)
    }

    /// Number of pages that can be reused right now.
    #[must_use]
    pub fn reusable(&self, stable: Generation) -> usize {
        self.entries
            .iter()
            .take_while(|entry| entry.released_in <= stable)
            .count()
    }

    /// True if `page_id` is waiting for reuse.
    #[must_use]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.entries.iter().any(|entry| entry.page_id == page_id)
    }

    /// Released pages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &FreeEntry> {
        self.entries.iter()
    }

    /// Chain pages needed to persist `entries` entries.
    #[must_use]
    pub const fn chain_pages_needed(entries: usize) -> usize {
        entries.div_ceil(ENTRIES_PER_PAGE)
    }

    /// Write the list to the chain pages `page_ids`, returning the head.
    ///
    /// `page_ids` must hold exactly `chain_pages_needed(self.len())` pages.
    pub fn write_chain(
        &self,
        cache: &PageCache,
        page_ids: &[PageId],
    ) -> Result<PageId, StorageError> {
        debug_assert_eq!(page_ids.len(), Self::chain_pages_needed(self.len()));
        let entries: Vec<FreeEntry> = self.entries.iter().copied().collect();

        for (index, chunk) in entries.chunks(ENTRIES_PER_PAGE).enumerate() {
            let next = page_ids.get(index + 1).copied().unwrap_or(0);
            let mut page = cache.write_new(page_ids[index])?;
            encode_chain_page(&mut page, chunk, next);
        }
        Ok(page_ids.first().copied().unwrap_or(0))
    }

    /// Load a persisted list starting at `head`.
    ///
    /// Returns the list and the ids of the chain pages it was read from.
    pub fn read_chain(
        cache: &PageCache,
        head: PageId,
        last_id: PageId,
    ) -> Result<(Self, Vec<PageId>), FreeListError> {
        let mut list = Self::new();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = head;

        while next != 0 {
            if next >= last_id || !seen.insert(next) {
                return Err(FreeListError::BrokenChain(next));
            }
            let page = cache.read(next)?;
            let (entries, following) = decode_chain_page(&page)?;
            for entry in entries {
                list.release(entry.page_id, entry.released_in);
            }
            chain.push(next);
            next = following;
        }
        Ok((list, chain))
    }
}

fn encode_chain_page(page: &mut Page, entries: &[FreeEntry], next: PageId) {
    page.clear();
    let header = PageHeader {
        page_type: PageType::FreeList,
        flags: 0,
        checksum: 0,
    };
    page.write_bytes(0, &header.to_bytes());
    page.write_u64(NEXT_OFFSET, next);
    page.write_u32(COUNT_OFFSET, entries.len() as u32);
    for (i, entry) in entries.iter().enumerate() {
        let offset = ENTRIES_OFFSET + i * ENTRY_SIZE;
        page.write_u64(offset, entry.page_id);
        page.write_u64(offset + 8, entry.released_in);
    }
    page.update_checksum();
}

fn decode_chain_page(page: &Page) -> Result<(Vec<FreeEntry>, PageId), FreeListError> {
    page.verify_checksum()?;
    let header = PageHeader::read(page)?;
    if header.page_type != PageType::FreeList {
        return Err(FreeListError::Page(PageError::InvalidPageType(
            header.page_type as u8,
        )));
    }
    let count = page.read_u32(COUNT_OFFSET) as usize;
    if count > ENTRIES_PER_PAGE {
        return Err(FreeListError::InvalidCount(count));
    }
    let entries = (0..count)
        .map(|i| {
            let offset = ENTRIES_OFFSET + i * ENTRY_SIZE;
            FreeEntry {
                page_id: page.read_u64(offset),
                released_in: page.read_u64(offset + 8),
            }
        })
        .collect();
    Ok((entries, page.read_u64(NEXT_OFFSET)))
}

/// Errors from loading a persisted free list.
#[derive(Debug)]
pub enum FreeListError {
    Storage(StorageError),
    Page(PageError),
    /// Entry count exceeds what a page can hold.
    InvalidCount(usize),
    /// The chain loops or leaves the allocated pages.
    BrokenChain(PageId),
}

impl std::fmt::Display for FreeListError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Page(e) => write!(f, "invalid free-list page: {e}"),
            Self::InvalidCount(count) => write!(f, "invalid free-list entry count {count}"),
            Self::BrokenChain(page_id) => write!(f, "free-list chain broken at page {page_id}"),
        }
    }
}

impl std::error::Error for FreeListError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for FreeListError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<PageError> for FreeListError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}
