//! Page storage for tree files.
//!
//! Trees never touch the filesystem directly; they lease pages from a
//! `PageCache`, which sits on top of a `PageStore`.
//!
//! # File Format
//!
//! A tree file is a sequence of 8KB pages:
//!
//! - Page 0: Meta page (magic, format version, layout identifier)
//! - Pages 1-2: Tree state pages A and B
//! - Remaining pages: tree nodes and free-list pages
//!
//! # Usage
//!
//! ```ignore
//! use gbtree::storage::{FileStore, PageCache};
//!
//! let store = Arc::new(FileStore::create(path)?);
//! let cache = PageCache::new(store, 1024);
//!
//! {
//!     let mut page = cache.write_new(3)?;
//!     page.write_bytes(0, b"hello");
//! }
//!
//! // Write back and fsync
//! cache.flush()?;
//! ```

mod file;
mod io;
mod memory;
mod meta;
mod page;
mod page_cache;

pub use file::FileStore;
pub use io::{PageStore, StorageError};
pub use memory::{CrashMode, CrashReport, FaultConfig, MemoryStore, MemoryStoreStats, SECTOR_SIZE};
pub use meta::{FORMAT_VERSION, MAGIC, META_PAGE_ID, Meta, MetaError};
pub use page::{PAGE_SIZE, PAGE_SIZE_U64, Page, PageError, PageHeader, PageId, PageType};
pub use page_cache::{
    DEFAULT_CACHE_CAPACITY, PageCache, PageCacheStats, PageRead, PageWrite,
};
