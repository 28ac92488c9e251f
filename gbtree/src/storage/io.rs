//! Page store abstraction for deterministic simulation testing.
//!
//! The `PageStore` trait is the boundary between the page cache and durable
//! media. Production trees use a file, tests use the in-memory store, which can
//! drop or tear writes that were never synced.
//!
//! # Contract
//!
//! - `read_page` returns the last written content for a page, or a zeroed page
//!   if the page was never written
//! - `write_page` may be buffered until `sync` is called
//! - `sync` makes all previous writes durable
//!
//! All methods take `&self`; implementations synchronize internally so the page
//! cache can read different pages from many threads at once.

use crate::storage::page::{Page, PageId};

/// Errors that can occur during page store operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InjectedFault(_) => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over page-granular durable storage.
pub trait PageStore: Send + Sync {
    /// Read a page into `page`.
    ///
    /// Pages past the end of the store read as zeroes.
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), StorageError>;

    /// Write a page, extending the store if needed.
    ///
    /// The write may be buffered until `sync` is called.
    fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&self) -> Result<(), StorageError>;

    /// Number of pages currently backed by the store.
    fn page_count(&self) -> Result<u64, StorageError>;
}
