//! File-backed page store.
//!
//! A tree file is a flat sequence of `PAGE_SIZE` pages. Reads and writes are
//! positional so concurrent readers never contend on a shared file cursor.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::{PAGE_SIZE_U64, Page, PageId};

/// A tree file handle with page-granular positional I/O.
pub struct FileStore {
    file: File,
    path: PathBuf,
    /// Number of pages currently covered by the file length.
    page_count: AtomicU64,
    #[cfg(not(unix))]
    cursor_lock: parking_lot::Mutex<()>,
}

impl FileStore {
    /// Create a new, empty tree file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.sync_all()?;

        Ok(Self::from_file(file, path, 0))
    }

    /// Open an existing tree file.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        Ok(Self::from_file(file, path, len.div_ceil(PAGE_SIZE_U64)))
    }

    fn from_file(file: File, path: &Path, page_count: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            page_count: AtomicU64::new(page_count),
            #[cfg(not(unix))]
            cursor_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let _guard = self.cursor_lock.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(not(unix))]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let _guard = self.cursor_lock.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

impl PageStore for FileStore {
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), StorageError> {
        if page_id >= self.page_count.load(Ordering::Acquire) {
            page.clear();
            return Ok(());
        }
        self.read_at(page.as_bytes_mut(), page_id * PAGE_SIZE_U64)?;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        self.write_at(page.as_bytes(), page_id * PAGE_SIZE_U64)?;
        self.page_count.fetch_max(page_id + 1, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_count(&self) -> Result<u64, StorageError> {
        Ok(self.page_count.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("page_count", &self.page_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
