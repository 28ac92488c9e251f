//! Meta page structure and serialization.
//!
//! The meta page occupies page 0 and identifies the file as a tree file built
//! for a particular layout. It is written once at creation and never changes.

// PAGE_SIZE is a compile-time constant that fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{PAGE_SIZE, Page, PageError, PageHeader, PageId, PageType};

/// Magic number identifying a tree file: "GBTREE01"
pub const MAGIC: [u8; 8] = *b"GBTREE01";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Page id of the meta page.
pub const META_PAGE_ID: PageId = 0;

/// Page size as u32 for storage in the meta page.
const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Meta page field offsets.
mod offsets {
    use crate::storage::page::PageHeader;

    pub const MAGIC: usize = PageHeader::SIZE;
    pub const FORMAT_VERSION: usize = MAGIC + 8;
    pub const PAGE_SIZE: usize = FORMAT_VERSION + 4;
    pub const LAYOUT_IDENTIFIER: usize = PAGE_SIZE + 4;
    pub const LAYOUT_VERSION: usize = LAYOUT_IDENTIFIER + 8;
}

/// File-level metadata.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes (always `PAGE_SIZE`).
    pub page_size: u32,
    /// Identifier of the layout the tree was created with.
    pub layout_identifier: u64,
    /// Version of that layout's encoding.
    pub layout_version: u32,
}

impl Meta {
    /// Create meta for a new tree file.
    #[must_use]
    pub const fn new(layout_identifier: u64, layout_version: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: PAGE_SIZE_U32,
            layout_identifier,
            layout_version,
        }
    }

    /// Serialize into a page.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::new();
        self.write_to(&mut page);
        page
    }

    /// Serialize into an existing page buffer.
    pub fn write_to(&self, page: &mut Page) {
        page.clear();
        let header = PageHeader {
            page_type: PageType::Meta,
            flags: 0,
            checksum: 0,
        };
        page.write_bytes(0, &header.to_bytes());
        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::LAYOUT_IDENTIFIER, self.layout_identifier);
        page.write_u32(offsets::LAYOUT_VERSION, self.layout_version);
        page.update_checksum();
    }

    /// Deserialize and validate a meta page.
    pub fn from_page(page: &Page) -> Result<Self, MetaError> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(MetaError::InvalidMagic(magic));
        }

        page.verify_checksum().map_err(MetaError::Page)?;
        let header = PageHeader::read(page).map_err(MetaError::Page)?;
        if header.page_type != PageType::Meta {
            return Err(MetaError::Page(PageError::InvalidPageType(
                header.page_type as u8,
            )));
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(MetaError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(MetaError::InvalidPageSize(page_size));
        }

        Ok(Self {
            format_version,
            page_size,
            layout_identifier: page.read_u64(offsets::LAYOUT_IDENTIFIER),
            layout_version: page.read_u32(offsets::LAYOUT_VERSION),
        })
    }
}

/// Errors related to meta page operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    /// Magic number mismatch (not a tree file).
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Page size mismatch.
    InvalidPageSize(u32),
    /// Header or checksum problem.
    Page(PageError),
}

impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => write!(f, "invalid magic number: {magic:?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
            Self::Page(e) => write!(f, "invalid meta page: {e}"),
        }
    }
}

impl std::error::Error for MetaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}
