//! Errors surfaced by tree operations.

use std::time::Duration;

use crate::config::ConfigError;
use crate::storage::{MetaError, PageId, StorageError};
use crate::tree::node::CorruptReason;
use crate::tree::state::StateError;

/// Errors from tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// The writer lease could not be obtained in time.
    WriterLockTimeout(Duration),
    /// A node could not be decoded.
    CorruptNode {
        page_id: PageId,
        reason: CorruptReason,
    },
    /// Neither tree state page is valid.
    UnreadableTreeState(StateError),
    /// The tree structure is inconsistent (cycle, broken leaf chain, key
    /// order violation).
    TreeCorruption(String),
    /// I/O failure from the page store.
    Storage(StorageError),
    /// The meta page is missing or invalid.
    Meta(MetaError),
    /// The tree was created with a different layout.
    LayoutMismatch { expected: u64, found: u64 },
    /// Recovery cleanup has not run since an unclean shutdown.
    RecoveryPending,
    /// An entry is too large to be stored in a node.
    EntryTooLarge { size: usize, max: usize },
    /// A checkpoint failed; the tree must be reopened.
    Poisoned,
    /// Invalid configuration.
    Config(ConfigError),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriterLockTimeout(timeout) => {
                write!(f, "writer lease not obtained within {}ms", timeout.as_millis())
            }
            Self::CorruptNode { page_id, reason } => {
                write!(f, "corrupt node at page {page_id}: {reason}")
            }
            Self::UnreadableTreeState(e) => write!(f, "unreadable tree state: {e}"),
            Self::TreeCorruption(msg) => write!(f, "tree corruption: {msg}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Meta(e) => write!(f, "meta page error: {e}"),
            Self::LayoutMismatch { expected, found } => write!(
                f,
                "layout mismatch: expected 0x{expected:016x}, found 0x{found:016x}"
            ),
            Self::RecoveryPending => write!(f, "recovery cleanup has not run"),
            Self::EntryTooLarge { size, max } => {
                write!(f, "entry of {size} bytes exceeds the maximum of {max}")
            }
            Self::Poisoned => write!(f, "tree is poisoned by a failed checkpoint"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnreadableTreeState(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Meta(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for TreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<MetaError> for TreeError {
    fn from(e: MetaError) -> Self {
        Self::Meta(e)
    }
}

impl From<StateError> for TreeError {
    fn from(e: StateError) -> Self {
        Self::UnreadableTreeState(e)
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
