//! Tree node codec.
//!
//! Translates between node pages and decoded node snapshots.
//!
//! # Page layout
//!
//! ```text
//! 0..8     page header (type = leaf/internal, checksum)
//! 8..16    generation
//! 16..18   key count
//! 18..20   reserved
//! leaf:
//!   20..60   successor pointer pair
//!   60..     entries: [key len u16][value len u16][key][value]
//! internal:
//!   20..     key count + 1 child pointer pairs
//!   then     keys: [key len u16][key]
//! ```
//!
//! The node checksum covers every byte except the checksum field and the
//! pointer pairs, which carry their own per-slot checksums and are the only
//! bytes ever rewritten in place on a node that may be stable.

// Entry sizes are bounded by MAX_ENTRY_SIZE and key counts by u16::MAX.
#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;
use std::ops::Range;

use crate::storage::{PAGE_SIZE, Page, PageHeader, PageId, PageType};
use crate::tree::generation::{Generation, Generations};
use crate::tree::layout::Layout;
use crate::tree::pointer::{
    PAIR_SIZE, PointerError, TreePointer, init_pointer, read_pointer, write_pointer,
};

mod offsets {
    use crate::storage::PageHeader;
    use crate::tree::pointer::PAIR_SIZE;

    pub const GENERATION: usize = PageHeader::SIZE;
    pub const KEY_COUNT: usize = GENERATION + 8;
    pub const HEADER_END: usize = KEY_COUNT + 4;
    pub const SUCCESSOR: usize = HEADER_END;
    pub const LEAF_ENTRIES: usize = SUCCESSOR + PAIR_SIZE;
    pub const CHILDREN: usize = HEADER_END;
}

/// Bytes available for leaf entries.
pub const LEAF_SPACE: usize = PAGE_SIZE - offsets::LEAF_ENTRIES;

/// Bytes available for child pointers and keys of an internal node.
pub const INTERNAL_SPACE: usize = PAGE_SIZE - offsets::CHILDREN;

/// Largest encoded entry (key + value + length prefixes) a tree accepts.
///
/// Small enough that any split of an overflowing node yields two halves that
/// each fit a page.
pub const MAX_ENTRY_SIZE: usize = 1024;

/// Largest key count representable in a node header.
pub const MAX_KEY_COUNT: usize = u16::MAX as usize;

const LEAF_ENTRY_OVERHEAD: usize = 4;
const INTERNAL_KEY_OVERHEAD: usize = 2;

/// Decoded leaf node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode<K, V> {
    pub generation: Generation,
    pub entries: Vec<(K, V)>,
    pub successor: Option<TreePointer>,
}

/// Decoded internal node.
///
/// `children.len() == keys.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode<K> {
    pub generation: Generation,
    pub keys: Vec<K>,
    pub children: Vec<TreePointer>,
}

/// A decoded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K>),
}

impl<K, V> Node<K, V> {
    /// Generation stamped on the node.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        match self {
            Self::Leaf(leaf) => leaf.generation,
            Self::Internal(internal) => internal.generation,
        }
    }

    /// Number of keys in the node.
    #[must_use]
    pub fn key_count(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.entries.len(),
            Self::Internal(internal) => internal.keys.len(),
        }
    }
}

/// Why a page failed to decode as a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptReason {
    /// Page type byte is not a node kind.
    InvalidKind(u8),
    /// Key count cannot fit in a page.
    InvalidKeyCount(usize),
    /// Node checksum does not match.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// An entry extends past the end of the page.
    EntryOverrun { index: usize },
    /// The layout rejected the bytes of a key.
    UnreadableKey { index: usize },
    /// The layout rejected the bytes of a value.
    UnreadableValue { index: usize },
    /// A pointer pair has no valid slot.
    CorruptPointer { index: usize },
    /// An internal node child pointer is absent.
    MissingChild { index: usize },
    /// The node generation is newer than the current unstable generation.
    FutureGeneration(Generation),
    /// A leaf where an internal node was expected, or the reverse.
    UnexpectedKind { expected: &'static str },
}

impl std::fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKind(kind) => write!(f, "invalid node kind 0x{kind:02x}"),
            Self::InvalidKeyCount(count) => write!(f, "invalid key count {count}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::EntryOverrun { index } => write!(f, "entry {index} overruns the page"),
            Self::UnreadableKey { index } => write!(f, "key {index} is unreadable"),
            Self::UnreadableValue { index } => write!(f, "value {index} is unreadable"),
            Self::CorruptPointer { index } => write!(f, "pointer {index} has no valid slot"),
            Self::MissingChild { index } => write!(f, "child {index} is missing"),
            Self::FutureGeneration(generation) => {
                write!(f, "generation {generation} is ahead of the tree")
            }
            Self::UnexpectedKind { expected } => write!(f, "expected a {expected} node"),
        }
    }
}

/// Errors from decoding a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The page is not a valid node.
    Corrupt(CorruptReason),
    /// The node or one of its pointers was written after the caller's
    /// generations were loaded.
    NewerGenerations,
}

impl NodeError {
    /// Treat a newer-generation observation as corruption, for callers whose
    /// generations are always current (the writer and cleanup).
    #[must_use]
    pub fn into_reason(self, node_generation: Generation) -> CorruptReason {
        match self {
            Self::Corrupt(reason) => reason,
            Self::NewerGenerations => CorruptReason::FutureGeneration(node_generation),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrupt(reason) => write!(f, "corrupt node: {reason}"),
            Self::NewerGenerations => write!(f, "node written by a newer generation"),
        }
    }
}

impl std::error::Error for NodeError {}

const fn pointer_error(error: PointerError, index: usize) -> NodeError {
    match error {
        PointerError::Corrupt => NodeError::Corrupt(CorruptReason::CorruptPointer { index }),
        PointerError::Newer => NodeError::NewerGenerations,
    }
}

/// Kind and key count of a node page, validated against the page size.
fn read_shape(page: &Page) -> Result<(PageType, usize), NodeError> {
    let kind_byte = page.read_u8(0);
    let kind = match PageType::try_from(kind_byte) {
        Ok(kind @ (PageType::TreeLeaf | PageType::TreeInternal)) => kind,
        _ => return Err(NodeError::Corrupt(CorruptReason::InvalidKind(kind_byte))),
    };
    let key_count = usize::from(page.read_u16(offsets::KEY_COUNT));
    let minimum = match kind {
        PageType::TreeLeaf => offsets::LEAF_ENTRIES + key_count * LEAF_ENTRY_OVERHEAD,
        _ => offsets::CHILDREN + (key_count + 1) * PAIR_SIZE + key_count * INTERNAL_KEY_OVERHEAD,
    };
    if minimum > PAGE_SIZE {
        return Err(NodeError::Corrupt(CorruptReason::InvalidKeyCount(key_count)));
    }
    Ok((kind, key_count))
}

fn pointer_region(kind: PageType, key_count: usize) -> Range<usize> {
    match kind {
        PageType::TreeLeaf => offsets::SUCCESSOR..offsets::SUCCESSOR + PAIR_SIZE,
        _ => offsets::CHILDREN..offsets::CHILDREN + (key_count + 1) * PAIR_SIZE,
    }
}

fn stamp_checksum(page: &mut Page, kind: PageType, key_count: usize) {
    let checksum = page.checksum_excluding(Some(pointer_region(kind, key_count)));
    page.set_checksum(checksum);
}

/// Generation stamped on a node page, without validating anything else.
#[must_use]
pub fn peek_generation(page: &Page) -> Generation {
    page.read_u64(offsets::GENERATION)
}

/// Decode a node page.
///
/// Fails with `NodeError::Corrupt` if the kind byte, key count, checksum, or
/// any entry is invalid.
pub fn decode<L: Layout>(
    page: &Page,
    layout: &L,
    generations: Generations,
) -> Result<Node<L::Key, L::Value>, NodeError> {
    let (kind, key_count) = read_shape(page)?;

    let expected = page.stored_checksum();
    let actual = page.checksum_excluding(Some(pointer_region(kind, key_count)));
    if expected != actual {
        return Err(NodeError::Corrupt(CorruptReason::ChecksumMismatch {
            expected,
            actual,
        }));
    }

    let generation = peek_generation(page);
    if generation > generations.unstable {
        return Err(NodeError::NewerGenerations);
    }

    match kind {
        PageType::TreeLeaf => decode_leaf(page, layout, generations, generation, key_count)
            .map(Node::Leaf),
        _ => decode_internal(page, layout, generations, generation, key_count)
            .map(Node::Internal),
    }
}

fn decode_leaf<L: Layout>(
    page: &Page,
    layout: &L,
    generations: Generations,
    generation: Generation,
    key_count: usize,
) -> Result<LeafNode<L::Key, L::Value>, NodeError> {
    let successor =
        read_pointer(page, offsets::SUCCESSOR, generations).map_err(|e| pointer_error(e, 0))?;

    let mut entries = Vec::with_capacity(key_count);
    let mut offset = offsets::LEAF_ENTRIES;
    for index in 0..key_count {
        if offset + LEAF_ENTRY_OVERHEAD > PAGE_SIZE {
            return Err(NodeError::Corrupt(CorruptReason::EntryOverrun { index }));
        }
        let key_len = usize::from(page.read_u16(offset));
        let value_len = usize::from(page.read_u16(offset + 2));
        offset += LEAF_ENTRY_OVERHEAD;
        if offset + key_len + value_len > PAGE_SIZE {
            return Err(NodeError::Corrupt(CorruptReason::EntryOverrun { index }));
        }
        let key = layout
            .read_key(page.read_bytes(offset, key_len))
            .ok_or(NodeError::Corrupt(CorruptReason::UnreadableKey { index }))?;
        offset += key_len;
        let value = layout
            .read_value(page.read_bytes(offset, value_len))
            .ok_or(NodeError::Corrupt(CorruptReason::UnreadableValue { index }))?;
        offset += value_len;
        entries.push((key, value));
    }

    Ok(LeafNode {
        generation,
        entries,
        successor,
    })
}

fn decode_internal<L: Layout>(
    page: &Page,
    layout: &L,
    generations: Generations,
    generation: Generation,
    key_count: usize,
) -> Result<InternalNode<L::Key>, NodeError> {
    let mut children = Vec::with_capacity(key_count + 1);
    for index in 0..=key_count {
        let child = read_pointer(page, offsets::CHILDREN + index * PAIR_SIZE, generations)
            .map_err(|e| pointer_error(e, index))?
            .ok_or(NodeError::Corrupt(CorruptReason::MissingChild { index }))?;
        children.push(child);
    }

    let mut keys = Vec::with_capacity(key_count);
    let mut offset = offsets::CHILDREN + (key_count + 1) * PAIR_SIZE;
    for index in 0..key_count {
        if offset + INTERNAL_KEY_OVERHEAD > PAGE_SIZE {
            return Err(NodeError::Corrupt(CorruptReason::EntryOverrun { index }));
        }
        let key_len = usize::from(page.read_u16(offset));
        offset += INTERNAL_KEY_OVERHEAD;
        if offset + key_len > PAGE_SIZE {
            return Err(NodeError::Corrupt(CorruptReason::EntryOverrun { index }));
        }
        let key = layout
            .read_key(page.read_bytes(offset, key_len))
            .ok_or(NodeError::Corrupt(CorruptReason::UnreadableKey { index }))?;
        offset += key_len;
        keys.push(key);
    }

    Ok(InternalNode {
        generation,
        keys,
        children,
    })
}

fn write_header(page: &mut Page, kind: PageType, generation: Generation, key_count: usize) {
    page.clear();
    let header = PageHeader {
        page_type: kind,
        flags: 0,
        checksum: 0,
    };
    page.write_bytes(0, &header.to_bytes());
    page.write_u64(offsets::GENERATION, generation);
    page.write_u16(offsets::KEY_COUNT, key_count as u16);
}

/// Write a complete leaf node.
///
/// The caller guarantees the entries fit (`leaf_used <= LEAF_SPACE`).
pub fn encode_leaf<L: Layout>(
    page: &mut Page,
    layout: &L,
    entries: &[(L::Key, L::Value)],
    generation: Generation,
    successor: PageId,
) {
    debug_assert!(leaf_used(layout, entries) <= LEAF_SPACE);
    write_header(page, PageType::TreeLeaf, generation, entries.len());
    init_pointer(page, offsets::SUCCESSOR, successor, generation);

    let mut offset = offsets::LEAF_ENTRIES;
    for (key, value) in entries {
        let key_len = layout.key_size(key);
        let value_len = layout.value_size(value);
        page.write_u16(offset, key_len as u16);
        page.write_u16(offset + 2, value_len as u16);
        offset += LEAF_ENTRY_OVERHEAD;
        layout.write_key(key, &mut page.as_bytes_mut()[offset..offset + key_len]);
        offset += key_len;
        layout.write_value(value, &mut page.as_bytes_mut()[offset..offset + value_len]);
        offset += value_len;
    }

    stamp_checksum(page, PageType::TreeLeaf, entries.len());
}

/// Write a complete internal node.
///
/// `children.len()` must be `keys.len() + 1`; the caller guarantees the keys
/// fit (`internal_used <= INTERNAL_SPACE`).
pub fn encode_internal<L: Layout>(
    page: &mut Page,
    layout: &L,
    keys: &[L::Key],
    children: &[PageId],
    generation: Generation,
) {
    debug_assert_eq!(children.len(), keys.len() + 1);
    debug_assert!(internal_used(layout, keys) <= INTERNAL_SPACE);
    write_header(page, PageType::TreeInternal, generation, keys.len());

    for (index, child) in children.iter().enumerate() {
        init_pointer(page, offsets::CHILDREN + index * PAIR_SIZE, *child, generation);
    }

    let mut offset = offsets::CHILDREN + children.len() * PAIR_SIZE;
    for key in keys {
        let key_len = layout.key_size(key);
        page.write_u16(offset, key_len as u16);
        offset += INTERNAL_KEY_OVERHEAD;
        layout.write_key(key, &mut page.as_bytes_mut()[offset..offset + key_len]);
        offset += key_len;
    }

    stamp_checksum(page, PageType::TreeInternal, keys.len());
}

/// Redirect child `index` of an internal node page in place.
pub fn write_child_pointer(
    page: &mut Page,
    index: usize,
    target: PageId,
    generations: Generations,
) {
    write_pointer(page, offsets::CHILDREN + index * PAIR_SIZE, target, generations);
}

/// Redirect the successor of a leaf page in place.
pub fn write_successor(page: &mut Page, target: PageId, generations: Generations) {
    write_pointer(page, offsets::SUCCESSOR, target, generations);
}

/// Offsets of every pointer pair on a node page.
pub fn pointer_offsets(page: &Page) -> Result<Vec<usize>, NodeError> {
    let (kind, key_count) = read_shape(page)?;
    Ok(pointer_region(kind, key_count).step_by(PAIR_SIZE).collect())
}

/// Index of the child of an internal node that covers `key`: the number of
/// separators less than or equal to it.
pub fn child_position<L: Layout>(layout: &L, keys: &[L::Key], key: &L::Key) -> usize {
    keys.partition_point(|separator| layout.compare(separator, key) != Ordering::Greater)
}

/// Encoded size of a leaf entry.
pub fn leaf_entry_size<L: Layout>(layout: &L, key: &L::Key, value: &L::Value) -> usize {
    LEAF_ENTRY_OVERHEAD + layout.key_size(key) + layout.value_size(value)
}

/// Bytes used by leaf entries.
pub fn leaf_used<L: Layout>(layout: &L, entries: &[(L::Key, L::Value)]) -> usize {
    entries
        .iter()
        .map(|(key, value)| leaf_entry_size(layout, key, value))
        .sum()
}

/// Bytes used by the children and keys of an internal node with `keys`.
pub fn internal_used<L: Layout>(layout: &L, keys: &[L::Key]) -> usize {
    (keys.len() + 1) * PAIR_SIZE
        + keys
            .iter()
            .map(|key| INTERNAL_KEY_OVERHEAD + layout.key_size(key))
            .sum::<usize>()
}

/// Occupancy rules for nodes.
///
/// With an explicit key limit, nodes split above `max_keys` and underflow
/// below `max_keys / 2`. Without one, nodes are limited by page space only and
/// underflow when empty or less than a quarter full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapacity {
    max_keys: usize,
    min_keys: usize,
    min_fill: bool,
}

impl NodeCapacity {
    /// Capacity limited by page space only.
    #[must_use]
    pub const fn bytes_limited() -> Self {
        Self {
            max_keys: MAX_KEY_COUNT,
            min_keys: 1,
            min_fill: true,
        }
    }

    /// Capacity limited to `max_keys` keys per node (at least 2).
    #[must_use]
    pub fn with_max_keys(max_keys: usize) -> Self {
        let max_keys = max_keys.clamp(2, MAX_KEY_COUNT);
        Self {
            max_keys,
            min_keys: (max_keys / 2).max(1),
            min_fill: false,
        }
    }

    /// Capacity for an optional key limit.
    #[must_use]
    pub fn from_max_keys(max_keys: Option<usize>) -> Self {
        max_keys.map_or_else(Self::bytes_limited, Self::with_max_keys)
    }

    /// Maximum keys per node.
    #[must_use]
    pub const fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// True if a leaf with these entries fits one page.
    pub fn leaf_fits<L: Layout>(&self, layout: &L, entries: &[(L::Key, L::Value)]) -> bool {
        entries.len() <= self.max_keys && leaf_used(layout, entries) <= LEAF_SPACE
    }

    /// True if a non-root leaf with these entries is under-occupied.
    pub fn leaf_underflows<L: Layout>(&self, layout: &L, entries: &[(L::Key, L::Value)]) -> bool {
        entries.len() < self.min_keys
            || (self.min_fill && leaf_used(layout, entries) < LEAF_SPACE / 4)
    }

    /// True if an internal node with these keys fits one page.
    pub fn internal_fits<L: Layout>(&self, layout: &L, keys: &[L::Key]) -> bool {
        keys.len() <= self.max_keys && internal_used(layout, keys) <= INTERNAL_SPACE
    }

    /// True if a non-root internal node with these keys is under-occupied.
    pub fn internal_underflows<L: Layout>(&self, layout: &L, keys: &[L::Key]) -> bool {
        keys.len() < self.min_keys
            || (self.min_fill && internal_used(layout, keys) < INTERNAL_SPACE / 4)
    }

    /// Where to split an overflowing leaf: entries `[..at]` stay left.
    pub fn leaf_split_point<L: Layout>(&self, layout: &L, entries: &[(L::Key, L::Value)]) -> usize {
        let sizes: Vec<usize> = entries
            .iter()
            .map(|(key, value)| leaf_entry_size(layout, key, value))
            .collect();
        balanced_split(&sizes, 1, entries.len().saturating_sub(1))
    }

    /// Which key of an overflowing internal node moves up: keys `[..at]` and
    /// children `[..=at]` stay left, key `at` is promoted.
    pub fn internal_split_point<L: Layout>(&self, layout: &L, keys: &[L::Key]) -> usize {
        let sizes: Vec<usize> = keys
            .iter()
            .map(|key| INTERNAL_KEY_OVERHEAD + layout.key_size(key) + PAIR_SIZE)
            .collect();
        balanced_split(&sizes, 1, keys.len().saturating_sub(2))
    }
}

/// First index at which the prefix holds at least half the bytes, clamped.
fn balanced_split(sizes: &[usize], low: usize, high: usize) -> usize {
    let total: usize = sizes.iter().sum();
    let mut prefix = 0;
    let mut at = sizes.len() / 2;
    for (index, size) in sizes.iter().enumerate() {
        if prefix * 2 >= total {
            at = index;
            break;
        }
        prefix += size;
    }
    at.clamp(low, high.max(low))
}
