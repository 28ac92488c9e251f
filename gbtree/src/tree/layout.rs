//! Key/value layouts.
//!
//! A `Layout` tells the tree how to order keys and how to encode keys and
//! values into node pages. The tree never assumes fixed-size entries; every
//! size it needs comes from `key_size` / `value_size`.

use std::cmp::Ordering;
use std::fmt::Debug;

/// Encoding and ordering of the entries stored in a tree.
///
/// # Invariants
///
/// - `compare` is a total order
/// - `write_key` fills exactly `key_size(key)` bytes and `read_key` on those
///   bytes returns an equal key (likewise for values)
pub trait Layout: Send + Sync + 'static {
    /// Key type.
    type Key: Clone + Debug + Send + Sync;
    /// Value type.
    type Value: Clone + Debug + Send + Sync;

    /// Identifier stored in the meta page; a tree can only be reopened with
    /// a layout reporting the same identifier.
    fn identifier(&self) -> u64;

    /// Encoding version of this layout.
    fn version(&self) -> u32 {
        0
    }

    /// Order two keys.
    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Encoded size of a key in bytes.
    fn key_size(&self, key: &Self::Key) -> usize;

    /// Encoded size of a value in bytes.
    fn value_size(&self, value: &Self::Value) -> usize;

    /// Encode `key` into `buf`, which is exactly `key_size(key)` bytes.
    fn write_key(&self, key: &Self::Key, buf: &mut [u8]);

    /// Decode a key; `None` if the bytes are not a valid key.
    fn read_key(&self, buf: &[u8]) -> Option<Self::Key>;

    /// Encode `value` into `buf`, which is exactly `value_size(value)` bytes.
    fn write_value(&self, value: &Self::Value, buf: &mut [u8]);

    /// Decode a value; `None` if the bytes are not a valid value.
    fn read_value(&self, buf: &[u8]) -> Option<Self::Value>;
}

/// Fixed-size layout mapping `u64` keys to `u64` values.
#[derive(Debug, Default, Clone, Copy)]
pub struct U64Layout;

impl U64Layout {
    /// Layout identifier ("U64:U64 ").
    pub const IDENTIFIER: u64 = u64::from_be_bytes(*b"U64:U64 ");
}

fn read_u64(buf: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = buf.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        Self::IDENTIFIER
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn key_size(&self, _key: &u64) -> usize {
        8
    }

    fn value_size(&self, _value: &u64) -> usize {
        8
    }

    fn write_key(&self, key: &u64, buf: &mut [u8]) {
        buf.copy_from_slice(&key.to_be_bytes());
    }

    fn read_key(&self, buf: &[u8]) -> Option<u64> {
        read_u64(buf)
    }

    fn write_value(&self, value: &u64, buf: &mut [u8]) {
        buf.copy_from_slice(&value.to_be_bytes());
    }

    fn read_value(&self, buf: &[u8]) -> Option<u64> {
        read_u64(buf)
    }
}

/// Variable-size layout mapping byte strings to byte strings.
///
/// Keys are ordered lexicographically, so a key sorts before every key it is a
/// proper prefix of.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesLayout;

impl BytesLayout {
    /// Layout identifier ("BYTES:BY").
    pub const IDENTIFIER: u64 = u64::from_be_bytes(*b"BYTES:BY");
}

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn identifier(&self) -> u64 {
        Self::IDENTIFIER
    }

    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.as_slice().cmp(b.as_slice())
    }

    fn key_size(&self, key: &Vec<u8>) -> usize {
        key.len()
    }

    fn value_size(&self, value: &Vec<u8>) -> usize {
        value.len()
    }

    fn write_key(&self, key: &Vec<u8>, buf: &mut [u8]) {
        buf.copy_from_slice(key);
    }

    fn read_key(&self, buf: &[u8]) -> Option<Vec<u8>> {
        Some(buf.to_vec())
    }

    fn write_value(&self, value: &Vec<u8>, buf: &mut [u8]) {
        buf.copy_from_slice(value);
    }

    fn read_value(&self, buf: &[u8]) -> Option<Vec<u8>> {
        Some(buf.to_vec())
    }
}
