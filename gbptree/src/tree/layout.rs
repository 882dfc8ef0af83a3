//! Key/value layouts.
//!
//! A [`Layout`] tells the tree how to order keys and how to turn keys and
//! values into bytes. Layouts whose keys and values all have one fixed size
//! are stored with the fixed-size node format; everything else uses the
//! dynamic format.

use std::cmp::Ordering;
use std::fmt::Debug;

/// Ordering and serialization contract for keys and values.
pub trait Layout: Send + Sync + 'static {
    type Key: Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Debug + PartialEq + Send + Sync + 'static;

    /// Identifies the layout in the meta page; a reopened tree must match it.
    fn identifier(&self) -> u64;

    fn major_version(&self) -> u32;

    fn minor_version(&self) -> u32;

    /// Serialized key size if every key has the same size.
    fn fixed_key_size(&self) -> Option<usize> {
        None
    }

    /// Serialized value size if every value has the same size.
    fn fixed_value_size(&self) -> Option<usize> {
        None
    }

    /// Whether the fixed-size node format applies.
    fn fixed_size(&self) -> bool {
        self.fixed_key_size().is_some() && self.fixed_value_size().is_some()
    }

    fn compare(&self, left: &Self::Key, right: &Self::Key) -> Ordering;

    fn key_size(&self, key: &Self::Key) -> usize;

    fn value_size(&self, value: &Self::Value) -> usize;

    /// Append the serialized key to `out`.
    fn write_key(&self, key: &Self::Key, out: &mut Vec<u8>);

    fn read_key(&self, bytes: &[u8]) -> Self::Key;

    /// Append the serialized value to `out`.
    fn write_value(&self, value: &Self::Value, out: &mut Vec<u8>);

    fn read_value(&self, bytes: &[u8]) -> Self::Value;

    /// Smallest key `s` with `left < s <= right`, used as separator when a
    /// leaf splits. Defaults to `right` itself.
    fn minimal_splitter(&self, left: &Self::Key, right: &Self::Key) -> Self::Key {
        let _ = left;
        right.clone()
    }
}

/// `u64` keys mapped to `u64` values, stored in the fixed-size format.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Layout;

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        u64::from_le_bytes(*b"u64->u64")
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn fixed_key_size(&self) -> Option<usize> {
        Some(8)
    }

    fn fixed_value_size(&self) -> Option<usize> {
        Some(8)
    }

    fn compare(&self, left: &u64, right: &u64) -> Ordering {
        left.cmp(right)
    }

    fn key_size(&self, _key: &u64) -> usize {
        8
    }

    fn value_size(&self, _value: &u64) -> usize {
        8
    }

    fn write_key(&self, key: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_le_bytes());
    }

    fn read_key(&self, bytes: &[u8]) -> u64 {
        read_u64(bytes)
    }

    fn write_value(&self, value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn read_value(&self, bytes: &[u8]) -> u64 {
        read_u64(bytes)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(buf)
}

/// Byte-string keys and values of any length, ordered lexicographically.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesLayout;

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn identifier(&self) -> u64 {
        u64::from_le_bytes(*b"bytes->b")
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn compare(&self, left: &Vec<u8>, right: &Vec<u8>) -> Ordering {
        left.cmp(right)
    }

    fn key_size(&self, key: &Vec<u8>) -> usize {
        key.len()
    }

    fn value_size(&self, value: &Vec<u8>) -> usize {
        value.len()
    }

    fn write_key(&self, key: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn read_key(&self, bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    fn write_value(&self, value: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn read_value(&self, bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    /// Shortest prefix of `right` that still sorts after `left`.
    fn minimal_splitter(&self, left: &Vec<u8>, right: &Vec<u8>) -> Vec<u8> {
        (1..=right.len())
            .map(|len| &right[..len])
            .find(|prefix| *prefix > left.as_slice())
            .map_or_else(|| right.clone(), <[u8]>::to_vec)
    }
}
