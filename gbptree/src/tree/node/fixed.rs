//! Fixed-size node format.
//!
//! Leaf: header, then `max` key slots, then `max` value slots.
//! Internal: header, then `max` key slots, then `max + 1` child pointers.

// Strides are bounded by the page size.
#![allow(clippy::cast_possible_wrap)]

use std::sync::Arc;

use crate::pagecache::{PageCursor, PageId};
use crate::tree::error::TreeError;
use crate::tree::generation::Generation;
use crate::tree::layout::Layout;
use crate::tree::node::header::{self, BASE_HEADER_LENGTH};
use crate::tree::node::{NodeFormat, OffloadStore, Overflow, RawEntry, SpaceBreakdown, TreeNode};
use crate::tree::pointer::{self, GSPP_SIZE};

pub struct FixedSizeNode<L: Layout> {
    layout: Arc<L>,
    page_size: usize,
    key_size: usize,
    value_size: usize,
    leaf_max: usize,
    internal_max: usize,
}

impl<L: Layout> FixedSizeNode<L> {
    /// Sizes come from the layout; a layout without fixed sizes gets
    /// zero-width slots and must use the dynamic format instead.
    pub fn new(layout: Arc<L>, page_size: usize) -> Self {
        let key_size = layout.fixed_key_size().unwrap_or_default();
        let value_size = layout.fixed_value_size().unwrap_or_default();
        let body = page_size - BASE_HEADER_LENGTH;
        let leaf_max = body / (key_size + value_size).max(1);
        let internal_max = (body - GSPP_SIZE) / (key_size + GSPP_SIZE);
        Self {
            layout,
            page_size,
            key_size,
            value_size,
            leaf_max,
            internal_max,
        }
    }

    #[must_use]
    pub const fn leaf_max_key_count(&self) -> usize {
        self.leaf_max
    }

    #[must_use]
    pub const fn internal_max_key_count(&self) -> usize {
        self.internal_max
    }

    const fn key_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + pos * self.key_size
    }

    const fn value_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + self.leaf_max * self.key_size + pos * self.value_size
    }

    const fn max(&self, leaf: bool) -> usize {
        if leaf { self.leaf_max } else { self.internal_max }
    }

    fn fit(bytes: &mut Vec<u8>, size: usize) {
        bytes.resize(size, 0);
    }
}

impl<L: Layout> TreeNode<L> for FixedSizeNode<L> {
    fn format(&self) -> NodeFormat {
        NodeFormat::Fixed
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn initialize(&self, cursor: &mut PageCursor, leaf: bool, node_generation: u32) {
        header::initialize(cursor, leaf, node_generation);
    }

    fn reasonable_key_count(&self, key_count: usize, leaf: bool) -> bool {
        key_count <= self.max(leaf)
    }

    fn key_value_size_cap(&self) -> usize {
        self.key_size + self.value_size
    }

    fn key_at(&self, cursor: &mut PageCursor, pos: usize, _leaf: bool) -> L::Key {
        let bytes = cursor.get_vec(self.key_offset(pos), self.key_size);
        self.layout.read_key(&bytes)
    }

    fn value_at(&self, cursor: &mut PageCursor, pos: usize) -> L::Value {
        let bytes = cursor.get_vec(self.value_offset(pos), self.value_size);
        self.layout.read_value(&bytes)
    }

    fn child_offset(&self, pos: usize) -> usize {
        BASE_HEADER_LENGTH + self.internal_max * self.key_size + pos * GSPP_SIZE
    }

    fn raw_at(&self, cursor: &mut PageCursor, pos: usize, leaf: bool) -> RawEntry {
        let mut bytes = cursor.get_vec(self.key_offset(pos), self.key_size);
        if leaf {
            bytes.extend(cursor.get_vec(self.value_offset(pos), self.value_size));
        }
        RawEntry {
            bytes,
            offload_id: None,
        }
    }

    fn decode_key(&self, _cursor: &mut PageCursor, raw: &RawEntry, _leaf: bool) -> L::Key {
        let end = self.key_size.min(raw.bytes.len());
        self.layout.read_key(&raw.bytes[..end])
    }

    fn encode(
        &self,
        key: &L::Key,
        value: Option<&L::Value>,
        _store: &mut dyn OffloadStore,
    ) -> Result<RawEntry, TreeError> {
        let mut bytes = Vec::with_capacity(self.key_size + self.value_size);
        self.layout.write_key(key, &mut bytes);
        Self::fit(&mut bytes, self.key_size);
        if let Some(value) = value {
            self.layout.write_value(value, &mut bytes);
            Self::fit(&mut bytes, self.key_size + self.value_size);
        }
        Ok(RawEntry {
            bytes,
            offload_id: None,
        })
    }

    fn entry_space(&self, _raw: &RawEntry, leaf: bool) -> usize {
        if leaf {
            self.key_size + self.value_size
        } else {
            self.key_size + GSPP_SIZE
        }
    }

    fn total_space(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_max * (self.key_size + self.value_size)
        } else {
            self.internal_max * (self.key_size + GSPP_SIZE)
        }
    }

    fn used_space(&self, _cursor: &mut PageCursor, key_count: usize, leaf: bool) -> usize {
        if leaf {
            key_count * (self.key_size + self.value_size)
        } else {
            key_count * (self.key_size + GSPP_SIZE)
        }
    }

    fn overflow(
        &self,
        _cursor: &mut PageCursor,
        key_count: usize,
        _space: usize,
        leaf: bool,
    ) -> Overflow {
        if key_count < self.max(leaf) {
            Overflow::No
        } else {
            Overflow::Yes
        }
    }

    fn defragment(&self, _cursor: &mut PageCursor, _key_count: usize, _leaf: bool) {}

    fn insert_raw_at(&self, cursor: &mut PageCursor, pos: usize, raw: &RawEntry, key_count: usize) {
        let tail = key_count - pos;
        cursor.shift_bytes(self.key_offset(pos), tail * self.key_size, self.key_size as isize);
        cursor.shift_bytes(
            self.value_offset(pos),
            tail * self.value_size,
            self.value_size as isize,
        );
        cursor.put_bytes(self.key_offset(pos), &raw.bytes[..self.key_size]);
        cursor.put_bytes(self.value_offset(pos), &raw.bytes[self.key_size..]);
        header::set_key_count(cursor, key_count + 1);
    }

    fn remove_raw_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) -> RawEntry {
        let raw = self.raw_at(cursor, pos, true);
        let tail = key_count - pos - 1;
        cursor.shift_bytes(
            self.key_offset(pos + 1),
            tail * self.key_size,
            -(self.key_size as isize),
        );
        cursor.shift_bytes(
            self.value_offset(pos + 1),
            tail * self.value_size,
            -(self.value_size as isize),
        );
        header::set_key_count(cursor, key_count - 1);
        raw
    }

    fn set_value_in_place(&self, cursor: &mut PageCursor, pos: usize, value: &L::Value) -> bool {
        let mut bytes = Vec::with_capacity(self.value_size);
        self.layout.write_value(value, &mut bytes);
        Self::fit(&mut bytes, self.value_size);
        cursor.put_bytes(self.value_offset(pos), &bytes);
        true
    }

    fn replace_key_in_place(&self, cursor: &mut PageCursor, pos: usize, raw: &RawEntry) -> bool {
        cursor.put_bytes(self.key_offset(pos), &raw.bytes[..self.key_size]);
        true
    }

    fn rewrite(
        &self,
        cursor: &mut PageCursor,
        leaf: bool,
        entries: &[RawEntry],
        children: &[PageId],
        generation: Generation,
    ) {
        cursor.zero(BASE_HEADER_LENGTH, self.page_size - BASE_HEADER_LENGTH);
        for (pos, raw) in entries.iter().enumerate() {
            cursor.put_bytes(self.key_offset(pos), &raw.bytes[..self.key_size]);
            if leaf {
                cursor.put_bytes(self.value_offset(pos), &raw.bytes[self.key_size..]);
            }
        }
        if !leaf {
            for (pos, child) in children.iter().enumerate() {
                pointer::initialize(cursor, self.child_offset(pos), *child, generation.unstable);
            }
        }
        header::set_key_count(cursor, entries.len());
    }

    fn space_breakdown(
        &self,
        _cursor: &mut PageCursor,
        _key_count: usize,
        _leaf: bool,
    ) -> Option<SpaceBreakdown> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagecache::{PagedFile, PfFlags};
    use crate::tree::layout::U64Layout;
    use tempfile::tempdir;

    struct NoOffload;

    impl OffloadStore for NoOffload {
        fn store(&mut self, _key: &[u8], _value: &[u8]) -> Result<PageId, TreeError> {
            unreachable!("fixed format never offloads")
        }
    }

    fn leaf_fixture(test: impl FnOnce(&FixedSizeNode<U64Layout>, &mut PageCursor)) {
        let dir = tempdir().expect("failed to create temp dir");
        let file = PagedFile::map(&dir.path().join("fixed.db"), 512, true).expect("map");
        let mut cursor = file.io(PfFlags::ExclusiveWrite).expect("io");
        assert!(cursor.next(3).expect("next"));
        let node = FixedSizeNode::new(Arc::new(U64Layout), 512);
        node.initialize(&mut cursor, true, 2);
        test(&node, &mut cursor);
    }

    fn insert(node: &FixedSizeNode<U64Layout>, cursor: &mut PageCursor, pos: usize, key: u64) {
        let raw = node.encode(&key, Some(&(key * 10)), &mut NoOffload).expect("encode");
        let count = header::key_count(cursor);
        node.insert_raw_at(cursor, pos, &raw, count);
    }

    #[test]
    fn test_capacity() {
        let node = FixedSizeNode::new(Arc::new(U64Layout), 512);
        assert_eq!(node.leaf_max_key_count(), (512 - 82) / 16);
        assert_eq!(node.internal_max_key_count(), (512 - 82 - 24) / 32);
        assert_eq!(node.total_space(true), 26 * 16);
    }

    #[test]
    fn test_insert_shifts_slots() {
        leaf_fixture(|node, cursor| {
            insert(node, cursor, 0, 10);
            insert(node, cursor, 1, 30);
            insert(node, cursor, 1, 20);

            assert_eq!(header::key_count(cursor), 3);
            let keys: Vec<u64> = (0..3).map(|i| node.key_at(cursor, i, true)).collect();
            let values: Vec<u64> = (0..3).map(|i| node.value_at(cursor, i)).collect();
            assert_eq!(keys, vec![10, 20, 30]);
            assert_eq!(values, vec![100, 200, 300]);
        });
    }

    #[test]
    fn test_remove_shifts_back() {
        leaf_fixture(|node, cursor| {
            for (pos, key) in [1u64, 2, 3, 4].into_iter().enumerate() {
                insert(node, cursor, pos, key);
            }
            let removed = node.remove_raw_at(cursor, 1, 4);
            assert_eq!(node.decode_key(cursor, &removed, true), 2);
            let keys: Vec<u64> = (0..3).map(|i| node.key_at(cursor, i, true)).collect();
            assert_eq!(keys, vec![1, 3, 4]);
            assert_eq!(node.value_at(cursor, 2), 40);
        });
    }

    #[test]
    fn test_overflow_at_capacity() {
        leaf_fixture(|node, cursor| {
            let max = node.leaf_max_key_count();
            for key in 0..max as u64 {
                insert(node, cursor, usize::try_from(key).expect("fits"), key);
            }
            assert_eq!(node.overflow(cursor, max, 16, true), Overflow::Yes);
            assert_eq!(node.overflow(cursor, max - 1, 16, true), Overflow::No);
        });
    }

    #[test]
    fn test_rewrite_internal_children() {
        leaf_fixture(|node, cursor| {
            node.initialize(cursor, false, 2);
            let generation = Generation::new(1, 2);
            let keys: Vec<RawEntry> = [5u64, 9]
                .iter()
                .map(|k| node.encode(k, None, &mut NoOffload).expect("encode"))
                .collect();
            node.rewrite(cursor, false, &keys, &[11, 12, 13], generation);

            assert_eq!(header::key_count(cursor), 2);
            assert_eq!(node.key_at(cursor, 1, false), 9);
            let children = node.read_children(cursor, 2, generation).expect("children");
            assert_eq!(children, vec![11, 12, 13]);
        });
    }
}
