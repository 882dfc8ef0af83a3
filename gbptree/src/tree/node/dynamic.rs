//! Dynamic-size node format.
//!
//! After the common header come two `u16` fields, the allocation offset and
//! the dead-space byte count. Then:
//!
//! - Leaf: a `u16` offset per key pointing at its entry.
//! - Internal: child 0, then per key a `u16` offset followed by the child
//!   right of that key.
//!
//! Entries are allocated downwards from the end of the page. A leaf entry is
//! `[key header u16][value header u16][key][value]`, an internal entry
//! `[key header u16][key]`. Key header bit 15 marks a tombstone, bit 14 an
//! offloaded entry whose body is a `u64` offload page id instead of the data.
//! Removing an entry only tombstones it; dead space is reclaimed by
//! defragmentation when an insert would otherwise not fit.

// Offsets and sizes are bounded by the page size, which fits in u16.
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::pagecache::{PageCursor, PageId};
use crate::tree::error::TreeError;
use crate::tree::generation::Generation;
use crate::tree::layout::Layout;
use crate::tree::node::header::{self, BASE_HEADER_LENGTH};
use crate::tree::node::offload;
use crate::tree::node::{NodeFormat, OffloadStore, Overflow, RawEntry, SpaceBreakdown, TreeNode};
use crate::tree::pointer::{self, GSPP_SIZE};

/// Header length of dynamic-format nodes.
pub const HEADER_LENGTH_DYNAMIC: usize = BASE_HEADER_LENGTH + 4;

mod offsets {
    pub const ALLOC_OFFSET: usize = super::BASE_HEADER_LENGTH;
    pub const DEAD_SPACE: usize = super::BASE_HEADER_LENGTH + 2;
}

const OFFSET_SIZE: usize = 2;
const KEY_HEADER_SIZE: usize = 2;
const VALUE_HEADER_SIZE: usize = 2;
const OFFLOAD_ID_SIZE: usize = 8;
const FLAG_TOMBSTONE: u16 = 0x8000;
const FLAG_OFFLOAD: u16 = 0x4000;
const SIZE_MASK: u16 = 0x3FFF;
const INTERNAL_SLOT_SIZE: usize = OFFSET_SIZE + GSPP_SIZE;

/// Decoded entry header.
#[derive(Debug, Clone, Copy)]
struct EntryHeader {
    offloaded: bool,
    key_size: usize,
    value_size: usize,
    /// Offset of the key bytes, or of the offload id.
    data: usize,
    /// Encoded length of the whole entry.
    len: usize,
}

pub struct DynamicSizeNode<L: Layout> {
    layout: Arc<L>,
    page_size: usize,
    inline_cap: usize,
}

impl<L: Layout> DynamicSizeNode<L> {
    pub fn new(layout: Arc<L>, page_size: usize) -> Self {
        Self {
            layout,
            page_size,
            inline_cap: inline_cap(page_size),
        }
    }

    /// Largest key plus value stored inline.
    #[must_use]
    pub const fn inline_cap(&self) -> usize {
        self.inline_cap
    }

    const fn slot_size(leaf: bool) -> usize {
        if leaf { OFFSET_SIZE } else { INTERNAL_SLOT_SIZE }
    }

    const fn slot_offset(pos: usize, leaf: bool) -> usize {
        if leaf {
            HEADER_LENGTH_DYNAMIC + pos * OFFSET_SIZE
        } else {
            HEADER_LENGTH_DYNAMIC + GSPP_SIZE + pos * INTERNAL_SLOT_SIZE
        }
    }

    const fn slots_end(key_count: usize, leaf: bool) -> usize {
        Self::slot_offset(key_count, leaf)
    }

    fn entry_offset(cursor: &mut PageCursor, pos: usize, leaf: bool) -> usize {
        cursor.get_u16(Self::slot_offset(pos, leaf)) as usize
    }

    fn entry_header(cursor: &mut PageCursor, offset: usize, leaf: bool) -> EntryHeader {
        let key_header = cursor.get_u16(offset);
        parse_header(key_header, leaf.then(|| cursor.get_u16(offset + KEY_HEADER_SIZE)), offset, leaf)
    }

    fn alloc_offset(cursor: &mut PageCursor) -> usize {
        cursor.get_u16(offsets::ALLOC_OFFSET) as usize
    }

    fn dead_space(cursor: &mut PageCursor) -> usize {
        cursor.get_u16(offsets::DEAD_SPACE) as usize
    }

    fn read_data(cursor: &mut PageCursor, entry: EntryHeader) -> (Vec<u8>, Vec<u8>) {
        if entry.offloaded {
            let id = cursor.get_u64(entry.data);
            let node_generation = header::generation(cursor);
            let offloaded = offload::read(cursor, id, node_generation);
            (offloaded.key, offloaded.value)
        } else {
            (
                cursor.get_vec(entry.data, entry.key_size),
                cursor.get_vec(entry.data + entry.key_size, entry.value_size),
            )
        }
    }
}

/// Inline cap for a page size: keeps any node able to hold four entries.
#[must_use]
pub const fn inline_cap(page_size: usize) -> usize {
    (page_size - HEADER_LENGTH_DYNAMIC) / 4 - (KEY_HEADER_SIZE + INTERNAL_SLOT_SIZE)
}

fn parse_header(key_header: u16, value_header: Option<u16>, offset: usize, leaf: bool) -> EntryHeader {
    let offloaded = key_header & FLAG_OFFLOAD != 0;
    let key_size = (key_header & SIZE_MASK) as usize;
    let value_size = value_header.unwrap_or(0) as usize;
    let headers = if leaf {
        KEY_HEADER_SIZE + VALUE_HEADER_SIZE
    } else {
        KEY_HEADER_SIZE
    };
    let body = if offloaded {
        OFFLOAD_ID_SIZE
    } else {
        key_size + value_size
    };
    EntryHeader {
        offloaded,
        key_size,
        value_size,
        data: offset + headers,
        len: headers + body,
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    bytes
        .get(at..at + 2)
        .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
}

impl<L: Layout> TreeNode<L> for DynamicSizeNode<L> {
    fn format(&self) -> NodeFormat {
        NodeFormat::Dynamic
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn initialize(&self, cursor: &mut PageCursor, leaf: bool, node_generation: u32) {
        header::initialize(cursor, leaf, node_generation);
        cursor.put_u16(offsets::ALLOC_OFFSET, self.page_size as u16);
        cursor.put_u16(offsets::DEAD_SPACE, 0);
    }

    fn reasonable_key_count(&self, key_count: usize, leaf: bool) -> bool {
        let smallest_entry = if leaf {
            KEY_HEADER_SIZE + VALUE_HEADER_SIZE + OFFSET_SIZE
        } else {
            KEY_HEADER_SIZE + INTERNAL_SLOT_SIZE
        };
        key_count <= self.total_space(leaf) / smallest_entry
    }

    fn key_value_size_cap(&self) -> usize {
        offload::key_value_size_cap(self.page_size)
    }

    fn key_at(&self, cursor: &mut PageCursor, pos: usize, leaf: bool) -> L::Key {
        let offset = Self::entry_offset(cursor, pos, leaf);
        let entry = Self::entry_header(cursor, offset, leaf);
        if entry.offloaded {
            let (key, _) = Self::read_data(cursor, entry);
            self.layout.read_key(&key)
        } else {
            let key = cursor.get_vec(entry.data, entry.key_size);
            self.layout.read_key(&key)
        }
    }

    fn value_at(&self, cursor: &mut PageCursor, pos: usize) -> L::Value {
        let offset = Self::entry_offset(cursor, pos, true);
        let entry = Self::entry_header(cursor, offset, true);
        let (_, value) = Self::read_data(cursor, entry);
        self.layout.read_value(&value)
    }

    fn child_offset(&self, pos: usize) -> usize {
        if pos == 0 {
            HEADER_LENGTH_DYNAMIC
        } else {
            Self::slot_offset(pos - 1, false) + OFFSET_SIZE
        }
    }

    fn raw_at(&self, cursor: &mut PageCursor, pos: usize, leaf: bool) -> RawEntry {
        let offset = Self::entry_offset(cursor, pos, leaf);
        let entry = Self::entry_header(cursor, offset, leaf);
        let bytes = cursor.get_vec(offset, entry.len);
        let offload_id = entry.offloaded.then(|| cursor.get_u64(entry.data));
        RawEntry { bytes, offload_id }
    }

    fn decode_key(&self, cursor: &mut PageCursor, raw: &RawEntry, leaf: bool) -> L::Key {
        let value_header = leaf.then(|| read_u16(&raw.bytes, KEY_HEADER_SIZE));
        let entry = parse_header(read_u16(&raw.bytes, 0), value_header, 0, leaf);
        match raw.offload_id {
            Some(id) if entry.offloaded => {
                let node_generation = header::generation(cursor);
                let offloaded = offload::read(cursor, id, node_generation);
                self.layout.read_key(&offloaded.key)
            }
            _ => {
                let end = (entry.data + entry.key_size).min(raw.bytes.len());
                let start = entry.data.min(end);
                self.layout.read_key(&raw.bytes[start..end])
            }
        }
    }

    fn encode(
        &self,
        key: &L::Key,
        value: Option<&L::Value>,
        store: &mut dyn OffloadStore,
    ) -> Result<RawEntry, TreeError> {
        let mut key_bytes = Vec::with_capacity(self.layout.key_size(key));
        self.layout.write_key(key, &mut key_bytes);
        let mut value_bytes = Vec::new();
        if let Some(value) = value {
            self.layout.write_value(value, &mut value_bytes);
        }

        let cap = self.key_value_size_cap();
        if key_bytes.len() + value_bytes.len() > cap {
            return Err(TreeError::EntryTooLarge {
                key_size: key_bytes.len(),
                value_size: value_bytes.len(),
                cap,
            });
        }

        let leaf = value.is_some();
        let mut bytes = Vec::new();
        if key_bytes.len() + value_bytes.len() <= self.inline_cap {
            bytes.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
            if leaf {
                bytes.extend_from_slice(&(value_bytes.len() as u16).to_le_bytes());
            }
            bytes.extend_from_slice(&key_bytes);
            bytes.extend_from_slice(&value_bytes);
            Ok(RawEntry {
                bytes,
                offload_id: None,
            })
        } else {
            let id = store.store(&key_bytes, &value_bytes)?;
            bytes.extend_from_slice(&FLAG_OFFLOAD.to_le_bytes());
            if leaf {
                bytes.extend_from_slice(&0u16.to_le_bytes());
            }
            bytes.extend_from_slice(&id.to_le_bytes());
            Ok(RawEntry {
                bytes,
                offload_id: Some(id),
            })
        }
    }

    fn entry_space(&self, raw: &RawEntry, leaf: bool) -> usize {
        raw.bytes.len() + Self::slot_size(leaf)
    }

    fn total_space(&self, leaf: bool) -> usize {
        if leaf {
            self.page_size - HEADER_LENGTH_DYNAMIC
        } else {
            self.page_size - HEADER_LENGTH_DYNAMIC - GSPP_SIZE
        }
    }

    fn used_space(&self, cursor: &mut PageCursor, key_count: usize, leaf: bool) -> usize {
        (0..key_count)
            .map(|pos| {
                let offset = Self::entry_offset(cursor, pos, leaf);
                Self::entry_header(cursor, offset, leaf).len + Self::slot_size(leaf)
            })
            .sum()
    }

    fn overflow(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        space: usize,
        leaf: bool,
    ) -> Overflow {
        let gap = Self::alloc_offset(cursor).saturating_sub(Self::slots_end(key_count, leaf));
        if space <= gap {
            Overflow::No
        } else if space <= gap + Self::dead_space(cursor) {
            Overflow::NoNeedDefrag
        } else {
            Overflow::Yes
        }
    }

    fn defragment(&self, cursor: &mut PageCursor, key_count: usize, leaf: bool) {
        let live: Vec<Vec<u8>> = (0..key_count)
            .map(|pos| {
                let offset = Self::entry_offset(cursor, pos, leaf);
                let entry = Self::entry_header(cursor, offset, leaf);
                cursor.get_vec(offset, entry.len)
            })
            .collect();

        let mut alloc = self.page_size;
        for (pos, bytes) in live.iter().enumerate() {
            alloc -= bytes.len();
            cursor.put_bytes(alloc, bytes);
            cursor.put_u16(Self::slot_offset(pos, leaf), alloc as u16);
        }
        let slots_end = Self::slots_end(key_count, leaf);
        cursor.zero(slots_end, alloc.saturating_sub(slots_end));
        cursor.put_u16(offsets::ALLOC_OFFSET, alloc as u16);
        cursor.put_u16(offsets::DEAD_SPACE, 0);
    }

    fn insert_raw_at(&self, cursor: &mut PageCursor, pos: usize, raw: &RawEntry, key_count: usize) {
        let alloc = Self::alloc_offset(cursor) - raw.bytes.len();
        cursor.put_bytes(alloc, &raw.bytes);
        cursor.shift_bytes(
            Self::slot_offset(pos, true),
            (key_count - pos) * OFFSET_SIZE,
            OFFSET_SIZE as isize,
        );
        cursor.put_u16(Self::slot_offset(pos, true), alloc as u16);
        cursor.put_u16(offsets::ALLOC_OFFSET, alloc as u16);
        header::set_key_count(cursor, key_count + 1);
    }

    fn remove_raw_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) -> RawEntry {
        let raw = self.raw_at(cursor, pos, true);
        let offset = Self::entry_offset(cursor, pos, true);
        let key_header = cursor.get_u16(offset);
        cursor.put_u16(offset, key_header | FLAG_TOMBSTONE);
        let dead = Self::dead_space(cursor) + raw.bytes.len();
        cursor.put_u16(offsets::DEAD_SPACE, dead as u16);
        cursor.shift_bytes(
            Self::slot_offset(pos + 1, true),
            (key_count - pos - 1) * OFFSET_SIZE,
            -(OFFSET_SIZE as isize),
        );
        header::set_key_count(cursor, key_count - 1);
        raw
    }

    fn set_value_in_place(&self, cursor: &mut PageCursor, pos: usize, value: &L::Value) -> bool {
        let offset = Self::entry_offset(cursor, pos, true);
        let entry = Self::entry_header(cursor, offset, true);
        if entry.offloaded {
            return false;
        }
        let mut bytes = Vec::with_capacity(entry.value_size);
        self.layout.write_value(value, &mut bytes);
        if bytes.len() != entry.value_size {
            return false;
        }
        cursor.put_bytes(entry.data + entry.key_size, &bytes);
        true
    }

    fn replace_key_in_place(&self, cursor: &mut PageCursor, pos: usize, raw: &RawEntry) -> bool {
        let offset = Self::entry_offset(cursor, pos, false);
        let entry = Self::entry_header(cursor, offset, false);
        if entry.offloaded || raw.offload_id.is_some() || entry.len != raw.bytes.len() {
            return false;
        }
        cursor.put_bytes(offset, &raw.bytes);
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
        if !leaf {
            if let Some(first) = children.first() {
                pointer::initialize(cursor, self.child_offset(0), *first, generation.unstable);
            }
        }
        let mut alloc = self.page_size;
        for (pos, raw) in entries.iter().enumerate() {
            alloc -= raw.bytes.len();
            cursor.put_bytes(alloc, &raw.bytes);
            cursor.put_u16(Self::slot_offset(pos, leaf), alloc as u16);
            if !leaf {
                if let Some(child) = children.get(pos + 1) {
                    pointer::initialize(
                        cursor,
                        self.child_offset(pos + 1),
                        *child,
                        generation.unstable,
                    );
                }
            }
        }
        cursor.put_u16(offsets::ALLOC_OFFSET, alloc as u16);
        cursor.put_u16(offsets::DEAD_SPACE, 0);
        header::set_key_count(cursor, entries.len());
    }

    fn space_breakdown(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        leaf: bool,
    ) -> Option<SpaceBreakdown> {
        let slots_end = Self::slots_end(key_count, leaf);
        let live: usize = (0..key_count)
            .map(|pos| {
                let offset = Self::entry_offset(cursor, pos, leaf);
                Self::entry_header(cursor, offset, leaf).len
            })
            .sum();
        let alloc_offset = Self::alloc_offset(cursor);
        Some(SpaceBreakdown {
            active: slots_end - HEADER_LENGTH_DYNAMIC + live,
            dead: Self::dead_space(cursor),
            alloc: alloc_offset.saturating_sub(slots_end),
            total: self.page_size - HEADER_LENGTH_DYNAMIC,
        })
    }
}
