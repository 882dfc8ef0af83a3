//! Node formats.
//!
//! A tree node is one page: the common [`header`] followed by a
//! format-specific body. [`FixedSizeNode`] stores fixed-size keys and values
//! in constant-stride slots. [`DynamicSizeNode`] stores variable-size entries
//! growing from the end of the page, addressed through an offset array, with
//! tombstones and lazy defragmentation, and moves oversized entries to
//! [`offload`] pages.
//!
//! Structural operations (split, merge, rebalance) work on [`RawEntry`]
//! values: the encoded bytes of one entry exactly as the node stores them.
//! Moving raw entries between nodes keeps offload references intact.

mod dynamic;
mod fixed;
pub mod header;
pub mod offload;

use std::sync::Arc;

pub use dynamic::DynamicSizeNode;
pub use fixed::FixedSizeNode;

use crate::pagecache::{PageCursor, PageId};
use crate::tree::error::TreeError;
use crate::tree::generation::Generation;
use crate::tree::layout::Layout;
use crate::tree::pointer::{PointerFailure, PointerRead};

/// Node format identifier stored in the meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeFormat {
    Fixed = 1,
    Dynamic = 2,
}

impl TryFrom<u8> for NodeFormat {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Fixed),
            2 => Ok(Self::Dynamic),
            _ => Err(value),
        }
    }
}

/// Whether one more entry fits in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Fits in the free space.
    No,
    /// Fits only after reclaiming dead space.
    NoNeedDefrag,
    /// Does not fit; the node must split.
    Yes,
}

/// One encoded entry as stored in a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub bytes: Vec<u8>,
    /// Offload page holding the real key and value, if any.
    pub offload_id: Option<PageId>,
}

/// Space accounting of a dynamic-format node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceBreakdown {
    /// Slot arrays and live entries.
    pub active: usize,
    /// Tombstoned entries not yet reclaimed.
    pub dead: usize,
    /// Free gap between the slot array and the entries.
    pub alloc: usize,
    /// Everything after the header.
    pub total: usize,
}

impl SpaceBreakdown {
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.active + self.dead + self.alloc == self.total
    }
}

/// Destination for entries too large to inline.
pub trait OffloadStore {
    /// Write `key` and `value` to a fresh offload page and return its id.
    fn store(&mut self, key: &[u8], value: &[u8]) -> Result<PageId, TreeError>;
}

/// A node format.
///
/// All positions are logical key positions. In internal nodes, child `i`
/// sits left of key `i` and child `key_count` is the rightmost.
pub trait TreeNode<L: Layout>: Send + Sync {
    fn format(&self) -> NodeFormat;

    fn page_size(&self) -> usize;

    /// Write an empty node with all pointers set to `NO_NODE`.
    fn initialize(&self, cursor: &mut PageCursor, leaf: bool, node_generation: u32);

    /// Upper bound on keys a valid node can hold, to reject garbage reads.
    fn reasonable_key_count(&self, key_count: usize, leaf: bool) -> bool;

    /// Largest key plus value accepted by `put`.
    fn key_value_size_cap(&self) -> usize;

    fn key_at(&self, cursor: &mut PageCursor, pos: usize, leaf: bool) -> L::Key;

    fn value_at(&self, cursor: &mut PageCursor, pos: usize) -> L::Value;

    /// Byte offset of child pointer `pos` in an internal node.
    fn child_offset(&self, pos: usize) -> usize;

    fn raw_at(&self, cursor: &mut PageCursor, pos: usize, leaf: bool) -> RawEntry;

    /// Key of a raw entry. The cursor is used to reach offload pages.
    fn decode_key(&self, cursor: &mut PageCursor, raw: &RawEntry, leaf: bool) -> L::Key;

    /// Encode a leaf entry (`value` is `Some`) or an internal key.
    fn encode(
        &self,
        key: &L::Key,
        value: Option<&L::Value>,
        store: &mut dyn OffloadStore,
    ) -> Result<RawEntry, TreeError>;

    /// Space a raw entry takes in a node, including its slot.
    fn entry_space(&self, raw: &RawEntry, leaf: bool) -> usize;

    /// Space available for entries in an empty node.
    fn total_space(&self, leaf: bool) -> usize;

    /// Space taken by the node's live entries.
    fn used_space(&self, cursor: &mut PageCursor, key_count: usize, leaf: bool) -> usize;

    fn overflow(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        space: usize,
        leaf: bool,
    ) -> Overflow;

    /// Reclaim dead space.
    fn defragment(&self, cursor: &mut PageCursor, key_count: usize, leaf: bool);

    /// Insert into a leaf that has room, updating the key count.
    fn insert_raw_at(&self, cursor: &mut PageCursor, pos: usize, raw: &RawEntry, key_count: usize);

    /// Remove from a leaf, updating the key count. Returns the removed entry.
    fn remove_raw_at(&self, cursor: &mut PageCursor, pos: usize, key_count: usize) -> RawEntry;

    /// Overwrite a leaf value without moving the entry, if the encoding allows.
    fn set_value_in_place(&self, cursor: &mut PageCursor, pos: usize, value: &L::Value) -> bool;

    /// Overwrite an internal key without moving it, if the encoding allows.
    fn replace_key_in_place(&self, cursor: &mut PageCursor, pos: usize, raw: &RawEntry) -> bool;

    /// Replace the node body with `entries` (and `children` for internal
    /// nodes), leaving the header pointers untouched.
    fn rewrite(
        &self,
        cursor: &mut PageCursor,
        leaf: bool,
        entries: &[RawEntry],
        children: &[PageId],
        generation: Generation,
    );

    /// Space accounting, for formats that track it.
    fn space_breakdown(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        leaf: bool,
    ) -> Option<SpaceBreakdown>;

    fn child_at(
        &self,
        cursor: &mut PageCursor,
        pos: usize,
        generation: Generation,
    ) -> Result<PointerRead, PointerFailure> {
        crate::tree::pointer::read(cursor, self.child_offset(pos), generation)
    }

    fn set_child_at(
        &self,
        cursor: &mut PageCursor,
        pos: usize,
        child: PageId,
        generation: Generation,
    ) -> Result<(), PointerFailure> {
        crate::tree::pointer::write(cursor, self.child_offset(pos), child, generation)
    }

    /// All raw entries of a node, in key order.
    fn read_entries(&self, cursor: &mut PageCursor, key_count: usize, leaf: bool) -> Vec<RawEntry> {
        (0..key_count).map(|pos| self.raw_at(cursor, pos, leaf)).collect()
    }

    /// All children of an internal node. On failure, returns the position
    /// of the unreadable pointer.
    fn read_children(
        &self,
        cursor: &mut PageCursor,
        key_count: usize,
        generation: Generation,
    ) -> Result<Vec<PageId>, (usize, PointerFailure)> {
        (0..=key_count)
            .map(|pos| {
                self.child_at(cursor, pos, generation)
                    .map(|read| read.pointer)
                    .map_err(|failure| (pos, failure))
            })
            .collect()
    }

    /// Whether a node using `used` bytes is less than half full.
    fn underflow(&self, used: usize, leaf: bool) -> bool {
        used < self.total_space(leaf) / 2
    }
}

/// Pick the node format for a layout.
pub fn format_for<L: Layout>(layout: Arc<L>, page_size: usize) -> Arc<dyn TreeNode<L>> {
    if layout.fixed_size() {
        Arc::new(FixedSizeNode::new(layout, page_size))
    } else {
        Arc::new(DynamicSizeNode::new(layout, page_size))
    }
}

/// Choose where to split entries of the given `sizes`.
///
/// For leaves the left node keeps `[..pos]` and the right node `[pos..]`.
/// For internal nodes entry `pos` moves up as separator and the right node
/// gets `[pos + 1..]`. The position whose left side is closest to `ratio` of
/// the total is chosen among those where both sides fit in `capacity`; on a
/// tie the earlier position wins.
#[must_use]
#[allow(clippy::cast_precision_loss)] // sizes are bounded by the page size
pub fn split_position(sizes: &[usize], capacity: usize, ratio: f64, leaf: bool) -> Option<usize> {
    let count = sizes.len();
    let last = if leaf { count.checked_sub(1)? } else { count.checked_sub(2)? };
    if last < 1 {
        return None;
    }
    let total: usize = sizes.iter().sum();
    let target = ratio * total as f64;

    let mut left = sizes[0];
    let mut best: Option<(usize, f64)> = None;
    for pos in 1..=last {
        let right = if leaf {
            total - left
        } else {
            total - left - sizes[pos]
        };
        let delta = (left as f64 - target).abs();
        if left <= capacity && right <= capacity {
            match best {
                Some((_, best_delta)) if delta > best_delta => break,
                Some((_, best_delta)) if delta < best_delta => best = Some((pos, delta)),
                Some(_) => {}
                None => best = Some((pos, delta)),
            }
        }
        left += sizes[pos];
    }
    best.map(|(pos, _)| pos)
}
