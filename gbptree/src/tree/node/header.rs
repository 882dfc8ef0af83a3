//! Node header shared by all node formats.
//!
//! Layout:
//! - byte 0: node type
//! - byte 1: leaf flag
//! - bytes 2-5: generation the node was last written in
//! - bytes 6-9: key count
//! - bytes 10-33: right sibling GSPP
//! - bytes 34-57: left sibling GSPP
//! - bytes 58-81: successor GSPP

// Key counts are bounded by the page size.
#![allow(clippy::cast_possible_truncation)]

use crate::pagecache::{PageCursor, PageId};
use crate::tree::generation::Generation;
use crate::tree::pointer::{self, NO_NODE, PointerFailure, PointerRead};

/// Page holds a tree node.
pub const NODE_TYPE_TREE_NODE: u8 = 1;
/// Page holds free-list entries.
pub const NODE_TYPE_FREE_LIST: u8 = 2;
/// Page holds one offloaded entry.
pub const NODE_TYPE_OFFLOAD: u8 = 3;

const LEAF_FLAG: u8 = 1;
const INTERNAL_FLAG: u8 = 0;

/// Length of the common header.
pub const BASE_HEADER_LENGTH: usize = 82;

pub mod offsets {
    pub const NODE_TYPE: usize = 0;
    pub const LEAF_FLAG: usize = 1;
    pub const GENERATION: usize = 2;
    pub const KEY_COUNT: usize = 6;
    pub const RIGHT_SIBLING: usize = 10;
    pub const LEFT_SIBLING: usize = 34;
    pub const SUCCESSOR: usize = 58;
}

/// Which header pointer a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPointer {
    RightSibling,
    LeftSibling,
    Successor,
}

impl HeaderPointer {
    pub const ALL: [Self; 3] = [Self::RightSibling, Self::LeftSibling, Self::Successor];

    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::RightSibling => offsets::RIGHT_SIBLING,
            Self::LeftSibling => offsets::LEFT_SIBLING,
            Self::Successor => offsets::SUCCESSOR,
        }
    }
}

impl std::fmt::Display for HeaderPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RightSibling => write!(f, "right sibling"),
            Self::LeftSibling => write!(f, "left sibling"),
            Self::Successor => write!(f, "successor"),
        }
    }
}

/// Write a fresh header: zero key count and every pointer set to `NO_NODE`.
pub fn initialize(cursor: &mut PageCursor, leaf: bool, node_generation: u32) {
    cursor.zero(0, BASE_HEADER_LENGTH);
    cursor.put_u8(offsets::NODE_TYPE, NODE_TYPE_TREE_NODE);
    cursor.put_u8(offsets::LEAF_FLAG, if leaf { LEAF_FLAG } else { INTERNAL_FLAG });
    cursor.put_u32(offsets::GENERATION, node_generation);
    cursor.put_u32(offsets::KEY_COUNT, 0);
    for which in HeaderPointer::ALL {
        pointer::initialize(cursor, which.offset(), NO_NODE, node_generation);
    }
}

pub fn node_type(cursor: &mut PageCursor) -> u8 {
    cursor.get_u8(offsets::NODE_TYPE)
}

pub fn is_tree_node(cursor: &mut PageCursor) -> bool {
    node_type(cursor) == NODE_TYPE_TREE_NODE
}

pub fn is_leaf(cursor: &mut PageCursor) -> bool {
    cursor.get_u8(offsets::LEAF_FLAG) == LEAF_FLAG
}

pub fn generation(cursor: &mut PageCursor) -> u32 {
    cursor.get_u32(offsets::GENERATION)
}

pub fn set_generation(cursor: &mut PageCursor, node_generation: u32) {
    cursor.put_u32(offsets::GENERATION, node_generation);
}

pub fn key_count(cursor: &mut PageCursor) -> usize {
    cursor.get_u32(offsets::KEY_COUNT) as usize
}

pub fn set_key_count(cursor: &mut PageCursor, key_count: usize) {
    cursor.put_u32(offsets::KEY_COUNT, key_count as u32);
}

pub fn read_pointer(
    cursor: &mut PageCursor,
    which: HeaderPointer,
    generation: Generation,
) -> Result<PointerRead, PointerFailure> {
    pointer::read(cursor, which.offset(), generation)
}

pub fn write_pointer(
    cursor: &mut PageCursor,
    which: HeaderPointer,
    target: PageId,
    generation: Generation,
) -> Result<(), PointerFailure> {
    pointer::write(cursor, which.offset(), target, generation)
}

pub fn right_sibling(
    cursor: &mut PageCursor,
    generation: Generation,
) -> Result<PointerRead, PointerFailure> {
    read_pointer(cursor, HeaderPointer::RightSibling, generation)
}

pub fn left_sibling(
    cursor: &mut PageCursor,
    generation: Generation,
) -> Result<PointerRead, PointerFailure> {
    read_pointer(cursor, HeaderPointer::LeftSibling, generation)
}

pub fn successor(
    cursor: &mut PageCursor,
    generation: Generation,
) -> Result<PointerRead, PointerFailure> {
    read_pointer(cursor, HeaderPointer::Successor, generation)
}
