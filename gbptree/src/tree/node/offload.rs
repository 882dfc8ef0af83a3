//! Offload pages.
//!
//! An entry too large to inline in a dynamic-format node is stored alone on
//! an offload page; the node keeps only a marker and the page id.
//!
//! Layout:
//! - byte 0: node type (offload)
//! - byte 1: reserved
//! - bytes 2-5: generation the page was written in
//! - bytes 6-7: key size
//! - bytes 8-9: value size
//! - bytes 10..: key bytes, then value bytes

// Sizes are capped by the page size, which fits in u16.
#![allow(clippy::cast_possible_truncation)]

use crate::pagecache::{PageCursor, PageId, PfFlags, retry_until_stable};
use crate::tree::node::header::NODE_TYPE_OFFLOAD;

/// Length of the offload page header.
pub const OFFLOAD_HEADER_LENGTH: usize = 10;

mod offsets {
    pub const NODE_TYPE: usize = 0;
    pub const GENERATION: usize = 2;
    pub const KEY_SIZE: usize = 6;
    pub const VALUE_SIZE: usize = 8;
}

/// Largest key plus value an offload page can hold.
#[must_use]
pub const fn key_value_size_cap(page_size: usize) -> usize {
    page_size - OFFLOAD_HEADER_LENGTH
}

/// Write an offload page at the cursor's current page.
pub fn write(cursor: &mut PageCursor, key: &[u8], value: &[u8], generation: u32) {
    cursor.zero(0, OFFLOAD_HEADER_LENGTH);
    cursor.put_u8(offsets::NODE_TYPE, NODE_TYPE_OFFLOAD);
    cursor.put_u32(offsets::GENERATION, generation);
    cursor.put_u16(offsets::KEY_SIZE, key.len() as u16);
    cursor.put_u16(offsets::VALUE_SIZE, value.len() as u16);
    cursor.put_bytes(OFFLOAD_HEADER_LENGTH, key);
    cursor.put_bytes(OFFLOAD_HEADER_LENGTH + key.len(), value);
}

/// Generation stamped on the offload page under the cursor.
pub fn generation(cursor: &mut PageCursor) -> u32 {
    cursor.get_u32(offsets::GENERATION)
}

/// Decoded offload page contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offloaded {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Read the offload page under the cursor.
///
/// `node_generation` is the generation of the node referencing the page;
/// a newer offload page means the id was reused and the reference is stale.
fn read_current(cursor: &mut PageCursor, node_generation: u32) -> Result<Offloaded, String> {
    if cursor.get_u8(offsets::NODE_TYPE) != NODE_TYPE_OFFLOAD {
        return Err("page is not an offload page".to_string());
    }
    let offload_generation = generation(cursor);
    if offload_generation > node_generation {
        return Err(format!(
            "offload generation {offload_generation} is newer than node generation {node_generation}"
        ));
    }
    let key_size = cursor.get_u16(offsets::KEY_SIZE) as usize;
    let value_size = cursor.get_u16(offsets::VALUE_SIZE) as usize;
    if OFFLOAD_HEADER_LENGTH + key_size + value_size > cursor.page_size() {
        return Err(format!("offload sizes {key_size}+{value_size} exceed the page"));
    }
    Ok(Offloaded {
        key: cursor.get_vec(OFFLOAD_HEADER_LENGTH, key_size),
        value: cursor.get_vec(OFFLOAD_HEADER_LENGTH + key_size, value_size),
    })
}

/// Read offload page `id` through a cursor linked to `cursor`.
///
/// Failures are raised on `cursor` with `set_cursor_error`, so a reader
/// inside a retry loop discards them if the node itself changed.
pub fn read(cursor: &mut PageCursor, id: PageId, node_generation: u32) -> Offloaded {
    let result = cursor
        .open_linked_cursor(id, PfFlags::SharedRead)
        .and_then(|mut linked| {
            retry_until_stable(&mut linked, |c| read_current(c, node_generation))
        });
    match result {
        Ok(Ok(offloaded)) => offloaded,
        Ok(Err(message)) => {
            cursor.set_cursor_error(format!("offload page {id}: {message}"));
            Offloaded {
                key: Vec::new(),
                value: Vec::new(),
            }
        }
        Err(e) => {
            cursor.set_cursor_error(format!("offload page {id}: {e}"));
            Offloaded {
                key: Vec::new(),
                value: Vec::new(),
            }
        }
    }
}
