//! Meta page and the two alternating state pages.
//!
//! Page 0 holds the meta page, written once at creation: magic, format
//! version, page size and the identity of the layout. Pages 1 and 2 hold
//! state pages. Each checkpoint writes a new state into the slot not holding
//! the current one, so a crash mid-write leaves the previous state intact.
//! On open the newest valid state wins.

// Sizes and positions are bounded by the page size, which fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::pagecache::{PageCursor, PageId, PagedFile, PfFlags, retry_until_stable};
use crate::tree::error::{MetadataError, TreeError};
use crate::tree::freelist::FreeListState;
use crate::tree::generation::{Generation, MIN_GENERATION};
use crate::tree::layout::Layout;
use crate::tree::node::NodeFormat;

/// Magic number identifying a tree file: "GBPTREE1"
pub const MAGIC: [u8; 8] = *b"GBPTREE1";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

pub const META_PAGE_ID: PageId = 0;
pub const STATE_PAGE_A: PageId = 1;
pub const STATE_PAGE_B: PageId = 2;

mod meta_offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const LAYOUT_IDENTIFIER: usize = 16;
    pub const LAYOUT_MAJOR: usize = 24;
    pub const LAYOUT_MINOR: usize = 28;
    pub const NODE_FORMAT: usize = 32;
}

mod state_offsets {
    pub const STABLE: usize = 0;
    pub const UNSTABLE: usize = 4;
    pub const ROOT_ID: usize = 8;
    pub const ROOT_GENERATION: usize = 16;
    pub const LAST_ID: usize = 20;
    pub const FREE_LIST_WRITE_PAGE: usize = 28;
    pub const FREE_LIST_READ_PAGE: usize = 36;
    pub const FREE_LIST_WRITE_POS: usize = 44;
    pub const FREE_LIST_READ_POS: usize = 48;
    pub const CLEAN: usize = 52;
    pub const HEADER_LENGTH: usize = 53;
    pub const HEADER: usize = 57;
}

const CHECKSUM_SIZE: usize = 4;

/// Largest header blob a state page can carry.
#[must_use]
pub const fn header_cap(page_size: usize) -> usize {
    page_size - state_offsets::HEADER - CHECKSUM_SIZE
}

/// Contents of the meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub format_version: u32,
    pub page_size: usize,
    pub layout_identifier: u64,
    pub layout_major: u32,
    pub layout_minor: u32,
    pub node_format: NodeFormat,
}

impl Meta {
    pub fn for_layout<L: Layout>(layout: &L, page_size: usize, node_format: NodeFormat) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size,
            layout_identifier: layout.identifier(),
            layout_major: layout.major_version(),
            layout_minor: layout.minor_version(),
            node_format,
        }
    }

    pub fn write(&self, cursor: &mut PageCursor) {
        cursor.zero(0, cursor.page_size());
        cursor.put_bytes(meta_offsets::MAGIC, &MAGIC);
        cursor.put_u32(meta_offsets::FORMAT_VERSION, self.format_version);
        cursor.put_u32(meta_offsets::PAGE_SIZE, self.page_size as u32);
        cursor.put_u64(meta_offsets::LAYOUT_IDENTIFIER, self.layout_identifier);
        cursor.put_u32(meta_offsets::LAYOUT_MAJOR, self.layout_major);
        cursor.put_u32(meta_offsets::LAYOUT_MINOR, self.layout_minor);
        cursor.put_u8(meta_offsets::NODE_FORMAT, self.node_format as u8);
    }

    pub fn read(cursor: &mut PageCursor) -> Result<Self, MetadataError> {
        let mut magic = [0u8; 8];
        cursor.get_bytes(meta_offsets::MAGIC, &mut magic);
        if magic != MAGIC {
            return Err(MetadataError::InvalidMagic);
        }

        let format_version = cursor.get_u32(meta_offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(MetadataError::UnsupportedVersion(format_version));
        }

        let format_byte = cursor.get_u8(meta_offsets::NODE_FORMAT);
        let node_format = NodeFormat::try_from(format_byte).map_err(|b| MetadataError::LayoutMismatch {
            expected: "a known node format".to_string(),
            actual: format!("node format {b}"),
        })?;

        Ok(Self {
            format_version,
            page_size: cursor.get_u32(meta_offsets::PAGE_SIZE) as usize,
            layout_identifier: cursor.get_u64(meta_offsets::LAYOUT_IDENTIFIER),
            layout_major: cursor.get_u32(meta_offsets::LAYOUT_MAJOR),
            layout_minor: cursor.get_u32(meta_offsets::LAYOUT_MINOR),
            node_format,
        })
    }

    /// Check that a stored meta page matches what the opener expects.
    pub fn verify(&self, expected: &Self) -> Result<(), MetadataError> {
        if self.page_size != expected.page_size {
            return Err(MetadataError::PageSizeMismatch {
                expected: expected.page_size,
                actual: self.page_size,
            });
        }
        if (self.layout_identifier, self.layout_major, self.layout_minor, self.node_format)
            != (
                expected.layout_identifier,
                expected.layout_major,
                expected.layout_minor,
                expected.node_format,
            )
        {
            return Err(MetadataError::LayoutMismatch {
                expected: expected.describe_layout(),
                actual: self.describe_layout(),
            });
        }
        Ok(())
    }

    fn describe_layout(&self) -> String {
        format!(
            "layout {:#x} v{}.{} ({:?})",
            self.layout_identifier, self.layout_major, self.layout_minor, self.node_format
        )
    }
}

/// One state page: everything needed to reopen the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeState {
    pub generation: Generation,
    pub root_id: PageId,
    pub root_generation: u32,
    pub free_list: FreeListState,
    /// Written by a close with nothing left to recover.
    pub clean: bool,
    pub header: Vec<u8>,
}

impl TreeState {
    pub fn write(&self, cursor: &mut PageCursor) -> Result<(), TreeError> {
        let page_size = cursor.page_size();
        let cap = header_cap(page_size);
        if self.header.len() > cap {
            return Err(TreeError::HeaderTooLarge {
                size: self.header.len(),
                cap,
            });
        }

        let mut page = vec![0u8; page_size];
        let mut put = |offset: usize, bytes: &[u8]| page[offset..offset + bytes.len()].copy_from_slice(bytes);
        put(state_offsets::STABLE, &self.generation.stable.to_le_bytes());
        put(state_offsets::UNSTABLE, &self.generation.unstable.to_le_bytes());
        put(state_offsets::ROOT_ID, &self.root_id.to_le_bytes());
        put(state_offsets::ROOT_GENERATION, &self.root_generation.to_le_bytes());
        put(state_offsets::LAST_ID, &self.free_list.last_id.to_le_bytes());
        put(state_offsets::FREE_LIST_WRITE_PAGE, &self.free_list.write_page.to_le_bytes());
        put(state_offsets::FREE_LIST_READ_PAGE, &self.free_list.read_page.to_le_bytes());
        put(state_offsets::FREE_LIST_WRITE_POS, &(self.free_list.write_pos as u32).to_le_bytes());
        put(state_offsets::FREE_LIST_READ_POS, &(self.free_list.read_pos as u32).to_le_bytes());
        put(state_offsets::CLEAN, &[u8::from(self.clean)]);
        put(state_offsets::HEADER_LENGTH, &(self.header.len() as u32).to_le_bytes());
        put(state_offsets::HEADER, &self.header);

        let checksum = crc32fast::hash(&page[..page_size - CHECKSUM_SIZE]);
        page[page_size - CHECKSUM_SIZE..].copy_from_slice(&checksum.to_le_bytes());
        cursor.put_bytes(0, &page);
        Ok(())
    }

    /// Decode a state page, or `None` if it is torn, blank or corrupt.
    pub fn read(cursor: &mut PageCursor) -> Option<Self> {
        let page_size = cursor.page_size();
        let page = retry_until_stable(cursor, |c| c.get_vec(0, page_size)).ok()?;

        let u32_at = |offset: usize| u32::from_le_bytes([page[offset], page[offset + 1], page[offset + 2], page[offset + 3]]);
        let u64_at = |offset: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&page[offset..offset + 8]);
            u64::from_le_bytes(buf)
        };

        let stored = u32_at(page_size - CHECKSUM_SIZE);
        if crc32fast::hash(&page[..page_size - CHECKSUM_SIZE]) != stored {
            return None;
        }
        let generation = Generation::new(u32_at(state_offsets::STABLE), u32_at(state_offsets::UNSTABLE));
        if generation.stable < MIN_GENERATION || generation.unstable <= generation.stable {
            return None;
        }
        let header_length = u32_at(state_offsets::HEADER_LENGTH) as usize;
        if header_length > header_cap(page_size) {
            return None;
        }

        Some(Self {
            generation,
            root_id: u64_at(state_offsets::ROOT_ID),
            root_generation: u32_at(state_offsets::ROOT_GENERATION),
            free_list: FreeListState {
                last_id: u64_at(state_offsets::LAST_ID),
                write_page: u64_at(state_offsets::FREE_LIST_WRITE_PAGE),
                read_page: u64_at(state_offsets::FREE_LIST_READ_PAGE),
                write_pos: u32_at(state_offsets::FREE_LIST_WRITE_POS) as usize,
                read_pos: u32_at(state_offsets::FREE_LIST_READ_POS) as usize,
            },
            clean: page[state_offsets::CLEAN] != 0,
            header: page[state_offsets::HEADER..state_offsets::HEADER + header_length].to_vec(),
        })
    }

    /// Whether `self` supersedes `other`.
    fn is_newer_than(&self, other: &Self) -> bool {
        let own = (self.generation.stable, self.generation.unstable);
        let theirs = (other.generation.stable, other.generation.unstable);
        own > theirs || (own == theirs && self.clean && !other.clean)
    }
}

/// The state slot not currently holding the newest state.
#[must_use]
pub const fn other_slot(slot: PageId) -> PageId {
    if slot == STATE_PAGE_A {
        STATE_PAGE_B
    } else {
        STATE_PAGE_A
    }
}

/// Read the meta page.
pub fn read_meta(file: &PagedFile) -> Result<Meta, MetadataError> {
    let mut cursor = file.io(PfFlags::SharedRead).map_err(|_| MetadataError::EmptyFile)?;
    if !cursor.next(META_PAGE_ID).map_err(|_| MetadataError::EmptyFile)? {
        return Err(MetadataError::EmptyFile);
    }
    // The meta page is never written after creation.
    Meta::read(&mut cursor)
}

pub fn write_meta(file: &PagedFile, meta: &Meta) -> Result<(), TreeError> {
    let mut cursor = file.io(PfFlags::ExclusiveWrite)?;
    cursor.next(META_PAGE_ID)?;
    meta.write(&mut cursor);
    Ok(())
}

/// Read both state pages and return the newest valid one with its slot.
pub fn read_newest_state(file: &PagedFile) -> Result<(TreeState, PageId), MetadataError> {
    let mut newest: Option<(TreeState, PageId)> = None;
    for slot in [STATE_PAGE_A, STATE_PAGE_B] {
        let mut cursor = file.io(PfFlags::SharedRead).map_err(|_| MetadataError::NoValidState)?;
        let pinned = cursor.next(slot).map_err(|_| MetadataError::NoValidState)?;
        let Some(state) = pinned.then(|| TreeState::read(&mut cursor)).flatten() else {
            tracing::warn!("state page {slot} of {} is not valid, skipping", file.path().display());
            continue;
        };
        newest = match newest {
            Some((current, current_slot)) if !state.is_newer_than(&current) => Some((current, current_slot)),
            _ => Some((state, slot)),
        };
    }
    newest.ok_or(MetadataError::NoValidState)
}

pub fn write_state(file: &PagedFile, slot: PageId, state: &TreeState) -> Result<(), TreeError> {
    let mut cursor = file.io(PfFlags::ExclusiveWrite)?;
    cursor.next(slot)?;
    state.write(&mut cursor)
}
