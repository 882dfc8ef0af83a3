//! Free list of released page ids.
//!
//! Released ids are queued on a chain of free-list pages. Each page holds a
//! link to the next page followed by `(generation, id)` entries:
//!
//! - byte 0: node type (free list)
//! - bytes 1-8: next free-list page id
//! - bytes 9..: entries of 12 bytes, generation `u32` then id `u64`
//!
//! Entries are appended at the write position and consumed at the read
//! position. An entry only becomes acquirable once the generation it was
//! released in is stable, so the last checkpointed tree never sees its pages
//! reused. Pages of the list itself are released once fully consumed.

use crate::pagecache::{PageCursor, PageId, PagedFile, PfFlags};
use crate::tree::error::{TreeError, TreeInconsistency};
use crate::tree::generation::Generation;
use crate::tree::node::header::NODE_TYPE_FREE_LIST;

mod offsets {
    pub const NODE_TYPE: usize = 0;
    pub const NEXT: usize = 1;
    pub const ENTRIES: usize = 9;
}

const ENTRY_SIZE: usize = 12;

/// Number of entries one free-list page holds.
#[must_use]
pub const fn entries_per_page(page_size: usize) -> usize {
    (page_size - offsets::ENTRIES) / ENTRY_SIZE
}

/// Persisted position of the free list, recorded in the state page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListState {
    pub last_id: PageId,
    pub write_page: PageId,
    pub write_pos: usize,
    pub read_page: PageId,
    pub read_pos: usize,
}

/// Something the free list accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeListItem {
    /// A page storing free-list entries.
    Page(PageId),
    /// A queued id, with the generation it was released in.
    Free { id: PageId, generation: u32 },
}

/// Allocator of page ids.
#[derive(Debug)]
pub struct FreeList {
    capacity: usize,
    state: FreeListState,
}

impl FreeList {
    /// Start an empty free list on `first_page`, with `last_id` as the
    /// highest id in use.
    pub fn create(file: &PagedFile, first_page: PageId, last_id: PageId) -> Result<Self, TreeError> {
        let mut cursor = file.io(PfFlags::ExclusiveWrite)?;
        cursor.next(first_page)?;
        initialize_page(&mut cursor);
        Ok(Self {
            capacity: entries_per_page(file.page_size()),
            state: FreeListState {
                last_id,
                write_page: first_page,
                write_pos: 0,
                read_page: first_page,
                read_pos: 0,
            },
        })
    }

    #[must_use]
    pub const fn restore(state: FreeListState, page_size: usize) -> Self {
        Self {
            capacity: entries_per_page(page_size),
            state,
        }
    }

    #[must_use]
    pub const fn state(&self) -> FreeListState {
        self.state
    }

    /// Highest page id handed out so far.
    #[must_use]
    pub const fn last_id(&self) -> PageId {
        self.state.last_id
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.state.read_page == self.state.write_page && self.state.read_pos == self.state.write_pos
    }

    /// Hand out a page id: a queued id whose release is stable, or a new id
    /// past the end of the file.
    pub fn acquire(&mut self, file: &PagedFile, generation: Generation) -> Result<PageId, TreeError> {
        if self.is_empty() {
            return Ok(self.extend());
        }

        let mut cursor = self.open_page(file, self.state.read_page, generation)?;
        let offset = entry_offset(self.state.read_pos);
        let released_in = cursor.get_u32(offset);
        if released_in > generation.stable {
            return Ok(self.extend());
        }
        let id = cursor.get_u64(offset + 4);

        self.state.read_pos += 1;
        if self.state.read_pos == self.capacity {
            let consumed = self.state.read_page;
            self.state.read_page = cursor.get_u64(offsets::NEXT);
            self.state.read_pos = 0;
            drop(cursor);
            self.release(file, consumed, generation)?;
        }
        Ok(id)
    }

    /// Queue `id` for reuse once the current unstable generation is stable.
    pub fn release(&mut self, file: &PagedFile, id: PageId, generation: Generation) -> Result<(), TreeError> {
        let mut cursor = self.open_page(file, self.state.write_page, generation)?;
        let offset = entry_offset(self.state.write_pos);
        cursor.put_u32(offset, generation.unstable);
        cursor.put_u64(offset + 4, id);

        self.state.write_pos += 1;
        if self.state.write_pos == self.capacity {
            let next = self.extend();
            cursor.put_u64(offsets::NEXT, next);
            cursor.next(next)?;
            initialize_page(&mut cursor);
            self.state.write_page = next;
            self.state.write_pos = 0;
        }
        Ok(())
    }

    /// Walk the free-list pages and queued ids using read cursors.
    pub fn visit(
        &self,
        file: &PagedFile,
        generation: Generation,
        mut visitor: impl FnMut(FreeListItem),
    ) -> Result<(), TreeError> {
        let mut cursor = file.io(PfFlags::SharedRead)?;
        let mut page = self.state.read_page;
        let mut pos = self.state.read_pos;
        loop {
            if !cursor.next(page)? {
                return Err(TreeInconsistency::new(page, "free-list page past end of file", generation).into());
            }
            visitor(FreeListItem::Page(page));
            let end = if page == self.state.write_page {
                self.state.write_pos
            } else {
                self.capacity
            };
            let (node_type, next, entries) = crate::pagecache::retry_until_stable(&mut cursor, |c| {
                let entries: Vec<(u32, PageId)> = (pos..end)
                    .map(|p| (c.get_u32(entry_offset(p)), c.get_u64(entry_offset(p) + 4)))
                    .collect();
                (c.get_u8(offsets::NODE_TYPE), c.get_u64(offsets::NEXT), entries)
            })?;
            if node_type != NODE_TYPE_FREE_LIST {
                return Err(TreeInconsistency::new(page, "expected a free-list page", generation).into());
            }
            for (released_in, id) in entries {
                visitor(FreeListItem::Free {
                    id,
                    generation: released_in,
                });
            }
            if page == self.state.write_page {
                return Ok(());
            }
            if next == page || next > self.state.last_id {
                return Err(TreeInconsistency::new(page, format!("free-list link to {next}"), generation).into());
            }
            page = next;
            pos = 0;
        }
    }

    const fn extend(&mut self) -> PageId {
        self.state.last_id += 1;
        self.state.last_id
    }

    fn open_page(&self, file: &PagedFile, page: PageId, generation: Generation) -> Result<PageCursor, TreeError> {
        let mut cursor = file.io(PfFlags::ExclusiveWrite)?;
        cursor.next(page)?;
        if cursor.get_u8(offsets::NODE_TYPE) != NODE_TYPE_FREE_LIST {
            return Err(TreeInconsistency::new(page, "expected a free-list page", generation).into());
        }
        Ok(cursor)
    }
}

const fn entry_offset(pos: usize) -> usize {
    offsets::ENTRIES + pos * ENTRY_SIZE
}

fn initialize_page(cursor: &mut PageCursor) {
    cursor.zero(0, offsets::ENTRIES);
    cursor.put_u8(offsets::NODE_TYPE, NODE_TYPE_FREE_LIST);
}
