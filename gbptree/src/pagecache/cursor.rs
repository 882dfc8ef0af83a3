//! Page cursors.

// Offsets are bounded by the page size, which is far below u32::MAX.
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use super::paged_file::{Frame, PageCacheError, PagedFile, PfFlags};
use super::PageId;

/// A cursor over the pages of a [`PagedFile`].
///
/// A cursor pins at most one page at a time. All accessors take explicit
/// byte offsets within the pinned page. Accesses outside the page, or through
/// an unpinned cursor, never panic: reads return zero and a bounds flag is
/// raised, to be checked with [`PageCursor::check_and_clear_bounds_flag`].
pub struct PageCursor {
    file: PagedFile,
    flags: PfFlags,
    current: Option<(PageId, Arc<Frame>)>,
    version: u64,
    out_of_bounds: bool,
    error: Option<String>,
}

impl PageCursor {
    pub(crate) const fn new(file: PagedFile, flags: PfFlags) -> Self {
        Self {
            file,
            flags,
            current: None,
            version: 0,
            out_of_bounds: false,
            error: None,
        }
    }

    /// Pin `page_id`, unpinning the previous page.
    ///
    /// Write cursors grow the file when `page_id` is past the end. Read
    /// cursors return `false` and stay unpinned in that case.
    pub fn next(&mut self, page_id: PageId) -> Result<bool, PageCacheError> {
        self.file.ensure_open()?;
        self.unpin();
        let frame = match self.flags {
            PfFlags::ExclusiveWrite => {
                let frame = self.file.frame_or_grow(page_id)?;
                frame.begin_write();
                frame
            }
            PfFlags::SharedRead => match self.file.frame(page_id) {
                Some(frame) => {
                    self.version = frame.version();
                    frame
                }
                None => return Ok(false),
            },
        };
        self.current = Some((page_id, frame));
        Ok(true)
    }

    /// Id of the pinned page.
    #[must_use]
    pub fn current_page_id(&self) -> Option<PageId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    #[must_use]
    pub const fn flags(&self) -> PfFlags {
        self.flags
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.file.page_size()
    }

    #[must_use]
    pub const fn paged_file(&self) -> &PagedFile {
        &self.file
    }

    /// Whether the page changed since it was pinned or since the last retry.
    ///
    /// Always `false` for write cursors. When `true`, the read must be
    /// redone; the cursor is re-armed against the current page version.
    pub fn should_retry(&mut self) -> bool {
        if self.flags == PfFlags::ExclusiveWrite {
            return false;
        }
        let Some((_, frame)) = &self.current else {
            return false;
        };
        let now = frame.version();
        if now == self.version && now & 1 == 0 {
            return false;
        }
        if now & 1 == 1 {
            std::thread::yield_now();
        }
        self.version = frame.version();
        true
    }

    /// Record an error to surface after the current read has settled.
    pub fn set_cursor_error(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    /// Return and clear a recorded cursor error.
    pub fn check_and_clear_cursor_error(&mut self) -> Result<(), PageCacheError> {
        match self.error.take() {
            Some(message) => Err(PageCacheError::Cursor(message)),
            None => Ok(()),
        }
    }

    /// Return and clear the bounds flag.
    pub const fn check_and_clear_bounds_flag(&mut self) -> bool {
        let flag = self.out_of_bounds;
        self.out_of_bounds = false;
        flag
    }

    /// Clear both the bounds flag and any cursor error.
    pub fn clear_flags(&mut self) {
        self.out_of_bounds = false;
        self.error = None;
    }

    /// Open another cursor on the same file, pinned to `page_id`.
    ///
    /// A read cursor whose page lies past the end of the file comes back
    /// unpinned.
    pub fn open_linked_cursor(
        &self,
        page_id: PageId,
        flags: PfFlags,
    ) -> Result<Self, PageCacheError> {
        let mut cursor = self.file.io(flags)?;
        cursor.next(page_id)?;
        Ok(cursor)
    }

    pub fn get_u8(&mut self, offset: usize) -> u8 {
        self.read_with(offset, 1, 0, |b| b[0])
    }

    pub fn get_u16(&mut self, offset: usize) -> u16 {
        self.read_with(offset, 2, 0, |b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self, offset: usize) -> u32 {
        self.read_with(offset, 4, 0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a 6-byte little-endian integer.
    pub fn get_u48(&mut self, offset: usize) -> u64 {
        self.read_with(offset, 6, 0, |b| {
            let mut buf = [0u8; 8];
            buf[..6].copy_from_slice(b);
            u64::from_le_bytes(buf)
        })
    }

    pub fn get_u64(&mut self, offset: usize) -> u64 {
        self.read_with(offset, 8, 0, |b| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(b);
            u64::from_le_bytes(buf)
        })
    }

    /// Fill `out` with bytes starting at `offset`.
    pub fn get_bytes(&mut self, offset: usize, out: &mut [u8]) {
        let len = out.len();
        let copied = self.read_with(offset, len, false, |b| {
            out.copy_from_slice(b);
            true
        });
        if !copied {
            out.fill(0);
        }
    }

    /// Read `len` bytes starting at `offset` into a new vector.
    pub fn get_vec(&mut self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.get_bytes(offset, &mut out);
        out
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) {
        self.write_with(offset, 1, |b| b[0] = value);
    }

    pub fn put_u16(&mut self, offset: usize, value: u16) {
        self.write_with(offset, 2, |b| b.copy_from_slice(&value.to_le_bytes()));
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) {
        self.write_with(offset, 4, |b| b.copy_from_slice(&value.to_le_bytes()));
    }

    /// Write the low 6 bytes of `value`, little-endian.
    pub fn put_u48(&mut self, offset: usize, value: u64) {
        self.write_with(offset, 6, |b| b.copy_from_slice(&value.to_le_bytes()[..6]));
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) {
        self.write_with(offset, 8, |b| b.copy_from_slice(&value.to_le_bytes()));
    }

    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.write_with(offset, bytes.len(), |b| b.copy_from_slice(bytes));
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&mut self, offset: usize, len: usize) {
        self.write_with(offset, len, |b| b.fill(0));
    }

    /// Copy `len` bytes from this cursor's page into `dst`'s page.
    pub fn copy_to(&mut self, src_offset: usize, dst: &mut Self, dst_offset: usize, len: usize) {
        let bytes = self.get_vec(src_offset, len);
        dst.put_bytes(dst_offset, &bytes);
    }

    /// Move `len` bytes at `offset` by `shift` bytes within the pinned page.
    pub fn shift_bytes(&mut self, offset: usize, len: usize, shift: isize) {
        let Some(target) = offset.checked_add_signed(shift) else {
            self.out_of_bounds = true;
            return;
        };
        let end = offset.max(target).checked_add(len);
        let page_size = self.page_size();
        let moved = self.write_with(0, page_size, |page| match end {
            Some(end) if end <= page.len() => {
                page.copy_within(offset..offset + len, target);
                true
            }
            _ => false,
        });
        if moved == Some(false) {
            self.out_of_bounds = true;
        }
    }

    fn read_with<T>(&mut self, offset: usize, len: usize, default: T, f: impl FnOnce(&[u8]) -> T) -> T {
        let Some((_, frame)) = &self.current else {
            self.out_of_bounds = true;
            return default;
        };
        let data = frame.data();
        match offset.checked_add(len).and_then(|end| data.get(offset..end)) {
            Some(bytes) => f(bytes),
            None => {
                self.out_of_bounds = true;
                default
            }
        }
    }

    fn write_with<T>(&mut self, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> T) -> Option<T> {
        if self.flags != PfFlags::ExclusiveWrite {
            self.set_cursor_error("write through a shared-read cursor");
            return None;
        }
        let Some((_, frame)) = &self.current else {
            self.out_of_bounds = true;
            return None;
        };
        let mut data = frame.data_mut();
        match offset.checked_add(len).and_then(|end| data.get_mut(offset..end)) {
            Some(bytes) => Some(f(bytes)),
            None => {
                self.out_of_bounds = true;
                None
            }
        }
    }

    fn unpin(&mut self) {
        if let Some((_, frame)) = self.current.take() {
            if self.flags == PfFlags::ExclusiveWrite {
                frame.end_write();
            }
        }
    }
}

impl Drop for PageCursor {
    fn drop(&mut self) {
        self.unpin();
    }
}

impl std::fmt::Debug for PageCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCursor")
            .field("flags", &self.flags)
            .field("page_id", &self.current_page_id())
            .finish_non_exhaustive()
    }
}

/// Run `read` until it completes without a concurrent write to the page.
///
/// Bounds violations and cursor errors raised during the final, stable read
/// are returned as errors; those raised during a discarded read are cleared.
pub fn retry_until_stable<T>(
    cursor: &mut PageCursor,
    mut read: impl FnMut(&mut PageCursor) -> T,
) -> Result<T, PageCacheError> {
    loop {
        let value = read(cursor);
        if cursor.should_retry() {
            cursor.clear_flags();
            continue;
        }
        if cursor.check_and_clear_bounds_flag() {
            return Err(PageCacheError::OutOfBounds {
                page_id: cursor.current_page_id(),
            });
        }
        cursor.check_and_clear_cursor_error()?;
        return Ok(value);
    }
}
