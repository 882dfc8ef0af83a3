//! Page-granular file mapping.
//!
//! All pages of the file are held in memory frames. Writes go to the frames
//! and only reach the disk on [`PagedFile::flush_and_force`]; dropping the
//! file without flushing loses them, which is exactly what a crash does.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::cursor::PageCursor;
use super::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, PageId};

/// Access intent of a page cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfFlags {
    /// Optimistic, lock-free reads validated with `should_retry`.
    SharedRead,
    /// Writes. Pinning a page marks it as being written until unpinned.
    ExclusiveWrite,
}

/// One in-memory page.
///
/// `version` is odd while at least one write cursor has the page pinned and
/// is bumped on every pin/unpin transition, so a reader that saw the same
/// even version before and after its read saw a consistent page.
pub(crate) struct Frame {
    data: RwLock<Box<[u8]>>,
    version: AtomicU64,
    writers: AtomicU32,
    dirty: AtomicBool,
}

impl Frame {
    fn new(data: Box<[u8]>, dirty: bool) -> Self {
        Self {
            data: RwLock::new(data),
            version: AtomicU64::new(0),
            writers: AtomicU32::new(0),
            dirty: AtomicBool::new(dirty),
        }
    }

    pub(crate) fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.dirty.store(true, Ordering::Release);
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn begin_write(&self) {
        if self.writers.fetch_add(1, Ordering::AcqRel) == 0 {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn end_write(&self) {
        if self.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }
}

struct Inner {
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
    frames: RwLock<Vec<Arc<Frame>>>,
    closed: AtomicBool,
}

/// A file mapped as fixed-size pages.
///
/// Cloning is cheap and yields another handle to the same mapping.
#[derive(Clone)]
pub struct PagedFile {
    inner: Arc<Inner>,
}

impl PagedFile {
    /// Map the file at `path` with the given page size.
    ///
    /// With `create` the file is created if missing. An existing file must
    /// have a length that is a whole number of pages.
    pub fn map(path: &Path, page_size: usize, create: bool) -> Result<Self, PageCacheError> {
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(PageCacheError::InvalidPageSize(page_size));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .map_err(PageCacheError::Io)?;

        let length = file.metadata().map_err(PageCacheError::Io)?.len();
        let page_size_u64 = page_size as u64;
        if length % page_size_u64 != 0 {
            return Err(PageCacheError::UnalignedFile { length, page_size });
        }

        let page_count = length / page_size_u64;
        let mut frames = Vec::new();
        file.seek(SeekFrom::Start(0)).map_err(PageCacheError::Io)?;
        for _ in 0..page_count {
            let mut buf = vec![0u8; page_size].into_boxed_slice();
            file.read_exact(&mut buf).map_err(PageCacheError::Io)?;
            frames.push(Arc::new(Frame::new(buf, false)));
        }

        tracing::debug!(
            "mapped {} with {page_count} pages of {page_size} bytes",
            path.display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                file: Mutex::new(file),
                page_size,
                frames: RwLock::new(frames),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open a cursor with the given intent. The cursor starts unpinned.
    pub fn io(&self, flags: PfFlags) -> Result<PageCursor, PageCacheError> {
        self.ensure_open()?;
        Ok(PageCursor::new(self.clone(), flags))
    }

    /// Page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Number of pages currently in the mapping.
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.frames().len() as u64
    }

    /// Path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Write all dirty pages to the file and fsync it.
    pub fn flush_and_force(&self) -> Result<(), PageCacheError> {
        self.ensure_open()?;
        let frames = self.frames().clone();
        let page_size = self.inner.page_size as u64;
        let mut file = self.inner.file.lock().unwrap_or_else(PoisonError::into_inner);

        let mut written = 0usize;
        for (page_id, frame) in frames.iter().enumerate() {
            if frame.dirty.swap(false, Ordering::AcqRel) {
                let data = frame.data();
                file.seek(SeekFrom::Start(page_id as u64 * page_size))
                    .map_err(PageCacheError::Io)?;
                file.write_all(&data).map_err(PageCacheError::Io)?;
                written += 1;
            }
        }
        file.sync_all().map_err(PageCacheError::Io)?;
        tracing::trace!("flushed {written} dirty pages");
        Ok(())
    }

    /// Close the mapping. Unflushed writes are discarded and further I/O fails.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub(crate) fn ensure_open(&self) -> Result<(), PageCacheError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(PageCacheError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn frame(&self, page_id: PageId) -> Option<Arc<Frame>> {
        let index = usize::try_from(page_id).ok()?;
        self.frames().get(index).map(Arc::clone)
    }

    /// Frame for `page_id`, growing the mapping with zeroed pages if needed.
    pub(crate) fn frame_or_grow(&self, page_id: PageId) -> Result<Arc<Frame>, PageCacheError> {
        if let Some(frame) = self.frame(page_id) {
            return Ok(frame);
        }
        let index = usize::try_from(page_id).map_err(|_| PageCacheError::PageOutOfRange(page_id))?;
        let mut frames = self.inner.frames.write().unwrap_or_else(PoisonError::into_inner);
        let old_len = frames.len();
        while frames.len() <= index {
            let zeroed = vec![0u8; self.inner.page_size].into_boxed_slice();
            frames.push(Arc::new(Frame::new(zeroed, true)));
        }
        if frames.len() > old_len {
            tracing::debug!("grew paged file from {old_len} to {} pages", frames.len());
        }
        Ok(Arc::clone(&frames[index]))
    }

    fn frames(&self) -> RwLockReadGuard<'_, Vec<Arc<Frame>>> {
        self.inner.frames.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedFile")
            .field("path", &self.inner.path)
            .field("page_size", &self.inner.page_size)
            .field("page_count", &self.page_count())
            .finish_non_exhaustive()
    }
}

/// Errors raised by the paged file and its cursors.
#[derive(Debug)]
pub enum PageCacheError {
    /// I/O error.
    Io(std::io::Error),
    /// Page size is not a supported power of two.
    InvalidPageSize(usize),
    /// File length is not a multiple of the page size.
    UnalignedFile { length: u64, page_size: usize },
    /// The mapping was closed.
    Closed,
    /// Page id cannot be addressed.
    PageOutOfRange(PageId),
    /// A read or write went past the page boundary.
    OutOfBounds { page_id: Option<PageId> },
    /// A deferred error raised through `set_cursor_error`.
    Cursor(String),
}

impl std::fmt::Display for PageCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidPageSize(size) => write!(f, "invalid page size: {size}"),
            Self::UnalignedFile { length, page_size } => write!(
                f,
                "file length {length} is not a multiple of page size {page_size}"
            ),
            Self::Closed => write!(f, "paged file is closed"),
            Self::PageOutOfRange(page_id) => write!(f, "page {page_id} cannot be addressed"),
            Self::OutOfBounds { page_id } => match page_id {
                Some(id) => write!(f, "access out of bounds on page {id}"),
                None => write!(f, "access through an unpinned cursor"),
            },
            Self::Cursor(message) => write!(f, "cursor error: {message}"),
        }
    }
}

impl std::error::Error for PageCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PageCacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_map_creates_empty_file() {
        let dir = tempdir().expect("failed to create temp dir");
        let path = dir.path().join("pages.db");

        let file = PagedFile::map(&path, 512, true).expect("failed to map");
        assert_eq!(file.page_count(), 0);
        assert_eq!(file.page_size(), 512);
        assert!(path.exists());
    }

    #[test]
    fn test_map_missing_file_without_create_fails() {
        let dir = tempdir().expect("failed to create temp dir");
        let result = PagedFile::map(&dir.path().join("missing.db"), 512, false);
        assert!(matches!(result, Err(PageCacheError::Io(_))));
    }

    #[test]
    fn test_map_rejects_invalid_page_size() {
        let dir = tempdir().expect("failed to create temp dir");
        let result = PagedFile::map(&dir.path().join("pages.db"), 1000, true);
        assert!(matches!(result, Err(PageCacheError::InvalidPageSize(1000))));
    }

    #[test]
    fn test_map_rejects_unaligned_file() {
        let dir = tempdir().expect("failed to create temp dir");
        let path = dir.path().join("pages.db");
        std::fs::write(&path, [0u8; 700]).expect("failed to write");

        let result = PagedFile::map(&path, 512, false);
        assert!(matches!(
            result,
            Err(PageCacheError::UnalignedFile { length: 700, page_size: 512 })
        ));
    }

    #[test]
    fn test_flush_persists_and_unflushed_writes_are_lost() {
        let dir = tempdir().expect("failed to create temp dir");
        let path = dir.path().join("pages.db");

        {
            let file = PagedFile::map(&path, 512, true).expect("failed to map");
            let mut cursor = file.io(PfFlags::ExclusiveWrite).expect("io");
            assert!(cursor.next(1).expect("next"));
            cursor.put_u64(8, 0xABCD);
            drop(cursor);
            file.flush_and_force().expect("flush");

            let mut cursor = file.io(PfFlags::ExclusiveWrite).expect("io");
            assert!(cursor.next(1).expect("next"));
            cursor.put_u64(8, 0x1234);
            // dropped without flush
        }

        let file = PagedFile::map(&path, 512, false).expect("failed to remap");
        assert_eq!(file.page_count(), 2);
        let mut cursor = file.io(PfFlags::SharedRead).expect("io");
        assert!(cursor.next(1).expect("next"));
        assert_eq!(cursor.get_u64(8), 0xABCD);
    }

    #[test]
    fn test_closed_file_rejects_io() {
        let dir = tempdir().expect("failed to create temp dir");
        let file = PagedFile::map(&dir.path().join("pages.db"), 512, true).expect("failed to map");
        file.close();
        assert!(matches!(file.io(PfFlags::SharedRead), Err(PageCacheError::Closed)));
        assert!(matches!(file.flush_and_force(), Err(PageCacheError::Closed)));
    }
}
