//! Paged file access.
//!
//! A [`PagedFile`] views a file as an array of fixed-size pages. Pages are
//! accessed through [`PageCursor`]s opened with either shared-read or
//! exclusive-write intent. Read cursors never block: a reader performs its
//! read, then asks [`PageCursor::should_retry`] whether a writer touched the
//! page in the meantime, and redoes the read if so. [`retry_until_stable`]
//! wraps that loop.

mod cursor;
mod paged_file;

pub use cursor::{PageCursor, retry_until_stable};
pub use paged_file::{PageCacheError, PagedFile, PfFlags};

/// A page identifier (0-indexed page number).
pub type PageId = u64;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 32768;
