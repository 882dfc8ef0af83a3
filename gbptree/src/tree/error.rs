//! Tree errors.

use crate::config::ConfigError;
use crate::pagecache::{PageCacheError, PageId};
use crate::tree::generation::Generation;
use crate::tree::pointer::PointerFailure;

/// Structural corruption found during a tree operation.
///
/// Carries the page and the generation pair at the time of detection so the
/// failure can be diagnosed without reproducing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInconsistency {
    pub page_id: PageId,
    pub message: String,
    pub generation: Generation,
}

impl TreeInconsistency {
    pub fn new(page_id: PageId, message: impl Into<String>, generation: Generation) -> Self {
        Self {
            page_id,
            message: message.into(),
            generation,
        }
    }

    #[must_use]
    pub fn pointer(page_id: PageId, what: &str, failure: &PointerFailure) -> Self {
        Self::new(page_id, format!("{what}: {failure}"), failure.generation)
    }
}

impl std::fmt::Display for TreeInconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tree inconsistency on page {}: {} ({})",
            self.page_id, self.message, self.generation
        )
    }
}

impl std::error::Error for TreeInconsistency {}

/// Problems with the meta or state pages, raised when opening a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// File exists but holds no pages.
    EmptyFile,
    /// Meta page does not start with the tree magic.
    InvalidMagic,
    /// Meta page written by an unknown format version.
    UnsupportedVersion(u32),
    /// File was created with another page size.
    PageSizeMismatch { expected: usize, actual: usize },
    /// File was created with another layout or node format.
    LayoutMismatch { expected: String, actual: String },
    /// Neither state page is valid.
    NoValidState,
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyFile => write!(f, "tree file is empty"),
            Self::InvalidMagic => write!(f, "invalid magic number"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::PageSizeMismatch { expected, actual } => write!(
                f,
                "page size mismatch: expected {expected}, file has {actual}"
            ),
            Self::LayoutMismatch { expected, actual } => {
                write!(f, "layout mismatch: expected {expected}, file has {actual}")
            }
            Self::NoValidState => write!(f, "no valid state page"),
        }
    }
}

impl std::error::Error for MetadataError {}

/// Errors returned by tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// Paged file failure.
    PageCache(PageCacheError),
    /// Meta or state pages are unusable.
    Metadata(MetadataError),
    /// Corrupt tree structure.
    Inconsistency(TreeInconsistency),
    /// Key and value together exceed what one page can hold.
    EntryTooLarge {
        key_size: usize,
        value_size: usize,
        cap: usize,
    },
    /// Header blob does not fit in a state page.
    HeaderTooLarge { size: usize, cap: usize },
    /// The crash cleaner failed; checkpoints are refused until reopen.
    CleanupFailed(String),
    /// Seek cursor used after close.
    CursorClosed,
    /// Tree used after close.
    TreeClosed,
    /// Write attempted on a read-only tree.
    ReadOnly,
    /// Invalid configuration.
    Config(ConfigError),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PageCache(e) => write!(f, "page cache error: {e}"),
            Self::Metadata(e) => write!(f, "metadata error: {e}"),
            Self::Inconsistency(e) => write!(f, "{e}"),
            Self::EntryTooLarge {
                key_size,
                value_size,
                cap,
            } => write!(
                f,
                "entry too large: key {key_size} + value {value_size} bytes exceeds cap of {cap}"
            ),
            Self::HeaderTooLarge { size, cap } => {
                write!(f, "header of {size} bytes exceeds cap of {cap}")
            }
            Self::CleanupFailed(message) => write!(f, "crash cleanup failed: {message}"),
            Self::CursorClosed => write!(f, "seek cursor is closed"),
            Self::TreeClosed => write!(f, "tree is closed"),
            Self::ReadOnly => write!(f, "tree is opened read-only"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PageCache(e) => Some(e),
            Self::Metadata(e) => Some(e),
            Self::Inconsistency(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::EntryTooLarge { .. }
            | Self::HeaderTooLarge { .. }
            | Self::CleanupFailed(_)
            | Self::CursorClosed
            | Self::TreeClosed
            | Self::ReadOnly => None,
        }
    }
}

impl From<PageCacheError> for TreeError {
    fn from(e: PageCacheError) -> Self {
        Self::PageCache(e)
    }
}

impl From<MetadataError> for TreeError {
    fn from(e: MetadataError) -> Self {
        Self::Metadata(e)
    }
}

impl From<TreeInconsistency> for TreeError {
    fn from(e: TreeInconsistency) -> Self {
        Self::Inconsistency(e)
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
