//! Generation-aware, crash-recoverable B+tree.
//!
//! # File Format
//!
//! - Page 0: meta page (magic, format version, page size, layout)
//! - Pages 1 and 2: state pages A and B, written alternately by checkpoints
//! - Page 3: first free-list page
//! - Page 4: initial root leaf
//! - Remaining pages: tree nodes, offload pages and free-list pages
//!
//! # Generations
//!
//! Every write is stamped with the unstable generation. A checkpoint flushes
//! all pages, records the current root and free list in the older state page
//! and then promotes the unstable generation to stable. Nodes from a stable
//! generation are never modified in place; a write to one first copies it
//! into a successor. After a crash the tree reopens from the newest state
//! page and everything written since that checkpoint is ignored, then erased
//! by the crash cleaner.
//!
//! # Concurrency
//!
//! One [`Writer`] at a time, any number of [`Seeker`]s. Seekers take no
//! locks; checkpoints wait for the writer.
//!
//! # Usage
//!
//! ```ignore
//! let tree = GBPTree::open(&path, U64Layout, TreeConfig::default(), None)?;
//! {
//!     let mut writer = tree.writer()?;
//!     writer.put(&1, &100)?;
//! }
//! tree.checkpoint()?;
//! for entry in tree.seek(0, 10)? {
//!     let (key, value) = entry?;
//! }
//! tree.close()?;
//! ```

pub mod cleaner;
pub mod consistency;
pub mod error;
pub mod freelist;
pub mod generation;
pub mod layout;
pub mod logic;
pub mod merger;
pub mod node;
pub mod pointer;
pub mod seek;
pub mod state;
pub mod structure;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

pub use cleaner::CleanupSummary;
pub use consistency::{ConsistencyIssue, ConsistencyVisitor, TreeStats};
pub use error::{MetadataError, TreeError, TreeInconsistency};
pub use generation::Generation;
pub use layout::{BytesLayout, Layout, U64Layout};
pub use logic::Root;
pub use merger::{KeepExisting, MergeOutcome, Overwrite, ValueMerger};
pub use seek::Seeker;

use crate::config::{CleanupMode, TreeConfig};
use crate::pagecache::{MIN_PAGE_SIZE, PageId, PagedFile, PfFlags};
use consistency::LoggingVisitor;
use freelist::FreeList;
use generation::{AtomicGeneration, MIN_GENERATION};
use logic::{Allocator, TreeLogic};
use node::{TreeNode, format_for};
use seek::RootSource;
use state::{Meta, STATE_PAGE_A, STATE_PAGE_B, TreeState, other_slot};

/// First page of the free list in a new tree.
const FREE_LIST_FIRST_PAGE: PageId = 3;

/// Root leaf of a new tree.
const INITIAL_ROOT: PageId = 4;

/// Crash cleanup progress.
#[derive(Debug, Clone)]
enum Cleanup {
    /// Nothing to clean.
    NotNeeded,
    /// Unclean shutdown detected, cleaner not run yet.
    Pending,
    Done,
    /// The cleaner failed. Nothing may be written or checkpointed.
    Failed(String),
}

/// State owned by whoever holds the writer lock.
struct WriterState<L: Layout> {
    logic: TreeLogic<L>,
    free_list: FreeList,
    root: Root,
    /// Something was written since the last checkpoint.
    changed: bool,
    /// State page holding the newest state.
    state_slot: PageId,
}

struct TreeInner<L: Layout> {
    file: PagedFile,
    layout: Arc<L>,
    node: Arc<dyn TreeNode<L>>,
    config: TreeConfig,
    generation: AtomicGeneration,
    /// Root as last published by the writer.
    root: RwLock<Root>,
    writer: Mutex<WriterState<L>>,
    cleanup: Mutex<Cleanup>,
    header: Mutex<Vec<u8>>,
    dirty_on_startup: bool,
    closed: AtomicBool,
}

impl<L: Layout> RootSource for TreeInner<L> {
    fn current(&self) -> (Root, Generation) {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        (*root, self.generation.load())
    }
}

impl<L: Layout> TreeInner<L> {
    fn lock_writer(&self) -> MutexGuard<'_, WriterState<L>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cleanup(&self) -> MutexGuard<'_, Cleanup> {
        self.cleanup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_root(&self, root: Root) {
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = root;
    }

    fn ensure_writable(&self) -> Result<(), TreeError> {
        if self.config.read_only {
            return Err(TreeError::ReadOnly);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TreeError> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(TreeError::TreeClosed);
        }
        Ok(())
    }

    /// Run the crash cleaner if it is pending. The writer lock must be held.
    ///
    /// Fails with `CleanupFailed` if this or an earlier run failed.
    fn run_pending_cleanup(
        &self,
        writer: &WriterState<L>,
        cleanup: &mut Cleanup,
    ) -> Result<Option<CleanupSummary>, TreeError> {
        match cleanup {
            Cleanup::Pending => {}
            Cleanup::Failed(message) => return Err(TreeError::CleanupFailed(message.clone())),
            Cleanup::NotNeeded | Cleanup::Done => return Ok(None),
        }
        let generation = self.generation.load();
        match cleaner::clean(&self.file, self.node.as_ref(), generation, writer.free_list.last_id()) {
            Ok(summary) => {
                tracing::info!(
                    "crash cleanup of {}: {} slots in {} of {} nodes cleaned in {:?}",
                    self.file.path().display(),
                    summary.slots_cleaned,
                    summary.nodes_cleaned,
                    summary.tree_nodes,
                    summary.elapsed
                );
                *cleanup = Cleanup::Done;
                Ok(Some(summary))
            }
            Err(e) => {
                tracing::error!("crash cleanup of {} failed: {e}", self.file.path().display());
                *cleanup = Cleanup::Failed(e.to_string());
                Err(TreeError::CleanupFailed(e.to_string()))
            }
        }
    }

    fn check(&self, visitor: &mut dyn ConsistencyVisitor) -> Result<consistency::CheckReport, TreeError> {
        self.ensure_open()?;
        let writer = self.lock_writer();
        consistency::check(
            &self.file,
            self.node.as_ref(),
            self.layout.as_ref(),
            writer.root,
            self.generation.load(),
            &writer.free_list,
            visitor,
        )
    }
}

/// A generation-aware B+tree stored in one file.
///
/// Handles are cheap to clone and share the same tree.
pub struct GBPTree<L: Layout> {
    inner: Arc<TreeInner<L>>,
}

impl<L: Layout> Clone for GBPTree<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Layout> std::fmt::Debug for GBPTree<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GBPTree")
            .field("path", &self.inner.file.path())
            .field("generation", &self.inner.generation.load())
            .field("read_only", &self.inner.config.read_only)
            .finish_non_exhaustive()
    }
}

impl<L: Layout> GBPTree<L> {
    /// Open the tree at `path`, creating it if the file is missing or empty.
    ///
    /// `header` is stored with a newly created tree and ignored otherwise.
    pub fn open(path: &Path, layout: L, config: TreeConfig, header: Option<&[u8]>) -> Result<Self, TreeError> {
        config.validate()?;
        let layout = Arc::new(layout);
        let node = format_for(Arc::clone(&layout), config.page_size);
        let expected = Meta::for_layout(layout.as_ref(), config.page_size, node.format());

        let existing = std::fs::metadata(path).is_ok_and(|m| m.len() > 0);
        let inner = if existing {
            Self::load(path, layout, node, config, &expected)?
        } else if config.read_only {
            return Err(MetadataError::EmptyFile.into());
        } else {
            Self::create(path, layout, node, config, &expected, header.unwrap_or_default())?
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    fn create(
        path: &Path,
        layout: Arc<L>,
        node: Arc<dyn TreeNode<L>>,
        config: TreeConfig,
        meta: &Meta,
        header: &[u8],
    ) -> Result<TreeInner<L>, TreeError> {
        let file = PagedFile::map(path, config.page_size, true)?;
        state::write_meta(&file, meta)?;

        let generation = Generation::new(MIN_GENERATION, MIN_GENERATION + 1);
        let free_list = FreeList::create(&file, FREE_LIST_FIRST_PAGE, INITIAL_ROOT)?;
        {
            let mut cursor = file.io(PfFlags::ExclusiveWrite)?;
            cursor.next(INITIAL_ROOT)?;
            node.initialize(&mut cursor, true, generation.stable);
        }
        let root = Root {
            id: INITIAL_ROOT,
            generation: generation.stable,
        };
        let tree_state = TreeState {
            generation,
            root_id: root.id,
            root_generation: root.generation,
            free_list: free_list.state(),
            clean: true,
            header: header.to_vec(),
        };
        state::write_state(&file, STATE_PAGE_A, &tree_state)?;

        // Run one generation past the created state, recorded as not clean,
        // so a crash before the first checkpoint is detected on the next open.
        let generation = Generation::new(generation.stable, generation.unstable + 1);
        let opened = TreeState {
            generation,
            clean: false,
            ..tree_state
        };
        state::write_state(&file, STATE_PAGE_B, &opened)?;
        file.flush_and_force()?;

        tracing::info!(
            "created tree {} with {} byte pages ({:?} nodes)",
            path.display(),
            config.page_size,
            node.format()
        );

        Ok(Self::assemble(
            file,
            layout,
            node,
            config,
            generation,
            root,
            free_list,
            STATE_PAGE_B,
            header.to_vec(),
            Cleanup::NotNeeded,
            false,
        ))
    }

    fn load(
        path: &Path,
        layout: Arc<L>,
        node: Arc<dyn TreeNode<L>>,
        config: TreeConfig,
        expected: &Meta,
    ) -> Result<TreeInner<L>, TreeError> {
        // Every supported page size is a multiple of the smallest, so the
        // meta page can be read before the real page size is known.
        {
            let meta_file = PagedFile::map(path, MIN_PAGE_SIZE, false)?;
            let stored = state::read_meta(&meta_file)?;
            stored.verify(expected)?;
        }

        let file = PagedFile::map(path, config.page_size, false)?;
        let (stored, slot) = state::read_newest_state(&file)?;
        let dirty = !stored.clean;
        let generation = Generation::new(stored.generation.stable, stored.generation.unstable + 1);
        let root = Root {
            id: stored.root_id,
            generation: stored.root_generation,
        };
        let free_list = FreeList::restore(stored.free_list, config.page_size);

        let mut state_slot = slot;
        if !config.read_only {
            // Until the next checkpoint the tree on disk is not clean, and
            // the bumped generation must survive another crash.
            let opened = TreeState {
                generation,
                clean: false,
                ..stored.clone()
            };
            state_slot = other_slot(slot);
            state::write_state(&file, state_slot, &opened)?;
            file.flush_and_force()?;
        }

        if dirty {
            tracing::warn!(
                "tree {} was not shut down cleanly, crash generations {}..{} will be cleaned",
                path.display(),
                stored.generation.stable + 1,
                generation.unstable
            );
        }
        tracing::info!(
            "opened tree {} at generation {generation}, root {}{}",
            path.display(),
            root.id,
            if config.read_only { " (read-only)" } else { "" }
        );

        let cleanup = if dirty && !config.read_only {
            Cleanup::Pending
        } else {
            Cleanup::NotNeeded
        };
        let immediate = matches!(cleanup, Cleanup::Pending) && config.cleanup == CleanupMode::Immediate;
        let inner = Self::assemble(
            file,
            layout,
            node,
            config,
            generation,
            root,
            free_list,
            state_slot,
            stored.header,
            cleanup,
            dirty,
        );
        if immediate {
            let writer = inner.lock_writer();
            let mut cleanup = inner.lock_cleanup();
            // A failure is recorded and refuses later checkpoints.
            let _ = inner.run_pending_cleanup(&writer, &mut cleanup);
        }
        Ok(inner)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        file: PagedFile,
        layout: Arc<L>,
        node: Arc<dyn TreeNode<L>>,
        config: TreeConfig,
        generation: Generation,
        root: Root,
        free_list: FreeList,
        state_slot: PageId,
        header: Vec<u8>,
        cleanup: Cleanup,
        dirty_on_startup: bool,
    ) -> TreeInner<L> {
        let logic = TreeLogic::new(Arc::clone(&layout), Arc::clone(&node), file.clone(), config.split_ratio);
        TreeInner {
            file,
            layout,
            node,
            config,
            generation: AtomicGeneration::new(generation),
            root: RwLock::new(root),
            writer: Mutex::new(WriterState {
                logic,
                free_list,
                root,
                changed: false,
                state_slot,
            }),
            cleanup: Mutex::new(cleanup),
            header: Mutex::new(header),
            dirty_on_startup,
            closed: AtomicBool::new(false),
        }
    }

    /// Take the writer, waiting for the current one to finish.
    pub fn writer(&self) -> Result<Writer<'_, L>, TreeError> {
        self.inner.ensure_open()?;
        self.inner.ensure_writable()?;
        let state = self.inner.lock_writer();
        Writer::new(&self.inner, state)
    }

    /// Take the writer if nobody holds it.
    pub fn try_writer(&self) -> Result<Option<Writer<'_, L>>, TreeError> {
        self.inner.ensure_open()?;
        self.inner.ensure_writable()?;
        let state = match self.inner.writer.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(None),
        };
        Writer::new(&self.inner, state).map(Some)
    }

    /// Entries with keys from `from` (inclusive) to `to` (exclusive).
    ///
    /// With `from > to` the entries come in descending order.
    pub fn seek(&self, from: L::Key, to: L::Key) -> Result<Seeker<L>, TreeError> {
        self.inner.ensure_open()?;
        let source: Arc<dyn RootSource> = Arc::clone(&self.inner) as Arc<dyn RootSource>;
        Seeker::new(
            Arc::clone(&self.inner.node),
            Arc::clone(&self.inner.layout),
            source,
            &self.inner.file,
            from,
            to,
            self.inner.config.read_ahead,
        )
    }

    /// Make everything written so far durable.
    pub fn checkpoint(&self) -> Result<(), TreeError> {
        self.checkpoint_inner(None)
    }

    /// Checkpoint and replace the stored header with `header`.
    pub fn checkpoint_with_header(&self, header: &[u8]) -> Result<(), TreeError> {
        self.checkpoint_inner(Some(header))
    }

    fn checkpoint_inner(&self, header: Option<&[u8]>) -> Result<(), TreeError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.ensure_writable()?;
        if let Some(header) = header {
            let cap = state::header_cap(inner.config.page_size);
            if header.len() > cap {
                return Err(TreeError::HeaderTooLarge {
                    size: header.len(),
                    cap,
                });
            }
        }

        // Most dirty pages are written before the writer is blocked.
        inner.file.flush_and_force()?;

        let mut writer = inner.lock_writer();
        let mut cleanup = inner.lock_cleanup();
        inner.run_pending_cleanup(&writer, &mut cleanup)?;
        inner.file.flush_and_force()?;

        let mut stored_header = inner.header.lock().unwrap_or_else(PoisonError::into_inner);
        let next = inner.generation.load().checkpointed();
        let tree_state = TreeState {
            generation: next,
            root_id: writer.root.id,
            root_generation: writer.root.generation,
            free_list: writer.free_list.state(),
            clean: false,
            header: header.map_or_else(|| stored_header.clone(), <[u8]>::to_vec),
        };
        let slot = other_slot(writer.state_slot);
        state::write_state(&inner.file, slot, &tree_state)?;
        inner.file.flush_and_force()?;

        inner.generation.store(next);
        writer.state_slot = slot;
        writer.changed = false;
        writer.logic.clear_cache();
        *stored_header = tree_state.header;

        tracing::info!(
            "checkpointed {} at generation {next}, root {}",
            inner.file.path().display(),
            writer.root.id
        );
        Ok(())
    }

    /// Run a deferred crash cleanup now. Returns `None` if nothing was
    /// pending.
    pub fn cleanup(&self) -> Result<Option<CleanupSummary>, TreeError> {
        self.inner.ensure_open()?;
        self.inner.ensure_writable()?;
        let writer = self.inner.lock_writer();
        let mut cleanup = self.inner.lock_cleanup();
        self.inner.run_pending_cleanup(&writer, &mut cleanup)
    }

    /// Whether the last session ended without a clean close.
    #[must_use]
    pub fn was_dirty_on_startup(&self) -> bool {
        self.inner.dirty_on_startup
    }

    /// Header stored with the newest checkpoint.
    #[must_use]
    pub fn header(&self) -> Vec<u8> {
        self.inner.header.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.generation.load()
    }

    #[must_use]
    pub fn config(&self) -> &TreeConfig {
        &self.inner.config
    }

    /// Check the whole tree, logging every issue. Returns whether it is
    /// consistent.
    pub fn consistency_check(&self) -> Result<bool, TreeError> {
        self.consistency_check_with(&mut LoggingVisitor)
    }

    /// Check the whole tree, reporting every issue to `visitor`.
    pub fn consistency_check_with(&self, visitor: &mut dyn ConsistencyVisitor) -> Result<bool, TreeError> {
        Ok(self.inner.check(visitor)?.is_consistent())
    }

    /// Shape of the tree.
    pub fn stats(&self) -> Result<TreeStats, TreeError> {
        let mut ignored: Vec<ConsistencyIssue> = Vec::new();
        Ok(self.inner.check(&mut ignored)?.stats)
    }

    /// Close the tree.
    ///
    /// Nothing is flushed: writes since the last checkpoint are lost. When
    /// nothing was written since then the tree is marked clean, so the next
    /// open skips crash cleanup.
    pub fn close(self) -> Result<(), TreeError> {
        let inner = &self.inner;
        if inner.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        if !inner.config.read_only {
            let mut writer = inner.lock_writer();
            let cleanup = inner.lock_cleanup();
            let recovered = matches!(*cleanup, Cleanup::NotNeeded | Cleanup::Done);
            if !writer.changed && recovered {
                let root = writer.root;
                let tree_state = TreeState {
                    generation: inner.generation.load(),
                    root_id: root.id,
                    root_generation: root.generation,
                    free_list: writer.free_list.state(),
                    clean: true,
                    header: inner.header.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                };
                let slot = other_slot(writer.state_slot);
                state::write_state(&inner.file, slot, &tree_state)?;
                inner.file.flush_and_force()?;
                writer.state_slot = slot;
            } else {
                tracing::warn!(
                    "closing {} with changes since the last checkpoint, they will be discarded",
                    inner.file.path().display()
                );
            }
        }
        inner.file.close();
        tracing::info!("closed tree {}", inner.file.path().display());
        Ok(())
    }
}

#[cfg(test)]
impl<L: Layout> GBPTree<L> {
    /// Write every page out, as eviction would, then drop the tree without
    /// touching the state pages.
    pub(crate) fn crash_after_flush(self) {
        let _ = self.inner.file.flush_and_force();
    }
}

/// Exclusive write access to a tree. Dropping it releases the writer.
pub struct Writer<'a, L: Layout> {
    inner: &'a TreeInner<L>,
    state: MutexGuard<'a, WriterState<L>>,
}

impl<'a, L: Layout> Writer<'a, L> {
    fn new(inner: &'a TreeInner<L>, state: MutexGuard<'a, WriterState<L>>) -> Result<Self, TreeError> {
        {
            let mut cleanup = inner.lock_cleanup();
            inner.run_pending_cleanup(&state, &mut cleanup)?;
        }
        Ok(Self { inner, state })
    }

    /// Insert or overwrite.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<(), TreeError> {
        self.merge(key, value, &Overwrite)
    }

    /// Insert `value`, or combine it with the existing value through
    /// `merger`.
    pub fn merge(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
    ) -> Result<(), TreeError> {
        self.apply_put(key, value, merger, false)
    }

    /// Combine `value` with the existing value; do nothing if the key is
    /// absent.
    pub fn merge_if_exists(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
    ) -> Result<(), TreeError> {
        self.apply_put(key, value, merger, true)
    }

    /// Remove `key`, returning the value it had.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>, TreeError> {
        self.inner.ensure_open()?;
        let generation = self.inner.generation.load();
        let state = &mut *self.state;
        let mut alloc = Allocator::new(&self.inner.file, &mut state.free_list, generation);
        let result = state.logic.remove(key, &mut state.root, &mut alloc);
        state.changed = true;
        self.inner.publish_root(state.root);
        result
    }

    fn apply_put(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
        only_if_exists: bool,
    ) -> Result<(), TreeError> {
        self.inner.ensure_open()?;
        let generation = self.inner.generation.load();
        let state = &mut *self.state;
        let mut alloc = Allocator::new(&self.inner.file, &mut state.free_list, generation);
        let result = state
            .logic
            .put(key, value, merger, only_if_exists, &mut state.root, &mut alloc);
        state.changed = true;
        self.inner.publish_root(state.root);
        result
    }
}

impl<L: Layout> std::fmt::Debug for Writer<'_, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").field("root", &self.state.root).finish_non_exhaustive()
    }
}
