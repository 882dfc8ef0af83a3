//! Offline verification of the whole tree.
//!
//! The checker walks the tree depth first, left to right, with read cursors
//! and reports every problem it finds to a [`ConsistencyVisitor`] instead of
//! failing on the first one. Besides per-node checks it keeps one sibling
//! chain per level and accounts for every page id between the first tree
//! page and the last allocated id: each must be reachable from the root, be
//! an offload page of a reachable entry, or be owned by the free list,
//! exactly once.

use std::cmp::Ordering;

use crate::pagecache::{PageCursor, PageId, PagedFile, PfFlags};
use crate::tree::error::TreeError;
use crate::tree::freelist::{FreeList, FreeListItem};
use crate::tree::generation::Generation;
use crate::tree::layout::Layout;
use crate::tree::logic::Root;
use crate::tree::node::header::{self, HeaderPointer};
use crate::tree::node::{SpaceBreakdown, TreeNode};
use crate::tree::pointer::{self, NO_NODE};

/// Lowest page id that can belong to the tree or the free list.
pub const FIRST_TREE_PAGE: PageId = 3;

/// A problem found by the consistency checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyIssue {
    /// A pointer pair that cannot be resolved in the current generation.
    Pointer { page_id: PageId, what: String, message: String },
    /// A pointer slot written in a generation that crashed.
    CrashedPointer { page_id: PageId, what: String },
    /// A reachable page that is not a tree node.
    NotATreeNode { page_id: PageId, node_type: u8 },
    UnreasonableKeyCount { page_id: PageId, key_count: usize },
    /// Key at `pos` is not greater than the key before it.
    KeysOutOfOrder { page_id: PageId, pos: usize },
    /// Key at `pos` lies outside the range given by the parent.
    KeyOutOfRange { page_id: PageId, pos: usize },
    /// A sibling pointer that does not match the neighbour on the level.
    SiblingMismatch {
        page_id: PageId,
        which: HeaderPointer,
        expected: PageId,
        actual: PageId,
    },
    /// A reachable node that has been replaced by a successor.
    UnexpectedSuccessor { page_id: PageId, successor: PageId },
    /// A node newer than the pointer leading to it.
    GenerationMismatch {
        page_id: PageId,
        node_generation: u32,
        pointer_generation: u32,
    },
    /// Dynamic node space accounting does not add up.
    SpaceMismatch { page_id: PageId, space: SpaceBreakdown },
    /// Leaves at different depths.
    UnevenDepth { page_id: PageId, depth: usize, expected: usize },
    /// A page that could not be read in full.
    Unreadable { page_id: PageId, message: String },
    /// A page id that nothing accounts for.
    UnusedPage { page_id: PageId },
    /// A page id accounted for more than once.
    DuplicatePage { page_id: PageId },
    /// A referenced page id beyond the last allocated id.
    PageOutOfRange { page_id: PageId, last_id: PageId },
    /// A free-list entry released in a future generation.
    FreeGenerationTooNew { page_id: PageId, generation: u32 },
}

impl std::fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pointer { page_id, what, message } => {
                write!(f, "page {page_id}: bad {what} pointer: {message}")
            }
            Self::CrashedPointer { page_id, what } => {
                write!(f, "page {page_id}: crashed {what} pointer")
            }
            Self::NotATreeNode { page_id, node_type } => {
                write!(f, "page {page_id}: node type {node_type} is not a tree node")
            }
            Self::UnreasonableKeyCount { page_id, key_count } => {
                write!(f, "page {page_id}: unreasonable key count {key_count}")
            }
            Self::KeysOutOfOrder { page_id, pos } => {
                write!(f, "page {page_id}: key {pos} out of order")
            }
            Self::KeyOutOfRange { page_id, pos } => {
                write!(f, "page {page_id}: key {pos} outside parent range")
            }
            Self::SiblingMismatch {
                page_id,
                which,
                expected,
                actual,
            } => write!(f, "page {page_id}: {which:?} is {actual}, expected {expected}"),
            Self::UnexpectedSuccessor { page_id, successor } => {
                write!(f, "page {page_id}: reachable node has successor {successor}")
            }
            Self::GenerationMismatch {
                page_id,
                node_generation,
                pointer_generation,
            } => write!(
                f,
                "page {page_id}: node generation {node_generation} newer than pointer generation {pointer_generation}"
            ),
            Self::SpaceMismatch { page_id, space } => write!(
                f,
                "page {page_id}: active {} + dead {} + alloc {} != total {}",
                space.active, space.dead, space.alloc, space.total
            ),
            Self::UnevenDepth {
                page_id,
                depth,
                expected,
            } => write!(f, "page {page_id}: leaf at depth {depth}, expected {expected}"),
            Self::Unreadable { page_id, message } => write!(f, "page {page_id}: {message}"),
            Self::UnusedPage { page_id } => write!(f, "page {page_id} is neither in the tree nor free"),
            Self::DuplicatePage { page_id } => write!(f, "page {page_id} is accounted for twice"),
            Self::PageOutOfRange { page_id, last_id } => {
                write!(f, "page {page_id} is beyond last id {last_id}")
            }
            Self::FreeGenerationTooNew { page_id, generation } => {
                write!(f, "free page {page_id} released in future generation {generation}")
            }
        }
    }
}

/// Receives the issues found by a consistency check.
pub trait ConsistencyVisitor {
    fn issue(&mut self, issue: ConsistencyIssue);
}

impl ConsistencyVisitor for Vec<ConsistencyIssue> {
    fn issue(&mut self, issue: ConsistencyIssue) {
        self.push(issue);
    }
}

/// Logs every issue and keeps nothing.
#[derive(Debug, Default)]
pub struct LoggingVisitor;

impl ConsistencyVisitor for LoggingVisitor {
    fn issue(&mut self, issue: ConsistencyIssue) {
        tracing::error!("consistency issue: {issue}");
    }
}

/// Shape of the tree, gathered during a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Internal levels above the leaves.
    pub height: usize,
    pub leaf_nodes: u64,
    pub internal_nodes: u64,
    pub entries: u64,
    pub offload_pages: u64,
    /// Ids queued on the free list.
    pub free_ids: u64,
    /// Pages holding free-list entries.
    pub free_list_pages: u64,
    pub last_id: PageId,
}

/// Outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub issues: usize,
    pub stats: TreeStats,
}

impl CheckReport {
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.issues == 0
    }
}

/// Check the tree rooted at `root`.
///
/// Errors are returned only when pages cannot be accessed at all; everything
/// else is reported to `visitor`.
pub fn check<L: Layout>(
    file: &PagedFile,
    node: &dyn TreeNode<L>,
    layout: &L,
    root: Root,
    generation: Generation,
    free_list: &FreeList,
    visitor: &mut dyn ConsistencyVisitor,
) -> Result<CheckReport, TreeError> {
    let last_id = free_list.last_id();
    let mut checker = Checker {
        node,
        layout,
        generation,
        visitor,
        cursor: file.io(PfFlags::SharedRead)?,
        last_id,
        seen: vec![0; usize::try_from(last_id + 1).unwrap_or(0)],
        levels: Vec::new(),
        leaf_depth: None,
        issues: 0,
        stats: TreeStats {
            last_id,
            ..TreeStats::default()
        },
    };

    checker.visit_node(root.id, root.generation, 0, None, None)?;
    checker.finish_levels();

    let mut free = Vec::new();
    free_list.visit(file, generation, |item| free.push(item))?;
    for item in free {
        match item {
            FreeListItem::Page(id) => {
                checker.stats.free_list_pages += 1;
                checker.mark(id);
            }
            FreeListItem::Free { id, generation: released } => {
                checker.stats.free_ids += 1;
                if released > generation.unstable {
                    checker.report(ConsistencyIssue::FreeGenerationTooNew {
                        page_id: id,
                        generation: released,
                    });
                }
                checker.mark(id);
            }
        }
    }
    checker.account_ids();

    Ok(CheckReport {
        issues: checker.issues,
        stats: checker.stats,
    })
}

struct Checker<'a, L: Layout> {
    node: &'a dyn TreeNode<L>,
    layout: &'a L,
    generation: Generation,
    visitor: &'a mut dyn ConsistencyVisitor,
    cursor: PageCursor,
    last_id: PageId,
    /// How many times each id was accounted for.
    seen: Vec<u8>,
    /// Per level: previous node visited and its right sibling.
    levels: Vec<Option<(PageId, PageId)>>,
    leaf_depth: Option<usize>,
    issues: usize,
    stats: TreeStats,
}

/// What the checker reads from one node before descending.
struct NodeSnapshot<K> {
    leaf: bool,
    keys: Vec<K>,
    offloads: Vec<PageId>,
    left: Option<PageId>,
    right: Option<PageId>,
    children: Vec<(PageId, u32)>,
}

impl<L: Layout> Checker<'_, L> {
    fn report(&mut self, issue: ConsistencyIssue) {
        self.issues += 1;
        self.visitor.issue(issue);
    }

    fn mark(&mut self, id: PageId) {
        if id > self.last_id || id < FIRST_TREE_PAGE {
            self.report(ConsistencyIssue::PageOutOfRange {
                page_id: id,
                last_id: self.last_id,
            });
            return;
        }
        let Ok(index) = usize::try_from(id) else { return };
        self.seen[index] = self.seen[index].saturating_add(1);
        if self.seen[index] == 2 {
            self.report(ConsistencyIssue::DuplicatePage { page_id: id });
        }
    }

    fn account_ids(&mut self) {
        for id in FIRST_TREE_PAGE..=self.last_id {
            let Ok(index) = usize::try_from(id) else { break };
            if self.seen[index] == 0 {
                self.report(ConsistencyIssue::UnusedPage { page_id: id });
            }
        }
    }

    fn visit_node(
        &mut self,
        id: PageId,
        pointer_generation: u32,
        depth: usize,
        lower: Option<&L::Key>,
        upper: Option<&L::Key>,
    ) -> Result<(), TreeError> {
        self.mark(id);
        if id > self.last_id || id < FIRST_TREE_PAGE {
            return Ok(());
        }
        let Some(snapshot) = self.read_node(id, pointer_generation, lower, upper)? else {
            return Ok(());
        };
        self.link_level(id, depth, snapshot.left, snapshot.right);
        for offload in &snapshot.offloads {
            self.stats.offload_pages += 1;
            self.mark(*offload);
        }

        if snapshot.leaf {
            self.stats.leaf_nodes += 1;
            self.stats.entries += snapshot.keys.len() as u64;
            match self.leaf_depth {
                None => {
                    self.leaf_depth = Some(depth);
                    self.stats.height = depth;
                }
                Some(expected) if expected != depth => self.report(ConsistencyIssue::UnevenDepth {
                    page_id: id,
                    depth,
                    expected,
                }),
                Some(_) => {}
            }
            return Ok(());
        }

        self.stats.internal_nodes += 1;
        for (pos, (child, child_generation)) in snapshot.children.iter().enumerate() {
            let child_lower = if pos == 0 { lower } else { snapshot.keys.get(pos - 1) };
            let child_upper = snapshot.keys.get(pos).or(upper);
            self.visit_node(*child, *child_generation, depth + 1, child_lower, child_upper)?;
        }
        Ok(())
    }

    /// Read and check one node. `None` if it cannot be descended into.
    fn read_node(
        &mut self,
        id: PageId,
        pointer_generation: u32,
        lower: Option<&L::Key>,
        upper: Option<&L::Key>,
    ) -> Result<Option<NodeSnapshot<L::Key>>, TreeError> {
        if !self.cursor.next(id)? {
            self.report(ConsistencyIssue::Unreadable {
                page_id: id,
                message: "page past end of file".to_string(),
            });
            return Ok(None);
        }
        let c = &mut self.cursor;
        let node_type = header::node_type(c);
        if node_type != header::NODE_TYPE_TREE_NODE {
            self.report(ConsistencyIssue::NotATreeNode { page_id: id, node_type });
            return Ok(None);
        }
        let c = &mut self.cursor;
        let leaf = header::is_leaf(c);
        let node_generation = header::generation(c);
        let key_count = header::key_count(c);
        if node_generation > pointer_generation {
            self.report(ConsistencyIssue::GenerationMismatch {
                page_id: id,
                node_generation,
                pointer_generation,
            });
        }
        if !self.node.reasonable_key_count(key_count, leaf) {
            self.report(ConsistencyIssue::UnreasonableKeyCount { page_id: id, key_count });
            return Ok(None);
        }

        let mut pointers = Vec::new();
        for which in HeaderPointer::ALL {
            let read = header::read_pointer(&mut self.cursor, which, self.generation);
            pointers.push(self.resolve(id, &format!("{which:?}"), which.offset(), read.map(|r| r.pointer)));
        }
        let (right, left, successor) = (pointers[0], pointers[1], pointers[2]);
        if let Some(successor) = successor.filter(|s| *s != NO_NODE) {
            self.report(ConsistencyIssue::UnexpectedSuccessor { page_id: id, successor });
        }

        let mut keys: Vec<L::Key> = Vec::with_capacity(key_count);
        let mut offloads = Vec::new();
        for pos in 0..key_count {
            let raw = self.node.raw_at(&mut self.cursor, pos, leaf);
            offloads.extend(raw.offload_id);
            keys.push(self.node.key_at(&mut self.cursor, pos, leaf));
        }
        if self.cursor.check_and_clear_bounds_flag() {
            self.report(ConsistencyIssue::Unreadable {
                page_id: id,
                message: "read past page bounds".to_string(),
            });
            return Ok(None);
        }
        if let Err(e) = self.cursor.check_and_clear_cursor_error() {
            self.report(ConsistencyIssue::Unreadable {
                page_id: id,
                message: e.to_string(),
            });
            return Ok(None);
        }
        self.check_keys(id, &keys, lower, upper);

        if let Some(space) = self.node.space_breakdown(&mut self.cursor, key_count, leaf) {
            if !space.is_consistent() {
                self.report(ConsistencyIssue::SpaceMismatch { page_id: id, space });
            }
        }

        let mut children = Vec::new();
        if !leaf {
            for pos in 0..=key_count {
                let offset = self.node.child_offset(pos);
                let read = self.node.child_at(&mut self.cursor, pos, self.generation);
                let generation = read.as_ref().map_or(0, |r| r.generation);
                match self.resolve(id, &format!("child {pos}"), offset, read.map(|r| r.pointer)) {
                    Some(NO_NODE) => self.report(ConsistencyIssue::Pointer {
                        page_id: id,
                        what: format!("child {pos}"),
                        message: "no child".to_string(),
                    }),
                    Some(child) => children.push((child, generation)),
                    None => return Ok(None),
                }
            }
        }

        Ok(Some(NodeSnapshot {
            leaf,
            keys,
            offloads,
            left,
            right,
            children,
        }))
    }

    /// Report a failed or crashed pointer read; the target if it resolved.
    fn resolve(
        &mut self,
        id: PageId,
        what: &str,
        offset: usize,
        read: Result<PageId, pointer::PointerFailure>,
    ) -> Option<PageId> {
        if pointer::has_crashed_slot(&mut self.cursor, offset, self.generation) {
            self.report(ConsistencyIssue::CrashedPointer {
                page_id: id,
                what: what.to_string(),
            });
        }
        match read {
            Ok(target) => Some(target),
            Err(failure) => {
                self.report(ConsistencyIssue::Pointer {
                    page_id: id,
                    what: what.to_string(),
                    message: failure.to_string(),
                });
                None
            }
        }
    }

    fn check_keys(&mut self, id: PageId, keys: &[L::Key], lower: Option<&L::Key>, upper: Option<&L::Key>) {
        for (pos, key) in keys.iter().enumerate() {
            if pos > 0 && self.layout.compare(&keys[pos - 1], key) != Ordering::Less {
                self.report(ConsistencyIssue::KeysOutOfOrder { page_id: id, pos });
            }
            let below = lower.is_some_and(|lower| self.layout.compare(key, lower) == Ordering::Less);
            let above = upper.is_some_and(|upper| self.layout.compare(key, upper) != Ordering::Less);
            if below || above {
                self.report(ConsistencyIssue::KeyOutOfRange { page_id: id, pos });
            }
        }
    }

    /// Check the sibling pointers of a node against the previous node on the
    /// same level.
    fn link_level(&mut self, id: PageId, depth: usize, left: Option<PageId>, right: Option<PageId>) {
        if self.levels.len() <= depth {
            self.levels.resize(depth + 1, None);
        }
        let previous = self.levels[depth];
        let expected_left = previous.map_or(NO_NODE, |(previous_id, _)| previous_id);
        if let Some((previous_id, previous_right)) = previous {
            if previous_right != id {
                self.report(ConsistencyIssue::SiblingMismatch {
                    page_id: previous_id,
                    which: HeaderPointer::RightSibling,
                    expected: id,
                    actual: previous_right,
                });
            }
        }
        if let Some(left) = left.filter(|left| *left != expected_left) {
            self.report(ConsistencyIssue::SiblingMismatch {
                page_id: id,
                which: HeaderPointer::LeftSibling,
                expected: expected_left,
                actual: left,
            });
        }
        self.levels[depth] = Some((id, right.unwrap_or(NO_NODE)));
    }

    /// The last node of every level must end the chain.
    fn finish_levels(&mut self) {
        let ends: Vec<_> = self.levels.iter().flatten().copied().collect();
        for (id, right) in ends {
            if right != NO_NODE {
                self.report(ConsistencyIssue::SiblingMismatch {
                    page_id: id,
                    which: HeaderPointer::RightSibling,
                    expected: NO_NODE,
                    actual: right,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::layout::{BytesLayout, U64Layout};
    use crate::tree::logic::{Allocator, TreeLogic};
    use crate::tree::merger::Overwrite;
    use crate::tree::node::format_for;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    struct Fixture<L: Layout> {
        _dir: TempDir,
        file: PagedFile,
        layout: Arc<L>,
        node: Arc<dyn TreeNode<L>>,
        logic: TreeLogic<L>,
        free_list: FreeList,
        root: Root,
        generation: Generation,
    }

    impl<L: Layout> Fixture<L> {
        fn new(layout: L) -> Self {
            let dir = tempdir().expect("failed to create temp dir");
            let file = PagedFile::map(&dir.path().join("check.db"), 512, true).expect("map");
            let layout = Arc::new(layout);
            let node = format_for(Arc::clone(&layout), 512);
            let generation = Generation::new(1, 2);
            let free_list = FreeList::create(&file, 3, 4).expect("free list");
            {
                let mut cursor = file.io(PfFlags::ExclusiveWrite).expect("io");
                cursor.next(4).expect("next");
                node.initialize(&mut cursor, true, generation.stable);
            }
            let logic = TreeLogic::new(Arc::clone(&layout), Arc::clone(&node), file.clone(), 0.5);
            Self {
                _dir: dir,
                file,
                layout,
                node,
                logic,
                free_list,
                root: Root { id: 4, generation: 1 },
                generation,
            }
        }

        fn put(&mut self, key: &L::Key, value: &L::Value) {
            let mut alloc = Allocator::new(&self.file, &mut self.free_list, self.generation);
            self.logic
                .put(key, value, &Overwrite, false, &mut self.root, &mut alloc)
                .expect("put");
        }

        fn remove(&mut self, key: &L::Key) {
            let mut alloc = Allocator::new(&self.file, &mut self.free_list, self.generation);
            self.logic.remove(key, &mut self.root, &mut alloc).expect("remove");
        }

        fn check(&self) -> (CheckReport, Vec<ConsistencyIssue>) {
            let mut issues = Vec::new();
            let report = check(
                &self.file,
                self.node.as_ref(),
                self.layout.as_ref(),
                self.root,
                self.generation,
                &self.free_list,
                &mut issues,
            )
            .expect("check");
            (report, issues)
        }
    }

    #[test]
    fn test_fresh_tree_is_consistent() {
        let fixture = Fixture::new(U64Layout);
        let (report, issues) = fixture.check();
        assert!(issues.is_empty(), "{issues:?}");
        assert!(report.is_consistent());
        assert_eq!(report.stats.leaf_nodes, 1);
        assert_eq!(report.stats.free_list_pages, 1);
    }

    #[test]
    fn test_tree_stays_consistent_through_checkpoints() {
        let mut fixture = Fixture::new(U64Layout);
        for round in 0..4u64 {
            for key in 0..200 {
                fixture.put(&(key * 4 + round), &key);
            }
            for key in (0..200).step_by(3) {
                fixture.remove(&(key * 4 + round));
            }
            let (_, issues) = fixture.check();
            assert!(issues.is_empty(), "round {round}: {issues:?}");
            fixture.generation = fixture.generation.checkpointed();
        }
        let (report, _) = fixture.check();
        assert!(report.stats.height >= 1);
        assert!(report.stats.free_ids > 0);
        assert_eq!(report.stats.entries, 4 * 133);
    }

    #[test]
    fn test_offload_pages_are_accounted() {
        let mut fixture = Fixture::new(BytesLayout);
        fixture.put(&vec![1u8; 300], &vec![2u8; 100]);
        fixture.put(&vec![3u8; 4], &vec![4u8; 4]);
        let (report, issues) = fixture.check();
        assert!(issues.is_empty(), "{issues:?}");
        assert_eq!(report.stats.offload_pages, 1);
    }

    #[test]
    fn test_reports_out_of_order_keys() {
        let mut fixture = Fixture::new(U64Layout);
        for key in 0..5 {
            fixture.put(&key, &key);
        }
        {
            let mut cursor = fixture.file.io(PfFlags::ExclusiveWrite).expect("io");
            cursor.next(fixture.root.id).expect("next");
            // Swap the first two keys of the fixed-size leaf.
            let first = header::BASE_HEADER_LENGTH;
            let second = first + 8;
            let a = cursor.get_u64(first);
            let b = cursor.get_u64(second);
            cursor.put_u64(first, b);
            cursor.put_u64(second, a);
        }
        let (report, issues) = fixture.check();
        assert!(!report.is_consistent());
        assert!(issues.contains(&ConsistencyIssue::KeysOutOfOrder {
            page_id: fixture.root.id,
            pos: 1
        }));
    }

    #[test]
    fn test_reports_broken_sibling_chain() {
        let mut fixture = Fixture::new(U64Layout);
        for key in 0..200 {
            fixture.put(&key, &key);
        }
        let leftmost = {
            let mut cursor = fixture.file.io(PfFlags::ExclusiveWrite).expect("io");
            cursor.next(fixture.root.id).expect("next");
            let leftmost = fixture.node.child_at(&mut cursor, 0, fixture.generation).expect("child");
            cursor.next(leftmost.pointer).expect("next");
            header::write_pointer(&mut cursor, HeaderPointer::RightSibling, NO_NODE, fixture.generation)
                .expect("write");
            leftmost.pointer
        };
        let (_, issues) = fixture.check();
        assert!(issues.iter().any(|issue| matches!(
            issue,
            ConsistencyIssue::SiblingMismatch {
                page_id,
                which: HeaderPointer::RightSibling,
                actual: NO_NODE,
                ..
            } if *page_id == leftmost
        )));
    }

    #[test]
    fn test_reports_leaked_page() {
        let mut fixture = Fixture::new(U64Layout);
        fixture.put(&1, &1);
        let mut alloc = Allocator::new(&fixture.file, &mut fixture.free_list, fixture.generation);
        let leaked = alloc.acquire().expect("acquire");
        let (_, issues) = fixture.check();
        assert_eq!(issues, vec![ConsistencyIssue::UnusedPage { page_id: leaked }]);
    }

    #[test]
    fn test_reports_crashed_pointers() {
        let mut fixture = Fixture::new(U64Layout);
        for key in 0..100 {
            fixture.put(&key, &key);
        }
        // Reopening after a crash bumps unstable, leaving the writes of
        // generation 2 in the gap.
        fixture.generation = Generation::new(1, 3);
        let (_, issues) = fixture.check();
        assert!(issues.iter().any(|issue| matches!(issue, ConsistencyIssue::CrashedPointer { .. })));
    }
}
