//! Tree mutation: insert, remove, split, merge and rebalance.
//!
//! A write descends from the root to the leaf holding the key, remembering
//! the path. The leaf is changed in place if it was already written in the
//! unstable generation, otherwise a successor copy is created first. The
//! changes a node cannot absorb alone are handed upwards as a
//! [`StructurePropagation`], one level at a time, until the root.
//!
//! Sibling and successor pointers of nodes from older generations are only
//! ever changed through their generation-safe pointer pairs, so the tree as
//! of the last checkpoint stays intact until the next one.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::pagecache::{PageCursor, PageId, PagedFile, PfFlags};
use crate::tree::error::{TreeError, TreeInconsistency};
use crate::tree::freelist::FreeList;
use crate::tree::generation::Generation;
use crate::tree::layout::Layout;
use crate::tree::merger::{MergeOutcome, ValueMerger};
use crate::tree::node::header::{self, HeaderPointer};
use crate::tree::node::{OffloadStore, Overflow, RawEntry, TreeNode, offload, split_position};
use crate::tree::pointer::NO_NODE;
use crate::tree::structure::StructurePropagation;

/// Deepest tree a descent accepts before declaring a cycle.
const MAX_DEPTH: usize = 64;

/// Root node id and the generation its pointer was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub id: PageId,
    pub generation: u32,
}

/// Page allocation for one write operation.
pub struct Allocator<'a> {
    file: &'a PagedFile,
    free_list: &'a mut FreeList,
    pub generation: Generation,
}

impl<'a> Allocator<'a> {
    pub const fn new(file: &'a PagedFile, free_list: &'a mut FreeList, generation: Generation) -> Self {
        Self {
            file,
            free_list,
            generation,
        }
    }

    pub fn acquire(&mut self) -> Result<PageId, TreeError> {
        self.free_list.acquire(self.file, self.generation)
    }

    pub fn release(&mut self, id: PageId) -> Result<(), TreeError> {
        self.free_list.release(self.file, id, self.generation)
    }

    /// Release the offload page of a discarded entry, if it has one.
    pub fn release_offload(&mut self, raw: &RawEntry) -> Result<(), TreeError> {
        match raw.offload_id {
            Some(id) => self.release(id),
            None => Ok(()),
        }
    }
}

impl OffloadStore for Allocator<'_> {
    fn store(&mut self, key: &[u8], value: &[u8]) -> Result<PageId, TreeError> {
        let id = self.acquire()?;
        let mut cursor = self.file.io(PfFlags::ExclusiveWrite)?;
        cursor.next(id)?;
        offload::write(&mut cursor, key, value, self.generation.unstable);
        Ok(id)
    }
}

/// Position of `key` among the keys of the node under the cursor, and
/// whether it is present.
pub fn search<L: Layout>(
    node: &dyn TreeNode<L>,
    layout: &L,
    cursor: &mut PageCursor,
    key: &L::Key,
    key_count: usize,
    leaf: bool,
) -> (usize, bool) {
    let (mut low, mut high) = (0, key_count);
    while low < high {
        let mid = low + (high - low) / 2;
        match layout.compare(&node.key_at(cursor, mid, leaf), key) {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return (mid, true),
        }
    }
    (low, false)
}

/// Child to follow for `key` in an internal node: the number of keys less
/// than or equal to it.
pub fn child_position<L: Layout>(
    node: &dyn TreeNode<L>,
    layout: &L,
    cursor: &mut PageCursor,
    key: &L::Key,
    key_count: usize,
) -> usize {
    match search(node, layout, cursor, key, key_count, false) {
        (pos, true) => pos + 1,
        (pos, false) => pos,
    }
}

fn inconsistency(cursor: &PageCursor, message: impl Into<String>, generation: Generation) -> TreeError {
    TreeInconsistency::new(cursor.current_page_id().unwrap_or(NO_NODE), message, generation).into()
}

/// One node on the cached path from the root.
#[derive(Debug)]
struct Level<K> {
    node_id: PageId,
    /// Child followed from this node.
    child_pos: usize,
    /// Inclusive lower bound of keys below this node.
    lower: Option<K>,
    /// Exclusive upper bound of keys below this node.
    upper: Option<K>,
}

/// The writer's mutation engine.
pub struct TreeLogic<L: Layout> {
    layout: Arc<L>,
    node: Arc<dyn TreeNode<L>>,
    file: PagedFile,
    split_ratio: f64,
    levels: Vec<Level<L::Key>>,
    /// Root and generation the cached path is valid for.
    cached_for: Option<(PageId, Generation)>,
}

impl<L: Layout> TreeLogic<L> {
    pub fn new(layout: Arc<L>, node: Arc<dyn TreeNode<L>>, file: PagedFile, split_ratio: f64) -> Self {
        Self {
            layout,
            node,
            file,
            split_ratio,
            levels: Vec::new(),
            cached_for: None,
        }
    }

    pub fn clear_cache(&mut self) {
        self.levels.clear();
        self.cached_for = None;
    }

    /// Insert or merge `value` under `key`. With `only_if_exists`, absent
    /// keys are left alone.
    pub fn put(
        &mut self,
        key: &L::Key,
        value: &L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
        only_if_exists: bool,
        root: &mut Root,
        alloc: &mut Allocator<'_>,
    ) -> Result<(), TreeError> {
        self.check_entry_size(key, value)?;
        let generation = alloc.generation;
        let mut cursor = self.file.io(PfFlags::ExclusiveWrite)?;
        self.descend(&mut cursor, key, *root, generation)?;

        let count = header::key_count(&mut cursor);
        let (pos, found) = search(self.node.as_ref(), &self.layout, &mut cursor, key, count, true);
        let mut propagation = StructurePropagation::new();

        if found {
            let existing = self.node.value_at(&mut cursor, pos);
            check_cursor(&mut cursor, generation)?;
            match merger.merge(key, &existing, value) {
                MergeOutcome::Unchanged => return Ok(()),
                MergeOutcome::Replaced(merged) => {
                    self.check_entry_size(key, &merged)?;
                    self.leaf_successor(&mut cursor, alloc, &mut propagation)?;
                    if !self.node.set_value_in_place(&mut cursor, pos, &merged) {
                        let raw = self.node.encode(key, Some(&merged), alloc)?;
                        let old = self.node.remove_raw_at(&mut cursor, pos, count);
                        alloc.release_offload(&old)?;
                        self.insert_in_leaf(&mut cursor, pos, raw, count - 1, alloc, &mut propagation)?;
                    }
                }
                MergeOutcome::Removed => {
                    self.leaf_successor(&mut cursor, alloc, &mut propagation)?;
                    self.remove_from_leaf(&mut cursor, pos, count, alloc, &mut propagation)?;
                }
            }
        } else {
            if only_if_exists {
                return Ok(());
            }
            self.leaf_successor(&mut cursor, alloc, &mut propagation)?;
            let raw = self.node.encode(key, Some(value), alloc)?;
            self.insert_in_leaf(&mut cursor, pos, raw, count, alloc, &mut propagation)?;
        }

        check_cursor(&mut cursor, generation)?;
        self.propagate(&mut cursor, propagation, root, alloc)
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(
        &mut self,
        key: &L::Key,
        root: &mut Root,
        alloc: &mut Allocator<'_>,
    ) -> Result<Option<L::Value>, TreeError> {
        let generation = alloc.generation;
        let mut cursor = self.file.io(PfFlags::ExclusiveWrite)?;
        self.descend(&mut cursor, key, *root, generation)?;

        let count = header::key_count(&mut cursor);
        let (pos, found) = search(self.node.as_ref(), &self.layout, &mut cursor, key, count, true);
        if !found {
            return Ok(None);
        }
        let value = self.node.value_at(&mut cursor, pos);
        check_cursor(&mut cursor, generation)?;

        let mut propagation = StructurePropagation::new();
        self.leaf_successor(&mut cursor, alloc, &mut propagation)?;
        self.remove_from_leaf(&mut cursor, pos, count, alloc, &mut propagation)?;
        check_cursor(&mut cursor, generation)?;
        self.propagate(&mut cursor, propagation, root, alloc)?;
        Ok(Some(value))
    }

    fn check_entry_size(&self, key: &L::Key, value: &L::Value) -> Result<(), TreeError> {
        let key_size = self.layout.key_size(key);
        let value_size = self.layout.value_size(value);
        let cap = self.node.key_value_size_cap();
        if key_size + value_size > cap {
            return Err(TreeError::EntryTooLarge {
                key_size,
                value_size,
                cap,
            });
        }
        Ok(())
    }

    /// Position the cursor on the leaf for `key`, reusing the cached path
    /// where its key bounds still cover `key`.
    fn descend(
        &mut self,
        cursor: &mut PageCursor,
        key: &L::Key,
        root: Root,
        generation: Generation,
    ) -> Result<(), TreeError> {
        if self.cached_for != Some((root.id, generation)) {
            self.levels.clear();
            self.cached_for = Some((root.id, generation));
        }
        while let Some(level) = self.levels.last() {
            if self.covers(level, key) {
                break;
            }
            self.levels.pop();
        }
        if self.levels.is_empty() {
            self.levels.push(Level {
                node_id: root.id,
                child_pos: 0,
                lower: None,
                upper: None,
            });
        }

        loop {
            let depth = self.levels.len() - 1;
            let node_id = self.levels[depth].node_id;
            cursor.next(node_id)?;
            let count = self.validate_node(cursor, generation)?;
            if header::is_leaf(cursor) {
                return Ok(());
            }
            if depth >= MAX_DEPTH {
                return Err(inconsistency(cursor, "tree deeper than any valid tree", generation));
            }

            let pos = child_position(self.node.as_ref(), &self.layout, cursor, key, count);
            let lower = if pos > 0 {
                Some(self.node.key_at(cursor, pos - 1, false))
            } else {
                self.levels[depth].lower.clone()
            };
            let upper = if pos < count {
                Some(self.node.key_at(cursor, pos, false))
            } else {
                self.levels[depth].upper.clone()
            };
            let child = self.child(cursor, pos, generation)?;
            check_cursor(cursor, generation)?;

            self.levels[depth].child_pos = pos;
            self.levels.push(Level {
                node_id: child,
                child_pos: 0,
                lower,
                upper,
            });
        }
    }

    fn covers(&self, level: &Level<L::Key>, key: &L::Key) -> bool {
        let above_lower = level
            .lower
            .as_ref()
            .is_none_or(|lower| self.layout.compare(key, lower) != Ordering::Less);
        let below_upper = level
            .upper
            .as_ref()
            .is_none_or(|upper| self.layout.compare(key, upper) == Ordering::Less);
        above_lower && below_upper
    }

    /// Check the node under the cursor is a plausible tree node and return
    /// its key count.
    fn validate_node(&self, cursor: &mut PageCursor, generation: Generation) -> Result<usize, TreeError> {
        if !header::is_tree_node(cursor) {
            return Err(inconsistency(cursor, "expected a tree node", generation));
        }
        let node_generation = header::generation(cursor);
        if node_generation > generation.unstable {
            return Err(inconsistency(
                cursor,
                format!("node generation {node_generation} is newer than unstable"),
                generation,
            ));
        }
        let count = header::key_count(cursor);
        let leaf = header::is_leaf(cursor);
        if !self.node.reasonable_key_count(count, leaf) {
            return Err(inconsistency(cursor, format!("unreasonable key count {count}"), generation));
        }
        Ok(count)
    }

    fn child(&self, cursor: &mut PageCursor, pos: usize, generation: Generation) -> Result<PageId, TreeError> {
        let page_id = cursor.current_page_id().unwrap_or(NO_NODE);
        let read = self
            .node
            .child_at(cursor, pos, generation)
            .map_err(|failure| TreeInconsistency::pointer(page_id, &format!("child {pos}"), &failure))?;
        if !read.is_node() {
            return Err(inconsistency(cursor, format!("child {pos} is empty"), generation));
        }
        Ok(read.pointer)
    }

    fn children(&self, cursor: &mut PageCursor, count: usize, generation: Generation) -> Result<Vec<PageId>, TreeError> {
        let page_id = cursor.current_page_id().unwrap_or(NO_NODE);
        self.node
            .read_children(cursor, count, generation)
            .map_err(|(pos, failure)| TreeInconsistency::pointer(page_id, &format!("child {pos}"), &failure).into())
    }

    fn leaf_successor(
        &mut self,
        cursor: &mut PageCursor,
        alloc: &mut Allocator<'_>,
        propagation: &mut StructurePropagation<L::Key>,
    ) -> Result<(), TreeError> {
        if let Some(new_id) = create_successor_if_needed(cursor, alloc)? {
            propagation.mid_child = Some(new_id);
            if let Some(level) = self.levels.last_mut() {
                level.node_id = new_id;
            }
        }
        Ok(())
    }

    fn insert_in_leaf(
        &self,
        cursor: &mut PageCursor,
        pos: usize,
        raw: RawEntry,
        count: usize,
        alloc: &mut Allocator<'_>,
        propagation: &mut StructurePropagation<L::Key>,
    ) -> Result<(), TreeError> {
        match self.node.overflow(cursor, count, self.node.entry_space(&raw, true), true) {
            Overflow::No => self.node.insert_raw_at(cursor, pos, &raw, count),
            Overflow::NoNeedDefrag => {
                self.node.defragment(cursor, count, true);
                self.node.insert_raw_at(cursor, pos, &raw, count);
            }
            Overflow::Yes => self.split_leaf(cursor, pos, raw, count, alloc, propagation)?,
        }
        Ok(())
    }

    fn split_leaf(
        &self,
        cursor: &mut PageCursor,
        pos: usize,
        raw: RawEntry,
        count: usize,
        alloc: &mut Allocator<'_>,
        propagation: &mut StructurePropagation<L::Key>,
    ) -> Result<(), TreeError> {
        let generation = alloc.generation;
        let mut entries = self.node.read_entries(cursor, count, true);
        entries.insert(pos, raw);
        let sizes: Vec<usize> = entries.iter().map(|e| self.node.entry_space(e, true)).collect();
        let split = split_position(&sizes, self.node.total_space(true), self.split_ratio, true)
            .ok_or_else(|| inconsistency(cursor, "no split position for leaf", generation))?;

        let left_key = self.node.decode_key(cursor, &entries[split - 1], true);
        let right_key = self.node.decode_key(cursor, &entries[split], true);
        let separator = self.layout.minimal_splitter(&left_key, &right_key);

        let (left, right) = entries.split_at(split);
        let new_id = self.split_off_right(cursor, true, (left, &[]), (right, &[]), alloc)?;
        propagation.right_key_insert = Some((separator, new_id));
        Ok(())
    }

    /// Rewrite the node under the cursor with `left` and move `right` into a
    /// new node linked in as its right sibling. Returns the new node's id.
    fn split_off_right(
        &self,
        cursor: &mut PageCursor,
        leaf: bool,
        left: (&[RawEntry], &[PageId]),
        right: (&[RawEntry], &[PageId]),
        alloc: &mut Allocator<'_>,
    ) -> Result<PageId, TreeError> {
        let generation = alloc.generation;
        let current_id = cursor.current_page_id().unwrap_or(NO_NODE);
        let old_right = sibling(cursor, HeaderPointer::RightSibling, generation)?;
        let new_id = alloc.acquire()?;

        {
            let mut new_node = cursor.open_linked_cursor(new_id, PfFlags::ExclusiveWrite)?;
            self.node.initialize(&mut new_node, leaf, generation.unstable);
            self.node.rewrite(&mut new_node, leaf, right.0, right.1, generation);
            write_pointer(&mut new_node, HeaderPointer::LeftSibling, current_id, generation)?;
            write_pointer(&mut new_node, HeaderPointer::RightSibling, old_right, generation)?;
        }
        if old_right != NO_NODE {
            let mut right_sibling = cursor.open_linked_cursor(old_right, PfFlags::ExclusiveWrite)?;
            write_pointer(&mut right_sibling, HeaderPointer::LeftSibling, new_id, generation)?;
        }
        self.node.rewrite(cursor, leaf, left.0, left.1, generation);
        write_pointer(cursor, HeaderPointer::RightSibling, new_id, generation)?;
        Ok(new_id)
    }

    fn remove_from_leaf(
        &self,
        cursor: &mut PageCursor,
        pos: usize,
        count: usize,
        alloc: &mut Allocator<'_>,
        propagation: &mut StructurePropagation<L::Key>,
    ) -> Result<(), TreeError> {
        let raw = self.node.remove_raw_at(cursor, pos, count);
        alloc.release_offload(&raw)?;
        let count = count - 1;
        let is_root = self.levels.len() < 2;
        if !is_root && self.node.underflow(self.node.used_space(cursor, count, true), true) {
            self.rebalance_leaf(cursor, count, alloc, propagation)?;
        }
        Ok(())
    }

    /// Fix an underflowing leaf by merging with or borrowing from a sibling
    /// under the same parent. Entries only ever move rightwards.
    fn rebalance_leaf(
        &self,
        cursor: &mut PageCursor,
        count: usize,
        alloc: &mut Allocator<'_>,
        propagation: &mut StructurePropagation<L::Key>,
    ) -> Result<(), TreeError> {
        let generation = alloc.generation;
        let parent = &self.levels[self.levels.len() - 2];
        let pos = parent.child_pos;
        let mut parent_cursor = cursor.open_linked_cursor(parent.node_id, PfFlags::ExclusiveWrite)?;
        let parent_count = header::key_count(&mut parent_cursor);
        let capacity = self.node.total_space(true);
        let current_used = self.node.used_space(cursor, count, true);

        if pos > 0 {
            let left_id = self.child(&mut parent_cursor, pos - 1, generation)?;
            drop(parent_cursor);
            let mut left = cursor.open_linked_cursor(left_id, PfFlags::ExclusiveWrite)?;
            let left_count = self.validate_node(&mut left, generation)?;
            let left_entries = self.node.read_entries(&mut left, left_count, true);
            let left_sizes: Vec<usize> = left_entries.iter().map(|e| self.node.entry_space(e, true)).collect();

            if left_sizes.iter().sum::<usize>() + current_used <= capacity {
                let mut entries = left_entries;
                entries.extend(self.node.read_entries(cursor, count, true));
                self.node.rewrite(cursor, true, &entries, &[], generation);
                unlink_merged(&mut left, cursor, alloc)?;
                propagation.merged_from_left = true;
                return Ok(());
            }

            let moved = rebalance_count(&left_sizes, current_used, capacity);
            if moved == 0 {
                return Ok(());
            }
            if let Some(new_left) = create_successor_if_needed(&mut left, alloc)? {
                propagation.left_child = Some(new_left);
            }
            let keep = left_count - moved;
            let mut entries = left_entries[keep..].to_vec();
            entries.extend(self.node.read_entries(cursor, count, true));
            self.node.rewrite(&mut left, true, &left_entries[..keep], &[], generation);
            self.node.rewrite(cursor, true, &entries, &[], generation);

            let left_key = self.node.decode_key(cursor, &left_entries[keep - 1], true);
            let right_key = self.node.decode_key(cursor, &entries[0], true);
            propagation.left_key_replace = Some(self.layout.minimal_splitter(&left_key, &right_key));
        } else if parent_count > 0 {
            let right_id = self.child(&mut parent_cursor, 1, generation)?;
            drop(parent_cursor);
            let mut right = cursor.open_linked_cursor(right_id, PfFlags::ExclusiveWrite)?;
            let right_count = self.validate_node(&mut right, generation)?;
            if current_used + self.node.used_space(&mut right, right_count, true) > capacity {
                return Ok(());
            }
            if let Some(new_right) = create_successor_if_needed(&mut right, alloc)? {
                propagation.right_child = Some(new_right);
            }
            let mut entries = self.node.read_entries(cursor, count, true);
            entries.extend(self.node.read_entries(&mut right, right_count, true));
            self.node.rewrite(&mut right, true, &entries, &[], generation);
            unlink_merged(cursor, &mut right, alloc)?;
            propagation.merged_into_right = true;
        }
        Ok(())
    }

    /// Apply `propagation` level by level up to the root.
    fn propagate(
        &mut self,
        cursor: &mut PageCursor,
        mut propagation: StructurePropagation<L::Key>,
        root: &mut Root,
        alloc: &mut Allocator<'_>,
    ) -> Result<(), TreeError> {
        let generation = alloc.generation;
        let structural = propagation.is_structural();
        let mut depth = self.levels.len() - 1;

        while propagation.has_changes() {
            if depth == 0 {
                self.apply_at_root(propagation, root, alloc)?;
                break;
            }
            depth -= 1;
            let (node_id, pos) = (self.levels[depth].node_id, self.levels[depth].child_pos);
            cursor.next(node_id)?;

            let mut next = StructurePropagation::new();
            if let Some(new_id) = create_successor_if_needed(cursor, alloc)? {
                next.mid_child = Some(new_id);
                self.levels[depth].node_id = new_id;
            }
            self.apply_internal(cursor, depth, pos, propagation, alloc, &mut next)?;
            check_cursor(cursor, generation)?;
            propagation = next;
        }

        if structural {
            self.shrink_root(root, alloc)?;
            self.clear_cache();
        } else {
            self.cached_for = Some((root.id, generation));
        }
        Ok(())
    }

    /// Apply a child's propagation to the internal node under the cursor,
    /// found at `depth` of the path, where the child sits at `pos`.
    fn apply_internal(
        &self,
        cursor: &mut PageCursor,
        depth: usize,
        pos: usize,
        propagation: StructurePropagation<L::Key>,
        alloc: &mut Allocator<'_>,
        next: &mut StructurePropagation<L::Key>,
    ) -> Result<(), TreeError> {
        let generation = alloc.generation;
        let page_id = cursor.current_page_id().unwrap_or(NO_NODE);
        let StructurePropagation {
            mid_child,
            left_child,
            right_child,
            left_key_replace,
            right_key_insert,
            merged_from_left,
            merged_into_right,
        } = propagation;
        let redirects = [
            (Some(pos), mid_child),
            (pos.checked_sub(1), left_child),
            (Some(pos + 1), right_child),
        ];
        for (child_pos, child) in redirects {
            if let (Some(child_pos), Some(child)) = (child_pos, child) {
                self.node
                    .set_child_at(cursor, child_pos, child, generation)
                    .map_err(|f| TreeInconsistency::pointer(page_id, &format!("child {child_pos}"), &f))?;
            }
        }

        let mut replacement = None;
        if let Some(key) = left_key_replace {
            let key_pos = pos - 1;
            let raw = self.node.encode(&key, None, alloc)?;
            let old = self.node.raw_at(cursor, key_pos, false);
            if self.node.replace_key_in_place(cursor, key_pos, &raw) {
                alloc.release_offload(&old)?;
            } else {
                replacement = Some(raw);
            }
        }
        let removes_key = merged_from_left || merged_into_right;
        if replacement.is_none() && !removes_key && right_key_insert.is_none() {
            return Ok(());
        }

        let count = header::key_count(cursor);
        let mut entries = self.node.read_entries(cursor, count, false);
        let mut children = self.children(cursor, count, generation)?;
        if let Some(raw) = replacement {
            let old = std::mem::replace(&mut entries[pos - 1], raw);
            alloc.release_offload(&old)?;
        }
        if merged_from_left {
            alloc.release_offload(&entries.remove(pos - 1))?;
            children.remove(pos - 1);
        }
        if merged_into_right {
            alloc.release_offload(&entries.remove(pos))?;
            children.remove(pos);
        }
        if let Some((key, right)) = right_key_insert {
            let raw = self.node.encode(&key, None, alloc)?;
            entries.insert(pos, raw);
            children.insert(pos + 1, right);
        }

        let sizes: Vec<usize> = entries.iter().map(|e| self.node.entry_space(e, false)).collect();
        let capacity = self.node.total_space(false);
        let used: usize = sizes.iter().sum();
        if used <= capacity {
            self.node.rewrite(cursor, false, &entries, &children, generation);
        } else {
            let split = split_position(&sizes, capacity, self.split_ratio, false)
                .ok_or_else(|| inconsistency(cursor, "no split position for internal node", generation))?;
            let separator = self.node.decode_key(cursor, &entries[split], false);
            alloc.release_offload(&entries[split])?;
            let new_id = self.split_off_right(
                cursor,
                false,
                (&entries[..split], &children[..=split]),
                (&entries[split + 1..], &children[split + 1..]),
                alloc,
            )?;
            next.right_key_insert = Some((separator, new_id));
            return Ok(());
        }

        if removes_key && depth > 0 && self.node.underflow(used, false) {
            self.rebalance_internal(cursor, depth, alloc, next)?;
        }
        Ok(())
    }

    /// Internal-node counterpart of [`Self::rebalance_leaf`]. Separators are
    /// pulled down from the parent on merge and rotated through it when
    /// borrowing.
    fn rebalance_internal(
        &self,
        cursor: &mut PageCursor,
        depth: usize,
        alloc: &mut Allocator<'_>,
        next: &mut StructurePropagation<L::Key>,
    ) -> Result<(), TreeError> {
        let generation = alloc.generation;
        let parent = &self.levels[depth - 1];
        let pos = parent.child_pos;
        let mut parent_cursor = cursor.open_linked_cursor(parent.node_id, PfFlags::ExclusiveWrite)?;
        let parent_count = header::key_count(&mut parent_cursor);
        let capacity = self.node.total_space(false);

        let count = header::key_count(cursor);
        let entries = self.node.read_entries(cursor, count, false);
        let children = self.children(cursor, count, generation)?;
        let used: usize = entries.iter().map(|e| self.node.entry_space(e, false)).sum();

        if pos > 0 {
            let separator_key = self.node.key_at(&mut parent_cursor, pos - 1, false);
            let left_id = self.child(&mut parent_cursor, pos - 1, generation)?;
            check_cursor(&mut parent_cursor, generation)?;
            drop(parent_cursor);

            let mut left = cursor.open_linked_cursor(left_id, PfFlags::ExclusiveWrite)?;
            let left_count = self.validate_node(&mut left, generation)?;
            let left_entries = self.node.read_entries(&mut left, left_count, false);
            let left_children = self.children(&mut left, left_count, generation)?;
            let left_sizes: Vec<usize> = left_entries.iter().map(|e| self.node.entry_space(e, false)).collect();
            let separator = self.node.encode(&separator_key, None, alloc)?;
            let separator_size = self.node.entry_space(&separator, false);

            if left_sizes.iter().sum::<usize>() + separator_size + used <= capacity {
                let mut merged = left_entries;
                merged.push(separator);
                merged.extend(entries);
                let mut merged_children = left_children;
                merged_children.extend(children);
                self.node.rewrite(cursor, false, &merged, &merged_children, generation);
                unlink_merged(&mut left, cursor, alloc)?;
                next.merged_from_left = true;
                return Ok(());
            }

            let moved = rebalance_count(&left_sizes, used + separator_size, capacity);
            let keep = left_count - moved;
            let received = || left_sizes[keep + 1..].iter().sum::<usize>() + separator_size;
            if moved == 0 || used + received() > capacity {
                alloc.release_offload(&separator)?;
                return Ok(());
            }
            if let Some(new_left) = create_successor_if_needed(&mut left, alloc)? {
                next.left_child = Some(new_left);
            }
            let new_separator = self.node.decode_key(cursor, &left_entries[keep], false);
            alloc.release_offload(&left_entries[keep])?;

            let mut rotated = left_entries[keep + 1..].to_vec();
            rotated.push(separator);
            rotated.extend(entries);
            let mut rotated_children = left_children[keep + 1..].to_vec();
            rotated_children.extend(children);
            self.node.rewrite(&mut left, false, &left_entries[..keep], &left_children[..=keep], generation);
            self.node.rewrite(cursor, false, &rotated, &rotated_children, generation);
            next.left_key_replace = Some(new_separator);
        } else if parent_count > 0 {
            let separator_key = self.node.key_at(&mut parent_cursor, 0, false);
            let right_id = self.child(&mut parent_cursor, 1, generation)?;
            check_cursor(&mut parent_cursor, generation)?;
            drop(parent_cursor);

            let mut right = cursor.open_linked_cursor(right_id, PfFlags::ExclusiveWrite)?;
            let right_count = self.validate_node(&mut right, generation)?;
            let right_entries = self.node.read_entries(&mut right, right_count, false);
            let right_children = self.children(&mut right, right_count, generation)?;
            let right_used: usize = right_entries.iter().map(|e| self.node.entry_space(e, false)).sum();
            let separator = self.node.encode(&separator_key, None, alloc)?;
            if used + self.node.entry_space(&separator, false) + right_used > capacity {
                alloc.release_offload(&separator)?;
                return Ok(());
            }

            if let Some(new_right) = create_successor_if_needed(&mut right, alloc)? {
                next.right_child = Some(new_right);
            }
            let mut merged = entries;
            merged.push(separator);
            merged.extend(right_entries);
            let mut merged_children = children;
            merged_children.extend(right_children);
            self.node.rewrite(&mut right, false, &merged, &merged_children, generation);
            unlink_merged(cursor, &mut right, alloc)?;
            next.merged_into_right = true;
        }
        Ok(())
    }

    fn apply_at_root(
        &self,
        propagation: StructurePropagation<L::Key>,
        root: &mut Root,
        alloc: &mut Allocator<'_>,
    ) -> Result<(), TreeError> {
        let generation = alloc.generation;
        if let Some(id) = propagation.mid_child {
            *root = Root {
                id,
                generation: generation.unstable,
            };
        }
        if let Some((key, right)) = propagation.right_key_insert {
            let raw = self.node.encode(&key, None, alloc)?;
            let new_root = alloc.acquire()?;
            let mut cursor = self.file.io(PfFlags::ExclusiveWrite)?;
            cursor.next(new_root)?;
            self.node.initialize(&mut cursor, false, generation.unstable);
            self.node.rewrite(&mut cursor, false, &[raw], &[root.id, right], generation);
            tracing::debug!("tree grew: new root {new_root} over {} and {right}", root.id);
            *root = Root {
                id: new_root,
                generation: generation.unstable,
            };
        }
        Ok(())
    }

    /// Replace an internal root without keys by its only child.
    fn shrink_root(&self, root: &mut Root, alloc: &mut Allocator<'_>) -> Result<(), TreeError> {
        let generation = alloc.generation;
        let mut cursor = self.file.io(PfFlags::ExclusiveWrite)?;
        loop {
            cursor.next(root.id)?;
            if header::is_leaf(&mut cursor) || header::key_count(&mut cursor) > 0 {
                return Ok(());
            }
            let child = self.child(&mut cursor, 0, generation)?;
            alloc.release(root.id)?;
            tracing::debug!("tree shrank: root {} replaced by {child}", root.id);
            *root = Root {
                id: child,
                generation: generation.unstable,
            };
        }
    }
}

/// Number of entries to move from the end of a donor with entry `sizes` to
/// a receiver using `receiver_used`, so that both end up roughly even.
fn rebalance_count(sizes: &[usize], receiver_used: usize, capacity: usize) -> usize {
    let donor_used: usize = sizes.iter().sum();
    let mut moved_space = 0;
    let mut moved = 0;
    while moved + 1 < sizes.len() {
        let next = sizes[sizes.len() - 1 - moved];
        if receiver_used + moved_space >= donor_used - moved_space || receiver_used + moved_space + next > capacity {
            break;
        }
        moved_space += next;
        moved += 1;
    }
    moved
}

fn check_cursor(cursor: &mut PageCursor, generation: Generation) -> Result<(), TreeError> {
    if cursor.check_and_clear_bounds_flag() {
        return Err(inconsistency(cursor, "access outside page bounds", generation));
    }
    cursor
        .check_and_clear_cursor_error()
        .map_err(|e| inconsistency(cursor, e.to_string(), generation))
}

pub(crate) fn sibling(cursor: &mut PageCursor, which: HeaderPointer, generation: Generation) -> Result<PageId, TreeError> {
    let page_id = cursor.current_page_id().unwrap_or(NO_NODE);
    header::read_pointer(cursor, which, generation)
        .map(|read| read.pointer)
        .map_err(|failure| TreeInconsistency::pointer(page_id, &which.to_string(), &failure).into())
}

fn write_pointer(
    cursor: &mut PageCursor,
    which: HeaderPointer,
    target: PageId,
    generation: Generation,
) -> Result<(), TreeError> {
    let page_id = cursor.current_page_id().unwrap_or(NO_NODE);
    header::write_pointer(cursor, which, target, generation)
        .map_err(|failure| TreeInconsistency::pointer(page_id, &which.to_string(), &failure).into())
}

/// Make the node under the cursor writable in the unstable generation.
///
/// A node from an older generation is copied to a new page, the old page
/// points to the copy through its successor pointer, both siblings are
/// redirected to the copy, and the old id is released. The cursor moves to
/// the copy, whose id is returned.
fn create_successor_if_needed(
    cursor: &mut PageCursor,
    alloc: &mut Allocator<'_>,
) -> Result<Option<PageId>, TreeError> {
    let generation = alloc.generation;
    let node_generation = header::generation(cursor);
    if node_generation == generation.unstable {
        return Ok(None);
    }
    if node_generation > generation.unstable {
        return Err(inconsistency(
            cursor,
            format!("node generation {node_generation} is newer than unstable"),
            generation,
        ));
    }

    let old_id = cursor.current_page_id().unwrap_or(NO_NODE);
    let new_id = alloc.acquire()?;
    {
        let mut successor = cursor.open_linked_cursor(new_id, PfFlags::ExclusiveWrite)?;
        let page_size = cursor.page_size();
        cursor.copy_to(0, &mut successor, 0, page_size);
        header::set_generation(&mut successor, generation.unstable);
    }
    write_pointer(cursor, HeaderPointer::Successor, new_id, generation)?;

    let left = sibling(cursor, HeaderPointer::LeftSibling, generation)?;
    if left != NO_NODE {
        let mut left_cursor = cursor.open_linked_cursor(left, PfFlags::ExclusiveWrite)?;
        write_pointer(&mut left_cursor, HeaderPointer::RightSibling, new_id, generation)?;
    }
    let right = sibling(cursor, HeaderPointer::RightSibling, generation)?;
    if right != NO_NODE {
        let mut right_cursor = cursor.open_linked_cursor(right, PfFlags::ExclusiveWrite)?;
        write_pointer(&mut right_cursor, HeaderPointer::LeftSibling, new_id, generation)?;
    }

    alloc.release(old_id)?;
    cursor.next(new_id)?;
    Ok(Some(new_id))
}

/// Unlink `removed`, whose contents were merged into its right sibling
/// `survivor`, and release it.
fn unlink_merged(
    removed: &mut PageCursor,
    survivor: &mut PageCursor,
    alloc: &mut Allocator<'_>,
) -> Result<(), TreeError> {
    let generation = alloc.generation;
    let removed_id = removed.current_page_id().unwrap_or(NO_NODE);
    let survivor_id = survivor.current_page_id().unwrap_or(NO_NODE);

    let far_left = sibling(removed, HeaderPointer::LeftSibling, generation)?;
    write_pointer(survivor, HeaderPointer::LeftSibling, far_left, generation)?;
    if far_left != NO_NODE {
        let mut far_left_cursor = removed.open_linked_cursor(far_left, PfFlags::ExclusiveWrite)?;
        write_pointer(&mut far_left_cursor, HeaderPointer::RightSibling, survivor_id, generation)?;
    }
    write_pointer(removed, HeaderPointer::Successor, survivor_id, generation)?;
    alloc.release(removed_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::layout::{BytesLayout, U64Layout};
    use crate::tree::merger::{KeepExisting, Overwrite};
    use crate::tree::node::format_for;
    use tempfile::{TempDir, tempdir};

    struct Fixture<L: Layout> {
        _dir: TempDir,
        file: PagedFile,
        logic: TreeLogic<L>,
        free_list: FreeList,
        root: Root,
        generation: Generation,
    }

    impl<L: Layout> Fixture<L> {
        fn new(layout: L, page_size: usize) -> Self {
            let dir = tempdir().expect("failed to create temp dir");
            let file = PagedFile::map(&dir.path().join("logic.db"), page_size, true).expect("map");
            let layout = Arc::new(layout);
            let node = format_for(Arc::clone(&layout), page_size);
            let generation = Generation::new(1, 2);
            let free_list = FreeList::create(&file, 3, 4).expect("free list");
            {
                let mut cursor = file.io(PfFlags::ExclusiveWrite).expect("io");
                cursor.next(4).expect("next");
                node.initialize(&mut cursor, true, generation.stable);
            }
            let logic = TreeLogic::new(layout, node, file.clone(), 0.5);
            Self {
                _dir: dir,
                file,
                logic,
                free_list,
                root: Root {
                    id: 4,
                    generation: 1,
                },
                generation,
            }
        }

        fn put(&mut self, key: &L::Key, value: &L::Value) {
            let mut alloc = Allocator::new(&self.file, &mut self.free_list, self.generation);
            self.logic
                .put(key, value, &Overwrite, false, &mut self.root, &mut alloc)
                .expect("put");
        }

        fn remove(&mut self, key: &L::Key) -> Option<L::Value> {
            let mut alloc = Allocator::new(&self.file, &mut self.free_list, self.generation);
            self.logic.remove(key, &mut self.root, &mut alloc).expect("remove")
        }

        fn checkpoint(&mut self) {
            self.generation = self.generation.checkpointed();
        }

        /// All entries in key order, walking the leaf level rightwards.
        fn scan(&self) -> Vec<(L::Key, L::Value)> {
            let node = &self.logic.node;
            let mut cursor = self.file.io(PfFlags::ExclusiveWrite).expect("io");
            let mut id = self.root.id;
            loop {
                cursor.next(id).expect("next");
                if header::is_leaf(&mut cursor) {
                    break;
                }
                id = node.child_at(&mut cursor, 0, self.generation).expect("child").pointer;
            }
            let mut out = Vec::new();
            while id != NO_NODE {
                cursor.next(id).expect("next");
                let count = header::key_count(&mut cursor);
                for pos in 0..count {
                    out.push((node.key_at(&mut cursor, pos, true), node.value_at(&mut cursor, pos)));
                }
                id = sibling(&mut cursor, HeaderPointer::RightSibling, self.generation).expect("right");
            }
            out
        }

        fn height(&self) -> usize {
            let mut cursor = self.file.io(PfFlags::ExclusiveWrite).expect("io");
            let mut id = self.root.id;
            let mut height = 0;
            loop {
                cursor.next(id).expect("next");
                if header::is_leaf(&mut cursor) {
                    return height;
                }
                height += 1;
                id = self.logic.node.child_at(&mut cursor, 0, self.generation).expect("child").pointer;
            }
        }
    }

    #[test]
    fn test_first_write_creates_successor_root() {
        let mut fixture = Fixture::new(U64Layout, 512);
        fixture.put(&1, &10);
        assert_ne!(fixture.root.id, 4);
        assert_eq!(fixture.root.generation, 2);

        // Further writes in the same generation touch the same node.
        let root = fixture.root;
        fixture.put(&2, &20);
        assert_eq!(fixture.root, root);
        assert_eq!(fixture.scan(), vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn test_splits_grow_tree_and_keep_order() {
        let mut fixture = Fixture::new(U64Layout, 512);
        for key in (0..400u64).rev() {
            fixture.put(&key, &(key * 2));
        }
        assert!(fixture.height() >= 2);
        let expected: Vec<(u64, u64)> = (0..400).map(|k| (k, k * 2)).collect();
        assert_eq!(fixture.scan(), expected);
    }

    #[test]
    fn test_overwrite_and_keep_existing() {
        let mut fixture = Fixture::new(U64Layout, 512);
        fixture.put(&5, &1);
        fixture.put(&5, &2);
        assert_eq!(fixture.scan(), vec![(5, 2)]);

        let mut alloc = Allocator::new(&fixture.file, &mut fixture.free_list, fixture.generation);
        fixture
            .logic
            .put(&5, &3, &KeepExisting, false, &mut fixture.root, &mut alloc)
            .expect("put");
        fixture
            .logic
            .put(&6, &3, &Overwrite, true, &mut fixture.root, &mut alloc)
            .expect("put");
        assert_eq!(fixture.scan(), vec![(5, 2)]);
    }

    #[test]
    fn test_removes_across_levels() {
        let mut fixture = Fixture::new(U64Layout, 512);
        for key in 0..300u64 {
            fixture.put(&key, &key);
        }
        fixture.checkpoint();
        assert!(fixture.height() >= 2);

        for key in 0..295u64 {
            assert_eq!(fixture.remove(&key), Some(key));
        }
        assert_eq!(fixture.remove(&0), None);
        let expected: Vec<(u64, u64)> = (295..300).map(|k| (k, k)).collect();
        assert_eq!(fixture.scan(), expected);
    }

    #[test]
    fn test_merges_shrink_root_to_leaf() {
        let mut fixture = Fixture::new(U64Layout, 512);
        for key in 0..40u64 {
            fixture.put(&key, &key);
        }
        assert_eq!(fixture.height(), 1);
        fixture.checkpoint();

        for key in 0..38u64 {
            assert_eq!(fixture.remove(&key), Some(key));
        }
        assert_eq!(fixture.height(), 0);
        assert_eq!(fixture.scan(), vec![(38, 38), (39, 39)]);
    }

    #[test]
    fn test_remove_from_right_end_rebalances_from_left() {
        let mut fixture = Fixture::new(U64Layout, 512);
        for key in 0..120u64 {
            fixture.put(&key, &key);
        }
        fixture.checkpoint();
        for key in (60..120u64).rev() {
            assert_eq!(fixture.remove(&key), Some(key));
        }
        let expected: Vec<(u64, u64)> = (0..60).map(|k| (k, k)).collect();
        assert_eq!(fixture.scan(), expected);
    }

    #[test]
    fn test_variable_size_entries_with_offload() {
        let mut fixture = Fixture::new(BytesLayout, 512);
        for i in 0..60u32 {
            let key = format!("key-{i:04}").into_bytes();
            let value = if i % 7 == 0 { vec![b'x'; 300] } else { vec![b'v'; (i % 13) as usize] };
            fixture.put(&key, &value);
        }
        let scanned = fixture.scan();
        assert_eq!(scanned.len(), 60);
        assert_eq!(scanned[7].1, vec![b'x'; 300]);
        assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));

        // Growing a value past the inline cap moves it to an offload page.
        let key = b"key-0001".to_vec();
        fixture.put(&key, &vec![b'y'; 250]);
        let scanned = fixture.scan();
        assert_eq!(scanned[1], (key, vec![b'y'; 250]));
    }

    #[test]
    fn test_entry_too_large() {
        let mut fixture = Fixture::new(BytesLayout, 512);
        let mut alloc = Allocator::new(&fixture.file, &mut fixture.free_list, fixture.generation);
        let result = fixture.logic.put(
            &vec![1; 400],
            &vec![2; 400],
            &Overwrite,
            false,
            &mut fixture.root,
            &mut alloc,
        );
        assert!(matches!(result, Err(TreeError::EntryTooLarge { .. })));
    }

    #[test]
    fn test_rebalance_count_evens_out() {
        assert_eq!(rebalance_count(&[10; 10], 20, 200), 4);
        assert_eq!(rebalance_count(&[10; 2], 0, 200), 1);
        assert_eq!(rebalance_count(&[10; 10], 200, 200), 0);
    }
}
