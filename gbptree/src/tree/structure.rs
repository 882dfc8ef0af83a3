//! Changes a node hands to its parent after a mutation.

use crate::pagecache::PageId;

/// Structural changes to apply one level up.
///
/// Positions are relative to the child that produced the propagation, at
/// child position `pos` in the parent.
#[derive(Debug)]
pub struct StructurePropagation<K> {
    /// The child got a successor: replace child `pos`.
    pub mid_child: Option<PageId>,
    /// The left sibling got a successor: replace child `pos - 1`.
    pub left_child: Option<PageId>,
    /// The right sibling got a successor: replace child `pos + 1`.
    pub right_child: Option<PageId>,
    /// Entries moved between the child and its left sibling: replace key
    /// `pos - 1`.
    pub left_key_replace: Option<K>,
    /// The child split: insert this key at `pos` with the new node as child
    /// `pos + 1`.
    pub right_key_insert: Option<(K, PageId)>,
    /// The left sibling was merged into the child: remove key and child
    /// `pos - 1`.
    pub merged_from_left: bool,
    /// The child was merged into its right sibling: remove key and child
    /// `pos`.
    pub merged_into_right: bool,
}

impl<K> StructurePropagation<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mid_child: None,
            left_child: None,
            right_child: None,
            left_key_replace: None,
            right_key_insert: None,
            merged_from_left: false,
            merged_into_right: false,
        }
    }

    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.mid_child.is_some() || self.is_structural()
    }

    /// Whether anything beyond child pointer redirects is pending.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        self.left_child.is_some()
            || self.right_child.is_some()
            || self.left_key_replace.is_some()
            || self.right_key_insert.is_some()
            || self.merged_from_left
            || self.merged_into_right
    }
}

impl<K> Default for StructurePropagation<K> {
    fn default() -> Self {
        Self::new()
    }
}
