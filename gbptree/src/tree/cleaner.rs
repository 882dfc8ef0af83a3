//! Crash-generation cleanup.
//!
//! After an unclean shutdown the tree reopens with a fresh unstable
//! generation, leaving every pointer slot written after the last checkpoint
//! in the crash gap. Those slots are harmless to readers, which ignore them,
//! but a writer must not find them when choosing which slot to overwrite.
//! The cleaner zeroes them on every tree node up to the last allocated id.

use std::time::{Duration, Instant};

use crate::pagecache::{PageCursor, PageId, PagedFile, PfFlags, retry_until_stable};
use crate::tree::consistency::FIRST_TREE_PAGE;
use crate::tree::error::TreeError;
use crate::tree::generation::Generation;
use crate::tree::layout::Layout;
use crate::tree::node::TreeNode;
use crate::tree::node::header::{self, HeaderPointer};
use crate::tree::pointer;

/// Result of a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub pages_scanned: u64,
    pub tree_nodes: u64,
    /// Tree nodes that had at least one crashed slot.
    pub nodes_cleaned: u64,
    pub slots_cleaned: usize,
    pub elapsed: Duration,
}

/// Pointer offsets of the tree node under the cursor, or `None` if the page
/// is not a tree node.
fn pointer_offsets<L: Layout>(node: &dyn TreeNode<L>, cursor: &mut PageCursor) -> Option<Vec<usize>> {
    if !header::is_tree_node(cursor) {
        return None;
    }
    let mut offsets: Vec<usize> = HeaderPointer::ALL.iter().map(|which| which.offset()).collect();
    if !header::is_leaf(cursor) {
        let key_count = header::key_count(cursor);
        if node.reasonable_key_count(key_count, false) {
            offsets.extend((0..=key_count).map(|pos| node.child_offset(pos)));
        }
    }
    Some(offsets)
}

/// Zero crashed pointer slots in every tree node in
/// `[FIRST_TREE_PAGE, last_id]`.
pub fn clean<L: Layout>(
    file: &PagedFile,
    node: &dyn TreeNode<L>,
    generation: Generation,
    last_id: PageId,
) -> Result<CleanupSummary, TreeError> {
    let started = Instant::now();
    let mut summary = CleanupSummary::default();
    let mut reader = file.io(PfFlags::SharedRead)?;

    for id in FIRST_TREE_PAGE..=last_id {
        if !reader.next(id)? {
            break;
        }
        summary.pages_scanned += 1;
        let crashed = retry_until_stable(&mut reader, |c| {
            pointer_offsets(node, c).map(|offsets| {
                offsets
                    .into_iter()
                    .any(|offset| pointer::has_crashed_slot(c, offset, generation))
            })
        })?;
        let Some(crashed) = crashed else { continue };
        summary.tree_nodes += 1;
        if !crashed {
            continue;
        }

        let mut writer = file.io(PfFlags::ExclusiveWrite)?;
        writer.next(id)?;
        let offsets = pointer_offsets(node, &mut writer).unwrap_or_default();
        let cleaned: usize = offsets
            .into_iter()
            .map(|offset| pointer::clean_crashed(&mut writer, offset, generation))
            .sum();
        if cleaned > 0 {
            summary.nodes_cleaned += 1;
            summary.slots_cleaned += cleaned;
        }
    }

    summary.elapsed = started.elapsed();
    Ok(summary)
}
