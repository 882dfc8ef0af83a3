// A generation-aware B+tree index.
//
// Pieces, bottom up:
//  - pagecache: pages in memory frames with optimistic read validation
//  - tree::pointer: crash-safe pointer pairs stamped with generations
//  - tree::node: fixed and dynamic node formats
//  - tree::freelist: page id reuse, gated on stable generations
//  - tree::logic: insert/remove with copy-on-write successors
//  - tree::seek: lock-free range reads
//  - tree::consistency, tree::cleaner: verification and crash recovery
//  - tree: open, checkpoint and close

pub mod config;
pub mod pagecache;
pub mod tree;

#[cfg(test)]
mod scenario_tests;
#[cfg(test)]
mod testing;

pub use config::{CleanupMode, ConfigError, TreeConfig};
pub use tree::{
    BytesLayout, ConsistencyIssue, ConsistencyVisitor, GBPTree, Generation, KeepExisting, Layout, MergeOutcome,
    MetadataError, Overwrite, Seeker, TreeError, TreeStats, U64Layout, ValueMerger, Writer,
};
