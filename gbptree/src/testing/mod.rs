use std::path::PathBuf;
use std::sync::Once;

use tempfile::TempDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TreeConfig;
use crate::tree::{GBPTree, Layout};

static TRACING: Once = Once::new();

/// Route tree logs to the test output. Filtered through `RUST_LOG`, quiet by
/// default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "gbptree=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A fresh temporary directory and the path of a tree file inside it.
pub fn temp_tree_path() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("tree.db");
    (dir, path)
}

/// Small pages, so that a few hundred entries already build several levels.
pub fn small_config() -> TreeConfig {
    TreeConfig::default().with_page_size(512).with_read_ahead(8)
}

pub fn open_tree<L: Layout>(path: &std::path::Path, layout: L, config: TreeConfig) -> GBPTree<L> {
    init_tracing();
    GBPTree::open(path, layout, config, None).expect("failed to open tree")
}

/// Every entry of the tree, in key order.
pub fn scan_all<L: Layout>(tree: &GBPTree<L>, from: L::Key, to: L::Key) -> Vec<(L::Key, L::Value)> {
    tree.seek(from, to)
        .expect("seek")
        .map(|entry| entry.expect("entry"))
        .collect()
}
