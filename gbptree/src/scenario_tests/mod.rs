//! End-to-end scenarios against file-backed trees.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{CleanupMode, TreeConfig};
use crate::testing::{open_tree, scan_all, small_config, temp_tree_path};
use crate::tree::consistency::ConsistencyIssue;
use crate::tree::node::header::BASE_HEADER_LENGTH;
use crate::tree::{BytesLayout, GBPTree, MergeOutcome, MetadataError, TreeError, U64Layout};

/// Entries per leaf of `U64Layout` at 512 byte pages.
const LEAF_CAPACITY: u64 = ((512 - BASE_HEADER_LENGTH) / 16) as u64;

fn put_all(tree: &GBPTree<U64Layout>, keys: impl IntoIterator<Item = u64>) {
    let mut writer = tree.writer().expect("writer");
    for key in keys {
        writer.put(&key, &(key * 10)).expect("put");
    }
}

fn assert_consistent<L: crate::tree::Layout>(tree: &GBPTree<L>) {
    let mut issues: Vec<ConsistencyIssue> = Vec::new();
    let consistent = tree.consistency_check_with(&mut issues).expect("check");
    assert!(consistent, "{issues:#?}");
}

#[test]
fn test_basic_split() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());

    put_all(&tree, 1..=LEAF_CAPACITY);
    let stats = tree.stats().expect("stats");
    assert_eq!((stats.height, stats.leaf_nodes), (0, 1));

    put_all(&tree, [LEAF_CAPACITY + 1]);
    let stats = tree.stats().expect("stats");
    assert_eq!(stats.height, 1);
    assert_eq!(stats.internal_nodes, 1);
    assert_eq!(stats.leaf_nodes, 2);
    assert_eq!(stats.entries, LEAF_CAPACITY + 1);
    assert_consistent(&tree);

    let keys: Vec<u64> = scan_all(&tree, 0, u64::MAX).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (1..=LEAF_CAPACITY + 1).collect::<Vec<_>>());
}

#[test]
fn test_merge_on_underflow() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 1..=LEAF_CAPACITY + 1);
    assert_eq!(tree.stats().expect("stats").leaf_nodes, 2);

    // Remove from the right leaf until it underflows and merges.
    let mut key = LEAF_CAPACITY + 1;
    while key > LEAF_CAPACITY / 2 {
        tree.writer().expect("writer").remove(&key).expect("remove");
        key -= 1;
        if tree.stats().expect("stats").leaf_nodes == 1 {
            break;
        }
    }

    let stats = tree.stats().expect("stats");
    assert_eq!(stats.leaf_nodes, 1, "leaves never merged");
    assert_eq!(stats.height, 0);
    assert_consistent(&tree);
    let keys: Vec<u64> = scan_all(&tree, 0, u64::MAX).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (1..=key).collect::<Vec<_>>());
}

#[test]
fn test_crash_recovery_cleans_crashed_pointers() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 0..300);
    tree.checkpoint().expect("checkpoint");
    let checkpointed = scan_all(&tree, 0, u64::MAX);

    // Writes after the checkpoint reach the disk but are never checkpointed.
    put_all(&tree, 300..600);
    {
        let mut writer = tree.writer().expect("writer");
        for key in (0..300).step_by(3) {
            writer.remove(&key).expect("remove");
        }
    }
    tree.crash_after_flush();

    let tree = open_tree(&path, U64Layout, small_config());
    assert!(tree.was_dirty_on_startup());
    assert!(tree.consistency_check().expect("check"));
    assert_eq!(scan_all(&tree, 0, u64::MAX), checkpointed);

    // The recovered tree takes writes and checkpoints again.
    put_all(&tree, 1000..1100);
    tree.checkpoint().expect("checkpoint");
    assert_consistent(&tree);
    assert_eq!(tree.stats().expect("stats").entries, 400);
}

#[test]
fn test_crash_before_first_checkpoint_is_recovered() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 0..50);
    tree.crash_after_flush();

    let tree = open_tree(&path, U64Layout, small_config());
    assert!(tree.was_dirty_on_startup());
    assert_consistent(&tree);
    assert!(scan_all(&tree, 0, u64::MAX).is_empty());

    // Checkpointing must not bring the crashed writes back.
    tree.checkpoint().expect("checkpoint");
    assert_consistent(&tree);
    assert!(scan_all(&tree, 0, u64::MAX).is_empty());

    put_all(&tree, 100..110);
    tree.checkpoint().expect("checkpoint");
    tree.close().expect("close");
    let tree = open_tree(&path, U64Layout, small_config());
    assert!(!tree.was_dirty_on_startup());
    let keys: Vec<u64> = scan_all(&tree, 0, u64::MAX).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (100..110).collect::<Vec<_>>());
}

#[test]
fn test_deferred_cleanup() {
    let (_dir, path) = temp_tree_path();
    let config = small_config().with_cleanup(CleanupMode::Deferred);
    let tree = open_tree(&path, U64Layout, config.clone());
    put_all(&tree, 0..200);
    tree.checkpoint().expect("checkpoint");
    put_all(&tree, 200..400);
    tree.crash_after_flush();

    let tree = open_tree(&path, U64Layout, config);
    let mut issues: Vec<ConsistencyIssue> = Vec::new();
    assert!(!tree.consistency_check_with(&mut issues).expect("check"));
    assert!(issues.iter().any(|issue| matches!(issue, ConsistencyIssue::CrashedPointer { .. })));

    let summary = tree.cleanup().expect("cleanup").expect("cleanup was pending");
    assert!(summary.slots_cleaned > 0);
    assert!(tree.cleanup().expect("cleanup").is_none());
    assert_consistent(&tree);
    assert_eq!(tree.stats().expect("stats").entries, 200);
}

#[test]
fn test_unflushed_crash_loses_uncheckpointed_writes() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 0..50);
    tree.checkpoint().expect("checkpoint");
    put_all(&tree, 50..100);
    drop(tree);

    let tree = open_tree(&path, U64Layout, small_config());
    assert!(tree.was_dirty_on_startup());
    assert_eq!(tree.stats().expect("stats").entries, 50);
    assert_consistent(&tree);
}

#[test]
fn test_clean_close() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 0..100);
    tree.checkpoint().expect("checkpoint");
    tree.close().expect("close");

    let tree = open_tree(&path, U64Layout, small_config());
    assert!(!tree.was_dirty_on_startup());
    assert_eq!(tree.stats().expect("stats").entries, 100);

    // Changes since the checkpoint leave the tree dirty.
    put_all(&tree, 100..110);
    tree.close().expect("close");
    let tree = open_tree(&path, U64Layout, small_config());
    assert!(tree.was_dirty_on_startup());
    assert_eq!(tree.stats().expect("stats").entries, 100);
}

#[test]
fn test_offload_round_trip() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, BytesLayout, small_config());
    let big_key: Vec<u8> = (0..300u16).map(|i| (i % 251) as u8).collect();
    let big_value: Vec<u8> = (0..150u8).rev().collect();
    {
        let mut writer = tree.writer().expect("writer");
        writer.put(&big_key, &big_value).expect("put");
        writer.put(&b"small".to_vec(), &b"value".to_vec()).expect("put");
    }
    let stats = tree.stats().expect("stats");
    assert_eq!(stats.offload_pages, 1);
    assert_consistent(&tree);
    tree.checkpoint().expect("checkpoint");
    tree.close().expect("close");

    let tree = open_tree(&path, BytesLayout, small_config());
    let entries = scan_all(&tree, Vec::new(), vec![0xff; 8]);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], (big_key.clone(), big_value));

    let mut writer = tree.writer().expect("writer");
    let too_large = writer.put(&big_key, &vec![0u8; 600]);
    assert!(matches!(too_large, Err(TreeError::EntryTooLarge { .. })));
    assert_eq!(writer.remove(&big_key).expect("remove").map(|v| v.len()), Some(150));
    drop(writer);
    assert_eq!(tree.stats().expect("stats").offload_pages, 0);
    assert_consistent(&tree);
}

#[test]
fn test_seeded_random_workload_matches_model() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model = BTreeMap::new();

    for round in 0..6 {
        {
            let mut writer = tree.writer().expect("writer");
            for _ in 0..500 {
                let key = rng.random_range(0..1000u64);
                if rng.random_bool(0.65) {
                    let value = rng.random_range(0..u64::MAX);
                    writer.put(&key, &value).expect("put");
                    model.insert(key, value);
                } else {
                    let removed = writer.remove(&key).expect("remove");
                    assert_eq!(removed, model.remove(&key), "round {round} key {key}");
                }
            }
        }
        let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(scan_all(&tree, 0, u64::MAX), expected, "round {round}");
        let backward: Vec<_> = expected.iter().rev().filter(|(k, _)| *k != 0).copied().collect();
        assert_eq!(scan_all(&tree, u64::MAX, 0), backward, "round {round}");
        assert_consistent(&tree);
        if round % 2 == 1 {
            tree.checkpoint().expect("checkpoint");
        }
    }
}

#[test]
fn test_seeded_random_bytes_workload() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, BytesLayout, small_config());
    let mut rng = StdRng::seed_from_u64(7);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for round in 0..4 {
        {
            let mut writer = tree.writer().expect("writer");
            for _ in 0..300 {
                let key_len = rng.random_range(1..40);
                let key: Vec<u8> = (0..key_len).map(|_| rng.random_range(b'a'..=b'f')).collect();
                if rng.random_bool(0.7) {
                    let long = rng.random_bool(0.05);
                    let value_len = rng.random_range(0..if long { 200 } else { 30 });
                    let value: Vec<u8> = (0..value_len).map(|_| rng.random()).collect();
                    writer.put(&key, &value).expect("put");
                    model.insert(key, value);
                } else {
                    assert_eq!(writer.remove(&key).expect("remove"), model.remove(&key));
                }
            }
        }
        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(scan_all(&tree, Vec::new(), vec![0xff]), expected, "round {round}");
        assert_consistent(&tree);
        tree.checkpoint().expect("checkpoint");
    }
}

#[test]
fn test_backward_seek_bounds() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, (0..500).map(|k| k * 2));

    let keys: Vec<u64> = scan_all(&tree, 301, 100).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (51..=150).rev().map(|k| k * 2).collect::<Vec<_>>());

    let keys: Vec<u64> = scan_all(&tree, 300, 100).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys.first(), Some(&300));
    assert_eq!(keys.last(), Some(&102));
}

#[test]
fn test_checkpoint_generation_monotonic() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    let initial = tree.generation();
    assert!(initial.stable < initial.unstable);
    for n in 1..=5u32 {
        put_all(&tree, [u64::from(n)]);
        tree.checkpoint().expect("checkpoint");
        let generation = tree.generation();
        assert_eq!(generation.unstable, initial.unstable + n);
        assert_eq!(generation.stable, generation.unstable - 1);
    }
    let before_close = tree.generation();
    tree.close().expect("close");

    let tree = open_tree(&path, U64Layout, small_config());
    let reopened = tree.generation();
    assert_eq!(reopened.stable, before_close.stable);
    assert_eq!(reopened.unstable, before_close.unstable + 1);
}

#[test]
fn test_concurrent_readers_see_consistent_scans() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config().with_read_ahead(3));
    put_all(&tree, (0..1500).map(|k| k * 2));
    tree.checkpoint().expect("checkpoint");
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let tree = tree.clone();
            let done = &done;
            scope.spawn(move || {
                let mut scans = 0;
                while !done.load(Ordering::Acquire) || scans == 0 {
                    let entries = scan_all(&tree, 0, u64::MAX);
                    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0), "scan out of order");
                    for (key, value) in &entries {
                        assert_eq!(*value, key * 10, "wrong value for {key}");
                    }
                    // Even keys not divisible by 10 are never touched.
                    let stable = entries.iter().filter(|(k, _)| k % 2 == 0 && k % 10 != 0).count();
                    assert_eq!(stable, 1200);
                    scans += 1;
                }
            });
        }

        for round in 0..6u64 {
            {
                let mut writer = tree.writer().expect("writer");
                for key in (0..1500).map(|k| k * 2 + 1).filter(|k| k % 6 == round) {
                    writer.put(&key, &(key * 10)).expect("put");
                }
                for key in (0..300).map(|k| k * 10).filter(|k| k % 60 == round * 10) {
                    writer.remove(&key).expect("remove");
                }
            }
            if round % 2 == 0 {
                tree.checkpoint().expect("checkpoint");
            }
        }
        done.store(true, Ordering::Release);
    });

    assert_consistent(&tree);
}

#[test]
fn test_concurrent_backward_readers_see_every_untouched_key() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config().with_read_ahead(2));
    put_all(&tree, (0..1000).map(|k| k * 4));
    tree.checkpoint().expect("checkpoint");
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for reader in 0..4u64 {
            let tree = tree.clone();
            let done = &done;
            scope.spawn(move || {
                let mut scans = 0u64;
                while !done.load(Ordering::Acquire) || scans == 0 {
                    let forward = (reader + scans) % 4 == 0;
                    let entries = if forward {
                        scan_all(&tree, 0, u64::MAX)
                    } else {
                        scan_all(&tree, u64::MAX, 0)
                    };
                    let ordered = if forward {
                        entries.windows(2).all(|w| w[0].0 < w[1].0)
                    } else {
                        entries.windows(2).all(|w| w[0].0 > w[1].0)
                    };
                    assert!(ordered, "scan out of order, forward={forward}");
                    // Multiples of 4 are never written after the first checkpoint.
                    let untouched: Vec<u64> = entries.iter().map(|(k, _)| *k).filter(|k| k % 4 == 0).collect();
                    let mut expected: Vec<u64> = (0..1000).map(|k| k * 4).filter(|k| forward || *k != 0).collect();
                    if !forward {
                        expected.reverse();
                    }
                    assert_eq!(untouched, expected, "forward={forward}");
                    scans += 1;
                }
            });
        }

        let mut rng = StdRng::seed_from_u64(0xb4c4);
        for round in 0..12 {
            {
                let mut writer = tree.writer().expect("writer");
                for _ in 0..400 {
                    let key = rng.random_range(0..4000u64);
                    if key % 4 == 0 {
                        continue;
                    }
                    if rng.random_bool(0.6) {
                        writer.put(&key, &(key * 10)).expect("put");
                    } else {
                        writer.remove(&key).expect("remove");
                    }
                }
            }
            if round % 3 == 2 {
                tree.checkpoint().expect("checkpoint");
            }
        }
        done.store(true, Ordering::Release);
    });

    assert_consistent(&tree);
}

#[test]
fn test_reopen_with_other_layout_or_page_size_fails() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 0..10);
    tree.checkpoint().expect("checkpoint");
    tree.close().expect("close");

    let err = GBPTree::open(&path, BytesLayout, small_config(), None).expect_err("layout mismatch");
    assert!(matches!(err, TreeError::Metadata(MetadataError::LayoutMismatch { .. })));

    let err = GBPTree::open(&path, U64Layout, small_config().with_page_size(1024), None).expect_err("page size");
    assert!(matches!(
        err,
        TreeError::Metadata(MetadataError::PageSizeMismatch {
            expected: 1024,
            actual: 512
        })
    ));

    // The failed opens leave the tree intact.
    let tree = open_tree(&path, U64Layout, small_config());
    assert_eq!(tree.stats().expect("stats").entries, 10);
}

#[test]
fn test_garbage_file_is_rejected() {
    let (_dir, path) = temp_tree_path();
    std::fs::write(&path, vec![0xabu8; 2048]).expect("write");
    let err = GBPTree::open(&path, U64Layout, small_config(), None).expect_err("garbage");
    assert!(matches!(err, TreeError::Metadata(MetadataError::InvalidMagic)));
}

#[test]
fn test_torn_state_page_falls_back_to_previous_checkpoint() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 0..20);
    tree.checkpoint().expect("checkpoint");
    put_all(&tree, 20..40);
    tree.checkpoint().expect("checkpoint");
    drop(tree);

    // Creation leaves its opened state in page 2, so checkpoints alternate
    // starting at page 1: the first went to page 1, the second to page 2.
    // Flip bits in one page at a time.
    let original = std::fs::read(&path).expect("read");
    let mut rng = StdRng::seed_from_u64(3);
    for (slot, expected) in [(1usize, 40u64), (2, 20)] {
        let mut bytes = original.clone();
        for _ in 0..rng.random_range(1..=8) {
            let offset = slot * 512 + rng.random_range(0..512);
            bytes[offset] ^= 1 << rng.random_range(0..8u8);
        }
        std::fs::write(&path, &bytes).expect("write");
        let tree = open_tree(&path, U64Layout, small_config());
        assert_eq!(tree.stats().expect("stats").entries, expected, "torn page {slot}");
        assert_consistent(&tree);
        drop(tree);
    }
}

#[test]
fn test_read_only_open() {
    let (_dir, path) = temp_tree_path();
    let err = GBPTree::open(&path, U64Layout, small_config().with_read_only(true), None).expect_err("missing");
    assert!(matches!(err, TreeError::Metadata(MetadataError::EmptyFile)));

    let tree = open_tree(&path, U64Layout, small_config());
    put_all(&tree, 0..100);
    tree.checkpoint().expect("checkpoint");
    tree.close().expect("close");
    let before = std::fs::read(&path).expect("read");

    let tree = open_tree(&path, U64Layout, small_config().with_read_only(true));
    assert_eq!(scan_all(&tree, 10, 13), vec![(10, 100), (11, 110), (12, 120)]);
    assert!(matches!(tree.writer(), Err(TreeError::ReadOnly)));
    assert!(matches!(tree.checkpoint(), Err(TreeError::ReadOnly)));
    assert!(tree.consistency_check().expect("check"));
    tree.close().expect("close");
    assert_eq!(std::fs::read(&path).expect("read"), before);
}

#[test]
fn test_header_blob() {
    let (_dir, path) = temp_tree_path();
    crate::testing::init_tracing();
    let tree = GBPTree::open(&path, U64Layout, small_config(), Some(b"hello".as_slice())).expect("open");
    assert_eq!(tree.header(), b"hello");
    tree.checkpoint_with_header(b"world").expect("checkpoint");
    assert_eq!(tree.header(), b"world");

    let too_large = vec![0u8; 512];
    assert!(matches!(
        tree.checkpoint_with_header(&too_large),
        Err(TreeError::HeaderTooLarge { .. })
    ));
    tree.close().expect("close");

    let tree = GBPTree::open(&path, U64Layout, small_config(), Some(b"ignored".as_slice())).expect("open");
    assert_eq!(tree.header(), b"world");
}

#[test]
fn test_mergers() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    let add = |_key: &u64, existing: &u64, new: &u64| MergeOutcome::Replaced(existing + new);
    let drop_on_zero = |_key: &u64, _existing: &u64, new: &u64| -> MergeOutcome<u64> {
        if *new == 0 { MergeOutcome::Removed } else { MergeOutcome::Unchanged }
    };

    let mut writer = tree.writer().expect("writer");
    writer.merge(&1, &5, &add).expect("merge");
    writer.merge(&1, &7, &add).expect("merge");
    writer.merge_if_exists(&2, &7, &add).expect("merge");
    writer.merge_if_exists(&1, &1, &add).expect("merge");
    writer.put(&3, &30).expect("put");
    writer.merge(&3, &0, &drop_on_zero).expect("merge");
    writer.merge(&1, &9, &drop_on_zero).expect("merge");
    drop(writer);

    assert_eq!(scan_all(&tree, 0, 10), vec![(1, 13)]);
}

#[test]
fn test_writer_exclusion_and_closed_tree() {
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, small_config());
    let other = tree.clone();
    {
        let _writer = tree.writer().expect("writer");
        assert!(other.try_writer().expect("try").is_none());
    }
    assert!(other.try_writer().expect("try").is_some());

    let mut seeker = other.seek(0, 10).expect("seek");
    tree.close().expect("close");
    assert!(matches!(other.seek(0, 10), Err(TreeError::TreeClosed)));
    assert!(matches!(other.writer(), Err(TreeError::TreeClosed)));
    seeker.close();
    assert!(matches!(seeker.next_entry(), Err(TreeError::CursorClosed)));
}

#[test]
fn test_config_from_lookup_drives_open() {
    let config = TreeConfig::from_lookup(|name| match name {
        "GBPTREE_PAGE_SIZE" => Some("1024".to_string()),
        "GBPTREE_READ_AHEAD" => Some("4".to_string()),
        _ => None,
    })
    .expect("config");
    let (_dir, path) = temp_tree_path();
    let tree = open_tree(&path, U64Layout, config);
    put_all(&tree, 0..300);
    assert_eq!(tree.config().page_size, 1024);
    assert_eq!(scan_all(&tree, 0, u64::MAX).len(), 300);
}
