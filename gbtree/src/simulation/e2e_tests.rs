//! End-to-end scenarios through the public tree API.
//!
//! These tests drive whole trees (create, write, read concurrently,
//! checkpoint, close, reopen) with deterministic inputs.

#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TreeConfig;
use crate::storage::PageStore;
use crate::testing::{init_test_logging, new_memory_store, small_node_config};
use crate::tree::{
    BytesLayout, GBTree, ImmediateCollector, MAX_ENTRY_SIZE, TreeError, TreeMonitor, U64Layout,
};

fn keys_of(tree: &GBTree<U64Layout>) -> Vec<u64> {
    tree.seek_all()
        .expect("seeker")
        .map(|entry| entry.expect("entry").0)
        .collect()
}

#[derive(Default)]
struct ShapeMonitor {
    growths: AtomicUsize,
    shrinks: AtomicUsize,
}

impl TreeMonitor for ShapeMonitor {
    fn tree_growth(&self, _height: usize) {
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    fn tree_shrink(&self, _height: usize) {
        self.shrinks.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_insert_seek_remove_small_nodes() {
    init_test_logging();
    let (_, store) = new_memory_store(1);
    let config = TreeConfig {
        max_node_keys: Some(3),
        ..TreeConfig::default()
    };
    let tree = GBTree::create(store, U64Layout, config).expect("create");

    {
        let mut writer = tree.writer().expect("writer");
        for key in [5, 1, 9, 3, 7, 2, 8, 4, 6] {
            writer.put(key, key * 10).expect("put");
        }
    }
    let entries: Vec<(u64, u64)> = tree
        .seek(&1, &10)
        .expect("seeker")
        .map(|entry| entry.expect("entry"))
        .collect();
    assert_eq!(entries, (1..=9).map(|k| (k, k * 10)).collect::<Vec<_>>());
    assert!(tree.height() > 1);

    let height_before = tree.height();
    {
        let mut writer = tree.writer().expect("writer");
        assert_eq!(writer.remove(&5).expect("remove"), Some(50));
        assert_eq!(writer.remove(&6).expect("remove"), Some(60));
        assert_eq!(writer.remove(&6).expect("remove"), None);
    }
    assert_eq!(keys_of(&tree), vec![1, 2, 3, 4, 7, 8, 9]);
    let height_after = tree.height();
    assert!(height_after <= height_before);
    assert!(height_before - height_after <= 1);
    tree.consistency_check().expect("consistent");
}

#[test]
fn test_seek_bounds() {
    let (_, store) = new_memory_store(2);
    let tree = GBTree::create(store, U64Layout, small_node_config()).expect("create");
    {
        let mut writer = tree.writer().expect("writer");
        for key in (0..100).step_by(10) {
            writer.put(key, key).expect("put");
        }
    }

    let between: Vec<u64> = tree
        .seek(&15, &45)
        .expect("seeker")
        .map(|entry| entry.expect("entry").0)
        .collect();
    assert_eq!(between, vec![20, 30, 40]);

    assert_eq!(tree.seek(&50, &50).expect("seeker").count(), 0);
    assert_eq!(tree.seek(&60, &10).expect("seeker").count(), 0);
    assert_eq!(tree.seek(&1000, &2000).expect("seeker").count(), 0);

    let from: Vec<u64> = tree
        .seek_from(&75)
        .expect("seeker")
        .map(|entry| entry.expect("entry").0)
        .collect();
    assert_eq!(from, vec![80, 90]);
}

#[test]
fn test_growth_and_shrink_reported() {
    init_test_logging();
    let (_, store) = new_memory_store(3);
    let monitor = Arc::new(ShapeMonitor::default());
    let tree = GBTree::create_with_monitor(
        store,
        U64Layout,
        small_node_config(),
        Arc::clone(&monitor) as Arc<dyn TreeMonitor>,
    )
    .expect("create");

    {
        let mut writer = tree.writer().expect("writer");
        for key in 0..200 {
            writer.put(key, key).expect("put");
        }
    }
    let grown = tree.height();
    assert!(grown >= 3);
    assert_eq!(monitor.growths.load(Ordering::Relaxed), grown - 1);

    {
        let mut writer = tree.writer().expect("writer");
        for key in 0..200 {
            writer.remove(&key).expect("remove");
        }
    }
    assert!(keys_of(&tree).is_empty());
    assert_eq!(tree.height(), 1);
    assert_eq!(monitor.shrinks.load(Ordering::Relaxed), grown - 1);
    tree.consistency_check().expect("consistent");
}

#[test]
fn test_writer_lock_timeout() {
    let (_, store) = new_memory_store(4);
    let config = TreeConfig {
        writer_lock_timeout: Duration::from_millis(50),
        ..TreeConfig::default()
    };
    let tree = GBTree::create(store, U64Layout, config).expect("create");

    let held = tree.writer().expect("writer");
    std::thread::scope(|scope| {
        let result = scope.spawn(|| tree.writer().map(|_| ())).join().expect("join");
        assert!(matches!(result, Err(TreeError::WriterLockTimeout(_))));
        assert!(matches!(tree.checkpoint(), Err(TreeError::WriterLockTimeout(_))));
    });
    drop(held);

    tree.writer().expect("writer after release");
}

#[test]
fn test_readers_see_consistent_snapshots_during_writes() {
    init_test_logging();
    let (_, store) = new_memory_store(5);
    let tree = GBTree::create(store, U64Layout, small_node_config()).expect("create");

    // Odd keys are never touched by the writer below.
    {
        let mut writer = tree.writer().expect("writer");
        for key in (1..400).step_by(2) {
            writer.put(key, key).expect("put");
        }
    }
    tree.checkpoint().expect("checkpoint");

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let keys: Vec<u64> = tree
                        .seek_all()
                        .expect("seeker")
                        .map(|entry| entry.expect("entry").0)
                        .collect();
                    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
                    let odd: Vec<u64> = keys.into_iter().filter(|k| k % 2 == 1).collect();
                    assert_eq!(odd, (1..400).step_by(2).collect::<Vec<_>>());
                }
            });
        }

        let mut rng = StdRng::seed_from_u64(5);
        for round in 0..40 {
            {
                let mut writer = tree.writer().expect("writer");
                for _ in 0..50 {
                    let key = rng.random_range(0..200) * 2;
                    if rng.random_bool(0.6) {
                        writer.put(key, round).expect("put");
                    } else {
                        writer.remove(&key).expect("remove");
                    }
                }
            }
            if round % 10 == 9 {
                tree.checkpoint().expect("checkpoint");
            }
        }
        done.store(true, Ordering::Release);
    });

    tree.consistency_check().expect("consistent");
}

#[test]
fn test_variable_size_entries_survive_reopen() {
    init_test_logging();
    let (_, store) = new_memory_store(6);
    let mut rng = StdRng::seed_from_u64(6);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    let tree = GBTree::create(Arc::clone(&store), BytesLayout, TreeConfig::default())
        .expect("create");
    {
        let mut writer = tree.writer().expect("writer");
        for _ in 0..600 {
            let key_len = rng.random_range(1..200);
            let key: Vec<u8> = (0..key_len).map(|_| rng.random_range(b'a'..=b'f')).collect();
            let value: Vec<u8> = (0..rng.random_range(0..300)).map(|_| rng.random()).collect();
            writer.put(key.clone(), value.clone()).expect("put");
            model.insert(key, value);
        }
        let doomed: Vec<Vec<u8>> = model.keys().step_by(3).cloned().collect();
        for key in doomed {
            assert_eq!(writer.remove(&key).expect("remove"), model.remove(&key));
        }
    }
    assert!(tree.height() > 1);
    tree.close().expect("close");

    let reopened = GBTree::open(store, BytesLayout, TreeConfig::default(), &ImmediateCollector)
        .expect("open");
    assert!(reopened.is_clean());
    let entries: Vec<(Vec<u8>, Vec<u8>)> = reopened
        .seek_all()
        .expect("seeker")
        .map(|entry| entry.expect("entry"))
        .collect();
    assert_eq!(entries, model.into_iter().collect::<Vec<_>>());
    reopened.consistency_check().expect("consistent");
}

#[test]
fn test_oversized_entry_rejected() {
    let (_, store) = new_memory_store(7);
    let tree = GBTree::create(store, BytesLayout, TreeConfig::default()).expect("create");
    let mut writer = tree.writer().expect("writer");

    let result = writer.put(vec![7; MAX_ENTRY_SIZE], b"v".to_vec());
    assert!(matches!(result, Err(TreeError::EntryTooLarge { .. })));

    let key = vec![7; 64];
    writer.put(key.clone(), vec![1; 512]).expect("put");
    assert_eq!(writer.get(&key).expect("get"), Some(vec![1; 512]));
}

#[test]
fn test_checkpoint_then_crash_keeps_checkpointed_data() {
    init_test_logging();
    let (memory, store) = new_memory_store(8);
    let tree = GBTree::create(Arc::clone(&store), U64Layout, small_node_config())
        .expect("create");
    {
        let mut writer = tree.writer().expect("writer");
        for key in 0..150 {
            writer.put(key, key).expect("put");
        }
        writer.checkpoint().expect("checkpoint");
        for key in 150..300 {
            writer.put(key, key).expect("put");
        }
    }
    drop(tree);
    memory.crash(crate::storage::CrashMode::DropUnsynced);

    let tree = GBTree::open(store, U64Layout, small_node_config(), &ImmediateCollector)
        .expect("open");
    assert_eq!(keys_of(&tree), (0..150).collect::<Vec<_>>());
}

#[derive(Debug, Clone)]
enum ModelOp {
    Put(u64, u64),
    Remove(u64),
    Checkpoint,
}

fn model_op() -> impl Strategy<Value = ModelOp> {
    prop_oneof![
        6 => (0u64..128, any::<u64>()).prop_map(|(k, v)| ModelOp::Put(k, v)),
        3 => (0u64..128).prop_map(ModelOp::Remove),
        1 => Just(ModelOp::Checkpoint),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tree_matches_btreemap(
        ops in proptest::collection::vec(model_op(), 1..300),
        from in 0u64..128,
        span in 0u64..64,
    ) {
        let (_, store): (_, Arc<dyn PageStore>) = new_memory_store(9);
        let tree = GBTree::create(store, U64Layout, small_node_config()).expect("create");
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                ModelOp::Put(key, value) => {
                    tree.writer().expect("writer").put(key, value).expect("put");
                    model.insert(key, value);
                }
                ModelOp::Remove(key) => {
                    let removed = tree.writer().expect("writer").remove(&key).expect("remove");
                    prop_assert_eq!(removed, model.remove(&key));
                }
                ModelOp::Checkpoint => tree.checkpoint().expect("checkpoint"),
            }
        }

        let all: Vec<(u64, u64)> = tree
            .seek_all()
            .expect("seeker")
            .map(|e| e.expect("entry"))
            .collect();
        prop_assert_eq!(all, model.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>());

        let to = from + span;
        let range: Vec<(u64, u64)> = tree
            .seek(&from, &to)
            .expect("seeker")
            .map(|e| e.expect("entry"))
            .collect();
        prop_assert_eq!(range, model.range(from..to).map(|(&k, &v)| (k, v)).collect::<Vec<_>>());

        let report = tree.consistency_check().expect("consistent");
        prop_assert_eq!(report.keys, model.len() as u64);
    }
}
