//! Functional scenarios for `CaTree` on a single thread.
//!
//! Splits and joins are forced through the diagnostic API or driven by a
//! tuned [`AdaptationConfig`], so partition boundaries are exercised
//! without relying on real contention.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use catree::{
    AdaptationConfig, CaTree, CaTreeError, FnComparator, RangeLockMode, RangeScratch,
    debug_counters,
};
use std::sync::Arc;

// ============================================================================
//  Helpers
// ============================================================================

/// Keys `0..n` mapped to `k * 10`, adaptation disabled.
fn filled(n: i32) -> CaTree<i32, i32> {
    let tree = CaTree::with_config(AdaptationConfig::frozen());
    for k in 0..n {
        tree.put(k, k * 10);
    }
    tree
}

/// Split the tree a few times around `points`; only the first split is
/// guaranteed to find a partition with two or more keys.
fn split_around(tree: &CaTree<i32, i32>, points: &[i32]) {
    let (first, rest) = points.split_first().unwrap();
    assert!(tree.force_split(first));
    for p in rest {
        tree.force_split(p);
    }
}

// ============================================================================
//  Point operations
// ============================================================================

#[test]
fn test_empty_tree() {
    common::init_tracing();

    let tree: CaTree<i32, i32> = CaTree::new();
    assert!(tree.is_empty());
    assert_eq!(tree.len(), 0);
    assert_eq!(tree.get(&1), None);
    assert_eq!(tree.remove(&1), None);
    assert!(tree.sub_set(&0, &100).is_empty());
    assert!(tree.keys().is_empty());
    assert_eq!(tree.route_node_count(), 0);
    assert_eq!(tree.partition_count(), 1);
}

#[test]
fn test_put_replaces_and_returns_previous() {
    let tree: CaTree<String, u64> = CaTree::new();

    assert_eq!(tree.put("a".to_string(), 1), None);
    assert_eq!(tree.put("a".to_string(), 2).as_deref(), Some(&1));
    assert_eq!(tree.get(&"a".to_string()).as_deref(), Some(&2));
    assert_eq!(tree.len(), 1);
}

#[test]
fn test_put_arc_shares_value() {
    let tree: CaTree<i32, Vec<u8>> = CaTree::new();
    let value = Arc::new(vec![1, 2, 3]);

    tree.put_arc(1, Arc::clone(&value));
    let read = tree.get(&1).unwrap();

    assert!(Arc::ptr_eq(&read, &value));
}

#[test]
fn test_put_if_absent_keeps_existing() {
    let tree: CaTree<i32, &str> = CaTree::new();

    assert_eq!(tree.put_if_absent(7, "first"), None);
    assert_eq!(tree.put_if_absent(7, "second").as_deref(), Some(&"first"));
    assert_eq!(tree.get(&7).as_deref(), Some(&"first"));
}

#[test]
fn test_remove_absent_is_idempotent() {
    let tree = filled(20);

    assert_eq!(tree.remove(&100), None);
    assert_eq!(tree.len(), 20);
    assert_eq!(tree.remove(&5).as_deref(), Some(&50));
    assert_eq!(tree.remove(&5), None);
    assert_eq!(tree.len(), 19);
}

// ============================================================================
//  Split / join
// ============================================================================

#[test]
fn test_splits_preserve_keys() {
    common::init_tracing();

    let tree = filled(100);
    split_around(&tree, &[50, 20, 80, 5, 95, 35, 65]);

    assert!(tree.route_node_count() >= 1);
    assert_eq!(tree.size(), 100);
    for k in 0..100 {
        assert_eq!(tree.get(&k).as_deref(), Some(&(k * 10)), "key {k}");
    }
    assert_eq!(tree.keys(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_shape_is_consistent_after_splits() {
    let tree = filled(100);
    split_around(&tree, &[50, 25, 75]);

    let shape = tree.shape();
    assert_eq!(shape.partitions, shape.route_nodes + 1);
    assert!(shape.partition_sizes.iter().all(|&n| n > 0));
    assert_eq!(shape.partition_sizes.iter().sum::<usize>(), 100);
    assert!(shape.max_depth <= shape.route_nodes);
}

#[test]
fn test_force_join_restores_keys() {
    let tree = filled(100);
    split_around(&tree, &[50, 25, 75]);

    let mut rounds = 0;
    while tree.route_node_count() > 0 {
        for k in [0, 30, 60, 99] {
            tree.force_join(&k);
        }
        rounds += 1;
        assert!(rounds < 100, "joins did not converge");
    }

    assert_eq!(tree.partition_count(), 1);
    assert_eq!(tree.keys(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_tiny_partition_does_not_split() {
    let tree = filled(1);

    assert!(!tree.force_split(&0));
    assert_eq!(tree.route_node_count(), 0);
}

#[test]
fn test_quiet_partitions_join_back() {
    let config = AdaptationConfig::new().with_low_contention_limit(-50);
    let tree: CaTree<i32, i32> = CaTree::with_config(config);
    for k in 0..100 {
        tree.put(k, k);
    }
    tree.force_split(&50);
    tree.force_split(&20);
    tree.force_split(&80);

    // Uncontended writes lower every partition's score below the limit.
    let mut rounds = 0;
    while tree.route_node_count() > 0 {
        for k in 0..100 {
            tree.put(k, k + rounds);
        }
        rounds += 1;
        assert!(rounds < 1000, "joins did not converge");
    }

    assert_eq!(tree.len(), 100);
    assert_eq!(tree.locks_held(), 0);
}

#[test]
fn test_split_and_join_counters_advance() {
    let before = debug_counters();

    let tree = filled(100);
    assert!(tree.force_split(&50));
    assert!(tree.force_join(&0));

    let after = debug_counters();
    assert!(after.splits > before.splits);
    assert!(after.joins > before.joins);
}

// ============================================================================
//  Range queries
// ============================================================================

#[test]
fn test_range_inside_one_partition() {
    let tree = filled(100);
    split_around(&tree, &[50]);

    assert_eq!(tree.sub_set(&60, &65), vec![60, 61, 62, 63, 64, 65]);
    assert_eq!(tree.sub_set(&3, &3), vec![3]);
}

#[test]
fn test_range_across_split_boundary() {
    let tree = filled(100);
    split_around(&tree, &[50, 25, 75]);

    assert_eq!(tree.sub_set(&40, &60), (40..=60).collect::<Vec<_>>());
    assert_eq!(tree.sub_set(&10, &90), (10..=90).collect::<Vec<_>>());
}

#[test]
fn test_range_with_no_matches() {
    let tree: CaTree<i32, i32> = CaTree::with_config(AdaptationConfig::frozen());
    for k in (0..100).map(|k| k * 3 + 1) {
        tree.put(k, k);
    }
    tree.force_split(&150);

    assert!(tree.sub_set(&50, &50).is_empty());
    assert!(tree.sub_set(&500, &600).is_empty());
    assert!(tree.sub_set(&-10, &0).is_empty());
}

#[test]
fn test_range_past_both_ends() {
    let tree = filled(100);
    split_around(&tree, &[50, 10, 90]);

    assert_eq!(tree.sub_set(&-30, &130), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_optimistic_matches_pessimistic() {
    let tree = filled(200);
    split_around(&tree, &[100, 50, 150, 25, 175]);

    for (lo, hi) in [(0, 199), (-5, 10), (49, 51), (120, 400), (77, 77), (300, 310)] {
        let optimistic = tree.sub_set(&lo, &hi);
        let read = tree.sub_set_pessimistic(&lo, &hi, RangeLockMode::Read);
        let write = tree.sub_set_pessimistic(&lo, &hi, RangeLockMode::Write);

        assert_eq!(optimistic, read, "range {lo}..={hi}");
        assert_eq!(optimistic, write, "range {lo}..={hi}");
    }
    assert_eq!(tree.locks_held(), 0);
}

#[test]
fn test_range_consumer_and_scratch() {
    let tree = filled(100);
    split_around(&tree, &[50, 30]);

    let mut seen = Vec::new();
    tree.sub_set_with(&45, &55, |k| seen.push(*k));
    assert_eq!(seen, (45..=55).collect::<Vec<_>>());

    let mut scratch: RangeScratch<i32, i32> = RangeScratch::with_capacity(8, 16);
    assert_eq!(tree.sub_set_into(&0, &4, &mut scratch), &[0, 1, 2, 3, 4]);
    assert_eq!(tree.sub_set_into(&98, &200, &mut scratch), &[98, 99]);

    let mut total = 0;
    tree.sub_set_in(&10, &19, &mut scratch, |k| total += *k);
    assert_eq!(total, (10..=19).sum::<i32>());
}

#[test]
fn test_checked_range_rejects_inverted_bounds() {
    let tree = filled(10);

    assert_eq!(tree.try_sub_set(&5, &2), Err(CaTreeError::InvalidRange));
    assert_eq!(tree.try_sub_set(&2, &5), Ok(vec![2, 3, 4, 5]));
    assert!(tree.sub_set(&5, &2).is_empty());
}

#[test]
fn test_range_update_is_unsupported() {
    let tree = filled(10);

    let result = tree.range_update(&0, &9, |_, v| v + 1);
    assert!(matches!(result, Err(CaTreeError::Unsupported { .. })));
    assert_eq!(tree.get(&3).as_deref(), Some(&30));
}

// ============================================================================
//  Whole-tree operations
// ============================================================================

#[test]
fn test_entry_set_and_clear() {
    let tree = filled(60);
    split_around(&tree, &[30, 10]);

    let mut entries: Vec<(i32, i32)> = tree.entry_set().into_iter().map(|(k, v)| (k, *v)).collect();
    entries.sort_unstable();
    assert_eq!(entries, (0..60).map(|k| (k, k * 10)).collect::<Vec<_>>());

    tree.clear();
    assert!(tree.is_empty());
    assert_eq!(tree.route_node_count(), 0);

    tree.put(1, 1);
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.locks_held(), 0);
}

#[test]
fn test_custom_comparator() {
    let descending = FnComparator::new(|a: &i32, b: &i32| b.cmp(a));
    let tree: CaTree<i32, i32, _> =
        CaTree::with_comparator_and_config(descending, AdaptationConfig::frozen());
    for k in 0..50 {
        tree.put(k, k);
    }
    assert!(tree.force_split(&25));

    assert_eq!(tree.keys(), (0..50).rev().collect::<Vec<_>>());
    // Bounds follow the comparator: "low" is the larger integer.
    assert_eq!(tree.sub_set(&30, &27), vec![30, 29, 28, 27]);
}
