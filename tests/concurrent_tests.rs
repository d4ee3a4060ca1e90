//! Multi-threaded tests for `CaTree`.
//!
//! Covers point-operation linearizability on disjoint and shared keys,
//! range queries racing with writers and adaptation, contention-driven
//! splits and quiet-period joins, and lock release after every run.
//!
//! Run with logging:
//! ```bash
//! RUST_LOG=catree=debug cargo test --features tracing --test concurrent_tests
//! ```

#![expect(clippy::unwrap_used)]
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

mod common;

use catree::{AdaptationConfig, CaTree, RangeLockMode, debug_counters};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// =============================================================================
// Test Configuration
// =============================================================================

const THREADS: usize = 4;

/// Adapts quickly and panics on livelock.
fn eager_config() -> AdaptationConfig {
    AdaptationConfig::new()
        .with_high_contention_limit(20)
        .with_low_contention_limit(-50)
        .with_retry_limit(Some(1_000_000))
}

/// Tiny xorshift for per-thread key streams.
fn next(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

// =============================================================================
// Point operations
// =============================================================================

#[test]
fn test_disjoint_writers_see_own_keys() {
    common::init_tracing();

    let tree: Arc<CaTree<u64, u64>> = Arc::new(CaTree::with_config(eager_config()));
    let per_thread = 5_000u64;

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let base = t * per_thread;
                for k in base..base + per_thread {
                    assert_eq!(tree.put(k, k), None);
                    assert_eq!(tree.get(&k).as_deref(), Some(&k));
                }
                for k in (base..base + per_thread).step_by(2) {
                    assert_eq!(tree.remove(&k).as_deref(), Some(&k));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let expected: Vec<u64> = (0..THREADS as u64 * per_thread).filter(|k| k % 2 == 1).collect();
    assert_eq!(tree.keys(), expected);
    assert_eq!(tree.len(), expected.len());
    assert_eq!(tree.locks_held(), 0);
}

#[test]
fn test_shared_keys_end_with_a_written_value() {
    let tree: Arc<CaTree<u64, u64>> = Arc::new(CaTree::with_config(eager_config()));
    let key_space = 256u64;

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut rng = 0x2545_f491_4f6c_dd1d ^ (t + 1);
                for _ in 0..20_000 {
                    let k = next(&mut rng) % key_space;
                    // Value encodes the writer so the final state can be checked.
                    tree.put(k, k * 100 + t);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for (k, v) in tree.entry_set() {
        assert_eq!(*v / 100, k, "value for {k} was not written for that key");
        assert!(*v % 100 < THREADS as u64);
    }
    assert_eq!(tree.locks_held(), 0);
}

#[test]
fn test_put_if_absent_has_one_winner() {
    let tree: Arc<CaTree<u64, usize>> = Arc::new(CaTree::new());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..1_000u64).filter(|&k| tree.put_if_absent(k, t).is_none()).count()
            })
        })
        .collect();

    let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(wins, 1_000);
    assert_eq!(tree.len(), 1_000);
}

// =============================================================================
// Range queries under concurrent writes
// =============================================================================

#[test]
fn test_ranges_are_atomic_snapshots() {
    common::init_tracing();

    let tree: Arc<CaTree<u64, u64>> = Arc::new(CaTree::with_config(eager_config()));
    // Even keys are permanent; writers toggle odd keys.
    for k in (0..2_000u64).step_by(2) {
        tree.put(k, k);
    }

    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..2u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = 0x9e37_79b9_7f4a_7c15 ^ (t + 1);
                while !stop.load(Ordering::Relaxed) {
                    let k = (next(&mut rng) % 1_000) * 2 + 1;
                    if next(&mut rng) % 2 == 0 {
                        tree.put(k, k);
                    } else {
                        tree.remove(&k);
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut rng = 0xbf58_476d_1ce4_e5b9 ^ (t + 1);
                for i in 0..2_000 {
                    let lo = next(&mut rng) % 2_000;
                    let hi = lo + next(&mut rng) % 300;
                    let keys = if i % 10 == 0 {
                        tree.sub_set_pessimistic(&lo, &hi, RangeLockMode::Read)
                    } else {
                        tree.sub_set(&lo, &hi)
                    };

                    assert!(keys.windows(2).all(|w| w[0] < w[1]), "unsorted range");
                    assert!(keys.iter().all(|k| (lo..=hi).contains(k)), "key out of range");

                    let present: HashSet<u64> = keys.iter().copied().collect();
                    for even in (lo..=hi.min(1_999)).filter(|k| k % 2 == 0) {
                        assert!(present.contains(&even), "permanent key {even} missing");
                    }
                }
            })
        })
        .collect();

    for h in readers {
        h.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        h.join().unwrap();
    }

    assert_eq!(tree.locks_held(), 0);
    let shape = tree.shape();
    assert_eq!(shape.partitions, shape.route_nodes + 1);
}

// =============================================================================
// Adaptation
// =============================================================================

#[test]
fn test_hot_spot_splits_then_quiet_joins() {
    common::init_tracing();

    // Joins need a long quiet stretch, so splits outlive the polling interval.
    let config = eager_config().with_low_contention_limit(-5_000);
    let tree: Arc<CaTree<u64, u64>> = Arc::new(CaTree::with_config(config));
    for k in 0..64 {
        tree.put(k, k);
    }
    let splits_before = debug_counters().splits;

    // Hot spot: every thread hammers the same 64 keys. The split is observed
    // while the load is still running; writers drain their batch afterwards.
    let deadline = Instant::now() + Duration::from_secs(30);
    let stop = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = 0x2545_f491_4f6c_dd1d ^ (t + 1);
                while !stop.load(Ordering::Relaxed) {
                    for _ in 0..256 {
                        let k = next(&mut rng) % 64;
                        tree.put(k, k);
                        let _ = tree.get(&(k ^ 1));
                    }
                }
            })
        })
        .collect();

    let mut peak = 0;
    while peak == 0 && Instant::now() < deadline {
        peak = peak.max(tree.route_node_count());
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }

    assert!(peak > 0, "hot spot never split");
    assert!(peak < 64, "more route nodes than keys");
    assert!(debug_counters().splits > splits_before);
    assert_eq!(tree.len(), 64);

    // Quiet period, run on its own: uncontended writes push every partition
    // below the join limit.
    let mut rounds = 0;
    while tree.route_node_count() > 0 {
        for k in 0..64 {
            tree.put(k, k);
        }
        rounds += 1;
        assert!(rounds < 200_000, "joins did not converge");
    }

    assert_eq!(tree.partition_count(), 1);
    assert_eq!(tree.keys(), (0..64).collect::<Vec<_>>());
    assert_eq!(tree.locks_held(), 0);
}

#[test]
fn test_mixed_workload_with_adaptation() {
    let tree: Arc<CaTree<u64, u64>> = Arc::new(CaTree::with_config(eager_config()));
    let key_space = 4_096u64;

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut rng = 0x517c_c1b7_2722_0a95 ^ (t + 1);
                for i in 0..20_000u64 {
                    let k = next(&mut rng) % key_space;
                    match i % 10 {
                        0 => {
                            let _ = tree.sub_set(&k, &(k + 64));
                        }
                        1 | 2 => {
                            tree.remove(&k);
                        }
                        3..=6 => {
                            tree.put(k, k);
                        }
                        _ => {
                            if let Some(v) = tree.get(&k) {
                                assert_eq!(*v, k);
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let keys = tree.keys();
    assert_eq!(keys.len(), tree.len());
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    for k in keys {
        assert_eq!(tree.get(&k).as_deref(), Some(&k));
    }
    assert_eq!(tree.locks_held(), 0);
}

#[test]
fn test_clear_races_with_writers() {
    let tree: Arc<CaTree<u64, u64>> = Arc::new(CaTree::with_config(eager_config()));
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..2u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rng = 0x2545_f491_4f6c_dd1d ^ (t + 1);
                while !stop.load(Ordering::Relaxed) {
                    let k = next(&mut rng) % 512;
                    tree.put(k, k);
                }
            })
        })
        .collect();

    for _ in 0..50 {
        tree.clear();
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        h.join().unwrap();
    }

    let keys = tree.keys();
    assert_eq!(keys.len(), tree.len());
    assert!(keys.iter().all(|&k| k < 512));
    assert_eq!(tree.locks_held(), 0);
}
