//! Filepath: src/tree/diagnostics.rs
//!
//! Whole-tree operations and introspection.
//!
//! Everything here that needs a consistent view locks every partition in
//! key order first. With all partitions locked no split or join can be in
//! progress, so the routing tree is frozen until the locks are released.
//! These locks do not charge contention statistics.
//!
//! The debug counters are process-wide and updated with relaxed atomics.

use std::ptr as StdPtr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use seize::LocalGuard;

use super::CaTree;
use super::range::{Held, RangeLockMode};
use crate::base::BaseNode;
use crate::comparator::KeyComparator;
use crate::node::{NodeRef, erase_base};
use crate::ordering::{RELAXED, WRITE_ORD};
use crate::route::{RouteNode, Side};
use crate::scratch::RangeScratch;
use crate::stamped::WriteGuard;
use crate::tracing_helpers::debug_log;

// ============================================================================
//  Debug counters
// ============================================================================

/// Partitions split.
pub static SPLIT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Partitions joined.
pub static JOIN_COUNT: AtomicU64 = AtomicU64::new(0);

/// Joins abandoned because the neighbour was locked or invalid.
pub static JOIN_ABORT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Range queries answered by the optimistic phase.
pub static OPTIMISTIC_RANGE_SUCCESS_COUNT: AtomicU64 = AtomicU64::new(0);

/// Range queries whose optimistic phase failed.
pub static OPTIMISTIC_RANGE_FAILURE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Range queries that ran the locked phase.
pub static PESSIMISTIC_RANGE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Partitions read by successful range-query phases.
pub static TRAVERSED_PARTITION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Structural retries (stale partition or route node).
pub static RETRY_COUNT: AtomicU64 = AtomicU64::new(0);

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, RELAXED);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, RELAXED);
}

/// A snapshot of the debug counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugCounters {
    /// See [`SPLIT_COUNT`].
    pub splits: u64,
    /// See [`JOIN_COUNT`].
    pub joins: u64,
    /// See [`JOIN_ABORT_COUNT`].
    pub aborted_joins: u64,
    /// See [`OPTIMISTIC_RANGE_SUCCESS_COUNT`].
    pub optimistic_range_successes: u64,
    /// See [`OPTIMISTIC_RANGE_FAILURE_COUNT`].
    pub optimistic_range_failures: u64,
    /// See [`PESSIMISTIC_RANGE_COUNT`].
    pub pessimistic_ranges: u64,
    /// See [`TRAVERSED_PARTITION_COUNT`].
    pub traversed_partitions: u64,
    /// See [`RETRY_COUNT`].
    pub retries: u64,
}

/// Read every debug counter.
#[must_use]
pub fn debug_counters() -> DebugCounters {
    DebugCounters {
        splits: SPLIT_COUNT.load(RELAXED),
        joins: JOIN_COUNT.load(RELAXED),
        aborted_joins: JOIN_ABORT_COUNT.load(RELAXED),
        optimistic_range_successes: OPTIMISTIC_RANGE_SUCCESS_COUNT.load(RELAXED),
        optimistic_range_failures: OPTIMISTIC_RANGE_FAILURE_COUNT.load(RELAXED),
        pessimistic_ranges: PESSIMISTIC_RANGE_COUNT.load(RELAXED),
        traversed_partitions: TRAVERSED_PARTITION_COUNT.load(RELAXED),
        retries: RETRY_COUNT.load(RELAXED),
    }
}

/// Zero every debug counter.
pub fn reset_debug_counters() {
    for counter in [
        &SPLIT_COUNT,
        &JOIN_COUNT,
        &JOIN_ABORT_COUNT,
        &OPTIMISTIC_RANGE_SUCCESS_COUNT,
        &OPTIMISTIC_RANGE_FAILURE_COUNT,
        &PESSIMISTIC_RANGE_COUNT,
        &TRAVERSED_PARTITION_COUNT,
        &RETRY_COUNT,
    ] {
        counter.store(0, RELAXED);
    }
}

// ============================================================================
//  TreeShape
// ============================================================================

/// Structure of the routing tree at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of route nodes.
    pub route_nodes: usize,

    /// Number of partitions (always `route_nodes + 1`).
    pub partitions: usize,

    /// Route nodes on the longest root-to-partition path.
    pub max_depth: usize,

    /// Entry count of each partition, in key order.
    pub partition_sizes: Vec<usize>,
}

impl<K, V, C> CaTree<K, V, C>
where
    K: Clone,
    C: KeyComparator<K>,
{
    // ========================================================================
    //  Size and contents
    // ========================================================================

    /// Number of entries.
    ///
    /// Locks every partition; O(n).
    #[must_use]
    pub fn len(&self) -> usize {
        let guard: LocalGuard<'_> = self.guard();
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        let held: Vec<Held<'_, K, V>> = self.lock_all(RangeLockMode::Read, &mut scratch, &guard);

        held.iter().map(|h| h.base.state(&guard).store.len()).sum()
    }

    /// Alias of [`len`](Self::len).
    #[must_use]
    pub fn size(&self) -> usize {
        self.len()
    }

    /// Check if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let guard: LocalGuard<'_> = self.guard();
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        let held: Vec<Held<'_, K, V>> = self.lock_all(RangeLockMode::Read, &mut scratch, &guard);

        held.iter().all(|h| h.base.state(&guard).store.is_empty())
    }

    /// Every entry. The order is unspecified.
    #[must_use]
    pub fn entry_set(&self) -> Vec<(K, Arc<V>)> {
        let guard: LocalGuard<'_> = self.guard();
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        let held: Vec<Held<'_, K, V>> = self.lock_all(RangeLockMode::Read, &mut scratch, &guard);

        let mut entries: Vec<(K, Arc<V>)> = Vec::new();
        for h in &held {
            h.base
                .state(&guard)
                .store
                .for_each(|k, v| entries.push((k.clone(), Arc::clone(v))));
        }
        entries
    }

    /// Remove every entry.
    ///
    /// Locks every partition, installs a fresh empty root, and retires the
    /// old tree.
    pub fn clear(&self) {
        let guard: LocalGuard<'_> = self.guard();
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        let held: Vec<Held<'_, K, V>> = self.lock_all(RangeLockMode::Write, &mut scratch, &guard);

        let mut routes: Vec<*mut RouteNode<K>> = Vec::new();
        self.collect_routes(&mut routes, &guard);

        let fresh: *mut BaseNode<K, V> = Box::into_raw(BaseNode::empty_root());
        self.root.store(erase_base(fresh), WRITE_ORD);

        let mut bases: Vec<*mut BaseNode<K, V>> = Vec::with_capacity(held.len());
        for h in held {
            h.base.invalidate();
            bases.push(StdPtr::from_ref(h.base).cast_mut());
        }

        // SAFETY: the old tree is no longer reachable from the root.
        unsafe {
            for route in routes {
                Self::retire_route(route, &guard);
            }
            for base in bases {
                Self::retire_base(base, &guard);
            }
        }

        debug_log!("cleared tree");
    }

    /// Lock every partition in key order, leaving contention scores alone.
    fn lock_all<'g>(
        &self,
        mode: RangeLockMode,
        scratch: &mut RangeScratch<K, V>,
        guard: &'g LocalGuard<'_>,
    ) -> Vec<Held<'g, K, V>> {
        let held: Vec<Held<'g, K, V>> = self.lock_range(None, None, mode, false, scratch, guard);
        scratch.reset_walk();
        held
    }

    fn collect_routes(&self, out: &mut Vec<*mut RouteNode<K>>, guard: &LocalGuard<'_>) {
        let mut stack: Vec<*mut u8> = vec![self.load_root(guard)];

        while let Some(ptr) = stack.pop() {
            // SAFETY: protected by `guard`, never null.
            if let NodeRef::Route(route) = unsafe { NodeRef::<'_, K, V>::from_raw(ptr) } {
                stack.push(route.child(Side::Left, guard));
                stack.push(route.child(Side::Right, guard));
                out.push(StdPtr::from_ref(route).cast_mut());
            }
        }
    }

    // ========================================================================
    //  Shape
    // ========================================================================

    /// Structure of the routing tree, read with every partition locked.
    #[must_use]
    pub fn shape(&self) -> TreeShape {
        let guard: LocalGuard<'_> = self.guard();
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        let held: Vec<Held<'_, K, V>> = self.lock_all(RangeLockMode::Read, &mut scratch, &guard);

        let mut shape = TreeShape::default();
        let mut stack: Vec<(*mut u8, usize)> = vec![(self.load_root(&guard), 0)];

        while let Some((ptr, depth)) = stack.pop() {
            // SAFETY: protected by `guard`, never null.
            match unsafe { NodeRef::<'_, K, V>::from_raw(ptr) } {
                NodeRef::Route(route) => {
                    shape.route_nodes += 1;
                    // Right first so partitions pop in key order.
                    stack.push((route.child(Side::Right, &guard), depth + 1));
                    stack.push((route.child(Side::Left, &guard), depth + 1));
                }

                NodeRef::Base(base) => {
                    shape.partitions += 1;
                    shape.max_depth = shape.max_depth.max(depth);
                    shape.partition_sizes.push(base.state(&guard).store.len());
                }
            }
        }

        drop(held);
        shape
    }

    /// Number of route nodes.
    #[must_use]
    pub fn route_node_count(&self) -> usize {
        self.shape().route_nodes
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.shape().partitions
    }

    /// Number of partition and route-node locks currently held by anyone.
    ///
    /// Zero whenever no operation is in flight.
    #[must_use]
    pub fn locks_held(&self) -> usize {
        let guard: LocalGuard<'_> = self.guard();
        let mut held: usize = 0;
        let mut stack: Vec<*mut u8> = vec![self.load_root(&guard)];

        while let Some(ptr) = stack.pop() {
            // SAFETY: protected by `guard`, never null.
            match unsafe { NodeRef::<'_, K, V>::from_raw(ptr) } {
                NodeRef::Route(route) => {
                    held += usize::from(route.is_locked());
                    stack.push(route.child(Side::Left, &guard));
                    stack.push(route.child(Side::Right, &guard));
                }

                NodeRef::Base(base) => held += usize::from(base.lock().is_locked()),
            }
        }

        held
    }

    // ========================================================================
    //  Forced adaptation
    // ========================================================================

    /// Split the partition owning `key`, ignoring its statistics.
    ///
    /// # Returns
    /// `false` if that partition holds fewer than two entries.
    pub fn force_split(&self, key: &K) -> bool {
        let guard: LocalGuard<'_> = self.guard();
        let (base, locked): (&BaseNode<K, V>, WriteGuard<'_>) =
            self.lock_partition_for_write(key, &guard, "force_split");

        self.split_partition(base, locked, &guard)
    }

    /// Join the partition owning `key` with its neighbour, ignoring its
    /// statistics.
    ///
    /// # Returns
    /// `false` if the partition is the root or its neighbour is busy.
    pub fn force_join(&self, key: &K) -> bool {
        let guard: LocalGuard<'_> = self.guard();
        let (base, locked): (&BaseNode<K, V>, WriteGuard<'_>) =
            self.lock_partition_for_write(key, &guard, "force_join");

        self.join_partition(base, locked, &guard)
    }
}
