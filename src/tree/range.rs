//! Filepath: src/tree/range.rs
//!
//! Ordered range queries.
//!
//! # Protocol
//!
//! 1. Optimistic phase: walk the partitions covering `[lo, hi]` in key order,
//!    taking an optimistic token from each. Stop at the first partition whose
//!    cached maximum exceeds `hi`. Join the collected stores and validate
//!    every token afterwards. Any failed token or invalid partition abandons
//!    the phase.
//! 2. Locked phase: the same walk, but lock every partition (in key order,
//!    so concurrent range queries cannot deadlock). A partition found invalid
//!    after locking is released and the walk resumes from a saved copy of the
//!    route stack. The stores are joined under the locks, then the locks are
//!    released with the statistics rules below.
//!
//! In both phases the keys are produced by one in-order walk of the joined
//! store after every lock is released.
//!
//! # Statistics on release
//! - one partition, write mode: adapt as after a point write
//! - one partition, read mode: charge the failure penalty
//! - several partitions: credit each with the range contribution

use std::ptr as StdPtr;

use seize::LocalGuard;

use super::diagnostics::{
    self, OPTIMISTIC_RANGE_FAILURE_COUNT, OPTIMISTIC_RANGE_SUCCESS_COUNT, PESSIMISTIC_RANGE_COUNT,
    TRAVERSED_PARTITION_COUNT,
};
use super::{CaTree, CaTreeError, RetryBudget};
use crate::base::{BaseNode, PartitionState};
use crate::comparator::KeyComparator;
use crate::node::{NodeRef, erase_base};
use crate::route::{RouteNode, Side};
use crate::scratch::RangeScratch;
use crate::stamped::{ReadGuard, WriteGuard};
use crate::tracing_helpers::trace_log;
use crate::treap::Treap;

/// Lock mode for the locked phase of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeLockMode {
    /// Shared locks; concurrent range readers do not block each other.
    #[default]
    Read,

    /// Exclusive locks, charging contention statistics like a point write.
    Write,
}

/// A lock held on one partition during the locked phase.
pub(crate) enum HeldLock<'g> {
    Read(ReadGuard<'g>),
    Write(WriteGuard<'g>),
}

pub(crate) struct Held<'g, K, V> {
    pub(crate) base: &'g BaseNode<K, V>,
    pub(crate) lock: HeldLock<'g>,
}

impl<K, V, C> CaTree<K, V, C>
where
    K: Clone,
    C: KeyComparator<K>,
{
    // ========================================================================
    //  Public API
    // ========================================================================

    /// Keys `k` with `lo <= k <= hi`, in order.
    ///
    /// An inverted range (`lo > hi`) is empty.
    #[must_use]
    pub fn sub_set(&self, lo: &K, hi: &K) -> Vec<K> {
        let mut keys: Vec<K> = Vec::new();
        self.sub_set_with(lo, hi, |k| keys.push(k.clone()));
        keys
    }

    /// Call `consumer` with each key `k`, `lo <= k <= hi`, in order.
    ///
    /// The consumer runs after every partition lock is released.
    pub fn sub_set_with<F>(&self, lo: &K, hi: &K, consumer: F)
    where
        F: FnMut(&K),
    {
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        self.sub_set_in(lo, hi, &mut scratch, consumer);
    }

    /// Like [`sub_set_with`](Self::sub_set_with), reusing `scratch`.
    pub fn sub_set_in<F>(&self, lo: &K, hi: &K, scratch: &mut RangeScratch<K, V>, mut consumer: F)
    where
        F: FnMut(&K),
    {
        let snapshot: Treap<K, V> = self.range_snapshot(Some(lo), Some(hi), scratch, None);
        snapshot.for_each_in_range(Some(lo), Some(hi), &self.comparator, |k, _| consumer(k));
    }

    /// Collect the keys in `[lo, hi]` into `scratch` and return them.
    pub fn sub_set_into<'s>(&self, lo: &K, hi: &K, scratch: &'s mut RangeScratch<K, V>) -> &'s [K] {
        let snapshot: Treap<K, V> = self.range_snapshot(Some(lo), Some(hi), scratch, None);

        scratch.keys.clear();
        snapshot.for_each_in_range(Some(lo), Some(hi), &self.comparator, |k, _| {
            scratch.keys.push(k.clone());
        });
        &scratch.keys
    }

    /// Checked [`sub_set`](Self::sub_set).
    ///
    /// # Errors
    /// [`CaTreeError::InvalidRange`] if `lo` orders after `hi`.
    pub fn try_sub_set(&self, lo: &K, hi: &K) -> Result<Vec<K>, CaTreeError> {
        if self.comparator.less(hi, lo) {
            return Err(CaTreeError::InvalidRange);
        }

        Ok(self.sub_set(lo, hi))
    }

    /// [`sub_set`](Self::sub_set) that skips the optimistic phase and locks
    /// every partition in the range with `mode`.
    #[must_use]
    pub fn sub_set_pessimistic(&self, lo: &K, hi: &K, mode: RangeLockMode) -> Vec<K> {
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        let snapshot: Treap<K, V> = self.range_snapshot(Some(lo), Some(hi), &mut scratch, Some(mode));

        let mut keys: Vec<K> = Vec::new();
        snapshot.for_each_in_range(Some(lo), Some(hi), &self.comparator, |k, _| {
            keys.push(k.clone());
        });
        keys
    }

    /// Every key, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        let mut scratch: RangeScratch<K, V> = RangeScratch::new();
        let snapshot: Treap<K, V> = self.range_snapshot(None, None, &mut scratch, None);

        let mut keys: Vec<K> = Vec::new();
        snapshot.for_each(|k, _| keys.push(k.clone()));
        keys
    }

    /// Apply `update` to every value in `[lo, hi]`.
    ///
    /// # Errors
    /// Always [`CaTreeError::Unsupported`]: range mutation is not implemented.
    pub fn range_update<F>(&self, lo: &K, hi: &K, update: F) -> Result<(), CaTreeError>
    where
        F: FnMut(&K, &V) -> V,
    {
        let _ = (lo, hi, update);
        Err(CaTreeError::Unsupported {
            operation: "range_update",
        })
    }

    // ========================================================================
    //  Snapshot
    // ========================================================================

    /// A store holding (at least) every entry in `[lo, hi]` at one instant.
    ///
    /// `force` skips the optimistic phase.
    pub(crate) fn range_snapshot(
        &self,
        lo: Option<&K>,
        hi: Option<&K>,
        scratch: &mut RangeScratch<K, V>,
        force: Option<RangeLockMode>,
    ) -> Treap<K, V> {
        let guard: LocalGuard<'_> = self.guard();

        let optimistic: Option<Treap<K, V>> = match force {
            None => self.optimistic_snapshot(lo, hi, scratch, &guard),
            Some(_) => None,
        };

        let snapshot: Treap<K, V> = if let Some(snapshot) = optimistic {
            diagnostics::bump(&OPTIMISTIC_RANGE_SUCCESS_COUNT);
            snapshot
        } else {
            if force.is_none() {
                diagnostics::bump(&OPTIMISTIC_RANGE_FAILURE_COUNT);
                trace_log!("optimistic range failed, locking");
            }
            let mode: RangeLockMode = force.unwrap_or_default();
            self.locked_snapshot(lo, hi, mode, scratch, &guard)
        };

        scratch.reset_walk();
        snapshot
    }

    fn optimistic_snapshot(
        &self,
        lo: Option<&K>,
        hi: Option<&K>,
        scratch: &mut RangeScratch<K, V>,
        guard: &LocalGuard<'_>,
    ) -> Option<Treap<K, V>> {
        scratch.visited.clear();
        let mut base: &BaseNode<K, V> = self.first_partition(lo, &mut scratch.path, guard);

        loop {
            let token: u64 = base.lock().optimistic()?;
            if !base.is_valid() {
                return None;
            }
            scratch.visited.push((StdPtr::from_ref(base), token));

            let state: &PartitionState<K, V> = base.state(guard);
            if self.ends_range(hi, state) {
                break;
            }

            match self.next_partition(base, &mut scratch.path, guard) {
                Some(next) => base = next,
                None => break,
            }
        }

        let mut merged: Treap<K, V> = Treap::new();
        for &(ptr, token) in &scratch.visited {
            // SAFETY: loaded under `guard`, which is still active.
            let visited: &BaseNode<K, V> = unsafe { &*ptr };
            merged = Treap::join(&merged, &visited.state(guard).store);

            if !visited.lock().validate(token) {
                return None;
            }
        }

        diagnostics::add(&TRAVERSED_PARTITION_COUNT, scratch.visited.len());
        Some(merged)
    }

    fn locked_snapshot(
        &self,
        lo: Option<&K>,
        hi: Option<&K>,
        mode: RangeLockMode,
        scratch: &mut RangeScratch<K, V>,
        guard: &LocalGuard<'_>,
    ) -> Treap<K, V> {
        diagnostics::bump(&PESSIMISTIC_RANGE_COUNT);

        let mut held: Vec<Held<'_, K, V>> = self.lock_range(lo, hi, mode, true, scratch, guard);
        diagnostics::add(&TRAVERSED_PARTITION_COUNT, held.len());

        // Linearization point: all locks held.
        let snapshot: Treap<K, V> = if held.len() == 1 {
            held[0].base.state(guard).store.clone()
        } else {
            held.iter().fold(Treap::new(), |merged, h| {
                Treap::join(&merged, &h.base.state(guard).store)
            })
        };

        self.release_range(&mut held, guard);
        snapshot
    }

    // ========================================================================
    //  Locking a range
    // ========================================================================

    /// Lock, in key order, every valid partition that may hold keys in
    /// `[lo, hi]`. Open bounds extend to the ends of the key space.
    ///
    /// With `charge` set, write-mode acquisitions update each partition's
    /// contention score as point writes do.
    pub(crate) fn lock_range<'g>(
        &self,
        lo: Option<&K>,
        hi: Option<&K>,
        mode: RangeLockMode,
        charge: bool,
        scratch: &mut RangeScratch<K, V>,
        guard: &'g LocalGuard<'_>,
    ) -> Vec<Held<'g, K, V>> {
        let mut budget = RetryBudget::new(&self.config, "range");
        let mut held: Vec<Held<'g, K, V>> = Vec::new();

        let mut current: Held<'g, K, V> = loop {
            let base: &'g BaseNode<K, V> = self.first_partition(lo, &mut scratch.path, guard);
            let lock: HeldLock<'g> = self.lock_in_mode(base, mode, charge);

            if base.is_valid() {
                break Held { base, lock };
            }

            drop(lock);
            budget.retry();
        };

        loop {
            let base: &'g BaseNode<K, V> = current.base;
            held.push(current);

            if self.ends_range(hi, base.state(guard)) {
                return held;
            }

            // Save the position so a stale successor can be retried from here.
            scratch.resume.clone_from(&scratch.path);

            current = loop {
                let Some(next) = self.next_partition(base, &mut scratch.path, guard) else {
                    return held;
                };
                let lock: HeldLock<'g> = self.lock_in_mode(next, mode, charge);

                if next.is_valid() {
                    break Held { base: next, lock };
                }

                drop(lock);
                scratch.path.clone_from(&scratch.resume);
                budget.retry();
            };
        }
    }

    fn lock_in_mode<'g>(
        &self,
        base: &'g BaseNode<K, V>,
        mode: RangeLockMode,
        charge: bool,
    ) -> HeldLock<'g> {
        match mode {
            RangeLockMode::Read => HeldLock::Read(base.read()),
            RangeLockMode::Write if charge => {
                HeldLock::Write(base.write_with_stats(&self.config))
            }
            RangeLockMode::Write => HeldLock::Write(base.lock().write()),
        }
    }

    /// Release the locks of a range query and charge statistics.
    pub(crate) fn release_range<'g>(
        &self,
        held: &mut Vec<Held<'g, K, V>>,
        guard: &'g LocalGuard<'_>,
    ) {
        if held.len() == 1 {
            if let Some(Held { base, lock }) = held.pop() {
                match lock {
                    HeldLock::Write(locked) => self.adapt_if_needed(base, locked, guard),
                    HeldLock::Read(locked) => {
                        base.charge(self.config.failure_contribution);
                        drop(locked);
                    }
                }
            }
            return;
        }

        for Held { base, lock } in held.drain(..) {
            base.charge(-self.config.range_contribution);
            drop(lock);
        }
    }

    // ========================================================================
    //  Walking partitions in key order
    // ========================================================================

    /// `true` if nothing after `state`'s partition can be in range.
    #[inline]
    fn ends_range(&self, hi: Option<&K>, state: &PartitionState<K, V>) -> bool {
        match (hi, state.max_key.as_ref()) {
            (Some(hi), Some(max)) => self.comparator.less(hi, max),
            _ => false,
        }
    }

    /// Descend to the partition owning `lo` (the leftmost one for an open
    /// bound), recording the route nodes passed.
    pub(crate) fn first_partition<'g>(
        &self,
        lo: Option<&K>,
        path: &mut Vec<*const RouteNode<K>>,
        guard: &'g LocalGuard<'_>,
    ) -> &'g BaseNode<K, V> {
        path.clear();
        let mut ptr: *mut u8 = self.load_root(guard);

        loop {
            // SAFETY: protected by `guard`, never null.
            match unsafe { NodeRef::<'g, K, V>::from_raw(ptr) } {
                NodeRef::Route(route) => {
                    path.push(StdPtr::from_ref(route));
                    let side: Side = lo.map_or(Side::Left, |lo| route.direction(lo, &self.comparator));
                    ptr = route.child(side, guard);
                }

                NodeRef::Base(base) => return base,
            }
        }
    }

    fn leftmost_partition<'g>(
        &self,
        start: *mut u8,
        path: &mut Vec<*const RouteNode<K>>,
        guard: &'g LocalGuard<'_>,
    ) -> &'g BaseNode<K, V> {
        let mut ptr: *mut u8 = start;

        loop {
            // SAFETY: protected by `guard`, never null.
            match unsafe { NodeRef::<'g, K, V>::from_raw(ptr) } {
                NodeRef::Route(route) => {
                    path.push(StdPtr::from_ref(route));
                    ptr = route.child(Side::Left, guard);
                }

                NodeRef::Base(base) => return base,
            }
        }
    }

    /// The partition following `current` in key order, or `None` if
    /// `current` is the last one. `path` must lead to `current`.
    pub(crate) fn next_partition<'g>(
        &self,
        current: &BaseNode<K, V>,
        path: &mut Vec<*const RouteNode<K>>,
        guard: &'g LocalGuard<'_>,
    ) -> Option<&'g BaseNode<K, V>> {
        let top: *const RouteNode<K> = *path.last()?;
        // SAFETY: every pointer on `path` was loaded under `guard`.
        let top: &'g RouteNode<K> = unsafe { &*top };

        let current_ptr: *mut u8 = erase_base(StdPtr::from_ref(current).cast_mut());
        if top.child(Side::Left, guard) == current_ptr {
            return Some(self.leftmost_partition(top.child(Side::Right, guard), path, guard));
        }

        // Climb to the nearest valid ancestor whose separator is above the
        // one we came from; its right subtree starts after `current`.
        let bound: &'g K = top.key();
        while let Some(&ptr) = path.last() {
            // SAFETY: as above.
            let route: &'g RouteNode<K> = unsafe { &*ptr };

            if route.is_valid() && self.comparator.less(bound, route.key()) {
                return Some(self.leftmost_partition(route.child(Side::Right, guard), path, guard));
            }

            path.pop();
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::RangeLockMode;
    use crate::{AdaptationConfig, CaTree, CaTreeError, RangeScratch};

    fn split_tree() -> CaTree<i32, i32> {
        let tree = CaTree::with_config(AdaptationConfig::frozen());
        for k in 0..100 {
            tree.put(k, k);
        }
        assert!(tree.force_split(&50));
        for k in [25, 75, 1] {
            tree.force_split(&k);
        }
        tree
    }

    #[test]
    fn test_single_partition_range() {
        let tree: CaTree<i32, i32> = CaTree::new();
        for k in 0..10 {
            tree.put(k, k);
        }

        assert_eq!(tree.sub_set(&3, &6), vec![3, 4, 5, 6]);
        assert_eq!(tree.sub_set(&6, &3), Vec::<i32>::new());
    }

    #[test]
    fn test_ranges_across_partitions() {
        let tree = split_tree();

        assert_eq!(tree.sub_set(&-30, &130), (0..100).collect::<Vec<_>>());
        assert_eq!(tree.sub_set(&-30, &50), (0..=50).collect::<Vec<_>>());
        assert_eq!(tree.sub_set(&10, &45), (10..=45).collect::<Vec<_>>());
        assert_eq!(tree.sub_set(&99, &105), vec![99]);
        assert_eq!(tree.sub_set(&50, &50), vec![50]);
        assert_eq!(tree.sub_set(&12, &34), (12..=34).collect::<Vec<_>>());
    }

    #[test]
    fn test_pessimistic_matches_optimistic() {
        let tree = split_tree();

        for (lo, hi) in [(-30, 130), (10, 45), (99, 105), (50, 50), (0, 0), (101, 200)] {
            let optimistic = tree.sub_set(&lo, &hi);
            assert_eq!(tree.sub_set_pessimistic(&lo, &hi, RangeLockMode::Read), optimistic);
            assert_eq!(tree.sub_set_pessimistic(&lo, &hi, RangeLockMode::Write), optimistic);
        }
        assert_eq!(tree.locks_held(), 0);
    }

    #[test]
    fn test_scratch_reuse() {
        let tree = split_tree();
        let mut scratch = RangeScratch::with_capacity(8, 16);

        assert_eq!(tree.sub_set_into(&20, &22, &mut scratch), &[20, 21, 22]);
        assert_eq!(tree.sub_set_into(&97, &200, &mut scratch), &[97, 98, 99]);
        assert_eq!(scratch.keys(), &[97, 98, 99]);

        let mut seen = Vec::new();
        tree.sub_set_in(&0, &2, &mut scratch, |k| seen.push(*k));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_checked_range_and_update() {
        let tree = split_tree();

        assert_eq!(tree.try_sub_set(&5, &1), Err(CaTreeError::InvalidRange));
        assert_eq!(tree.try_sub_set(&1, &3), Ok(vec![1, 2, 3]));
        assert_eq!(
            tree.range_update(&0, &10, |_, v| v + 1),
            Err(CaTreeError::Unsupported {
                operation: "range_update"
            })
        );
        assert_eq!(tree.get(&5).as_deref(), Some(&5));
    }

    #[test]
    fn test_multi_partition_read_credits_partitions() {
        let config = AdaptationConfig::new()
            .with_high_contention_limit(i32::MAX)
            .with_low_contention_limit(i32::MIN);
        let tree: CaTree<i32, i32> = CaTree::with_config(config);
        for k in 0..100 {
            tree.put(k, k);
        }
        assert!(tree.force_split(&50));

        let before: i32 = {
            let guard = tree.guard();
            tree.find_base(&0, &guard).statistics()
        };
        let _ = tree.sub_set_pessimistic(&0, &99, RangeLockMode::Read);

        let guard = tree.guard();
        assert_eq!(
            tree.find_base(&0, &guard).statistics(),
            before - config.range_contribution
        );
    }
}
