//! Filepath: src/tree/point.rs
//!
//! Single-key operations.
//!
//! # Protocol
//!
//! Reads:
//! 1. guard = `tree.guard()`
//! 2. descend to a partition without locking
//! 3. optimistic attempt: token, validity check, load state, validate
//! 4. on failure: shared read lock, charge the failure penalty, re-check
//!    validity (retry from the root if invalid), load state, unlock
//! 5. query the (immutable) store outside any lock
//!
//! Writes:
//! 1. descend, take the write lock (charging statistics)
//! 2. if the partition is invalid, unlock and retry from the root
//! 3. publish the new state
//! 4. adapt (split or join) while still holding the lock

use std::sync::Arc;

use seize::LocalGuard;

use super::{CaTree, RetryBudget};
use crate::base::{BaseNode, PartitionState};
use crate::comparator::KeyComparator;
use crate::stamped::{ReadGuard, WriteGuard};
use crate::tracing_helpers::trace_log;

impl<K, V, C> CaTree<K, V, C>
where
    K: Clone,
    C: KeyComparator<K>,
{
    // ========================================================================
    //  Reads
    // ========================================================================

    /// Look up `key`.
    ///
    /// Lock-free when the partition is not being written; otherwise falls
    /// back to a shared lock.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let guard: LocalGuard<'_> = self.guard();
        let state: &PartitionState<K, V> = self.read_partition(key, &guard);

        state.store.get(key, &self.comparator).cloned()
    }

    /// Check if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// A consistent snapshot of the partition that owns `key`.
    fn read_partition<'g>(&self, key: &K, guard: &'g LocalGuard<'_>) -> &'g PartitionState<K, V> {
        let mut budget = RetryBudget::new(&self.config, "get");

        loop {
            let base: &BaseNode<K, V> = self.find_base(key, guard);

            if let Some(token) = base.lock().optimistic() {
                if base.is_valid() {
                    let state: &PartitionState<K, V> = base.state(guard);
                    if base.lock().validate(token) {
                        return state;
                    }
                }
            }

            // Optimistic attempt failed.
            let locked: ReadGuard<'_> = base.read();
            base.charge(self.config.failure_contribution);

            if !base.is_valid() {
                drop(locked);
                trace_log!("get: partition invalidated, retrying");
                budget.retry();
                continue;
            }

            let state: &PartitionState<K, V> = base.state(guard);
            drop(locked);
            return state;
        }
    }

    // ========================================================================
    //  Writes
    // ========================================================================

    /// Insert or replace. Returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        self.put_arc(key, Arc::new(value))
    }

    /// Insert or replace with a shared value. Returns the previous value.
    pub fn put_arc(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let guard: LocalGuard<'_> = self.guard();
        let (base, locked) = self.lock_partition_for_write(&key, &guard, "put");

        let (state, previous) = base.state(&guard).with_put(key, value, &self.comparator);
        base.publish(state, &locked, &guard);

        self.adapt_if_needed(base, locked, &guard);
        previous
    }

    /// Insert only if `key` is absent.
    ///
    /// # Returns
    /// `None` if the value was inserted, otherwise the existing value (the
    /// map is unchanged).
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard: LocalGuard<'_> = self.guard();
        let (base, locked) = self.lock_partition_for_write(&key, &guard, "put_if_absent");

        let (state, existing) =
            base.state(&guard)
                .with_put_if_absent(key, Arc::new(value), &self.comparator);
        if let Some(state) = state {
            base.publish(state, &locked, &guard);
        }

        self.adapt_if_needed(base, locked, &guard);
        existing
    }

    /// Remove `key`. Returns the removed value, or `None` if absent.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let guard: LocalGuard<'_> = self.guard();
        let (base, locked) = self.lock_partition_for_write(key, &guard, "remove");

        let removed: Option<Arc<V>> = match base.state(&guard).with_remove(key, &self.comparator) {
            Some((state, previous)) => {
                base.publish(state, &locked, &guard);
                Some(previous)
            }

            None => None,
        };

        self.adapt_if_needed(base, locked, &guard);
        removed
    }

    /// Write-lock the valid partition that owns `key`.
    pub(crate) fn lock_partition_for_write<'g>(
        &self,
        key: &K,
        guard: &'g LocalGuard<'_>,
        operation: &'static str,
    ) -> (&'g BaseNode<K, V>, WriteGuard<'g>) {
        let mut budget = RetryBudget::new(&self.config, operation);

        loop {
            let base: &'g BaseNode<K, V> = self.find_base(key, guard);
            let locked: WriteGuard<'g> = base.write_with_stats(&self.config);

            if base.is_valid() {
                return (base, locked);
            }

            drop(locked);
            trace_log!(operation, "partition invalidated, retrying");
            budget.retry();
        }
    }
}
