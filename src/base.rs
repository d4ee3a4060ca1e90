//! Filepath: src/base.rs
//!
//! Base nodes: the partitions that hold the data.
//!
//! A [`BaseNode`] owns one persistent [`Treap`] plus the concurrency metadata
//! for its key range: a [`StampedLock`], a signed contention score, a validity
//! flag, and a pointer to its routing parent.
//!
//! The store and its cached maximum key are published together as one boxed
//! [`PartitionState`]. A writer builds a new state, swaps the pointer under
//! the write lock, and retires the old box through the reclamation guard, so
//! an optimistic reader always sees a matching `(store, max_key)` pair.

use std::ptr as StdPtr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr};

use seize::{Guard, LocalGuard};

use crate::comparator::KeyComparator;
use crate::config::AdaptationConfig;
use crate::node::NodeHeader;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::route::RouteNode;
use crate::stamped::{ReadGuard, StampedLock, WriteGuard};
use crate::treap::Treap;

// ============================================================================
//  PartitionState
// ============================================================================

/// An immutable snapshot of one partition's contents.
pub(crate) struct PartitionState<K, V> {
    pub(crate) store: Treap<K, V>,

    /// Always equals `store.max_key()`.
    pub(crate) max_key: Option<K>,
}

impl<K: Clone, V> PartitionState<K, V> {
    pub(crate) fn new(store: Treap<K, V>) -> Self {
        let max_key: Option<K> = store.max_key().cloned();
        Self { store, max_key }
    }

    /// Insert or replace `key`.
    pub(crate) fn with_put<C>(&self, key: K, value: Arc<V>, cmp: &C) -> (Self, Option<Arc<V>>)
    where
        C: KeyComparator<K> + ?Sized,
    {
        let max_key: Option<K> = self.max_after_insert(&key, cmp);
        let (store, previous) = self.store.insert(key, value, cmp);

        (Self { store, max_key }, previous)
    }

    /// Insert `key` only if absent.
    ///
    /// # Returns
    /// `(None, Some(existing))` when the key was present and nothing changed.
    pub(crate) fn with_put_if_absent<C>(
        &self,
        key: K,
        value: Arc<V>,
        cmp: &C,
    ) -> (Option<Self>, Option<Arc<V>>)
    where
        C: KeyComparator<K> + ?Sized,
    {
        if let Some(existing) = self.store.get(&key, cmp) {
            return (None, Some(Arc::clone(existing)));
        }

        let max_key: Option<K> = self.max_after_insert(&key, cmp);
        let (store, _) = self.store.insert_if_absent(key, value, cmp);

        (Some(Self { store, max_key }), None)
    }

    /// Remove `key`.
    ///
    /// # Returns
    /// `None` when the key was absent and nothing changed.
    pub(crate) fn with_remove<C>(&self, key: &K, cmp: &C) -> Option<(Self, Arc<V>)>
    where
        C: KeyComparator<K> + ?Sized,
    {
        let (store, previous) = self.store.remove(key, cmp);
        let previous: Arc<V> = previous?;

        // Recompute only when the maximum itself left.
        let max_key: Option<K> = match &self.max_key {
            Some(max) if cmp.compare(max, key).is_eq() => store.max_key().cloned(),
            other => other.clone(),
        };

        Some((Self { store, max_key }, previous))
    }

    fn max_after_insert<C>(&self, key: &K, cmp: &C) -> Option<K>
    where
        C: KeyComparator<K> + ?Sized,
    {
        match &self.max_key {
            Some(max) if !cmp.less(max, key) => Some(max.clone()),
            _ => Some(key.clone()),
        }
    }

    /// Split around the store's root.
    ///
    /// # Returns
    /// `(left, right, separator)`, or `None` with fewer than two entries.
    pub(crate) fn split(&self) -> Option<(Self, Self, K)> {
        let (left, right, separator) = self.store.split()?;

        let left_max: Option<K> = left.max_key().cloned();
        let left = Self {
            store: left,
            max_key: left_max,
        };
        let right = Self {
            store: right,
            max_key: self.max_key.clone(),
        };

        Some((left, right, separator))
    }

    /// Concatenate two adjacent partitions, `left` holding the smaller keys.
    pub(crate) fn join(left: &Self, right: &Self) -> Self {
        Self {
            store: Treap::join(&left.store, &right.store),
            max_key: right.max_key.clone().or_else(|| left.max_key.clone()),
        }
    }
}

// ============================================================================
//  BaseNode
// ============================================================================

/// A partition of the key space.
///
/// # Invariants
/// - `state` is never null and only replaced under the write lock.
/// - Once `valid` is false the node is unreachable from the root for every
///   traversal that starts afterwards, and is never made valid again.
/// - `parent` is only rewritten while the write lock is held or before the
///   node is published.
#[repr(C)]
pub(crate) struct BaseNode<K, V> {
    header: NodeHeader,
    lock: StampedLock,
    state: AtomicPtr<PartitionState<K, V>>,
    statistics: AtomicI32,
    valid: AtomicBool,
    parent: AtomicPtr<RouteNode<K>>,
}

impl<K, V> BaseNode<K, V> {
    /// Allocate a valid partition around `state`.
    pub(crate) fn boxed_with_state(
        state: PartitionState<K, V>,
        parent: *mut RouteNode<K>,
    ) -> Box<Self> {
        Box::new(Self {
            header: NodeHeader::base(),
            lock: StampedLock::new(),
            state: AtomicPtr::new(Box::into_raw(Box::new(state))),
            statistics: AtomicI32::new(0),
            valid: AtomicBool::new(true),
            parent: AtomicPtr::new(parent),
        })
    }

    // ========================================================================
    //  Locking
    // ========================================================================

    #[inline(always)]
    pub(crate) const fn lock(&self) -> &StampedLock {
        &self.lock
    }

    /// Take the write lock, charging the contention score.
    ///
    /// An immediate acquisition earns the success credit, waiting costs the
    /// failure penalty.
    pub(crate) fn write_with_stats(&self, config: &AdaptationConfig) -> WriteGuard<'_> {
        if let Some(guard) = self.lock.try_write() {
            self.charge(-config.success_contribution);
            return guard;
        }

        let guard: WriteGuard<'_> = self.lock.write();
        self.charge(config.failure_contribution);
        guard
    }

    /// Take a shared read lock. Statistics are the caller's concern.
    #[inline]
    pub(crate) fn read(&self) -> ReadGuard<'_> {
        self.lock.read()
    }

    // ========================================================================
    //  State
    // ========================================================================

    /// Current contents, protected by `guard`.
    #[inline(always)]
    pub(crate) fn state<'g>(&self, guard: &'g LocalGuard<'_>) -> &'g PartitionState<K, V> {
        let ptr: *mut PartitionState<K, V> = guard.protect(&self.state, READ_ORD);

        // SAFETY: never null; retired states outlive every guard that could
        // have loaded them.
        unsafe { &*ptr }
    }

    /// Replace the contents. The write guard proves exclusivity.
    pub(crate) fn publish(
        &self,
        state: PartitionState<K, V>,
        _locked: &WriteGuard<'_>,
        guard: &LocalGuard<'_>,
    ) {
        let fresh: *mut PartitionState<K, V> = Box::into_raw(Box::new(state));
        let old: *mut PartitionState<K, V> = self.state.swap(fresh, WRITE_ORD);

        // SAFETY: `old` came from Box::into_raw and is no longer reachable
        // through `self.state`.
        unsafe {
            guard.defer_retire(old, |ptr, _| {
                drop(Box::from_raw(ptr));
            });
        }
    }

    // ========================================================================
    //  Contention statistics
    // ========================================================================

    /// Current contention score.
    #[inline(always)]
    pub(crate) fn statistics(&self) -> i32 {
        self.statistics.load(RELAXED)
    }

    /// Add `delta` to the score, saturating.
    ///
    /// Updates are racy by intent: concurrent readers may lose an update,
    /// which only delays adaptation.
    #[inline]
    pub(crate) fn charge(&self, delta: i32) {
        let current: i32 = self.statistics.load(RELAXED);
        self.statistics.store(current.saturating_add(delta), RELAXED);
    }

    #[inline]
    pub(crate) fn reset_statistics(&self) {
        self.statistics.store(0, RELAXED);
    }

    // ========================================================================
    //  Validity and parent
    // ========================================================================

    #[inline(always)]
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(READ_ORD)
    }

    /// Mark removed from the tree. Caller holds the write lock.
    #[inline]
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, WRITE_ORD);
    }

    /// Routing parent, or `None` when this partition is the root.
    #[inline]
    pub(crate) fn parent<'g>(&self, guard: &'g LocalGuard<'_>) -> Option<&'g RouteNode<K>> {
        let ptr: *mut RouteNode<K> = guard.protect(&self.parent, READ_ORD);

        // SAFETY: a parent is retired only after it stops being this node's
        // parent, and the guard keeps it allocated.
        unsafe { ptr.as_ref() }
    }
}

impl<K: Clone, V> BaseNode<K, V> {
    /// Allocate a valid partition around `store`.
    pub(crate) fn boxed(store: Treap<K, V>, parent: *mut RouteNode<K>) -> Box<Self> {
        Self::boxed_with_state(PartitionState::new(store), parent)
    }

    /// Allocate an empty root partition.
    pub(crate) fn empty_root() -> Box<Self> {
        Self::boxed(Treap::new(), StdPtr::null_mut())
    }
}

impl<K, V> Drop for BaseNode<K, V> {
    fn drop(&mut self) {
        let state: *mut PartitionState<K, V> = *self.state.get_mut();

        if !state.is_null() {
            // SAFETY: the current state is owned by this node; retired states
            // were handed to the collector separately.
            drop(unsafe { Box::from_raw(state) });
        }
    }
}
