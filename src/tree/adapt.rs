//! Filepath: src/tree/adapt.rs
//!
//! Contention-driven restructuring.
//!
//! Both operations run while the caller holds the write lock of the
//! partition being adapted, and consume that lock.
//!
//! # Split
//! ```text
//!        P                 P
//!        |                 |
//!        B      =>         R(sep)
//!                         /      \
//!                       B_lo    B_hi
//! ```
//!
//! # Join (B is the left child of P; the mirror case is symmetric)
//! ```text
//!        G                    G
//!        |                    |
//!        P          =>        S'        S' = S with N replaced by M
//!       / \                   .         M  = B ++ N
//!      B   S                  .
//!         ..
//!        N  (leftmost partition of S)
//! ```
//! The neighbour N is only try-locked, so a join never waits on a lock while
//! holding one. Unlinking P walks up to its current parent G, re-locking
//! until a valid G is found.

use std::ptr as StdPtr;

use parking_lot::MutexGuard;
use seize::LocalGuard;

use super::diagnostics::{self, JOIN_ABORT_COUNT, JOIN_COUNT, SPLIT_COUNT};
use super::{CaTree, RetryBudget};
use crate::base::{BaseNode, PartitionState};
use crate::comparator::KeyComparator;
use crate::node::{NodeRef, erase_base, erase_route};
use crate::route::{RouteNode, Side};
use crate::stamped::WriteGuard;
use crate::tracing_helpers::{debug_log, trace_log};

impl<K, V, C> CaTree<K, V, C>
where
    K: Clone,
    C: KeyComparator<K>,
{
    /// Split or join `base` if its contention score crossed a limit.
    pub(crate) fn adapt_if_needed<'g>(
        &self,
        base: &'g BaseNode<K, V>,
        locked: WriteGuard<'g>,
        guard: &'g LocalGuard<'_>,
    ) {
        let score: i32 = base.statistics();

        if self.config.wants_split(score) {
            self.split_partition(base, locked, guard);
        } else if self.config.wants_join(score) {
            self.join_partition(base, locked, guard);
        }
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Replace `base` by a route node over its two halves.
    ///
    /// # Returns
    /// `false` (after resetting the score) if the partition holds fewer than
    /// two entries.
    pub(crate) fn split_partition<'g>(
        &self,
        base: &'g BaseNode<K, V>,
        locked: WriteGuard<'g>,
        guard: &'g LocalGuard<'_>,
    ) -> bool {
        let Some((left, right, separator)) = base.state(guard).split() else {
            base.reset_statistics();
            return false;
        };

        let parent: Option<&RouteNode<K>> = base.parent(guard);

        let route: *mut RouteNode<K> = Box::into_raw(RouteNode::boxed(
            separator,
            StdPtr::null_mut(),
            StdPtr::null_mut(),
        ));
        let left: *mut BaseNode<K, V> = Box::into_raw(BaseNode::boxed_with_state(left, route));
        let right: *mut BaseNode<K, V> = Box::into_raw(BaseNode::boxed_with_state(right, route));

        // SAFETY: `route` is not yet published; nothing else can see it.
        let route_ref: &RouteNode<K> = unsafe { &*route };
        route_ref.set_child(Side::Left, erase_base(left));
        route_ref.set_child(Side::Right, erase_base(right));

        let base_ptr: *mut BaseNode<K, V> = StdPtr::from_ref(base).cast_mut();
        self.replace_child(parent, erase_base(base_ptr), erase_route(route));

        base.invalidate();
        drop(locked);

        // SAFETY: `base` was replaced in its slot and is unreachable from
        // the root.
        unsafe { Self::retire_base(base_ptr, guard) };

        diagnostics::bump(&SPLIT_COUNT);
        debug_log!(root = parent.is_none(), "split partition");
        true
    }

    // ========================================================================
    //  Join
    // ========================================================================

    /// Merge `base` with its neighbour under the same parent.
    ///
    /// # Returns
    /// `false` (after resetting the score) if `base` is the root, or the
    /// neighbour is locked or already invalid.
    pub(crate) fn join_partition<'g>(
        &self,
        base: &'g BaseNode<K, V>,
        locked: WriteGuard<'g>,
        guard: &'g LocalGuard<'_>,
    ) -> bool {
        let Some(parent) = base.parent(guard) else {
            base.reset_statistics();
            return false;
        };

        let base_ptr: *mut BaseNode<K, V> = StdPtr::from_ref(base).cast_mut();

        // Side of `parent` that holds `base`; the neighbour is the closest
        // partition in the other subtree.
        let side: Side = if parent.child(Side::Left, guard) == erase_base(base_ptr) {
            Side::Left
        } else {
            Side::Right
        };
        let neighbor: &'g BaseNode<K, V> =
            self.outermost_partition(parent.child(side.other(), guard), side, guard);

        let Some(neighbor_locked) = neighbor.lock().try_write() else {
            trace_log!("join aborted: neighbour locked");
            return Self::abort_join(base);
        };
        if !neighbor.is_valid() {
            drop(neighbor_locked);
            trace_log!("join aborted: neighbour invalid");
            return Self::abort_join(base);
        }

        let merged: PartitionState<K, V> = match side {
            Side::Left => PartitionState::join(base.state(guard), neighbor.state(guard)),
            Side::Right => PartitionState::join(neighbor.state(guard), base.state(guard)),
        };

        // Unlink `parent`: its slot in the grandparent now points at the
        // subtree holding the neighbour.
        let parent_locked: MutexGuard<'_, ()> = parent.lock();
        let grandparent: Option<(&'g RouteNode<K>, MutexGuard<'g, ()>)> =
            self.lock_valid_parent_of(parent, guard);
        let sibling: *mut u8 = parent.child(side.other(), guard);
        let parent_ptr: *mut RouteNode<K> = StdPtr::from_ref(parent).cast_mut();

        let grandparent_ref: Option<&'g RouteNode<K>> = grandparent.as_ref().map(|(g, _)| *g);
        self.replace_child(grandparent_ref, erase_route(parent_ptr), sibling);

        parent.invalidate();
        drop(parent_locked);
        drop(grandparent);

        // Install the merged partition in the neighbour's slot.
        let neighbor_ptr: *mut BaseNode<K, V> = StdPtr::from_ref(neighbor).cast_mut();
        let neighbor_parent: Option<&'g RouteNode<K>> = if sibling == erase_base(neighbor_ptr) {
            grandparent_ref
        } else {
            neighbor.parent(guard)
        };
        let neighbor_parent_ptr: *mut RouteNode<K> =
            neighbor_parent.map_or(StdPtr::null_mut(), |p| StdPtr::from_ref(p).cast_mut());

        let merged: *mut BaseNode<K, V> =
            Box::into_raw(BaseNode::boxed_with_state(merged, neighbor_parent_ptr));
        self.replace_child(neighbor_parent, erase_base(neighbor_ptr), erase_base(merged));

        neighbor.invalidate();
        drop(neighbor_locked);
        base.invalidate();
        drop(locked);

        // SAFETY: all three nodes were unlinked above.
        unsafe {
            Self::retire_route(parent_ptr, guard);
            Self::retire_base(neighbor_ptr, guard);
            Self::retire_base(base_ptr, guard);
        }

        diagnostics::bump(&JOIN_COUNT);
        debug_log!(left = (side == Side::Left), "joined partitions");
        true
    }

    fn abort_join(base: &BaseNode<K, V>) -> bool {
        base.reset_statistics();
        diagnostics::bump(&JOIN_ABORT_COUNT);
        false
    }

    /// Descend from `start` always taking `toward`, down to a partition.
    ///
    /// `toward == Left` gives the leftmost partition of the subtree.
    pub(crate) fn outermost_partition<'g>(
        &self,
        start: *mut u8,
        toward: Side,
        guard: &'g LocalGuard<'_>,
    ) -> &'g BaseNode<K, V> {
        let mut ptr: *mut u8 = start;

        loop {
            // SAFETY: protected by `guard`, never null.
            match unsafe { NodeRef::<'g, K, V>::from_raw(ptr) } {
                NodeRef::Route(route) => ptr = route.child(toward, guard),
                NodeRef::Base(base) => return base,
            }
        }
    }

    /// Find and lock the current, valid parent of `route`.
    ///
    /// The caller holds `route`'s mutex, so `route` stays linked. The parent
    /// can still be spliced out by another join until it is locked, hence the
    /// loop.
    ///
    /// # Returns
    /// `None` when `route` is the root.
    fn lock_valid_parent_of<'g>(
        &self,
        route: &RouteNode<K>,
        guard: &'g LocalGuard<'_>,
    ) -> Option<(&'g RouteNode<K>, MutexGuard<'g, ()>)>
    where
        V: 'g,
    {
        let mut budget = RetryBudget::new(&self.config, "join");

        loop {
            let parent: &'g RouteNode<K> = self.parent_of(route, guard)?;
            let parent_locked: MutexGuard<'g, ()> = parent.lock();

            if parent.is_valid() {
                return Some((parent, parent_locked));
            }

            drop(parent_locked);
            budget.retry();
        }
    }

    /// Locate the route node whose child slot holds `route`, by descending
    /// from the root with `route`'s separator.
    fn parent_of<'g>(
        &self,
        route: &RouteNode<K>,
        guard: &'g LocalGuard<'_>,
    ) -> Option<&'g RouteNode<K>>
    where
        V: 'g,
    {
        let target: *mut u8 = erase_route(StdPtr::from_ref(route).cast_mut());
        let key: &K = route.key();
        let mut budget = RetryBudget::new(&self.config, "parent_of");

        'restart: loop {
            let mut previous: Option<&'g RouteNode<K>> = None;
            let mut ptr: *mut u8 = self.load_root(guard);

            while ptr != target {
                // SAFETY: protected by `guard`, never null.
                match unsafe { NodeRef::<'g, K, V>::from_raw(ptr) } {
                    NodeRef::Route(current) => {
                        previous = Some(current);
                        ptr = current.child(current.direction(key, &self.comparator), guard);
                    }

                    NodeRef::Base(_) => {
                        // Raced with a restructuring above `route`.
                        budget.retry();
                        continue 'restart;
                    }
                }
            }

            return previous;
        }
    }
}
