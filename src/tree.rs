//! Filepath: src/tree.rs
//! `CaTree` - a contention adapting concurrent ordered map.
//!
//! This module provides the [`CaTree`] type: the root pointer, construction,
//! descent helpers, and teardown. The access protocols live in submodules:
//!
//! - `point`: get / put / put-if-absent / remove
//! - `adapt`: statistics-driven split and join
//! - `range`: two-phase (optimistic, then locked) range queries
//! - `diagnostics`: whole-tree introspection and debug counters

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::Arc;
use std::sync::atomic::AtomicPtr;

use seize::{Collector, Guard, LocalGuard};

use crate::base::BaseNode;
use crate::comparator::{KeyComparator, NaturalOrder};
use crate::config::AdaptationConfig;
use crate::node::{NodeRef, erase_base};
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::route::{RouteNode, Side};
use crate::tracing_helpers::warn_log;

mod adapt;
mod diagnostics;
mod point;
mod range;

pub use diagnostics::{
    DebugCounters, JOIN_ABORT_COUNT, JOIN_COUNT, OPTIMISTIC_RANGE_FAILURE_COUNT,
    OPTIMISTIC_RANGE_SUCCESS_COUNT, PESSIMISTIC_RANGE_COUNT, RETRY_COUNT, SPLIT_COUNT,
    TRAVERSED_PARTITION_COUNT, TreeShape, debug_counters, reset_debug_counters,
};
pub use range::RangeLockMode;

// ============================================================================
//  CaTreeError
// ============================================================================

/// Errors returned by the checked parts of the map API.
///
/// Structural conflicts with concurrent operations are never reported; they
/// are resolved by retrying internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaTreeError {
    /// The operation exists in the interface but is not implemented.
    Unsupported {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// A range whose low bound orders after its high bound.
    InvalidRange,
}

impl StdFmt::Display for CaTreeError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Unsupported { operation } => {
                write!(f, "operation `{operation}` is not supported")
            }

            Self::InvalidRange => write!(f, "range low bound is greater than its high bound"),
        }
    }
}

impl std::error::Error for CaTreeError {}

// ============================================================================
//  RetryBudget
// ============================================================================

/// Counts structural retries of one operation against the configured bound.
pub(crate) struct RetryBudget {
    operation: &'static str,
    limit: Option<usize>,
    retries: usize,
}

impl RetryBudget {
    pub(crate) const fn new(config: &AdaptationConfig, operation: &'static str) -> Self {
        Self {
            operation,
            limit: config.retry_limit,
            retries: 0,
        }
    }

    /// Record a retry.
    ///
    /// # Panics
    /// When the configured retry limit is exceeded.
    pub(crate) fn retry(&mut self) {
        self.retries += 1;
        diagnostics::bump(&RETRY_COUNT);

        if let Some(limit) = self.limit {
            if self.retries > limit {
                warn_log!(
                    operation = self.operation,
                    retries = self.retries,
                    "retry limit exceeded"
                );
                panic!(
                    "CaTree::{}: retried {} times, limit is {limit}",
                    self.operation, self.retries
                );
            }
        }
    }
}

// ============================================================================
//  CaTree
// ============================================================================

/// A concurrent ordered map that adapts its lock granularity to contention.
///
/// Keys are spread over partitions, each with its own lock. Partitions that
/// see contended locking are split in two; partitions that are mostly read by
/// multi-partition range queries, or rarely contended, are joined with a
/// neighbour. Lookups read partitions optimistically without locking.
///
/// Values are stored as `Arc<V>` and lookups return a clone of the `Arc`.
///
/// # Example
///
/// ```rust
/// use catree::CaTree;
///
/// let map: CaTree<u64, String> = CaTree::new();
/// map.put(3, "three".to_string());
/// map.put(1, "one".to_string());
///
/// assert_eq!(map.get(&3).as_deref().map(String::as_str), Some("three"));
/// assert_eq!(map.sub_set(&0, &10), vec![1, 3]);
/// assert_eq!(map.remove(&1).as_deref().map(String::as_str), Some("one"));
/// assert_eq!(map.len(), 1);
/// ```
///
/// # Thread Safety
///
/// `CaTree<K, V, C>` is `Send + Sync` when `K`, `V`, and `C` are. All
/// operations take `&self`.
pub struct CaTree<K, V, C = NaturalOrder> {
    /// Root node: a `RouteNode<K>` or a `BaseNode<K, V>`.
    root: AtomicPtr<u8>,

    comparator: C,
    config: AdaptationConfig,

    /// Declared last: retired nodes are reclaimed after the live tree is
    /// freed by `Drop`.
    collector: Collector,

    _marker: PhantomData<(K, Arc<V>)>,
}

// SAFETY: keys and values are shared between threads through the tree and
// may be dropped by whichever thread reclaims a retired node.
unsafe impl<K: Send + Sync, V: Send + Sync, C: Send + Sync> Send for CaTree<K, V, C> {}

// SAFETY: see above; every shared mutable field is atomic or lock protected.
unsafe impl<K: Send + Sync, V: Send + Sync, C: Send + Sync> Sync for CaTree<K, V, C> {}

impl<K, V> CaTree<K, V, NaturalOrder>
where
    K: Ord + Clone,
{
    /// Create an empty map ordered by `K: Ord`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator_and_config(NaturalOrder, AdaptationConfig::new())
    }

    /// Create an empty map ordered by `K: Ord` with custom adaptation tuning.
    #[must_use]
    pub fn with_config(config: AdaptationConfig) -> Self {
        Self::with_comparator_and_config(NaturalOrder, config)
    }
}

impl<K, V> Default for CaTree<K, V, NaturalOrder>
where
    K: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> CaTree<K, V, C>
where
    K: Clone,
    C: KeyComparator<K>,
{
    /// Create an empty map ordered by `comparator`.
    #[must_use]
    pub fn with_comparator(comparator: C) -> Self {
        Self::with_comparator_and_config(comparator, AdaptationConfig::new())
    }

    /// Create an empty map with both a custom order and custom tuning.
    #[must_use]
    pub fn with_comparator_and_config(comparator: C, config: AdaptationConfig) -> Self {
        let root: *mut BaseNode<K, V> = Box::into_raw(BaseNode::empty_root());

        Self {
            root: AtomicPtr::new(erase_base(root)),
            comparator,
            config,
            collector: Collector::new(),
            _marker: PhantomData,
        }
    }

    /// The adaptation tuning this map was built with.
    #[must_use]
    pub const fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    /// The key order this map was built with.
    #[must_use]
    pub const fn comparator(&self) -> &C {
        &self.comparator
    }

    // ========================================================================
    //  Internal helpers
    // ========================================================================

    /// Enter a protected region.
    ///
    /// Every node pointer loaded while the guard lives stays allocated.
    #[inline(always)]
    pub(crate) fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    #[inline(always)]
    pub(crate) fn load_root(&self, guard: &LocalGuard<'_>) -> *mut u8 {
        guard.protect(&self.root, READ_ORD)
    }

    /// Descend to the partition responsible for `key`.
    ///
    /// No locks are taken. The partition may be stale by the time the caller
    /// looks at it; callers check [`BaseNode::is_valid`] under a lock or an
    /// optimistic token.
    pub(crate) fn find_base<'g>(&self, key: &K, guard: &'g LocalGuard<'_>) -> &'g BaseNode<K, V> {
        let mut ptr: *mut u8 = self.load_root(guard);

        loop {
            // SAFETY: child and root pointers are never null and the guard
            // protects everything reachable from them.
            match unsafe { NodeRef::<'g, K, V>::from_raw(ptr) } {
                NodeRef::Route(route) => {
                    ptr = route.child(route.direction(key, &self.comparator), guard);
                }

                NodeRef::Base(base) => return base,
            }
        }
    }

    /// Point whichever slot held `old` (a child of `parent`, or the root) at
    /// `new`.
    ///
    /// The caller holds the write lock of the partition in that slot, which
    /// is what makes the slot its to rewrite.
    pub(crate) fn replace_child(&self, parent: Option<&RouteNode<K>>, old: *mut u8, new: *mut u8) {
        match parent {
            None => self.root.store(new, WRITE_ORD),

            Some(route) => {
                let side: Option<Side> = route.side_of(old);
                debug_assert!(side.is_some(), "replace_child: old node is not a child");

                // Never guess a slot: writing the sibling would unlink it.
                let Some(side) = side else {
                    warn_log!("replace_child: old node is not a child, slots left untouched");
                    return;
                };
                route.set_child(side, new);
            }
        }
    }

    /// Hand an unlinked partition to the collector.
    ///
    /// # Safety
    /// `ptr` came from `Box::into_raw` and is no longer reachable from the
    /// root.
    pub(crate) unsafe fn retire_base(ptr: *mut BaseNode<K, V>, guard: &LocalGuard<'_>) {
        // SAFETY: caller contract.
        unsafe {
            guard.defer_retire(ptr, |ptr, _| {
                drop(Box::from_raw(ptr));
            });
        }
    }

    /// Hand an unlinked route node to the collector.
    ///
    /// # Safety
    /// Same as [`retire_base`](Self::retire_base).
    pub(crate) unsafe fn retire_route(ptr: *mut RouteNode<K>, guard: &LocalGuard<'_>) {
        // SAFETY: caller contract.
        unsafe {
            guard.defer_retire(ptr, |ptr, _| {
                drop(Box::from_raw(ptr));
            });
        }
    }
}

impl<K, V, C> StdFmt::Debug for CaTree<K, V, C> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("CaTree")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K, V, C> Drop for CaTree<K, V, C> {
    fn drop(&mut self) {
        let mut stack: Vec<*mut u8> = vec![*self.root.get_mut()];

        while let Some(ptr) = stack.pop() {
            if ptr.is_null() {
                continue;
            }

            // SAFETY: `&mut self` means no other thread can reach the tree;
            // every live node is visited exactly once.
            match unsafe { NodeRef::<'_, K, V>::from_raw(ptr) } {
                NodeRef::Route(route) => {
                    stack.push(route.child_unguarded(Side::Left));
                    stack.push(route.child_unguarded(Side::Right));

                    // SAFETY: allocated with Box::into_raw, unreachable now.
                    drop(unsafe { Box::from_raw(ptr.cast::<RouteNode<K>>()) });
                }

                NodeRef::Base(_) => {
                    // SAFETY: as above.
                    drop(unsafe { Box::from_raw(ptr.cast::<BaseNode<K, V>>()) });
                }
            }
        }

        *self.root.get_mut() = StdPtr::null_mut();
    }
}
