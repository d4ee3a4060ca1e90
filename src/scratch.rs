//! Filepath: src/scratch.rs
//!
//! Reusable buffers for range queries.
//!
//! A range query walks the routing tree with an explicit stack of route
//! nodes, keeps a copy of that stack to resume from when a partition turns
//! out to be stale, records the optimistic tokens it collected, and may
//! gather result keys. [`RangeScratch`] owns those buffers so a caller that
//! issues many range queries from one thread can reuse the allocations.
//!
//! ```rust
//! use catree::{CaTree, RangeScratch};
//!
//! let map: CaTree<u32, u32> = CaTree::new();
//! for k in 0..10 {
//!     map.put(k, k);
//! }
//!
//! let mut scratch = RangeScratch::new();
//! assert_eq!(map.sub_set_into(&2, &4, &mut scratch), &[2, 3, 4]);
//! assert_eq!(map.sub_set_into(&8, &20, &mut scratch), &[8, 9]);
//! ```
//!
//! The buffers hold no state between calls; every query starts by clearing
//! them. A fresh scratch per call is equivalent, only slower.

use std::fmt as StdFmt;

use crate::base::BaseNode;
use crate::route::RouteNode;

/// Per-caller buffers for range queries.
pub struct RangeScratch<K, V> {
    /// Route nodes from the root down to the current partition.
    pub(crate) path: Vec<*const RouteNode<K>>,

    /// Copy of `path` taken before looking for the next partition.
    pub(crate) resume: Vec<*const RouteNode<K>>,

    /// Partitions read by the optimistic phase and their tokens.
    pub(crate) visited: Vec<(*const BaseNode<K, V>, u64)>,

    /// Result keys for [`CaTree::sub_set_into`](crate::CaTree::sub_set_into).
    pub(crate) keys: Vec<K>,
}

// SAFETY: the pointer buffers are only meaningful during one query on the
// thread running it, and are cleared before and after every query. Only the
// key buffer carries data across threads.
unsafe impl<K: Send, V> Send for RangeScratch<K, V> {}

impl<K, V> RangeScratch<K, V> {
    /// Empty buffers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            path: Vec::new(),
            resume: Vec::new(),
            visited: Vec::new(),
            keys: Vec::new(),
        }
    }

    /// Buffers pre-sized for `depth` route levels and `keys` result keys.
    #[must_use]
    pub fn with_capacity(depth: usize, keys: usize) -> Self {
        Self {
            path: Vec::with_capacity(depth),
            resume: Vec::with_capacity(depth),
            visited: Vec::with_capacity(depth),
            keys: Vec::with_capacity(keys),
        }
    }

    /// Drop every node pointer left from the last walk.
    pub(crate) fn reset_walk(&mut self) {
        self.path.clear();
        self.resume.clear();
        self.visited.clear();
    }

    /// Keys gathered by the last [`CaTree::sub_set_into`](crate::CaTree::sub_set_into).
    #[must_use]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K, V> Default for RangeScratch<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StdFmt::Debug for RangeScratch<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("RangeScratch")
            .field("path_capacity", &self.path.capacity())
            .field("keys", &self.keys.len())
            .finish()
    }
}
