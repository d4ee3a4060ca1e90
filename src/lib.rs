//! # `CaTree`
//!
//! A contention adapting concurrent ordered map.
//!
//! The key space is divided into partitions. Each partition is an
//! immutable treap behind a stamped lock, and a binary tree of route
//! nodes maps every key to exactly one partition. Partitions watch their
//! own lock contention: a contended partition splits in two, and a quiet
//! one joins with its neighbour. The structure follows the workload.
//!
//! | Operation | Synchronization |
//! |-----------|-----------------|
//! | `get` | Optimistic read, shared lock on failure |
//! | `put` / `remove` | Exclusive lock on one partition |
//! | `sub_set` | Optimistic over all partitions, locked in key order on failure |
//! | Split / join | Inside the write that triggered them |
//!
//! ## Thread Safety
//!
//! `CaTree<K, V>` is `Send + Sync` when `K` and `V` are. All operations
//! take `&self`:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//!
//! use catree::CaTree;
//!
//! let map: Arc<CaTree<u64, String>> = Arc::new(CaTree::new());
//!
//! let handles: Vec<_> = (0..4u64)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 map.put(t * 100 + i, format!("v{i}"));
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(map.len(), 400);
//! assert_eq!(map.sub_set(&10, &13), vec![10, 11, 12, 13]);
//! ```
//!
//! ## Value Storage
//!
//! Values are stored as `Arc<V>`; reads return a clone of the `Arc`.
//!
//! ## Memory Reclamation
//!
//! Replaced partitions, partition states and route nodes are retired
//! through a [`seize`] collector owned by the map and freed once no
//! operation can still observe them.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

pub mod comparator;
pub mod config;
pub mod ordering;
pub mod scratch;
pub mod stamped;
pub mod treap;
pub mod tree;

mod base;
mod node;
mod route;
mod tracing_helpers;

pub use comparator::{FnComparator, KeyComparator, NaturalOrder};
pub use config::AdaptationConfig;
pub use scratch::RangeScratch;
pub use tree::{
    CaTree, CaTreeError, DebugCounters, RangeLockMode, TreeShape, debug_counters,
    reset_debug_counters,
};
