//! Standard memory orderings for concurrent node access.
//!
//! These constants keep ordering usage consistent across the tree and make
//! the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading child, root, and state pointers during descent.
/// Pairs with the writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing child, root, and state pointers under a lock.
/// Pairs with the reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for relaxed loads (statistics, fields fixed before publication).
pub const RELAXED: Ordering = Ordering::Relaxed;
