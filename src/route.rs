//! Filepath: src/route.rs
//!
//! Route nodes: the binary decision points of the routing tree.
//!
//! A route node's separator never changes. Its child slots are rewritten
//! only by a thread holding the node's mutex (joins), and plain descent reads
//! them without locking. A node spliced out by a join is marked invalid and
//! retired; threads that still reach it are corrected by the validity check
//! at the partition they land on.

use std::sync::atomic::{AtomicBool, AtomicPtr};

use parking_lot::{Mutex, MutexGuard};
use seize::{Guard, LocalGuard};

use crate::comparator::KeyComparator;
use crate::node::NodeHeader;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Which child slot of a route node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    pub(crate) const fn other(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// Internal routing node.
///
/// Keys strictly less than `key` live in the left subtree.
#[repr(C)]
pub(crate) struct RouteNode<K> {
    header: NodeHeader,
    key: K,
    left: AtomicPtr<u8>,
    right: AtomicPtr<u8>,
    lock: Mutex<()>,
    valid: AtomicBool,
}

impl<K> RouteNode<K> {
    /// Allocate a valid route node over two erased children.
    pub(crate) fn boxed(key: K, left: *mut u8, right: *mut u8) -> Box<Self> {
        Box::new(Self {
            header: NodeHeader::route(),
            key,
            left: AtomicPtr::new(left),
            right: AtomicPtr::new(right),
            lock: Mutex::new(()),
            valid: AtomicBool::new(true),
        })
    }

    #[inline(always)]
    pub(crate) const fn key(&self) -> &K {
        &self.key
    }

    /// Load a child slot under the reclamation guard.
    #[inline(always)]
    pub(crate) fn child(&self, side: Side, guard: &LocalGuard<'_>) -> *mut u8 {
        match side {
            Side::Left => guard.protect(&self.left, READ_ORD),
            Side::Right => guard.protect(&self.right, READ_ORD),
        }
    }

    /// Load a child slot with exclusive access to the tree.
    #[inline(always)]
    pub(crate) fn child_unguarded(&self, side: Side) -> *mut u8 {
        match side {
            Side::Left => self.left.load(RELAXED),
            Side::Right => self.right.load(RELAXED),
        }
    }

    /// Rewrite a child slot. Caller holds this node's mutex, or the node is
    /// not yet published.
    #[inline(always)]
    pub(crate) fn set_child(&self, side: Side, child: *mut u8) {
        match side {
            Side::Left => self.left.store(child, WRITE_ORD),
            Side::Right => self.right.store(child, WRITE_ORD),
        }
    }

    /// Slot that currently holds `child`, if any.
    pub(crate) fn side_of(&self, child: *mut u8) -> Option<Side> {
        if self.left.load(READ_ORD) == child {
            Some(Side::Left)
        } else if self.right.load(READ_ORD) == child {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Which subtree a lookup for `key` descends into.
    #[inline(always)]
    pub(crate) fn direction<C>(&self, key: &K, cmp: &C) -> Side
    where
        C: KeyComparator<K> + ?Sized,
    {
        if cmp.less(key, &self.key) {
            Side::Left
        } else {
            Side::Right
        }
    }

    #[inline(always)]
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    #[inline(always)]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    #[inline(always)]
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(READ_ORD)
    }

    /// Mark spliced out. Caller holds the mutex.
    #[inline(always)]
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, WRITE_ORD);
    }
}
