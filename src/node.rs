//! Filepath: src/node.rs
//!
//! Tagged child references.
//!
//! Children and the root are stored as type-erased `*mut u8`. Both node types
//! are `#[repr(C)]` with a [`NodeHeader`] as their first field, so the header
//! can be read through the erased pointer and decoded into a [`NodeRef`].

use crate::base::BaseNode;
use crate::route::RouteNode;

/// Discriminant stored at offset zero of every node.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Route = 0,
    Base = 1,
}

/// First field of [`RouteNode`] and [`BaseNode`].
#[repr(C)]
#[derive(Debug)]
pub(crate) struct NodeHeader {
    kind: NodeKind,
}

impl NodeHeader {
    pub(crate) const fn route() -> Self {
        Self {
            kind: NodeKind::Route,
        }
    }

    pub(crate) const fn base() -> Self {
        Self {
            kind: NodeKind::Base,
        }
    }

    #[inline(always)]
    pub(crate) const fn kind(&self) -> NodeKind {
        self.kind
    }
}

/// A decoded child reference, valid for the reclamation guard lifetime `'g`.
pub(crate) enum NodeRef<'g, K, V> {
    Route(&'g RouteNode<K>),
    Base(&'g BaseNode<K, V>),
}

impl<K, V> Clone for NodeRef<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for NodeRef<'_, K, V> {}

impl<'g, K, V> NodeRef<'g, K, V> {
    /// Decode an erased node pointer.
    ///
    /// # Safety
    /// `ptr` must be non-null and point to a live `RouteNode<K>` or
    /// `BaseNode<K, V>` that stays allocated for `'g` (protected by a
    /// reclamation guard, or owned exclusively by the caller).
    #[inline(always)]
    pub(crate) unsafe fn from_raw(ptr: *mut u8) -> Self {
        debug_assert!(!ptr.is_null(), "NodeRef::from_raw: null node pointer");

        // SAFETY: both node types are repr(C) with the header first.
        let header: &NodeHeader = unsafe { &*ptr.cast::<NodeHeader>() };

        match header.kind() {
            // SAFETY: the header says which type lives at `ptr`.
            NodeKind::Route => Self::Route(unsafe { &*ptr.cast::<RouteNode<K>>() }),
            NodeKind::Base => Self::Base(unsafe { &*ptr.cast::<BaseNode<K, V>>() }),
        }
    }
}

/// Erase a route node pointer for storage in a child slot.
#[inline(always)]
pub(crate) const fn erase_route<K>(ptr: *mut RouteNode<K>) -> *mut u8 {
    ptr.cast::<u8>()
}

/// Erase a base node pointer for storage in a child slot.
#[inline(always)]
pub(crate) const fn erase_base<K, V>(ptr: *mut BaseNode<K, V>) -> *mut u8 {
    ptr.cast::<u8>()
}
