//! Filepath: src/treap.rs
//!
//! Persistent treap: the ordered store inside every partition.
//!
//! A [`Treap`] is an immutable binary search tree with heap-ordered random
//! priorities. Every mutation copies the path from the root to the touched
//! node and shares the rest through `Arc`, so a previously obtained [`Treap`]
//! value stays valid and unchanged forever. That property is what lets a
//! partition publish a new root under its write lock while optimistic readers
//! keep using the old one.
//!
//! Values are stored as `Arc<V>` and handed out by cloning the `Arc`.
//!
//! # Operations
//!
//! | Operation | Cost (expected) |
//! |-----------|-----------------|
//! | `get`, `insert`, `insert_if_absent`, `remove` | O(log n) |
//! | `min_key`, `max_key` | O(log n) |
//! | `split` (root-median) | O(1) |
//! | `join` (all left keys < all right keys) | O(log n) |
//! | `for_each_in_range` | O(log n + k) |

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt as StdFmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::comparator::KeyComparator;

type Link<K, V> = Option<Arc<TreapNode<K, V>>>;

// ============================================================================
//  Priorities
// ============================================================================

/// Seed source for per-thread priority generators.
static PRIORITY_SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);

thread_local! {
    static PRIORITY_STATE: Cell<u64> = Cell::new(splitmix64(
        PRIORITY_SEED.fetch_add(0x9e37_79b9_7f4a_7c15, AtomicOrdering::Relaxed),
    ));
}

const fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Draw the next priority from this thread's xorshift generator.
fn next_priority() -> u64 {
    PRIORITY_STATE.with(|state| {
        let mut x: u64 = state.get() | 1;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        x
    })
}

// ============================================================================
//  TreapNode
// ============================================================================

struct TreapNode<K, V> {
    key: K,
    value: Arc<V>,
    priority: u64,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K: Clone, V> TreapNode<K, V> {
    fn leaf(key: K, value: Arc<V>) -> Arc<Self> {
        Arc::new(Self {
            key,
            value,
            priority: next_priority(),
            left: None,
            right: None,
        })
    }

    fn with_children(&self, left: Link<K, V>, right: Link<K, V>) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            priority: self.priority,
            left,
            right,
        }
    }

    fn with_left(&self, left: Link<K, V>) -> Arc<Self> {
        Arc::new(self.with_children(left, self.right.clone()))
    }

    fn with_right(&self, right: Link<K, V>) -> Arc<Self> {
        Arc::new(self.with_children(self.left.clone(), right))
    }

    fn with_value(&self, value: Arc<V>) -> Arc<Self> {
        Arc::new(Self {
            key: self.key.clone(),
            value,
            priority: self.priority,
            left: self.left.clone(),
            right: self.right.clone(),
        })
    }

    /// Hang a freshly built left child, rotating right if it outranks `self`.
    fn attach_left(&self, child: &Arc<Self>) -> Arc<Self> {
        if child.priority > self.priority {
            let lowered: Arc<Self> = self.with_left(child.right.clone());
            child.with_right(Some(lowered))
        } else {
            self.with_left(Some(Arc::clone(child)))
        }
    }

    /// Hang a freshly built right child, rotating left if it outranks `self`.
    fn attach_right(&self, child: &Arc<Self>) -> Arc<Self> {
        if child.priority > self.priority {
            let lowered: Arc<Self> = self.with_right(child.left.clone());
            child.with_left(Some(lowered))
        } else {
            self.with_right(Some(Arc::clone(child)))
        }
    }
}

// ============================================================================
//  Insertion
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertMode {
    Replace,
    KeepExisting,
}

enum Insertion<K, V> {
    /// Key was new; the subtree has a new root.
    Added(Arc<TreapNode<K, V>>),
    /// Key existed and its value was replaced.
    Replaced(Arc<TreapNode<K, V>>, Arc<V>),
    /// Key existed and was kept; nothing changed.
    Present(Arc<V>),
}

fn insert_at<K, V, C>(
    link: &Link<K, V>,
    key: K,
    value: Arc<V>,
    cmp: &C,
    mode: InsertMode,
) -> Insertion<K, V>
where
    K: Clone,
    C: KeyComparator<K> + ?Sized,
{
    let Some(node) = link else {
        return Insertion::Added(TreapNode::leaf(key, value));
    };

    match cmp.compare(&key, &node.key) {
        Ordering::Equal => match mode {
            InsertMode::Replace => {
                Insertion::Replaced(node.with_value(value), Arc::clone(&node.value))
            }
            InsertMode::KeepExisting => Insertion::Present(Arc::clone(&node.value)),
        },

        Ordering::Less => match insert_at(&node.left, key, value, cmp, mode) {
            Insertion::Added(child) => Insertion::Added(node.attach_left(&child)),
            Insertion::Replaced(child, previous) => {
                Insertion::Replaced(node.with_left(Some(child)), previous)
            }
            present @ Insertion::Present(_) => present,
        },

        Ordering::Greater => match insert_at(&node.right, key, value, cmp, mode) {
            Insertion::Added(child) => Insertion::Added(node.attach_right(&child)),
            Insertion::Replaced(child, previous) => {
                Insertion::Replaced(node.with_right(Some(child)), previous)
            }
            present @ Insertion::Present(_) => present,
        },
    }
}

// ============================================================================
//  Removal and joining
// ============================================================================

fn remove_at<K, V, C>(link: &Link<K, V>, key: &K, cmp: &C) -> Option<(Link<K, V>, Arc<V>)>
where
    K: Clone,
    C: KeyComparator<K> + ?Sized,
{
    let node = link.as_ref()?;

    match cmp.compare(key, &node.key) {
        Ordering::Equal => Some((merge(&node.left, &node.right), Arc::clone(&node.value))),

        Ordering::Less => {
            let (left, previous) = remove_at(&node.left, key, cmp)?;
            Some((Some(node.with_left(left)), previous))
        }

        Ordering::Greater => {
            let (right, previous) = remove_at(&node.right, key, cmp)?;
            Some((Some(node.with_right(right)), previous))
        }
    }
}

/// Merge two treaps where every key of `left` precedes every key of `right`.
fn merge<K: Clone, V>(left: &Link<K, V>, right: &Link<K, V>) -> Link<K, V> {
    match (left, right) {
        (None, _) => right.clone(),
        (_, None) => left.clone(),
        (Some(l), Some(r)) => {
            if l.priority >= r.priority {
                Some(l.with_right(merge(&l.right, right)))
            } else {
                Some(r.with_left(merge(left, &r.left)))
            }
        }
    }
}

// ============================================================================
//  Traversal
// ============================================================================

fn for_each_node<K, V, F>(link: &Link<K, V>, f: &mut F)
where
    F: FnMut(&K, &Arc<V>),
{
    if let Some(node) = link {
        for_each_node(&node.left, f);
        f(&node.key, &node.value);
        for_each_node(&node.right, f);
    }
}

fn for_each_in_range_node<K, V, C, F>(
    link: &Link<K, V>,
    lo: Option<&K>,
    hi: Option<&K>,
    cmp: &C,
    f: &mut F,
) where
    C: KeyComparator<K> + ?Sized,
    F: FnMut(&K, &Arc<V>),
{
    let Some(node) = link else {
        return;
    };

    let above_lo: bool = lo.is_none_or(|lo| !cmp.less(&node.key, lo));
    let below_hi: bool = hi.is_none_or(|hi| !cmp.less(hi, &node.key));

    if above_lo {
        for_each_in_range_node(&node.left, lo, hi, cmp, f);
    }
    if above_lo && below_hi {
        f(&node.key, &node.value);
    }
    if below_hi {
        for_each_in_range_node(&node.right, lo, hi, cmp, f);
    }
}

// ============================================================================
//  Treap
// ============================================================================

/// An immutable, persistent ordered map.
///
/// Cloning is O(1): the clone shares every node.
///
/// # Example
///
/// ```rust
/// use catree::treap::Treap;
/// use catree::NaturalOrder;
/// use std::sync::Arc;
///
/// let empty: Treap<u32, &str> = Treap::new();
/// let (one, _) = empty.insert(1, Arc::new("one"), &NaturalOrder);
/// let (two, _) = one.insert(2, Arc::new("two"), &NaturalOrder);
///
/// // Older versions are untouched.
/// assert!(empty.is_empty());
/// assert_eq!(one.len(), 1);
/// assert_eq!(two.len(), 2);
/// assert_eq!(two.get(&2, &NaturalOrder).map(|v| **v), Some("two"));
/// ```
pub struct Treap<K, V> {
    root: Link<K, V>,
}

impl<K, V> Clone for Treap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<K, V> Default for Treap<K, V> {
    fn default() -> Self {
        Self { root: None }
    }
}

impl<K: StdFmt::Debug, V: StdFmt::Debug> StdFmt::Debug for Treap<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let mut map = f.debug_map();
        for_each_node(&self.root, &mut |k: &K, v: &Arc<V>| {
            map.entry(k, v);
        });
        map.finish()
    }
}

impl<K, V> Treap<K, V> {
    /// The empty treap.
    #[must_use]
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Check if the treap holds no entries.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Check if the treap holds zero or one entry.
    #[inline]
    #[must_use]
    pub fn has_fewer_than_two(&self) -> bool {
        self.root
            .as_ref()
            .is_none_or(|root| root.left.is_none() && root.right.is_none())
    }

    /// Number of entries. O(n).
    #[must_use]
    pub fn len(&self) -> usize {
        let mut count: usize = 0;
        for_each_node(&self.root, &mut |_: &K, _: &Arc<V>| count += 1);
        count
    }

    /// Smallest key.
    #[must_use]
    pub fn min_key(&self) -> Option<&K> {
        let mut node = self.root.as_ref()?;
        while let Some(left) = node.left.as_ref() {
            node = left;
        }
        Some(&node.key)
    }

    /// Largest key.
    #[must_use]
    pub fn max_key(&self) -> Option<&K> {
        let mut node = self.root.as_ref()?;
        while let Some(right) = node.right.as_ref() {
            node = right;
        }
        Some(&node.key)
    }

    /// Look up `key`.
    pub fn get<C>(&self, key: &K, cmp: &C) -> Option<&Arc<V>>
    where
        C: KeyComparator<K> + ?Sized,
    {
        let mut link: &Link<K, V> = &self.root;

        while let Some(node) = link {
            match cmp.compare(key, &node.key) {
                Ordering::Less => link = &node.left,
                Ordering::Greater => link = &node.right,
                Ordering::Equal => return Some(&node.value),
            }
        }

        None
    }

    /// Visit every entry in key order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &Arc<V>),
    {
        for_each_node(&self.root, &mut f);
    }

    /// Visit, in key order, every entry with `lo <= key <= hi`.
    ///
    /// A `None` bound is open.
    pub fn for_each_in_range<C, F>(&self, lo: Option<&K>, hi: Option<&K>, cmp: &C, mut f: F)
    where
        C: KeyComparator<K> + ?Sized,
        F: FnMut(&K, &Arc<V>),
    {
        for_each_in_range_node(&self.root, lo, hi, cmp, &mut f);
    }
}

impl<K: Clone, V> Treap<K, V> {
    /// Insert or replace. Returns the new version and the previous value.
    #[must_use]
    pub fn insert<C>(&self, key: K, value: Arc<V>, cmp: &C) -> (Self, Option<Arc<V>>)
    where
        C: KeyComparator<K> + ?Sized,
    {
        self.insert_with_mode(key, value, cmp, InsertMode::Replace)
    }

    /// Insert only if `key` is absent.
    ///
    /// When the key is present the returned version shares this one entirely
    /// and the existing value is returned.
    #[must_use]
    pub fn insert_if_absent<C>(&self, key: K, value: Arc<V>, cmp: &C) -> (Self, Option<Arc<V>>)
    where
        C: KeyComparator<K> + ?Sized,
    {
        self.insert_with_mode(key, value, cmp, InsertMode::KeepExisting)
    }

    fn insert_with_mode<C>(
        &self,
        key: K,
        value: Arc<V>,
        cmp: &C,
        mode: InsertMode,
    ) -> (Self, Option<Arc<V>>)
    where
        C: KeyComparator<K> + ?Sized,
    {
        match insert_at(&self.root, key, value, cmp, mode) {
            Insertion::Added(root) => (Self { root: Some(root) }, None),
            Insertion::Replaced(root, previous) => (Self { root: Some(root) }, Some(previous)),
            Insertion::Present(existing) => (self.clone(), Some(existing)),
        }
    }

    /// Remove `key`. Returns the new version and the removed value.
    #[must_use]
    pub fn remove<C>(&self, key: &K, cmp: &C) -> (Self, Option<Arc<V>>)
    where
        C: KeyComparator<K> + ?Sized,
    {
        match remove_at(&self.root, key, cmp) {
            Some((root, previous)) => (Self { root }, Some(previous)),
            None => (self.clone(), None),
        }
    }

    /// Split into two non-empty halves around the root.
    ///
    /// # Returns
    /// `(left, right, separator)` where every key of `left` is less than
    /// `separator` and `separator` is the smallest key of `right`, or `None`
    /// when the treap has fewer than two entries.
    #[must_use]
    pub fn split(&self) -> Option<(Self, Self, K)> {
        let root = self.root.as_ref()?;

        if root.left.is_some() {
            let left = Self {
                root: root.left.clone(),
            };
            let right = Self {
                root: Some(root.with_left(None)),
            };
            return Some((left, right, root.key.clone()));
        }

        // Root is the minimum: it alone forms the left half.
        let right = Self {
            root: Some(Arc::clone(root.right.as_ref()?)),
        };
        let separator: K = right.min_key()?.clone();
        let left = Self {
            root: Some(root.with_right(None)),
        };

        Some((left, right, separator))
    }

    /// Concatenate two treaps.
    ///
    /// Every key of `left` must precede every key of `right`; this is not
    /// checked. Neither input is modified.
    #[must_use]
    pub fn join(left: &Self, right: &Self) -> Self {
        Self {
            root: merge(&left.root, &right.root),
        }
    }
}
