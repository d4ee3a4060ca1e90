//! Key ordering used by routing and by every partition store.
//!
//! A [`CaTree`](crate::CaTree) orders keys through a [`KeyComparator`]. The
//! default, [`NaturalOrder`], defers to `K: Ord`. Custom orders are supplied
//! at construction either as a type implementing the trait or as a closure
//! wrapped in [`FnComparator`].

use std::cmp::Ordering;
use std::fmt as StdFmt;

/// A total order over keys of type `K`.
///
/// Implementations must be consistent: the same pair of keys must always
/// compare the same way for the lifetime of the map, otherwise routing
/// decisions made by concurrent threads will disagree.
pub trait KeyComparator<K: ?Sized>: Send + Sync {
    /// Compare two keys.
    fn compare(&self, a: &K, b: &K) -> Ordering;

    /// `a < b` under this order.
    #[inline]
    fn less(&self, a: &K, b: &K) -> bool {
        self.compare(a, b) == Ordering::Less
    }
}

/// Orders keys by their [`Ord`] implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NaturalOrder;

impl<K: Ord + ?Sized> KeyComparator<K> for NaturalOrder {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Adapts a closure into a [`KeyComparator`].
///
/// ```rust
/// use catree::{CaTree, FnComparator};
///
/// let descending = FnComparator::new(|a: &i32, b: &i32| b.cmp(a));
/// let map: CaTree<i32, &str, _> = CaTree::with_comparator(descending);
/// map.put(1, "one");
/// map.put(2, "two");
/// assert_eq!(map.keys(), vec![2, 1]);
/// ```
#[derive(Clone, Copy)]
pub struct FnComparator<F> {
    compare: F,
}

impl<F> FnComparator<F> {
    /// Wrap `compare`.
    pub const fn new(compare: F) -> Self {
        Self { compare }
    }
}

impl<F> StdFmt::Debug for FnComparator<F> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("FnComparator").finish_non_exhaustive()
    }
}

impl<K, F> KeyComparator<K> for FnComparator<F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.compare)(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_order() {
        assert_eq!(NaturalOrder.compare(&1, &2), Ordering::Less);
        assert_eq!(NaturalOrder.compare("b", "a"), Ordering::Greater);
        assert!(NaturalOrder.less(&-5_i64, &0));
        assert!(!NaturalOrder.less(&3, &3));
    }

    #[test]
    fn test_fn_comparator_reverses() {
        let reverse = FnComparator::new(|a: &u32, b: &u32| b.cmp(a));

        assert_eq!(reverse.compare(&1, &2), Ordering::Greater);
        assert!(reverse.less(&9, &4));
    }

    #[test]
    fn test_fn_comparator_by_projection() {
        let by_len = FnComparator::new(|a: &String, b: &String| a.len().cmp(&b.len()));

        assert!(by_len.less(&"zz".to_string(), &"aaa".to_string()));
        assert_eq!(
            by_len.compare(&"ab".to_string(), &"cd".to_string()),
            Ordering::Equal
        );
    }
}
