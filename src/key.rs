//! Key selection and ordering for the keyed containers.

use core::cmp::Ordering;
use core::ptr::NonNull;

/// Maps an element to the key the container orders it by.
pub trait KeySelector<T: ?Sized> {
    /// The key type.
    type Key: ?Sized;

    /// Returns the key of `element`.
    fn key<'a>(&self, element: &'a T) -> &'a Self::Key;
}

/// Selector returning the whole element as its own key.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentitySelector;

impl<T: ?Sized> KeySelector<T> for IdentitySelector {
    type Key = T;

    fn key<'a>(&self, element: &'a T) -> &'a T {
        element
    }
}

/// A three-way comparator over keys.
///
/// The ordered sets keep their elements ascending per the comparator; the
/// heap keeps the element that compares greatest at the root.
pub trait Compare<K: ?Sized> {
    /// Compares two keys.
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering;
}

/// Comparator using the key's [`Ord`] implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<K: ?Sized + Ord> Compare<K> for NaturalOrder {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        lhs.cmp(rhs)
    }
}

/// Comparator inverting the key's [`Ord`] implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReverseOrder;

impl<K: ?Sized + Ord> Compare<K> for ReverseOrder {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        rhs.cmp(lhs)
    }
}

/// Result of inserting into an ordered set.
#[derive(Clone, Copy, Debug)]
pub struct InsertResult<T> {
    /// The matching element in the container: the newly inserted element,
    /// or the existing equivalent one if the insert was rejected.
    pub element: NonNull<T>,

    /// True if a new element was inserted.
    pub inserted: bool,
}
