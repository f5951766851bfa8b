//! Growable vector arena.
//!
//! `VecArena<T>` is the memory substrate of the dataplane: node tables,
//! pending frames, per-node counters and packet buffers are all stored in
//! one. It only ever grows. Capacity follows a power-of-two schedule so that
//! N single-element validations copy O(N) elements in total.

use std::ops::{Deref, DerefMut};

/// Smallest capacity ever allocated.
pub const MIN_CAPACITY: usize = 4;

/// Next capacity in the resize schedule that can hold `len` elements.
#[inline]
pub fn next_resize_cap(len: usize) -> usize {
    len.max(MIN_CAPACITY).next_power_of_two()
}

/// Owned, contiguous, grow-only sequence of `T`.
///
/// Elements are reached through slice indexing, ranges included:
///
/// ```
/// use vnet::arena::VecArena;
///
/// let mut a: VecArena<u8> = (0..8).collect();
/// a[2..4].copy_from_slice(&[9, 9]);
/// assert_eq!(&a[1..5], &[1, 9, 9, 4]);
/// ```
///
/// There is no way to shorten an arena from outside the crate:
///
/// ```compile_fail
/// let mut a: vnet::arena::VecArena<u8> = (0..8).collect();
/// a.clear();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VecArena<T> {
    items: Vec<T>,
}

impl<T> VecArena<T> {
    /// Create an empty arena. Nothing is allocated until the first growth.
    pub const fn new() -> Self {
        VecArena { items: Vec::new() }
    }

    /// Create an arena whose capacity can hold at least `n` elements.
    pub fn with_capacity(n: usize) -> Self {
        VecArena {
            items: Vec::with_capacity(next_resize_cap(n)),
        }
    }

    /// Current length.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Current capacity. Never smaller than `len()`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Append one element, growing on the resize schedule.
    pub fn push(&mut self, item: T) {
        self.reserve_for(self.items.len() + 1);
        self.items.push(item);
    }

    /// Make room for `len` elements using the resize schedule.
    fn reserve_for(&mut self, len: usize) {
        if len > self.items.capacity() {
            let cap = next_resize_cap(len);
            self.items.reserve_exact(cap - self.items.len());
        }
    }

    /// Drop all elements, keeping the allocation.
    ///
    /// Only the dataplane's own per-dispatch scratch storage resets itself;
    /// users of the arena see a grow-only sequence.
    #[inline]
    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    /// Move all elements out, leaving the arena empty but allocated.
    pub(crate) fn drain_all(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.items
    }
}

impl<T: Clone> VecArena<T> {
    /// Extend the length by `n`, filling the new slots with `zero`.
    pub fn resize_init(&mut self, n: usize, zero: T) {
        let len = self.items.len() + n;
        self.reserve_for(len);
        self.items.resize(len, zero);
    }

    /// Ensure index `i` is addressable, seeding new slots with `zero`.
    pub fn validate_init(&mut self, i: usize, zero: T) -> &mut T {
        let len = i + 1;
        if len > self.items.len() {
            self.reserve_for(len);
            self.items.resize(len, zero);
        }
        &mut self.items[i]
    }

    /// Append all elements of `other`.
    pub fn extend_from_slice(&mut self, other: &[T]) {
        self.reserve_for(self.items.len() + other.len());
        self.items.extend_from_slice(other);
    }
}

impl<T: Clone + Default> VecArena<T> {
    /// Extend the length by `n` default-valued elements.
    pub fn resize(&mut self, n: usize) {
        self.resize_init(n, T::default());
    }

    /// Ensure index `i` is addressable, seeding new slots with `T::default()`.
    pub fn validate(&mut self, i: usize) -> &mut T {
        self.validate_init(i, T::default())
    }
}

impl<T> Default for VecArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for VecArena<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> DerefMut for VecArena<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.items
    }
}

impl<T> FromIterator<T> for VecArena<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut arena = VecArena::new();
        for item in iter {
            arena.push(item);
        }
        arena
    }
}

impl<'a, T> IntoIterator for &'a VecArena<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
