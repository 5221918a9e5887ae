//! BoundedHeap - Fixed-capacity top-K selection
//!
//! Keeps the `capacity` greatest items pushed into it. Internally a min-heap,
//! so the weakest retained item sits at the root and is replaced when a
//! better candidate arrives.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;

/// Heap retaining at most `capacity` greatest items
#[derive(Clone, Debug)]
pub struct BoundedHeap<T: Ord> {
    heap: BinaryHeap<Reverse<T>>,
    capacity: usize,
}

impl<T: Ord> BoundedHeap<T> {
    /// Create a heap that retains at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum retained items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of retained items
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if nothing is retained
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Offer an item. Returns true if it was retained.
    pub fn push(&mut self, item: T) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(item));
            return true;
        }
        match self.heap.peek_mut() {
            Some(mut weakest) if item > weakest.0 => {
                *weakest = Reverse(item);
                true
            }
            _ => false,
        }
    }

    /// Weakest retained item (next to be displaced)
    pub fn peek_min(&self) -> Option<&T> {
        self.heap.peek().map(|r| &r.0)
    }

    /// Drain into a vector ordered greatest first
    pub fn into_sorted_vec(self) -> Vec<T> {
        // Ascending in Reverse order is descending in T
        self.heap.into_sorted_vec().into_iter().map(|r| r.0).collect()
    }
}
