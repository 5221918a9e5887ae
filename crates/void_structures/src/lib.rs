//! # void_structures - Engine Data Structures
//!
//! Cache-friendly containers used by per-frame engine subsystems:
//! - BitSet: Growable index-addressed flag table
//! - BoundedHeap: Fixed-capacity top-K selection

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod bitset;
pub mod bounded_heap;

pub use bitset::BitSet;
pub use bounded_heap::BoundedHeap;

pub mod prelude {
    pub use crate::bitset::BitSet;
    pub use crate::bounded_heap::BoundedHeap;
}
