//! BitSet - Efficient bit-level storage
//!
//! Index-addressed flags backed by 64-bit words. The set can grow in place,
//! which suits tables keyed by stable ids whose range expands over a session
//! (persistent primitive indices, light ids).

use alloc::vec;
use alloc::vec::Vec;

/// Growable bitset
pub struct BitSet {
    bits: Vec<u64>,
    len: usize,
}

impl BitSet {
    /// Bits per word
    const BITS_PER_WORD: usize = 64;

    #[inline]
    const fn words_for(len: usize) -> usize {
        (len + Self::BITS_PER_WORD - 1) / Self::BITS_PER_WORD
    }

    /// Create a new bitset with capacity for n bits
    pub fn new(capacity: usize) -> Self {
        Self {
            bits: vec![0; Self::words_for(capacity)],
            len: capacity,
        }
    }

    /// Resize to `len` bits. New bits are clear; bits past a shrunk length are dropped.
    pub fn resize(&mut self, len: usize) {
        self.bits.resize(Self::words_for(len), 0);
        self.len = len;
        self.mask_tail();
    }

    /// Grow to at least `len` bits, never shrinking
    pub fn ensure_len(&mut self, len: usize) {
        if len > self.len {
            self.resize(len);
        }
    }

    /// Set a bit
    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let word = index / Self::BITS_PER_WORD;
        let bit = index % Self::BITS_PER_WORD;
        self.bits[word] |= 1u64 << bit;
    }

    /// Clear a bit
    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let word = index / Self::BITS_PER_WORD;
        let bit = index % Self::BITS_PER_WORD;
        self.bits[word] &= !(1u64 << bit);
    }

    /// Set or clear a bit
    #[inline]
    pub fn set_value(&mut self, index: usize, value: bool) {
        if value {
            self.set(index);
        } else {
            self.clear(index);
        }
    }

    /// Get a bit. Indices past the end read as clear.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = index / Self::BITS_PER_WORD;
        let bit = index % Self::BITS_PER_WORD;
        (self.bits[word] & (1u64 << bit)) != 0
    }

    /// Clear all bits
    pub fn clear_all(&mut self) {
        for word in &mut self.bits {
            *word = 0;
        }
    }

    /// Count set bits
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Check if any bit is set
    pub fn any(&self) -> bool {
        self.bits.iter().any(|&w| w != 0)
    }

    /// Get the capacity
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty (no capacity)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over set bit indices in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(word_idx, &word)| {
            let mut remaining = word;
            core::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(word_idx * Self::BITS_PER_WORD + bit)
            })
        })
    }

    /// Get the raw words
    pub fn as_words(&self) -> &[u64] {
        &self.bits
    }

    fn mask_tail(&mut self) {
        let last_bits = self.len % Self::BITS_PER_WORD;
        if last_bits != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1u64 << last_bits) - 1;
            }
        }
    }
}

impl Clone for BitSet {
    fn clone(&self) -> Self {
        Self {
            bits: self.bits.clone(),
            len: self.len,
        }
    }
}

impl Default for BitSet {
    fn default() -> Self {
        Self::new(0)
    }
}

impl core::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BitSet(len={}, ones={})", self.len, self.count_ones())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut bs = BitSet::new(100);

        bs.set(0);
        bs.set(50);
        bs.set(99);

        assert!(bs.get(0));
        assert!(bs.get(50));
        assert!(bs.get(99));
        assert!(!bs.get(1));
        assert_eq!(bs.count_ones(), 3);

        bs.set_value(50, false);
        assert!(!bs.get(50));
        assert_eq!(bs.count_ones(), 2);
    }

    #[test]
    fn test_bitset_out_of_range_reads_clear() {
        let bs = BitSet::new(10);
        assert!(!bs.get(10));
        assert!(!bs.get(10_000));
    }

    #[test]
    fn test_bitset_grow_keeps_bits() {
        let mut bs = BitSet::new(10);
        bs.set(3);
        bs.ensure_len(200);
        assert_eq!(bs.len(), 200);
        assert!(bs.get(3));
        bs.set(150);
        assert!(bs.get(150));

        // Never shrinks
        bs.ensure_len(5);
        assert_eq!(bs.len(), 200);
    }

    #[test]
    fn test_bitset_shrink_drops_tail() {
        let mut bs = BitSet::new(128);
        bs.set(5);
        bs.set(70);
        bs.resize(64);
        assert_eq!(bs.count_ones(), 1);
        bs.resize(128);
        assert!(!bs.get(70));
        assert!(bs.get(5));
    }

    #[test]
    fn test_bitset_iter() {
        let mut bs = BitSet::new(200);
        bs.set(5);
        bs.set(42);
        bs.set(73);
        bs.set(191);

        let ones: Vec<_> = bs.iter_ones().collect();
        assert_eq!(ones, vec![5, 42, 73, 191]);
    }

    #[test]
    fn test_bitset_clear_all() {
        let mut bs = BitSet::new(64);
        bs.set(1);
        bs.set(63);
        assert!(bs.any());
        bs.clear_all();
        assert!(!bs.any());
        assert_eq!(bs.len(), 64);
    }
}
