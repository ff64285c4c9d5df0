//! Fixed-size bit vectors allocated in the compilation arena.
//!
//! Liveness keeps three of these per block (live-in, live-out, kill), all
//! sized to the number of SSA values of the method. They only grow during
//! the fixed-point iteration, which is what bounds it.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// Dense bit set whose storage lives in a bumpalo arena.
pub struct BitVector<'arena> {
    words: BumpVec<'arena, u64>,
    bits: usize,
}

impl<'arena> BitVector<'arena> {
    /// Create a cleared vector able to hold `bits` bits.
    pub fn new_in(bits: usize, arena: &'arena Bump) -> Self {
        let len = bits.div_ceil(WORD_BITS);
        let mut words = BumpVec::with_capacity_in(len, arena);
        words.resize(len, 0);
        Self { words, bits }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn set_bit(&mut self, idx: usize) {
        assert!(idx < self.bits, "bit {idx} out of range {}", self.bits);
        self.words[idx / WORD_BITS] |= 1u64 << (idx % WORD_BITS);
    }

    pub fn clear_bit(&mut self, idx: usize) {
        assert!(idx < self.bits, "bit {idx} out of range {}", self.bits);
        self.words[idx / WORD_BITS] &= !(1u64 << (idx % WORD_BITS));
    }

    pub fn is_bit_set(&self, idx: usize) -> bool {
        idx < self.bits && (self.words[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS))) != 0
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// `self |= other`. Returns whether any bit changed.
    pub fn union(&mut self, other: &BitVector<'_>) -> bool {
        debug_assert_eq!(self.bits, other.bits);
        let mut changed = false;
        for (dst, &src) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *dst | src;
            changed |= merged != *dst;
            *dst = merged;
        }
        changed
    }

    /// `self |= union_with & !not_in`. Returns whether any bit changed.
    pub fn union_if_not_in(&mut self, union_with: &BitVector<'_>, not_in: &BitVector<'_>) -> bool {
        debug_assert_eq!(self.bits, union_with.bits);
        debug_assert_eq!(self.bits, not_in.bits);
        let mut changed = false;
        for ((dst, &src), &mask) in self
            .words
            .iter_mut()
            .zip(union_with.words.iter())
            .zip(not_in.words.iter())
        {
            let merged = *dst | (src & !mask);
            changed |= merged != *dst;
            *dst = merged;
        }
        changed
    }

    pub fn num_set_bits(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over set bit indices in ascending order.
    pub fn indexes(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(word_idx * WORD_BITS + bit)
            })
        })
    }
}

impl fmt::Debug for BitVector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.indexes()).finish()
    }
}
