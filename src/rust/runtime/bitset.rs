// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::bit_iter::BitIter;
use ::std::ops::BitAnd;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Number of 32-bit words in a mask set.
pub const MASK_WORDS: usize = 4;

/// Maximum number of units (compute units or queue slots) a mask set can address.
pub const MAX_UNITS: usize = MASK_WORDS * 32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A set of up to [MAX_UNITS] units encoded as four 32-bit mask words.
///
/// The word index of unit `i` is `i >> 5` and its bit position is `i & 31`.
/// This arithmetic is shared with the wire format of command packets, so the
/// same mask words may be copied verbatim from a packet into this structure.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Bitmask {
    /// Mask words, lowest indices in `words[0]`.
    words: [u32; MASK_WORDS],
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Bitmasks
impl Bitmask {
    /// Creates an empty mask set.
    pub fn new() -> Self {
        Self {
            words: [0; MASK_WORDS],
        }
    }

    /// Creates a mask set from up to [MASK_WORDS] wire-format mask words.
    pub fn from_words(words: &[u32]) -> Self {
        let mut mask: Self = Self::new();
        for (i, word) in words.iter().enumerate().take(MASK_WORDS) {
            mask.words[i] = *word;
        }
        mask
    }

    /// Sets the bit for unit `idx`.
    pub fn set(&mut self, idx: usize) {
        assert!(idx < MAX_UNITS, "unit index out of range");
        self.words[idx >> 5] |= 1 << (idx & 31);
    }

    /// Clears the bit for unit `idx`.
    pub fn clear(&mut self, idx: usize) {
        assert!(idx < MAX_UNITS, "unit index out of range");
        self.words[idx >> 5] &= !(1 << (idx & 31));
    }

    /// Tests the bit for unit `idx`.
    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < MAX_UNITS, "unit index out of range");
        self.words[idx >> 5] & (1 << (idx & 31)) != 0
    }

    /// Returns true if no bit is set.
    pub fn none(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Returns the number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns the `i`-th mask word.
    pub fn word(&self, i: usize) -> u32 {
        self.words[i]
    }

    /// Overwrites the `i`-th mask word.
    pub fn set_word(&mut self, i: usize, word: u32) {
        self.words[i] = word;
    }

    /// Returns the lowest set bit, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Returns the lowest clear bit below `limit`, if any. This is the
    /// first-fit scan used by slot and compute-unit allocation.
    pub fn first_clear_below(&self, limit: usize) -> Option<usize> {
        (0..limit.min(MAX_UNITS)).find(|idx| !self.test(*idx))
    }

    /// Iterates over set bits in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(i, word)| BitIter::from(*word).map(move |bit| (i << 5) + bit))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Bitwise-And Trait Implementation for Bitmasks
impl BitAnd for Bitmask {
    type Output = Bitmask;

    fn bitand(self, rhs: Self) -> Self::Output {
        let mut out: Bitmask = Bitmask::new();
        for i in 0..MASK_WORDS {
            out.words[i] = self.words[i] & rhs.words[i];
        }
        out
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::runtime::bitset::{
        Bitmask,
        MAX_UNITS,
    };

    #[test]
    fn bitset_word_arithmetic() {
        let mut mask: Bitmask = Bitmask::new();

        // Unit 37 lives in word 1, bit 5.
        mask.set(37);
        assert_eq!(mask.word(0), 0);
        assert_eq!(mask.word(1), 1 << 5);
        assert!(mask.test(37));

        mask.clear(37);
        assert!(mask.none());
    }

    #[test]
    fn bitset_first_fit_is_lowest_index() {
        let mut mask: Bitmask = Bitmask::new();
        mask.set(0);
        mask.set(1);
        mask.set(3);

        assert_eq!(mask.first_clear_below(8), Some(2));
        assert_eq!(mask.first_set(), Some(0));
    }

    #[test]
    fn bitset_first_fit_exhausted() {
        let mut mask: Bitmask = Bitmask::new();
        for idx in 0..4 {
            mask.set(idx);
        }

        assert_eq!(mask.first_clear_below(4), None);
        assert_eq!(mask.first_clear_below(5), Some(4));
    }

    #[test]
    fn bitset_iterates_in_ascending_order() {
        let mut mask: Bitmask = Bitmask::new();
        mask.set(2);
        mask.set(33);
        mask.set(127);

        let bits: Vec<usize> = mask.iter().collect();
        assert_eq!(bits, vec![2, 33, 127]);
    }

    #[test]
    fn bitset_and_restricts_to_common_bits() {
        let mut a: Bitmask = Bitmask::new();
        let mut b: Bitmask = Bitmask::new();
        a.set(2);
        a.set(5);
        b.set(5);
        b.set(64);

        let both: Bitmask = a & b;
        assert_eq!(both.iter().collect::<Vec<usize>>(), vec![5]);
    }

    #[test]
    fn bitset_spans_all_units() {
        let mut mask: Bitmask = Bitmask::new();
        for idx in 0..MAX_UNITS {
            mask.set(idx);
        }
        assert_eq!(mask.count(), MAX_UNITS);
        assert_eq!(mask.first_clear_below(MAX_UNITS), None);
    }
}
