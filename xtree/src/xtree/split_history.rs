//! Per-directory-entry record of the split axes used beneath an entry.
//!
//! Every directory entry carries a fixed bitset of width d. Bit `k` is set
//! once dimension `k` has served as a split axis somewhere on the path from
//! the root to the entry's subtree. The X-split restricts candidate axes for
//! directory splits to those on which all (or none) of the entries' histories
//! agree, which is what makes overlap-free directory splits possible at all.

/// Fixed-width bitset over the tree's dimensionality.
///
/// Cloning is a plain word copy; histories are cloned into both children on
/// every split, with the split axis additionally set in both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitHistory {
    dims: u32,
    words: Vec<u64>,
}

impl SplitHistory {
    /// Empty history for a tree of the given dimensionality.
    pub fn new(dims: u32) -> SplitHistory {
        SplitHistory {
            dims,
            words: vec![0; Self::word_count(dims)],
        }
    }

    /// Number of 64-bit words needed for `dims` bits.
    pub fn word_count(dims: u32) -> usize {
        ((dims as usize) + 63) / 64
    }

    /// Reconstructs a history from its serialized words.
    pub fn from_words(dims: u32, words: Vec<u64>) -> SplitHistory {
        debug_assert_eq!(words.len(), Self::word_count(dims));
        SplitHistory { dims, words }
    }

    pub fn dims(&self) -> u32 {
        self.dims
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Marks `axis` as used.
    pub fn set(&mut self, axis: usize) {
        debug_assert!(axis < self.dims as usize);
        self.words[axis / 64] |= 1u64 << (axis % 64);
    }

    /// True when `axis` has been used beneath this entry.
    pub fn is_set(&self, axis: usize) -> bool {
        debug_assert!(axis < self.dims as usize);
        self.words[axis / 64] & (1u64 << (axis % 64)) != 0
    }

    /// Number of axes recorded.
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &SplitHistory) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & !b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let h = SplitHistory::new(8);
        assert_eq!(h.count(), 0);
        assert!(!h.is_set(0));
        assert!(!h.is_set(7));
    }

    #[test]
    fn test_set_and_get() {
        let mut h = SplitHistory::new(8);
        h.set(0);
        h.set(5);
        assert!(h.is_set(0));
        assert!(h.is_set(5));
        assert!(!h.is_set(3));
        assert_eq!(h.count(), 2);
    }

    #[test]
    fn test_wide_history_crosses_words() {
        let mut h = SplitHistory::new(130);
        h.set(0);
        h.set(64);
        h.set(129);
        assert_eq!(h.words().len(), 3);
        assert!(h.is_set(64));
        assert!(h.is_set(129));
        assert_eq!(h.count(), 3);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a = SplitHistory::new(4);
        a.set(1);
        let mut b = a.clone();
        b.set(2);
        assert!(!a.is_set(2));
        assert!(b.is_set(1));
    }

    #[test]
    fn test_subset() {
        let mut parent = SplitHistory::new(4);
        parent.set(1);
        let mut child = parent.clone();
        child.set(3);
        assert!(parent.is_subset_of(&child));
        assert!(!child.is_subset_of(&parent));
    }

    #[test]
    fn test_word_round_trip() {
        let mut h = SplitHistory::new(70);
        h.set(2);
        h.set(69);
        let back = SplitHistory::from_words(70, h.words().to_vec());
        assert_eq!(h, back);
    }
}
