//! Fixed-width bit vectors used by the effects inferencer.
//!
//! The fixed-point loops over method components need to know whether an
//! in-place union or intersection changed anything, so the mutating
//! operations report that instead of returning the result.

/// A fixed-width boolean vector backed by 64-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
}

impl BitVec {
    /// Create an all-zero vector with `len` bits.
    pub fn new(len: usize) -> Self {
        BitVec {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        self.words[bit >> 6] |= 1u64 << (bit & 63);
    }

    pub fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        self.words[bit >> 6] &= !(1u64 << (bit & 63));
    }

    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        self.words[bit >> 6] & (1u64 << (bit & 63)) != 0
    }

    /// In-place union. Returns `true` iff any bit changed.
    pub fn or_with(&mut self, other: &BitVec) -> bool {
        debug_assert_eq!(self.len, other.len);
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let x = *w | o;
            changed |= x != *w;
            *w = x;
        }
        changed
    }

    /// In-place intersection. Returns `true` iff any bit changed.
    pub fn and_with(&mut self, other: &BitVec) -> bool {
        debug_assert_eq!(self.len, other.len);
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let x = *w & o;
            changed |= x != *w;
            *w = x;
        }
        changed
    }

    /// In-place set difference: remove every bit set in `other`.
    pub fn minus_with(&mut self, other: &BitVec) {
        debug_assert_eq!(self.len, other.len);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    /// Number of set bits.
    pub fn popcount(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Call `f` with the index of every set bit, in increasing order.
    pub fn for_each_set(&self, mut f: impl FnMut(usize)) {
        for (wi, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let b = w.trailing_zeros() as usize;
                f(wi * 64 + b);
                w &= w - 1;
            }
        }
    }

    /// Iterator over set bit indices, in increasing order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let b = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(wi * 64 + b)
            })
        })
    }
}

/// Positive and negative effect bits of a method or action subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectBits {
    pub pos: BitVec,
    pub neg: BitVec,
}

impl EffectBits {
    pub fn new(len: usize) -> Self {
        EffectBits {
            pos: BitVec::new(len),
            neg: BitVec::new(len),
        }
    }

    pub fn or_with(&mut self, other: &EffectBits) -> bool {
        let a = self.pos.or_with(&other.pos);
        let b = self.neg.or_with(&other.neg);
        a | b
    }

    pub fn and_with(&mut self, other: &EffectBits) -> bool {
        let a = self.pos.and_with(&other.pos);
        let b = self.neg.and_with(&other.neg);
        a | b
    }

    /// Cancellation by a later contradictory effect: a positive bit dies if
    /// `other` may delete it, a negative bit dies if `other` may re-add it.
    /// This is not a plain bitwise difference.
    pub fn minus_with(&mut self, other: &EffectBits) {
        self.pos.minus_with(&other.neg);
        self.neg.minus_with(&other.pos);
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty() && self.neg.is_empty()
    }
}
