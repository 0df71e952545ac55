//! Fixed-capacity ring of call outcomes
//!
//! Each recorded call sets one bit (1 = failure) at the cursor, overwriting
//! the oldest outcome once the ring has wrapped. The failure rate is only
//! defined after the ring has been filled at least once.

/// Failure rate reported while the ring has not been filled yet
pub const RATE_UNDEFINED: f32 = -1.0;

const WORD_BITS: usize = 64;

/// Bit-packed outcome ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBitSet {
    words: Vec<u64>,
    size: usize,
    /// Next write position
    index: usize,
    /// Outcomes recorded so far, capped at `size`
    length: usize,
    /// Set bits currently in the ring
    cardinality: usize,
}

impl RingBitSet {
    /// Create an empty ring holding `size` outcomes (at least one)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            words: vec![0; size.div_ceil(WORD_BITS)],
            size,
            index: 0,
            length: 0,
            cardinality: 0,
        }
    }

    /// Create a ring of `size` seeded with the most recent outcomes of `previous`
    pub fn from_previous(size: usize, previous: &RingBitSet) -> Self {
        let mut ring = Self::new(size);
        for failure in previous.outcomes().skip(previous.length.saturating_sub(ring.size)) {
            ring.set_next_bit(failure);
        }
        ring
    }

    /// Record one outcome and return the new number of failures in the ring
    pub fn set_next_bit(&mut self, failure: bool) -> usize {
        let previous = self.get(self.index);
        if self.length < self.size {
            self.length += 1;
        }
        match (previous, failure) {
            (false, true) => self.cardinality += 1,
            (true, false) => self.cardinality -= 1,
            _ => {}
        }
        self.set(self.index, failure);
        self.index = (self.index + 1) % self.size;
        self.cardinality
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    /// True once every slot has been written at least once
    pub fn is_full(&self) -> bool {
        self.length == self.size
    }

    /// Failure percentage, or [`RATE_UNDEFINED`] until the ring is full
    pub fn failure_rate(&self) -> f32 {
        if !self.is_full() {
            return RATE_UNDEFINED;
        }
        self.cardinality as f32 * 100.0 / self.size as f32
    }

    /// Recorded outcomes from oldest to newest (`true` = failure)
    pub fn outcomes(&self) -> impl Iterator<Item = bool> + '_ {
        let start = (self.index + self.size - self.length) % self.size;
        (0..self.length).map(move |offset| self.get((start + offset) % self.size))
    }

    fn get(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS] & (1u64 << (bit % WORD_BITS)) != 0
    }

    fn set(&mut self, bit: usize, value: bool) {
        let mask = 1u64 << (bit % WORD_BITS);
        if value {
            self.words[bit / WORD_BITS] |= mask;
        } else {
            self.words[bit / WORD_BITS] &= !mask;
        }
    }
}
