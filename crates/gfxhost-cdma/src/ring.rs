use core::sync::atomic::{AtomicU32, Ordering};

use crate::{CdmaError, Result};

/// Word storage of a command ring, shared with whatever consumes it.
///
/// Positions are free-running `u32` word counters; the slot for a position is
/// `pos % capacity`. Capacity is a power of two so the mapping stays continuous when a
/// position wraps past `u32::MAX`.
#[derive(Debug)]
pub struct RingMemory {
    words: Box<[AtomicU32]>,
    mask: u32,
}

impl RingMemory {
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(CdmaError::InvalidCapacity(capacity));
        }
        let words = (0..capacity).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        Ok(Self {
            words: words.into_boxed_slice(),
            mask: capacity - 1,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    #[inline]
    fn slot(&self, pos: u32) -> &AtomicU32 {
        &self.words[(pos & self.mask) as usize]
    }

    /// Reads the word at `pos`. Acquire pairs with the producer's release publish of `put`.
    pub fn read(&self, pos: u32) -> u32 {
        self.slot(pos).load(Ordering::Acquire)
    }

    pub(crate) fn write(&self, pos: u32, word: u32) {
        self.slot(pos).store(word, Ordering::Release);
    }

    /// Copies `len` words starting at `start`.
    pub fn snapshot(&self, start: u32, len: u32) -> Vec<u32> {
        (0..len).map(|i| self.read(start.wrapping_add(i))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert_eq!(RingMemory::new(0).unwrap_err(), CdmaError::InvalidCapacity(0));
        assert_eq!(RingMemory::new(12).unwrap_err(), CdmaError::InvalidCapacity(12));
        assert_eq!(RingMemory::new(16).unwrap().capacity(), 16);
    }

    #[test]
    fn positions_wrap_onto_slots() {
        let ring = RingMemory::new(4).unwrap();
        ring.write(u32::MAX, 0xaa);
        ring.write(0, 0xbb);
        assert_eq!(ring.read(3), 0xaa);
        assert_eq!(ring.snapshot(u32::MAX, 2), vec![0xaa, 0xbb]);
    }
}
