//! Request ID allocation.
//!
//! A 256-bit occupancy bitmap, one bit per request ID. IDs are handed out
//! lowest-free-first so a lightly loaded connection keeps reusing small IDs.

use crate::protocol::MAX_REQUEST_IDS;

const WORDS: usize = MAX_REQUEST_IDS / 64;

/// Hands out distinct request IDs in `0..=255`.
#[derive(Debug, Clone, Default)]
pub struct RequestIdAllocator {
    /// Bit set means the ID is in use.
    words: [u64; WORDS],
}

#[inline]
fn locate(id: u8) -> (usize, u64) {
    let id = id as usize;
    (id / 64, 1u64 << (id % 64))
}

impl RequestIdAllocator {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Mark the lowest free ID as allocated, or `None` if all are in use.
    pub fn try_acquire(&mut self) -> Option<u8> {
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros();
                *word |= 1u64 << bit;
                return Some((index * 64 + bit as usize) as u8);
            }
        }
        None
    }

    /// Mark the lowest free ID as allocated.
    ///
    /// # Panics
    ///
    /// Panics if every ID is in use. Callers bound their concurrency by the
    /// request-processor pool, so exhaustion here is a bookkeeping bug.
    pub fn acquire(&mut self) -> u8 {
        match self.try_acquire() {
            Some(id) => id,
            None => panic!("all {} request ids are in flight", MAX_REQUEST_IDS),
        }
    }

    /// Return an ID to the free set.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently allocated.
    pub fn release(&mut self, id: u8) {
        assert!(
            self.is_allocated(id),
            "released request id {} that was not allocated",
            id
        );
        let (word, mask) = locate(id);
        self.words[word] &= !mask;
    }

    #[inline]
    pub fn is_allocated(&self, id: u8) -> bool {
        let (word, mask) = locate(id);
        self.words[word] & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_acquire_lowest_first() {
        let mut ids = RequestIdAllocator::new();
        assert_eq!(ids.acquire(), 0);
        assert_eq!(ids.acquire(), 1);
        assert_eq!(ids.acquire(), 2);

        ids.release(1);
        assert_eq!(ids.acquire(), 1);
        assert_eq!(ids.acquire(), 3);
    }

    #[test]
    fn test_all_ids_distinct_until_full() {
        let mut ids = RequestIdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..MAX_REQUEST_IDS {
            assert!(seen.insert(ids.acquire()));
        }
        assert_eq!(seen.len(), 256);
        assert_eq!(ids.try_acquire(), None);
    }

    #[test]
    fn test_release_crosses_word_boundary() {
        let mut ids = RequestIdAllocator::new();
        for _ in 0..MAX_REQUEST_IDS {
            ids.acquire();
        }
        ids.release(200);
        ids.release(64);
        assert!(!ids.is_allocated(64));
        assert!(ids.is_allocated(65));
        assert_eq!(ids.acquire(), 64);
        assert_eq!(ids.acquire(), 200);
        assert_eq!(ids.try_acquire(), None);
    }

    #[test]
    #[should_panic(expected = "was not allocated")]
    fn test_release_unallocated_panics() {
        let mut ids = RequestIdAllocator::new();
        ids.release(5);
    }

    #[test]
    #[should_panic(expected = "was not allocated")]
    fn test_double_release_panics() {
        let mut ids = RequestIdAllocator::new();
        let id = ids.acquire();
        ids.release(id);
        ids.release(id);
    }

    #[test]
    #[should_panic(expected = "in flight")]
    fn test_acquire_when_full_panics() {
        let mut ids = RequestIdAllocator::new();
        for _ in 0..=MAX_REQUEST_IDS {
            ids.acquire();
        }
    }
}
