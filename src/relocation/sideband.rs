//! The sideband arena holding forwarding tables.
//!
//! The arena is one fixed range of words. The new collector carves tables upward from the bottom and
//! the old collector downward from the top, each limited to its maximum share. When the two ends
//! would cross, or a collector has used its share, allocation fails and the collector relocates fewer
//! pages this cycle.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::memory::{mmap_zeroed_noreserve, try_munmap};
use crate::util::Address;
use std::sync::atomic::{AtomicU64, Ordering};

/// Word offsets of the two ends. `new_end <= old_end` always.
struct ArenaEnds {
    new_end: usize,
    old_end: usize,
}

pub struct SidebandArena {
    start: Address,
    words: usize,
    max_words_per_gc: usize,
    padding_percent: usize,
    ends: spin::Mutex<ArenaEnds>,
}

/// Length of a forwarding table for `live_objects` records: the live count plus padding, rounded up
/// to a power of two. Tables whose padded size overflows the next power of two get the one after.
pub fn table_len(live_objects: usize, padding_percent: usize) -> usize {
    assert!(live_objects > 0, "Forwarding table for a page with no live objects");
    let padded = live_objects + live_objects * padding_percent / 100;
    let first_bit = usize::BITS - 1 - live_objects.leading_zeros();
    let pow2 = if live_objects.is_power_of_two() {
        live_objects
    } else {
        1 << (first_bit + 1)
    };
    if padded > pow2 {
        1 << (first_bit + 2)
    } else {
        pow2
    }
}

impl SidebandArena {
    /// An arena of `words` words, of which one collector may use `max_percent`.
    pub fn new(words: usize, max_percent: usize, padding_percent: usize) -> std::io::Result<Self> {
        assert!(words > 0);
        let start = mmap_zeroed_noreserve(words * BYTES_IN_WORD)?;
        let max_words_per_gc = words * max_percent / 100;
        debug!(
            "Sideband arena of {} words at {}, {} per collector",
            words, start, max_words_per_gc
        );
        Ok(SidebandArena {
            start,
            words,
            max_words_per_gc,
            padding_percent,
            ends: spin::Mutex::new(ArenaEnds {
                new_end: 0,
                old_end: words,
            }),
        })
    }

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn max_words_per_gc(&self) -> usize {
        self.max_words_per_gc
    }

    pub fn table_len(&self, live_objects: usize) -> usize {
        table_len(live_objects, self.padding_percent)
    }

    /// A zeroed table for `live_objects` records from the bottom. Returns its address and length.
    pub fn new_gc_allocate(&self, live_objects: usize) -> Option<(Address, usize)> {
        let len = self.table_len(live_objects);
        let offset = {
            let mut ends = self.ends.lock();
            let new_end = ends.new_end + len;
            if new_end > ends.old_end || new_end > self.max_words_per_gc {
                return None;
            }
            let offset = ends.new_end;
            ends.new_end = new_end;
            offset
        };
        Some((self.zeroed(offset, len), len))
    }

    /// A zeroed table for `live_objects` records from the top. Returns its address and length.
    pub fn old_gc_allocate(&self, live_objects: usize) -> Option<(Address, usize)> {
        let len = self.table_len(live_objects);
        let offset = {
            let mut ends = self.ends.lock();
            if len > ends.old_end {
                return None;
            }
            let old_end = ends.old_end - len;
            if old_end < ends.new_end || old_end < self.words - self.max_words_per_gc {
                return None;
            }
            ends.old_end = old_end;
            old_end
        };
        Some((self.zeroed(offset, len), len))
    }

    fn zeroed(&self, offset: usize, len: usize) -> Address {
        let table = self.start.plus_words(offset);
        for i in 0..len {
            // The range is ours alone until the table is published through a page's info.
            unsafe { &*table.plus_words(i).to_ptr::<AtomicU64>() }.store(0, Ordering::Relaxed);
        }
        table
    }

    /// Free every table of the new collector.
    pub fn new_gc_reset(&self) {
        self.ends.lock().new_end = 0;
    }

    /// Free every table of the old collector.
    pub fn old_gc_reset(&self) {
        self.ends.lock().old_end = self.words;
    }

    pub fn new_gc_words_used(&self) -> usize {
        self.ends.lock().new_end
    }

    pub fn old_gc_words_used(&self) -> usize {
        self.words - self.ends.lock().old_end
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.start.plus_words(self.words)
    }
}

impl Drop for SidebandArena {
    fn drop(&mut self) {
        if let Err(e) = try_munmap(self.start, self.words * BYTES_IN_WORD) {
            warn!("Unable to unmap the sideband arena: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lengths() {
        assert_eq!(table_len(1, 25), 1);
        assert_eq!(table_len(3, 25), 4);
        // 4 live objects pad to 5, past 4.
        assert_eq!(table_len(4, 25), 16);
        assert_eq!(table_len(4, 0), 4);
        // 7 pad to 8, which still fits.
        assert_eq!(table_len(7, 25), 8);
        assert_eq!(table_len(13, 25), 16);
        assert_eq!(table_len(14, 25), 32);
        for live in 1..200 {
            let len = table_len(live, 25);
            assert!(len.is_power_of_two());
            assert!(len >= live);
        }
    }

    #[test]
    fn ends_never_cross() {
        let arena = SidebandArena::new(64, 100, 0).unwrap();
        let (low, len) = arena.new_gc_allocate(32).unwrap();
        assert_eq!(len, 32);
        let (high, _) = arena.old_gc_allocate(16).unwrap();
        assert!(high >= low.plus_words(32));
        assert!(arena.old_gc_allocate(32).is_none());
        assert!(arena.new_gc_allocate(32).is_none());
        assert!(arena.new_gc_allocate(16).is_some());
        assert!(arena.old_gc_allocate(1).is_none());
        assert_eq!(arena.new_gc_words_used() + arena.old_gc_words_used(), 64);
    }

    #[test]
    fn collectors_limited_to_their_share() {
        let arena = SidebandArena::new(64, 50, 0).unwrap();
        assert!(arena.new_gc_allocate(32).is_some());
        assert!(arena.new_gc_allocate(1).is_none());
        assert!(arena.old_gc_allocate(32).is_some());
        assert!(arena.old_gc_allocate(1).is_none());
    }

    #[test]
    fn reset_frees_one_side() {
        let arena = SidebandArena::new(64, 100, 0).unwrap();
        let (table, _) = arena.new_gc_allocate(8).unwrap();
        unsafe { table.store(0xdead_u64) };
        arena.old_gc_allocate(8).unwrap();
        arena.new_gc_reset();
        assert_eq!(arena.new_gc_words_used(), 0);
        assert_eq!(arena.old_gc_words_used(), 8);
        let (again, _) = arena.new_gc_allocate(8).unwrap();
        assert_eq!(again, table);
        assert_eq!(unsafe { again.load::<u64>() }, 0);
        assert!(arena.contains(again));
    }
}
