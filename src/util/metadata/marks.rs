//! Mark bitmaps: one live bit and one marked-through bit per heap word.
//!
//! Marking itself lives outside this crate; it sets live bits through [`Marks::mark_live_if_not`] and
//! counts the object on its page. The heap reads the bits to find live objects when relocating, and
//! clears them between cycles.

use crate::util::constants::LOG_BYTES_IN_WORD;
use crate::util::heap::layout::{HeapLayout, PageNum};
use crate::util::metadata::SideTable;
use crate::util::Address;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_ENTRY: usize = 64;

pub struct Marks {
    heap_base: Address,
    words_in_page: usize,
    live: SideTable<AtomicU64>,
    marked_through: SideTable<AtomicU64>,
}

impl Marks {
    pub fn new(layout: &HeapLayout) -> std::io::Result<Self> {
        let words = layout.heap_pages() * layout.words_in_page;
        let entries = words.div_ceil(BITS_PER_ENTRY);
        Ok(Marks {
            heap_base: layout.heap_base,
            words_in_page: layout.words_in_page,
            live: SideTable::new(entries)?,
            marked_through: SideTable::new(entries)?,
        })
    }

    #[inline(always)]
    fn bit_index(&self, addr: Address) -> usize {
        addr.words_from(self.heap_base)
    }

    fn page_bits(&self, page: PageNum, pages: usize) -> std::ops::Range<usize> {
        let start = page.index() * self.words_in_page;
        start..start + pages * self.words_in_page
    }

    fn set_bit(table: &SideTable<AtomicU64>, bit: usize) -> bool {
        let mask = 1u64 << (bit % BITS_PER_ENTRY);
        let old = table[bit / BITS_PER_ENTRY].fetch_or(mask, Ordering::AcqRel);
        old & mask == 0
    }

    fn get_bit(table: &SideTable<AtomicU64>, bit: usize) -> bool {
        let mask = 1u64 << (bit % BITS_PER_ENTRY);
        table[bit / BITS_PER_ENTRY].load(Ordering::Acquire) & mask != 0
    }

    /// Clear a bit range. Page ranges are always whole entries.
    fn clear_bits(table: &SideTable<AtomicU64>, bits: std::ops::Range<usize>) {
        debug_assert!(bits.start % BITS_PER_ENTRY == 0 && bits.end % BITS_PER_ENTRY == 0);
        for entry in bits.start / BITS_PER_ENTRY..bits.end / BITS_PER_ENTRY {
            table[entry].store(0, Ordering::Relaxed);
        }
    }

    fn any_bit(table: &SideTable<AtomicU64>, bits: std::ops::Range<usize>) -> bool {
        (bits.start / BITS_PER_ENTRY..bits.end / BITS_PER_ENTRY)
            .any(|entry| table[entry].load(Ordering::Relaxed) != 0)
    }

    /// Set the live bit of the object at `addr`. Returns true if this call set it.
    pub fn mark_live_if_not(&self, addr: Address) -> bool {
        Self::set_bit(&self.live, self.bit_index(addr))
    }

    pub fn is_marked_live(&self, addr: Address) -> bool {
        Self::get_bit(&self.live, self.bit_index(addr))
    }

    pub fn mark_through_if_not(&self, addr: Address) -> bool {
        Self::set_bit(&self.marked_through, self.bit_index(addr))
    }

    pub fn is_marked_through(&self, addr: Address) -> bool {
        Self::get_bit(&self.marked_through, self.bit_index(addr))
    }

    pub fn clear_live_marks(&self, page: PageNum, pages: usize) {
        Self::clear_bits(&self.live, self.page_bits(page, pages));
    }

    pub fn clear_verify_marks(&self, page: PageNum, pages: usize) {
        Self::clear_bits(&self.marked_through, self.page_bits(page, pages));
    }

    /// Clear every mark of the pages. Done when a page is handed out for allocation.
    pub fn clear_all_metadata(&self, page: PageNum, pages: usize) {
        self.clear_live_marks(page, pages);
        self.clear_verify_marks(page, pages);
    }

    pub fn has_live_marks(&self, page: PageNum, pages: usize) -> bool {
        Self::any_bit(&self.live, self.page_bits(page, pages))
    }

    /// Marks of a dead cycle must be cleared before the next marking starts.
    pub fn verify_no_live_marks(&self, page: PageNum, pages: usize) {
        assert!(
            !self.has_live_marks(page, pages),
            "Live marks left on {} (+{} pages)",
            page,
            pages
        );
    }

    /// Addresses of the objects marked live in `[start, end)`, in address order.
    pub fn live_objects(&self, start: Address, end: Address) -> Vec<Address> {
        let mut result = vec![];
        self.for_each_live_object(start, end, |addr| result.push(addr));
        result
    }

    pub fn for_each_live_object<F: FnMut(Address)>(&self, start: Address, end: Address, mut f: F) {
        let first = self.bit_index(start);
        let last = self.bit_index(end);
        let mut bit = first;
        while bit < last {
            let entry = bit / BITS_PER_ENTRY;
            let shift = bit % BITS_PER_ENTRY;
            let word = self.live[entry].load(Ordering::Acquire) >> shift;
            if word == 0 {
                bit = (entry + 1) * BITS_PER_ENTRY;
                continue;
            }
            bit += word.trailing_zeros() as usize;
            if bit < last {
                f(self.heap_base + (bit << LOG_BYTES_IN_WORD));
            }
            bit += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::test_options;

    fn marks() -> (HeapLayout, Marks) {
        let mut layout = HeapLayout::new(&test_options(), 4);
        layout.heap_base = unsafe { Address::from_usize(0x10_0000_0000) };
        let marks = Marks::new(&layout).unwrap();
        (layout, marks)
    }

    #[test]
    fn mark_once() {
        let (layout, marks) = marks();
        let addr = layout.page_to_addr(layout.small_space_start).plus_words(5);
        assert!(!marks.is_marked_live(addr));
        assert!(marks.mark_live_if_not(addr));
        assert!(!marks.mark_live_if_not(addr));
        assert!(marks.is_marked_live(addr));
        assert!(!marks.is_marked_live(addr.plus_words(1)));
    }

    #[test]
    fn iterate_live_objects() {
        let (layout, marks) = marks();
        let page = layout.small_space_start.plus(2);
        let base = layout.page_to_addr(page);
        let objects = [base, base.plus_words(63), base.plus_words(64), base.plus_words(1000)];
        for obj in objects {
            marks.mark_live_if_not(obj);
        }
        // A mark on the next page is not reported.
        marks.mark_live_if_not(layout.page_to_addr(page.plus(1)));
        let end = layout.page_to_addr(page.plus(1));
        assert_eq!(marks.live_objects(base, end), objects.to_vec());
        assert_eq!(marks.live_objects(base.plus_words(64), end), objects[2..].to_vec());
    }

    #[test]
    fn clear_per_page() {
        let (layout, marks) = marks();
        let page = layout.small_space_start;
        marks.mark_live_if_not(layout.page_to_addr(page).plus_words(7));
        marks.mark_live_if_not(layout.page_to_addr(page.plus(1)).plus_words(7));
        marks.mark_through_if_not(layout.page_to_addr(page).plus_words(7));
        marks.clear_live_marks(page, 1);
        marks.verify_no_live_marks(page, 1);
        assert!(marks.has_live_marks(page.plus(1), 1));
        assert!(marks.is_marked_through(layout.page_to_addr(page).plus_words(7)));
        marks.clear_all_metadata(page, 2);
        assert!(!marks.has_live_marks(page, 2));
        assert!(!marks.is_marked_through(layout.page_to_addr(page).plus_words(7)));
    }

    #[test]
    #[should_panic]
    fn verify_catches_stale_marks() {
        let (layout, marks) = marks();
        let page = layout.small_space_start;
        marks.mark_live_if_not(layout.page_to_addr(page));
        marks.verify_no_live_marks(page, 1);
    }
}
