//! Partition of the reserved heap range.
//!
//! ```text
//! heap_base
//! | mid space | pad | large space | pad | small space | .. | mirror of the heap | preallocated pages |
//! ```
//!
//! Mid space comes first so that mid blocks are aligned to their 16-page granule relative to the heap
//! base, and small space comes last so that "is this address in small space" is a single comparison.
//! The pads are one mid block each, so a mid block number can never alias a large or small page.

use crate::util::constants::*;
use crate::util::conversions::raw_align_up;
use crate::util::options::Options;
use crate::util::Address;
use bytemuck::NoUninit;
use std::fmt;

/// A page number relative to the heap base. Pages in the mirror and preallocated regions are numbered
/// past the end of the heap.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit, Default)]
pub struct PageNum(pub u32);

impl PageNum {
    /// The "no page" sentinel.
    pub const NONE: PageNum = PageNum(u32::MAX);

    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn plus(self, pages: usize) -> PageNum {
        PageNum(self.0 + pages as u32)
    }

    pub const fn minus(self, pages: usize) -> PageNum {
        PageNum(self.0 - pages as u32)
    }

    /// Number of pages from `other` up to `self`.
    pub const fn distance_from(self, other: PageNum) -> usize {
        (self.0 - other.0) as usize
    }
}

impl fmt::Debug for PageNum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_none() {
            write!(f, "NoPage")
        } else {
            write!(f, "page#{}", self.0)
        }
    }
}

impl fmt::Display for PageNum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Byte sizes of the side structures, each with a trailing pad so an overrun lands in the pad.
#[derive(Copy, Clone, Debug)]
pub struct StructuresLayout {
    pub marks: (usize, usize),
    pub cardmarks: (usize, usize),
    pub page_info: (usize, usize),
    pub page_audit: (usize, usize),
    pub sideband: (usize, usize),
    pub total_bytes: usize,
}

impl StructuresLayout {
    fn new(heap_pages: usize, words_in_page: usize, sideband_words: usize, pad: usize) -> Self {
        let mut cursor = 0;
        let mut carve = |bytes: usize| {
            let start = cursor;
            cursor = raw_align_up(start + bytes, BYTES_IN_OS_PAGE) + pad;
            (start, bytes)
        };
        // Two mark bits per heap word: live and marked-through.
        let marks = carve(heap_pages * words_in_page * 2 / BITS_IN_BYTE);
        let cardmarks = carve(heap_pages * ((words_in_page * BYTES_IN_WORD) >> LOG_BYTES_IN_CARD));
        let page_info = carve(heap_pages * 64);
        let page_audit = carve(heap_pages * (PAGE_AUDIT_ENTRIES + 2) * BYTES_IN_WORD);
        let sideband = carve(sideband_words * BYTES_IN_WORD);
        StructuresLayout {
            marks,
            cardmarks,
            page_info,
            page_audit,
            sideband,
            total_bytes: cursor,
        }
    }

    fn ranges(&self) -> [(usize, usize); 5] {
        [
            self.marks,
            self.cardmarks,
            self.page_info,
            self.page_audit,
            self.sideband,
        ]
    }
}

#[derive(Clone, Debug)]
pub struct HeapLayout {
    pub log_bytes_in_page: u8,
    pub bytes_in_page: usize,
    pub words_in_page: usize,
    pub heap_base: Address,

    pub mid_space_start: PageNum,
    pub mid_space_end: PageNum,
    pub large_space_start: PageNum,
    pub large_space_end: PageNum,
    pub small_space_start: PageNum,
    pub small_space_end: PageNum,

    /// Pages from a heap page to its mirror.
    pub mirror_offset: usize,
    pub preallocated_start: PageNum,
    pub preallocated_pages: usize,

    /// Objects of at least this many words go to mid space.
    pub mid_min_object_words: usize,
    /// Objects of at least this many words go to large space.
    pub large_min_object_words: usize,
    /// Mid-space objects start on, and are sized in, OS pages.
    pub mid_object_alignment_words: usize,

    pub sideband_words: usize,
    pub structures: StructuresLayout,
}

impl HeapLayout {
    /// Compute the layout for `options`. The heap base is fixed later, once the range is reserved.
    pub fn new(options: &Options, preallocated_pages: usize) -> Self {
        let log_bytes_in_page = options.log_bytes_in_page;
        let bytes_in_page = 1usize << log_bytes_in_page;
        let words_in_page = bytes_in_page >> LOG_BYTES_IN_WORD;
        let pad = PAGES_IN_MID_BLOCK;

        let mid_space_start = PageNum(0);
        let mid_space_end = mid_space_start.plus(options.mid_space_blocks * PAGES_IN_MID_BLOCK);
        let large_space_start = mid_space_end.plus(pad);
        let large_space_end = large_space_start.plus(options.large_space_pages);
        let small_space_start = large_space_end.plus(pad);
        let small_space_end = small_space_start.plus(options.small_space_pages);

        let heap_pages = raw_align_up(small_space_end.index(), PAGES_IN_MID_BLOCK);
        let mirror_offset = heap_pages;
        let preallocated_start = PageNum((heap_pages + mirror_offset) as u32);

        let sideband_words = heap_pages * words_in_page / 100 * options.sideband_percent;

        HeapLayout {
            log_bytes_in_page,
            bytes_in_page,
            words_in_page,
            heap_base: Address::ZERO,
            mid_space_start,
            mid_space_end,
            large_space_start,
            large_space_end,
            small_space_start,
            small_space_end,
            mirror_offset,
            preallocated_start,
            preallocated_pages,
            mid_min_object_words: words_in_page >> LOG_MID_MIN_OBJECT_FRACTION,
            large_min_object_words: words_in_page * LARGE_MIN_PAGES,
            mid_object_alignment_words: BYTES_IN_OS_PAGE >> LOG_BYTES_IN_WORD,
            sideband_words,
            structures: StructuresLayout::new(
                heap_pages,
                words_in_page,
                sideband_words,
                pad * bytes_in_page,
            ),
        }
    }

    /// Pages covered by the page-indexed side tables: everything up to the end of small space.
    pub fn heap_pages(&self) -> usize {
        self.small_space_end.index()
    }

    /// Bytes to reserve: heap, mirror and preallocated pages.
    pub fn reserved_bytes(&self) -> usize {
        (self.preallocated_start.index() + self.preallocated_pages) << self.log_bytes_in_page
    }

    pub fn words_in_mid_block(&self) -> usize {
        self.words_in_page * PAGES_IN_MID_BLOCK
    }

    pub fn bytes_in_mid_block(&self) -> usize {
        self.bytes_in_page * PAGES_IN_MID_BLOCK
    }

    #[inline(always)]
    pub fn page_to_addr(&self, page: PageNum) -> Address {
        debug_assert!(page.is_some());
        self.heap_base + (page.index() << self.log_bytes_in_page)
    }

    #[inline(always)]
    pub fn addr_to_page(&self, addr: Address) -> PageNum {
        debug_assert!(addr >= self.heap_base);
        PageNum(((addr - self.heap_base) >> self.log_bytes_in_page) as u32)
    }

    /// Word offset of `addr` within its page.
    #[inline(always)]
    pub fn page_word_offset(&self, addr: Address) -> usize {
        ((addr - self.heap_base) & (self.bytes_in_page - 1)) >> LOG_BYTES_IN_WORD
    }

    pub fn page_in_heap_range(&self, page: PageNum) -> bool {
        page.is_some() && page < self.small_space_end
    }

    pub fn addr_in_heap_range(&self, addr: Address) -> bool {
        addr >= self.heap_base && self.page_in_heap_range(self.addr_to_page(addr))
    }

    #[inline(always)]
    pub fn page_in_small_space(&self, page: PageNum) -> bool {
        page >= self.small_space_start
    }

    #[inline(always)]
    pub fn page_in_mid_space(&self, page: PageNum) -> bool {
        page < self.mid_space_end
    }

    #[inline(always)]
    pub fn page_in_large_space(&self, page: PageNum) -> bool {
        page >= self.large_space_start && page < self.large_space_end
    }

    /// The base page of the mid block holding `page`.
    #[inline(always)]
    pub fn mid_space_base_page(&self, page: PageNum) -> PageNum {
        debug_assert!(self.page_in_mid_space(page));
        PageNum(page.0 & !(PAGES_IN_MID_BLOCK as u32 - 1))
    }

    pub fn page_is_mid_space_base(&self, page: PageNum) -> bool {
        self.page_in_mid_space(page) && page.0 % PAGES_IN_MID_BLOCK as u32 == 0
    }

    /// The page where the bookkeeping for `page` lives: the block base in mid space.
    pub fn page_to_base_page(&self, page: PageNum) -> PageNum {
        if self.page_in_mid_space(page) {
            self.mid_space_base_page(page)
        } else {
            page
        }
    }

    pub fn mirror_page(&self, page: PageNum) -> PageNum {
        debug_assert!(self.page_in_heap_range(page));
        page.plus(self.mirror_offset)
    }

    pub fn mirror_addr(&self, addr: Address) -> Address {
        addr + (self.mirror_offset << self.log_bytes_in_page)
    }

    pub fn preallocated_page(&self, slot: usize) -> PageNum {
        assert!(
            slot < self.preallocated_pages,
            "Preallocated page slot {} out of range",
            slot
        );
        self.preallocated_start.plus(slot)
    }

    /// Assert the ordering and alignment the rest of the heap relies on.
    pub fn validate(&self) {
        assert!(self.heap_base.is_aligned_to(self.bytes_in_mid_block()));
        assert!(self.mid_space_start.index() % PAGES_IN_MID_BLOCK == 0);
        assert!(self.mid_space_end.index() % PAGES_IN_MID_BLOCK == 0);
        assert!(self.mid_space_start < self.mid_space_end);
        assert!(self.large_space_start.distance_from(self.mid_space_end) >= PAGES_IN_MID_BLOCK);
        assert!(self.large_space_start < self.large_space_end);
        assert!(self.small_space_start.distance_from(self.large_space_end) >= PAGES_IN_MID_BLOCK);
        assert!(self.small_space_start < self.small_space_end);
        // Small space is the top of the heap, so one comparison decides membership.
        assert!(self.small_space_end.index() <= self.mirror_offset);
        assert!(self.mirror_offset % PAGES_IN_MID_BLOCK == 0);
        assert!(self.preallocated_start.index() >= self.mirror_offset * 2);
        assert!(self.mid_min_object_words < self.words_in_page);
        // The largest mid object, aligned, must fit in a mid block.
        assert!(self.large_min_object_words <= self.words_in_mid_block());
        assert!(self.words_in_page % self.mid_object_alignment_words == 0);
        // Objects are placed by word offset within a page in 32-bit fields.
        assert!(self.words_in_mid_block() < (1 << 32));

        let ranges = self.structures.ranges();
        for pair in ranges.windows(2) {
            let (start, bytes) = pair[0];
            assert!(
                start + bytes < pair[1].0,
                "Structure ranges overlap: {:?}",
                pair
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::test_options;

    fn layout() -> HeapLayout {
        let mut layout = HeapLayout::new(&test_options(), 8);
        layout.heap_base = unsafe { Address::from_usize(0x4000_0000_0000) };
        layout
    }

    #[test]
    fn validates() {
        layout().validate();
    }

    #[test]
    fn region_order() {
        let layout = layout();
        assert!(layout.page_in_mid_space(PageNum(0)));
        assert!(!layout.page_in_mid_space(layout.mid_space_end));
        assert!(layout.page_in_large_space(layout.large_space_start));
        assert!(!layout.page_in_small_space(layout.large_space_end));
        assert!(layout.page_in_small_space(layout.small_space_start));
        assert!(!layout.page_in_heap_range(layout.small_space_end));
    }

    #[test]
    fn page_address_round_trip() {
        let layout = layout();
        let page = layout.small_space_start.plus(3);
        let addr = layout.page_to_addr(page);
        assert_eq!(layout.addr_to_page(addr), page);
        assert_eq!(layout.addr_to_page(addr.plus_words(17)), page);
        assert_eq!(layout.page_word_offset(addr.plus_words(17)), 17);
    }

    #[test]
    fn mid_base_page() {
        let layout = layout();
        assert_eq!(layout.mid_space_base_page(PageNum(17)), PageNum(16));
        assert!(layout.page_is_mid_space_base(PageNum(32)));
        assert!(!layout.page_is_mid_space_base(PageNum(33)));
        assert_eq!(layout.page_to_base_page(PageNum(35)), PageNum(32));
        let small = layout.small_space_start.plus(1);
        assert_eq!(layout.page_to_base_page(small), small);
    }

    #[test]
    fn mirror_and_preallocated_regions() {
        let layout = layout();
        let page = layout.small_space_start;
        let mirror = layout.mirror_page(page);
        assert!(!layout.page_in_heap_range(mirror));
        assert_eq!(
            layout.mirror_addr(layout.page_to_addr(page)),
            layout.page_to_addr(mirror)
        );
        assert!(layout.preallocated_page(0) > layout.mirror_page(layout.small_space_end.minus(1)));
    }

    #[test]
    fn size_classes() {
        let layout = layout();
        assert_eq!(layout.mid_min_object_words, layout.words_in_page / 8);
        assert_eq!(layout.large_min_object_words, layout.words_in_page * 8);
        assert_eq!(layout.mid_object_alignment_words, 512);
    }

    #[test]
    #[should_panic]
    fn preallocated_slot_out_of_range() {
        layout().preallocated_page(8);
    }
}
