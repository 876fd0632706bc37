//! Card marks recording old-to-new pointer stores.
//!
//! One byte per 512-byte card, plus a per-page count of marked cards so the new collector can skip
//! clean pages without reading their cards.

use crate::util::constants::LOG_BYTES_IN_CARD;
use crate::util::heap::layout::{HeapLayout, PageNum};
use crate::util::metadata::SideTable;
use crate::util::Address;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

const CLEAN: u8 = 0;
const DIRTY: u8 = 1;

pub struct CardTable {
    heap_base: Address,
    log_bytes_in_page: u8,
    cards_in_page: usize,
    cards: SideTable<AtomicU8>,
    page_counts: SideTable<AtomicU32>,
}

impl CardTable {
    pub fn new(layout: &HeapLayout) -> std::io::Result<Self> {
        let cards_in_page = layout.bytes_in_page >> LOG_BYTES_IN_CARD;
        Ok(CardTable {
            heap_base: layout.heap_base,
            log_bytes_in_page: layout.log_bytes_in_page,
            cards_in_page,
            cards: SideTable::new(layout.heap_pages() * cards_in_page)?,
            page_counts: SideTable::new(layout.heap_pages())?,
        })
    }

    #[inline(always)]
    fn card_index(&self, addr: Address) -> usize {
        (addr - self.heap_base) >> LOG_BYTES_IN_CARD
    }

    fn card_page(&self, card: usize) -> usize {
        card / self.cards_in_page
    }

    fn card_start(&self, card: usize) -> Address {
        self.heap_base + (card << LOG_BYTES_IN_CARD)
    }

    fn mark_card(&self, card: usize) {
        // Most stores hit an already dirty card; skip the write then.
        if self.cards[card].load(Ordering::Relaxed) == DIRTY {
            return;
        }
        if self.cards[card].swap(DIRTY, Ordering::AcqRel) == CLEAN {
            self.page_counts[self.card_page(card)].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Record a reference store into `field`.
    pub fn card_mark(&self, field: Address) {
        self.mark_card(self.card_index(field));
    }

    pub fn is_card_marked(&self, addr: Address) -> bool {
        self.cards[self.card_index(addr)].load(Ordering::Acquire) == DIRTY
    }

    /// Mark every card overlapping `[start, end)`. Used for objects promoted into old space, whose
    /// reference fields may still point into new space.
    pub fn card_mark_across_region(&self, start: Address, end: Address) {
        if end <= start {
            return;
        }
        let first = self.card_index(start);
        let last = self.card_index(end - 1usize);
        for card in first..=last {
            self.mark_card(card);
        }
    }

    pub fn page_card_count(&self, page: PageNum) -> u32 {
        self.page_counts[page.index()].load(Ordering::Acquire)
    }

    pub fn page_has_card_marks(&self, page: PageNum) -> bool {
        self.page_card_count(page) != 0
    }

    pub fn clear_card_marks(&self, page: PageNum, pages: usize) {
        let first = page.index() * self.cards_in_page;
        for card in first..first + pages * self.cards_in_page {
            self.cards[card].store(CLEAN, Ordering::Relaxed);
        }
        for p in page.index()..page.index() + pages {
            self.page_counts[p].store(0, Ordering::Release);
        }
    }

    /// Visit the dirty cards of `pages` pages from `page` as runs of `[start, end)`. Each run is
    /// cleaned before `f` sees it; when `f` returns true the run still holds old-to-new references
    /// and its cards are marked again.
    pub fn scan_cardmarks<F>(&self, page: PageNum, pages: usize, mut f: F) -> usize
    where
        F: FnMut(Address, Address) -> bool,
    {
        let mut runs = 0;
        for p in page.index()..page.index() + pages {
            if self.page_counts[p].load(Ordering::Acquire) == 0 {
                continue;
            }
            let first = p * self.cards_in_page;
            let end = first + self.cards_in_page;
            let mut card = first;
            while card < end {
                if self.cards[card].load(Ordering::Acquire) == CLEAN {
                    card += 1;
                    continue;
                }
                let run_start = card;
                while card < end && self.cards[card].load(Ordering::Acquire) == DIRTY {
                    self.cards[card].store(CLEAN, Ordering::Relaxed);
                    self.page_counts[p].fetch_sub(1, Ordering::AcqRel);
                    card += 1;
                }
                runs += 1;
                if f(self.card_start(run_start), self.card_start(card)) {
                    for c in run_start..card {
                        self.mark_card(c);
                    }
                }
            }
        }
        runs
    }

    /// Addresses of the dirty cards of a page, in order.
    pub fn dirty_cards(&self, page: PageNum) -> Vec<Address> {
        let first = page.index() * self.cards_in_page;
        (first..first + self.cards_in_page)
            .filter(|&card| self.cards[card].load(Ordering::Acquire) == DIRTY)
            .map(|card| self.card_start(card))
            .collect()
    }

    pub fn page_of(&self, addr: Address) -> PageNum {
        PageNum(((addr - self.heap_base) >> self.log_bytes_in_page) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::test_options;

    fn cards() -> (HeapLayout, CardTable) {
        let mut layout = HeapLayout::new(&test_options(), 4);
        layout.heap_base = unsafe { Address::from_usize(0x20_0000_0000) };
        let cards = CardTable::new(&layout).unwrap();
        (layout, cards)
    }

    #[test]
    fn mark_and_count() {
        let (layout, cards) = cards();
        let page = layout.small_space_start;
        let field = layout.page_to_addr(page) + 1000usize;
        assert!(!cards.is_card_marked(field));
        cards.card_mark(field);
        cards.card_mark(field + 8usize);
        assert!(cards.is_card_marked(field));
        assert_eq!(cards.page_card_count(page), 1);
        assert_eq!(cards.page_of(field), page);
        assert_eq!(cards.dirty_cards(page), vec![layout.page_to_addr(page) + 512usize]);
    }

    #[test]
    fn mark_region() {
        let (layout, cards) = cards();
        let page = layout.small_space_start.plus(1);
        let start = layout.page_to_addr(page) + 500usize;
        cards.card_mark_across_region(start, start + 1030usize);
        // Bytes 500..1530 touch cards 0, 1 and 2.
        assert_eq!(cards.page_card_count(page), 3);
        cards.clear_card_marks(page, 1);
        assert!(!cards.page_has_card_marks(page));
        assert!(cards.dirty_cards(page).is_empty());
    }

    #[test]
    fn scan_cleans_and_remarks() {
        let (layout, cards) = cards();
        let page = layout.small_space_start.plus(2);
        let base = layout.page_to_addr(page);
        cards.card_mark(base);
        cards.card_mark(base + 512usize);
        cards.card_mark(base + 4096usize);
        let mut seen = vec![];
        let runs = cards.scan_cardmarks(page, 1, |start, end| {
            seen.push((start, end));
            start == base
        });
        assert_eq!(runs, 2);
        assert_eq!(seen, vec![(base, base + 1024usize), (base + 4096usize, base + 4608usize)]);
        // Only the first run was kept.
        assert_eq!(cards.page_card_count(page), 2);
        assert!(cards.is_card_marked(base));
        assert!(!cards.is_card_marked(base + 4096usize));
    }
}
