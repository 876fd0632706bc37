//! Per-cycle classification of pages: which to relocate, which to skip, how much garbage each holds.
//!
//! A [`PopulationArray`] is filled by one thread while the spaces are scanned, sorted, and then
//! consumed in parallel by workers claiming chunks of it through an atomic cursor.

use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::Gen;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One page (or mid block, or large block) and its word counts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PagePop {
    pub page: PageNum,
    pub live_words: u32,
    pub dead_words: u32,
    pub frag_words: u32,
    /// Live words per allocated page. Equal to `live_words` in small space.
    pub occupancy: u32,
    /// Page time for candidate arrays, fragment stripe for others.
    pub time_stripe: i64,
}

#[derive(Default)]
pub struct PopulationArray {
    array: Vec<PagePop>,
    cursor: AtomicUsize,
    max_cursor: usize,

    live_words_total: u64,
    dead_words_total: u64,
    frag_words_total: u64,
    block_pages_total: u64,
    live_words_selected: u64,
    dead_words_selected: u64,
    frag_words_selected: u64,

    sideband_limited_words: u64,
    skipped_pages: u64,
    released_empty_pages: u64,
    no_relocate_pages: u64,
    defrag_pages_selected: u64,
}

impl PopulationArray {
    pub fn with_capacity(capacity: usize) -> Self {
        PopulationArray {
            array: Vec::with_capacity(capacity),
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        self.array.clear();
        *self.cursor.get_mut() = 0;
        self.max_cursor = 0;
        self.live_words_total = 0;
        self.dead_words_total = 0;
        self.frag_words_total = 0;
        self.block_pages_total = 0;
        self.live_words_selected = 0;
        self.dead_words_selected = 0;
        self.frag_words_selected = 0;
        self.sideband_limited_words = 0;
        self.skipped_pages = 0;
        self.released_empty_pages = 0;
        self.no_relocate_pages = 0;
        self.defrag_pages_selected = 0;
    }

    pub fn add_no_relocate_pages(&mut self, pages: u32) {
        debug_assert!(pages > 0);
        self.no_relocate_pages += pages as u64;
    }

    pub fn add_empty_page(&mut self, pages: u32) {
        debug_assert!(pages > 0);
        self.released_empty_pages += pages as u64;
    }

    pub fn add_skipped_page(
        &mut self,
        page: PageNum,
        pages: u32,
        live_words: u32,
        frag_words: u32,
        dead_words: u32,
    ) {
        self.array.push(PagePop {
            page,
            live_words,
            dead_words,
            frag_words,
            occupancy: 0,
            time_stripe: 0,
        });
        self.skipped_pages += pages as u64;
        self.live_words_total += live_words as u64;
        self.frag_words_total += frag_words as u64;
        self.dead_words_total += dead_words as u64;
    }

    pub fn add_page(
        &mut self,
        page: PageNum,
        time: i64,
        occupancy: u32,
        live_words: u32,
        frag_words: u32,
        dead_words: u32,
    ) {
        self.add_page_pop(PagePop {
            page,
            live_words,
            dead_words,
            frag_words,
            occupancy,
            time_stripe: time,
        });
    }

    pub fn add_page_pop(&mut self, pop: PagePop) {
        self.array.push(pop);
        self.live_words_total += pop.live_words as u64;
        self.frag_words_total += pop.frag_words as u64;
        self.dead_words_total += pop.dead_words as u64;
        self.live_words_selected += pop.live_words as u64;
        self.frag_words_selected += pop.frag_words as u64;
        self.dead_words_selected += pop.dead_words as u64;
    }

    /// A large-space block. Its occupancy is its live words.
    pub fn add_block(&mut self, block: PageNum, time: i64, pages: u64, live_words: u32, frag_words: u32) {
        self.array.push(PagePop {
            page: block,
            live_words,
            dead_words: 0,
            frag_words,
            occupancy: live_words,
            time_stripe: time,
        });
        self.live_words_total += live_words as u64;
        self.frag_words_total += frag_words as u64;
        self.block_pages_total += pages;
        self.live_words_selected += live_words as u64;
        self.frag_words_selected += frag_words as u64;
    }

    pub fn add_empty_block(&mut self, pages: u64) {
        self.released_empty_pages += pages;
    }

    /// Remove the candidates matching `f`, taking their words out of the totals. The removed
    /// entries are returned in their original order, ready for [`Self::add_page_pop`] elsewhere.
    pub fn split_off<F: Fn(&PagePop) -> bool>(&mut self, f: F) -> Vec<PagePop> {
        let (taken, kept): (Vec<PagePop>, Vec<PagePop>) = self.array.drain(..).partition(|pop| f(pop));
        self.array = kept;
        for pop in &taken {
            self.live_words_total -= pop.live_words as u64;
            self.frag_words_total -= pop.frag_words as u64;
            self.dead_words_total -= pop.dead_words as u64;
            self.live_words_selected -= pop.live_words as u64;
            self.frag_words_selected -= pop.frag_words as u64;
            self.dead_words_selected -= pop.dead_words as u64;
        }
        taken
    }

    pub fn increment_defrag_pages_selected(&mut self) {
        self.defrag_pages_selected += 1;
    }

    /// Lowest occupancy first.
    pub fn sort_by_new_gc_relocation_priority(&mut self) {
        self.array.sort_by_key(|pop| pop.occupancy);
    }

    /// Lowest occupancy first, then the most fragmented first.
    pub fn sort_by_old_gc_relocation_priority(&mut self) {
        self.array.sort_by(|a, b| match a.occupancy.cmp(&b.occupancy) {
            CmpOrdering::Equal => b.frag_words.cmp(&a.frag_words),
            other => other,
        });
    }

    /// Youngest first.
    pub fn sort_by_largest_time_first(&mut self) {
        self.array.sort_by(|a, b| b.time_stripe.cmp(&a.time_stripe));
    }

    /// Stop relocating at `max_cursor`; the garbage past it stays until a later cycle.
    pub fn sideband_limit_reclaim_cutoff(&mut self, max_cursor: usize) {
        assert!(max_cursor < self.max_cursor);
        assert_eq!(self.sideband_limited_words, 0);
        self.sideband_limited_words = self.array[max_cursor..self.max_cursor]
            .iter()
            .map(|pop| pop.dead_words as u64)
            .sum();
        self.max_cursor = max_cursor;
    }

    /// Stop relocating at the first page at least `occupancy` full. The array is sorted by occupancy.
    pub fn occupancy_cutoff(&mut self, occupancy: u32) {
        self.max_cursor = self.array[..self.max_cursor].partition_point(|pop| pop.occupancy < occupancy);
    }

    pub fn reset_cursor(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    pub fn reset_max_cursor(&mut self) {
        self.reset_cursor();
        self.max_cursor = self.array.len();
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn max_cursor(&self) -> usize {
        self.max_cursor
    }

    pub fn cursor_at_end(&self) -> bool {
        self.cursor() >= self.max_cursor
    }

    /// Claim up to `work_unit` entries. Returns the claimed index range, or `None` once all are claimed.
    pub fn atomic_claim_array_chunk(&self, work_unit: usize) -> Option<std::ops::Range<usize>> {
        let max_cursor = self.max_cursor;
        let mut cursor = self.cursor();
        loop {
            if cursor >= max_cursor {
                return None;
            }
            let new_cursor = (cursor + work_unit).min(max_cursor);
            match self.cursor.compare_exchange_weak(
                cursor,
                new_cursor,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(cursor..new_cursor),
                Err(actual) => cursor = actual,
            }
        }
    }

    /// Claim chunks until the array is exhausted, calling `f` on every claimed entry.
    pub fn for_each_claimed<F: FnMut(usize, &PagePop)>(&self, work_unit: usize, mut f: F) {
        while let Some(range) = self.atomic_claim_array_chunk(work_unit) {
            for index in range {
                f(index, &self.array[index]);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.skipped_pages == 0
    }

    pub fn page(&self, index: usize) -> PageNum {
        self.array[index].page
    }

    pub fn occupancy(&self, index: usize) -> u32 {
        self.array[index].occupancy
    }

    pub fn time(&self, index: usize) -> i64 {
        self.array[index].time_stripe
    }

    /// The selected entries: everything up to the max cursor.
    pub fn selected(&self) -> &[PagePop] {
        &self.array[..self.max_cursor]
    }

    pub fn sideband_limited_words(&self) -> u64 {
        self.sideband_limited_words
    }

    pub fn released_pages(&self) -> u64 {
        self.released_empty_pages
    }

    pub fn no_relocate_pages(&self) -> u64 {
        self.no_relocate_pages
    }

    pub fn skipped_pages(&self) -> u64 {
        self.skipped_pages
    }

    pub fn defrag_pages_selected(&self) -> u64 {
        self.defrag_pages_selected
    }

    pub fn live_words_found(&self) -> u64 {
        self.live_words_total
    }

    pub fn live_words_selected(&self) -> u64 {
        self.live_words_selected
    }

    pub fn dead_words_found(&self) -> u64 {
        self.dead_words_total
    }

    pub fn dead_words_selected(&self) -> u64 {
        self.dead_words_selected
    }

    pub fn frag_words_found(&self) -> u64 {
        self.frag_words_total
    }

    pub fn frag_words_selected(&self) -> u64 {
        self.frag_words_selected
    }

    pub fn block_pages_total(&self) -> u64 {
        self.block_pages_total
    }
}

/// A mid-space page that received remapped objects, and the generation they came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RemapTarget {
    pub page: PageNum,
    pub stripe: i64,
    pub source_gen: Gen,
}

/// Remap targets, appended under a lock by the workers remapping mid pages.
#[derive(Default)]
pub struct RemapTargetArray {
    targets: std::sync::Mutex<Vec<RemapTarget>>,
}

impl RemapTargetArray {
    pub fn reset(&self) {
        self.targets.lock().unwrap().clear();
    }

    pub fn add_page(&self, page: PageNum, stripe: i64, source_gen: Gen) {
        self.targets.lock().unwrap().push(RemapTarget {
            page,
            stripe,
            source_gen,
        });
    }

    pub fn len(&self) -> usize {
        self.targets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<RemapTarget> {
        self.targets.lock().unwrap().clone()
    }
}

/// Population arrays of one collector. The new collector uses the `*_1` arrays for pages staying in
/// new space and `*_2` for pages being promoted; the old collector uses them for old and perm pages.
#[derive(Default)]
pub struct Population {
    pub small_space_1: PopulationArray,
    pub small_space_2: PopulationArray,
    pub mid_space_1: PopulationArray,
    pub mid_space_2: PopulationArray,
    pub large_space_1: PopulationArray,
    pub large_space_2: PopulationArray,
    pub small_space_skipped_pages: PopulationArray,
    pub mid_space_skipped_pages: PopulationArray,
    pub large_space_skipped_pages: PopulationArray,
    pub mid_space_targets: RemapTargetArray,

    source_pages_to_new_gen: AtomicUsize,
    source_pages_to_old_gen: AtomicUsize,
}

impl Population {
    pub fn new(small_pages: usize, mid_blocks: usize, large_pages: usize) -> Self {
        Population {
            small_space_1: PopulationArray::with_capacity(small_pages),
            small_space_2: PopulationArray::with_capacity(small_pages),
            mid_space_1: PopulationArray::with_capacity(mid_blocks),
            mid_space_2: PopulationArray::with_capacity(mid_blocks),
            large_space_1: PopulationArray::with_capacity(large_pages),
            large_space_2: PopulationArray::with_capacity(large_pages),
            small_space_skipped_pages: PopulationArray::with_capacity(small_pages),
            mid_space_skipped_pages: PopulationArray::with_capacity(mid_blocks),
            large_space_skipped_pages: PopulationArray::with_capacity(large_pages),
            ..Default::default()
        }
    }

    fn arrays_mut(&mut self) -> [&mut PopulationArray; 9] {
        [
            &mut self.small_space_1,
            &mut self.small_space_2,
            &mut self.mid_space_1,
            &mut self.mid_space_2,
            &mut self.large_space_1,
            &mut self.large_space_2,
            &mut self.small_space_skipped_pages,
            &mut self.mid_space_skipped_pages,
            &mut self.large_space_skipped_pages,
        ]
    }

    fn selectable(&self) -> [&PopulationArray; 6] {
        [
            &self.small_space_1,
            &self.small_space_2,
            &self.mid_space_1,
            &self.mid_space_2,
            &self.large_space_1,
            &self.large_space_2,
        ]
    }

    pub fn reset_populations(&mut self) {
        for array in self.arrays_mut() {
            array.reset();
        }
        self.mid_space_targets.reset();
        for counter in [
            &self.source_pages_to_new_gen,
            &self.source_pages_to_old_gen,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn reset_max_cursor(&mut self) {
        for array in self.arrays_mut() {
            array.reset_max_cursor();
        }
    }

    pub fn reset_cursor(&self) {
        for array in self.selectable() {
            array.reset_cursor();
        }
    }

    pub fn total_released(&self) -> u64 {
        self.selectable().iter().map(|a| a.released_pages()).sum()
    }

    pub fn no_relocate_pages(&self) -> u64 {
        self.selectable().iter().map(|a| a.no_relocate_pages()).sum()
    }

    pub fn total_pops_to_relocate(&self) -> usize {
        self.selectable().iter().map(|a| a.max_cursor()).sum()
    }

    fn one_space_sum(&self, f: fn(&PopulationArray) -> u64) -> u64 {
        self.selectable()[..4].iter().map(|a| f(a)).sum()
    }

    pub fn live_words_found(&self) -> u64 {
        self.one_space_sum(PopulationArray::live_words_found)
    }

    pub fn dead_words_found(&self) -> u64 {
        self.one_space_sum(PopulationArray::dead_words_found)
    }

    pub fn dead_words_selected(&self) -> u64 {
        self.one_space_sum(PopulationArray::dead_words_selected)
    }

    pub fn frag_words_found(&self) -> u64 {
        self.one_space_sum(PopulationArray::frag_words_found)
    }

    pub fn frag_words_selected(&self) -> u64 {
        self.one_space_sum(PopulationArray::frag_words_selected)
    }

    pub fn sideband_limited_words(&self) -> u64 {
        self.selectable().iter().map(|a| a.sideband_limited_words()).sum()
    }

    pub fn total_garbage_words(&self, words_in_page: usize) -> u64 {
        self.total_released() * words_in_page as u64 + self.dead_words_found()
    }

    pub fn garbage_words_to_collect(&self, words_in_page: usize) -> u64 {
        self.total_released() * words_in_page as u64 + self.dead_words_selected()
    }

    pub fn set_source_pages_to_new_gen(&self, pages: usize) {
        self.source_pages_to_new_gen.store(pages, Ordering::Relaxed);
    }

    pub fn set_source_pages_to_old_gen(&self, pages: usize) {
        self.source_pages_to_old_gen.store(pages, Ordering::Relaxed);
    }

    pub fn source_pages_to_new_gen(&self) -> usize {
        self.source_pages_to_new_gen.load(Ordering::Relaxed)
    }

    pub fn source_pages_to_old_gen(&self) -> usize {
        self.source_pages_to_old_gen.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pop(page: u32, occupancy: u32, frag: u32, time: i64) -> PagePop {
        PagePop {
            page: PageNum(page),
            live_words: occupancy,
            dead_words: 100 - occupancy,
            frag_words: frag,
            occupancy,
            time_stripe: time,
        }
    }

    #[test]
    fn new_gc_priority() {
        let mut array = PopulationArray::default();
        for (page, occupancy) in [(1, 10), (2, 90), (3, 50)] {
            array.add_page_pop(pop(page, occupancy, 0, 0));
        }
        array.sort_by_new_gc_relocation_priority();
        let order: Vec<u32> = (0..array.len()).map(|i| array.page(i).0).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[test]
    fn old_gc_breaks_ties_by_fragmentation() {
        let mut array = PopulationArray::default();
        array.add_page_pop(pop(1, 40, 5, 0));
        array.add_page_pop(pop(2, 40, 50, 0));
        array.add_page_pop(pop(3, 20, 0, 0));
        array.sort_by_old_gc_relocation_priority();
        let order: Vec<u32> = (0..array.len()).map(|i| array.page(i).0).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn youngest_first() {
        let mut array = PopulationArray::default();
        array.add_page_pop(pop(1, 1, 0, 5));
        array.add_page_pop(pop(2, 1, 0, 50));
        array.sort_by_largest_time_first();
        assert_eq!(array.page(0), PageNum(2));
    }

    #[test]
    fn cutoff_counts_abandoned_garbage() {
        let mut array = PopulationArray::default();
        for page in 0..4 {
            array.add_page_pop(pop(page, 60, 0, 0));
        }
        array.reset_max_cursor();
        array.sideband_limit_reclaim_cutoff(1);
        assert_eq!(array.max_cursor(), 1);
        assert_eq!(array.sideband_limited_words(), 3 * 40);
        assert_eq!(array.selected().len(), 1);
    }

    #[test]
    fn split_moves_words_with_pages() {
        let mut stay = PopulationArray::default();
        let mut promote = PopulationArray::default();
        for (page, time) in [(1, 10), (2, 500), (3, 20)] {
            stay.add_page_pop(pop(page, 30, 0, time));
        }
        for moved in stay.split_off(|pop| pop.time_stripe < 100) {
            promote.add_page_pop(moved);
        }
        assert_eq!(stay.len(), 1);
        assert_eq!(stay.page(0), PageNum(2));
        assert_eq!(stay.live_words_selected(), 30);
        assert_eq!(promote.len(), 2);
        assert_eq!(promote.dead_words_selected(), 2 * 70);
    }

    #[test]
    fn parallel_claims_cover_everything_once() {
        let mut array = PopulationArray::default();
        for page in 0..1000 {
            array.add_page_pop(pop(page, 1, 0, 0));
        }
        array.reset_max_cursor();
        let claimed: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        crossbeam::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    array.for_each_claimed(7, |index, _| {
                        claimed[index].fetch_add(1, Ordering::Relaxed);
                    })
                });
            }
        })
        .unwrap();
        assert!(claimed.iter().all(|c| c.load(Ordering::Relaxed) == 1));
        assert!(array.cursor_at_end());
    }

    #[test]
    fn remap_targets_from_many_workers_are_all_kept() {
        let targets = RemapTargetArray::default();
        crossbeam::scope(|s| {
            for worker in 0..4u32 {
                let targets = &targets;
                s.spawn(move |_| {
                    for i in 0..100 {
                        targets.add_page(PageNum(worker * 100 + i), i as i64, Gen::Old);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(targets.len(), 400);
        let mut pages: Vec<u32> = targets.snapshot().iter().map(|t| t.page.0).collect();
        pages.sort_unstable();
        assert!(pages.iter().copied().eq(0..400));
        targets.reset();
        assert!(targets.is_empty());
    }
}
