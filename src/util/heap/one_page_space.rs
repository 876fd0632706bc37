//! A space of fixed-size granules: single pages in small space, 16-page blocks in mid space.
//!
//! Free granules sit on a lock-free singly linked list threaded through `PageInfo::ll_next`. The list
//! head carries a tag in its high 32 bits that every pop increments, so a head that was popped and
//! pushed back between another thread's read and CAS is not mistaken for the one it read.
//!
//! Freed granules cannot be reused while some CPU may still hold a stale translation for them. They
//! go onto a hold list first; [`OnePageSpace::prepare_for_tlb_resync`] detaches that list, and only
//! [`OnePageSpace::tlb_resync_occurred`], called after the TLB invalidation, makes them available.

use crate::collector::population::PopulationArray;
use crate::collector::CollectionState;
use crate::util::heap::heap_meta::HeapMeta;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::{flags, Gen, PageInfo, PageState};
use crate::util::Address;
use crate::vm::ObjectModel;
use atomic::Atomic;
use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{fence, AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;

const PAGE_NUM_MASK: u64 = 0xFFFF_FFFF;
const TAG_SHIFT: u32 = 32;

fn decode_page(list: u64) -> PageNum {
    PageNum((list & PAGE_NUM_MASK) as u32)
}

fn decode_tag(list: u64) -> u32 {
    (list >> TAG_SHIFT) as u32
}

fn encode(page: PageNum, tag: u32) -> u64 {
    ((tag as u64) << TAG_SHIFT) | page.0 as u64
}

/// Granules detached from the hold list, waiting for the TLB invalidation to complete.
#[derive(Default)]
struct PendingPages {
    head: Option<PageNum>,
    tail: PageNum,
    count: usize,
}

/// Pages counted by a sparse-page scan as taking part in some generation's allocation.
fn is_allocating_or_allocated(state: PageState) -> bool {
    matches!(state, PageState::Allocating | PageState::Allocated)
}

pub struct OnePageSpace {
    meta: Arc<HeapMeta>,
    small_space: bool,
    block_size: usize,
    start_page: PageNum,
    end_page: PageNum,
    top_page: Atomic<PageNum>,
    /// Tagged head of the available list.
    available_pages_list: AtomicU64,
    pages_on_hold: Atomic<PageNum>,
    pending: AtomicRefCell<PendingPages>,

    allocated_pages_count: AtomicIsize,
    available_pages_count: AtomicIsize,
    held_pages_count: AtomicIsize,
    retired_pages_count: AtomicIsize,
}

impl OnePageSpace {
    /// A small space of single pages, or a mid space of mid blocks, over `[start, end)`.
    pub fn new(meta: Arc<HeapMeta>, start: PageNum, end: PageNum, small_space: bool) -> Self {
        assert!(start < end, "Invalid page range {}..{}", start, end);
        let block_size = if small_space {
            1
        } else {
            assert!(
                meta.layout.page_is_mid_space_base(start)
                    && end.index() % crate::util::constants::PAGES_IN_MID_BLOCK == 0,
                "Mid space range {}..{} not aligned to mid blocks",
                start,
                end
            );
            crate::util::constants::PAGES_IN_MID_BLOCK
        };
        OnePageSpace {
            meta,
            small_space,
            block_size,
            start_page: start,
            end_page: end,
            top_page: Atomic::new(start),
            available_pages_list: AtomicU64::new(encode(PageNum::NONE, 0)),
            pages_on_hold: Atomic::new(PageNum::NONE),
            pending: AtomicRefCell::new(PendingPages::default()),
            allocated_pages_count: AtomicIsize::new(0),
            available_pages_count: AtomicIsize::new(0),
            held_pages_count: AtomicIsize::new(0),
            retired_pages_count: AtomicIsize::new(0),
        }
    }

    pub fn small_space(&self) -> bool {
        self.small_space
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn start_page(&self) -> PageNum {
        self.start_page
    }

    pub fn end_page(&self) -> PageNum {
        self.end_page
    }

    pub fn top_page(&self) -> PageNum {
        self.top_page.load(Ordering::Acquire)
    }

    pub fn allocated_pages_count(&self) -> isize {
        self.allocated_pages_count.load(Ordering::Relaxed)
    }

    pub fn available_pages_count(&self) -> isize {
        self.available_pages_count.load(Ordering::Relaxed)
    }

    pub fn held_pages_count(&self) -> isize {
        self.held_pages_count.load(Ordering::Relaxed)
    }

    pub fn retired_pages_count(&self) -> isize {
        self.retired_pages_count.load(Ordering::Relaxed)
    }

    /// The tag of the available list head. Every successful pop increments it.
    pub fn available_list_tag(&self) -> u32 {
        decode_tag(self.available_pages_list.load(Ordering::Acquire))
    }

    fn info(&self, page: PageNum) -> &PageInfo {
        self.meta.info(page)
    }

    /// Base pages of every granule expanded over so far.
    fn granules(&self) -> impl Iterator<Item = PageNum> {
        let block_size = self.block_size;
        (self.start_page.index()..self.top_page().index())
            .step_by(block_size)
            .map(|index| PageNum(index as u32))
    }

    /// Pop the available list. Returns the page and the tag the pop installed.
    pub fn pop_available_page(&self) -> Option<(PageNum, u32)> {
        let mut spins = 0;
        let mut list = self.available_pages_list.load(Ordering::Acquire);
        loop {
            let head = decode_page(list);
            if head.is_none() {
                return None;
            }
            let next = self.info(head).ll_next();
            let tag = decode_tag(list).wrapping_add(1);
            match self.available_pages_list.compare_exchange(
                list,
                encode(next, tag),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let info = self.info(head);
                    info.set_ll_next(PageNum::NONE);
                    self.available_pages_count.fetch_sub(1, Ordering::Relaxed);
                    if spins > 10 {
                        debug!("Spun {} times selecting an available page", spins);
                    }
                    debug_assert_eq!(info.state(), PageState::Unmapped);
                    return Some((head, tag));
                }
                Err(actual) => {
                    spins += 1;
                    list = actual;
                }
            }
        }
    }

    pub fn get_available_page(&self) -> PageNum {
        self.pop_available_page()
            .map_or(PageNum::NONE, |(page, _)| page)
    }

    /// Claim the next granule above the top watermark. The page-info records are made usable before
    /// the CAS that publishes the new top, so a selectable granule always has its records.
    pub fn get_expansion_page(&self) -> PageNum {
        let mut spins = 0;
        let mut top = self.top_page();
        while top < self.end_page {
            let new_top = top.plus(self.block_size);
            self.meta.page_info.expand_pages_in_use(top, self.block_size);
            match self.top_page.compare_exchange(
                top,
                new_top,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    for i in 0..self.block_size {
                        self.meta.page_info.info(top.plus(i)).initialize();
                    }
                    self.info(top).set_gen_and_state(None, PageState::Unmapped);
                    if spins > 10 {
                        debug!("Spun {} times expanding a one-page space", spins);
                    }
                    return top;
                }
                Err(actual) => {
                    spins += 1;
                    top = actual;
                }
            }
        }
        PageNum::NONE
    }

    /// A free granule, reusing freed ones before expanding. `PageNum::NONE` when the space is full.
    pub fn select_page(&self) -> PageNum {
        let mut page = self.get_available_page();
        if page.is_none() {
            page = self.get_expansion_page();
        }
        if page.is_some() {
            self.allocated_pages_count.fetch_add(1, Ordering::Relaxed);
            trace!("Selected {} from {} space", page, self.name());
        }
        page
    }

    /// Push a granule no CPU can hold a stale translation for onto the available list.
    pub fn return_available_page(&self, page: PageNum) {
        assert!(page.is_some());
        let info = self.info(page);
        let mut list = self.available_pages_list.load(Ordering::Acquire);
        loop {
            info.set_ll_next(decode_page(list));
            // The pushed head keeps the tag; only pops advance it.
            let new_list = encode(page, decode_tag(list));
            match self.available_pages_list.compare_exchange(
                list,
                new_list,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => list = actual,
            }
        }
        self.allocated_pages_count.fetch_sub(1, Ordering::Relaxed);
        self.available_pages_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Park a freed granule until the next TLB resync.
    pub fn hold_page_for_tlb_resync(&self, page: PageNum) {
        assert!(page.is_some());
        let info = self.info(page);
        let mut head = self.pages_on_hold.load(Ordering::Acquire);
        loop {
            info.set_ll_next(head);
            match self.pages_on_hold.compare_exchange(
                head,
                page,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.allocated_pages_count.fetch_sub(1, Ordering::Relaxed);
        self.held_pages_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Free a granule for good. It goes on no list, so its address range is never handed out again.
    pub fn retire_page(&self, page: PageNum) {
        assert!(page.is_some());
        self.info(page).set_ll_next(PageNum::NONE);
        self.allocated_pages_count.fetch_sub(1, Ordering::Relaxed);
        self.retired_pages_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Detach the hold list. The detached granules stay unselectable until
    /// [`Self::tlb_resync_occurred`]. Returns how many were detached.
    pub fn prepare_for_tlb_resync(&self) -> usize {
        let mut pending = self.pending.borrow_mut();
        assert!(pending.head.is_none(), "TLB resync already prepared");
        let head = self.pages_on_hold.swap(PageNum::NONE, Ordering::AcqRel);
        if head.is_none() {
            return 0;
        }
        let mut tail = head;
        let mut pages = 1;
        loop {
            let next = self.info(tail).ll_next();
            if next.is_none() {
                break;
            }
            tail = next;
            pages += 1;
        }
        self.held_pages_count
            .fetch_sub(pages as isize, Ordering::Relaxed);
        *pending = PendingPages {
            head: Some(head),
            tail,
            count: pages,
        };
        fence(Ordering::Release);
        pages
    }

    /// Splice the detached granules onto the available list. The caller has invalidated the TLBs
    /// since [`Self::prepare_for_tlb_resync`].
    pub fn tlb_resync_occurred(&self) -> usize {
        let mut pending = self.pending.borrow_mut();
        let head = match pending.head {
            Some(head) => head,
            None => return 0,
        };
        let tail_info = self.info(pending.tail);
        let mut list = self.available_pages_list.load(Ordering::Acquire);
        loop {
            tail_info.set_ll_next(decode_page(list));
            match self.available_pages_list.compare_exchange(
                list,
                encode(head, decode_tag(list)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => list = actual,
            }
        }
        let count = pending.count;
        self.available_pages_count
            .fetch_add(count as isize, Ordering::Relaxed);
        *pending = PendingPages::default();
        count
    }

    /// Pages currently staged between the two halves of a TLB resync.
    pub fn pending_pages(&self) -> usize {
        self.pending.borrow().count
    }

    /// Pin a mid block. Refused while the owning collector could still decide to relocate it.
    pub fn pin_page(&self, page: PageNum, gc_state: impl FnOnce(Gen) -> CollectionState) {
        assert!(!self.small_space, "Pinning small space pages is not supported");
        assert!(self.meta.layout.page_is_mid_space_base(page));
        let info = self.info(page);
        let gs = info.gen_and_state();
        assert!(
            is_allocating_or_allocated(gs.state()),
            "Pinning {} in state {:?}",
            page,
            gs
        );
        if !info.has_flag(flags::NO_RELOCATE) {
            let gen = gs.gen().unwrap_or_else(|| panic!("Pinning {} with no generation", page));
            assert!(
                !gc_state(gen).may_select_for_relocation(),
                "Attempting to pin {} that could be relocated by the collector",
                page
            );
        }
        info.atomic_add_pinned();
    }

    pub fn unpin_page(&self, page: PageNum) {
        assert!(self.meta.layout.page_is_mid_space_base(page));
        let info = self.info(page);
        assert!(is_allocating_or_allocated(info.state()));
        info.atomic_subtract_pinned();
    }

    /// Pages of a granule that hold objects: 1 in small space, up to the page holding `top - 1` in
    /// mid space (none for an empty block).
    fn allocated_pages(&self, page: PageNum, info: &PageInfo) -> usize {
        if self.small_space {
            return 1;
        }
        let base = self.meta.page_to_addr(page);
        let top = info.top();
        if top <= base {
            return 0;
        }
        self.meta.addr_to_page(top - 1usize).distance_from(page) + 1
    }

    /// Allocated pages and unusable tail words of the generations in `gen_mask`.
    pub fn page_and_frag_words_count(&self, gen_mask: u8) -> (usize, usize) {
        let mut pages = 0;
        let mut frag_words = 0;
        for page in self.granules() {
            let info = self.info(page);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask == 0 || !is_allocating_or_allocated(gs.state()) {
                continue;
            }
            let allocated = self.allocated_pages(page, info);
            pages += allocated;
            if gs.state() == PageState::Allocated {
                let end = self.meta.page_to_addr(page.plus(allocated));
                frag_words += end.words_from(info.top());
            }
        }
        (pages, frag_words)
    }

    /// Classify new-generation granules for the new collector. Empty granules are handed to
    /// `release_empty` rather than queued.
    pub fn new_gc_collect_sparse_populations(
        &self,
        promotion_threshold_time: i64,
        population: &mut PopulationArray,
        skipped: &mut PopulationArray,
        release_empty: &mut dyn FnMut(PageNum),
    ) {
        let words_in_page = self.meta.words_in_page();
        for page in self.granules() {
            let info = self.info(page);
            let gs = info.gen_and_state();
            let gen = gs.gen();
            let state = gs.state();
            if gen == Some(Gen::New) && is_allocating_or_allocated(state) {
                fence(Ordering::Acquire);
                let live_words = info.live_words() as u32;
                let allocated_pages = self.allocated_pages(page, info);
                let occupancy = live_words / allocated_pages.max(1) as u32;
                if info.has_flag(flags::NO_RELOCATE) || info.has_flag(flags::PINNED) {
                    population.add_no_relocate_pages(allocated_pages as u32);
                    skipped.add_skipped_page(page, allocated_pages as u32, live_words, 0, 0);
                    continue;
                }
                self.debug_check_mark_count(page, info);
                if live_words == 0 {
                    population.add_empty_page(allocated_pages as u32);
                    release_empty(page);
                    continue;
                }
                let (frag_words, dead_words) =
                    self.frag_and_dead_words(page, info, allocated_pages, words_in_page);
                trace!(
                    "Sparse {}: {} objs, {} live, {} frag, {} dead words",
                    page,
                    info.live_objs(),
                    live_words,
                    frag_words,
                    dead_words
                );
                if dead_words > 0 || info.time() < promotion_threshold_time {
                    population.add_page(page, info.time(), occupancy, live_words, frag_words, dead_words);
                } else {
                    skipped.add_skipped_page(page, allocated_pages as u32, live_words, frag_words, dead_words);
                }
            } else if gen == Some(Gen::New) {
                debug_assert!(
                    !matches!(state, PageState::Relocating | PageState::Relocated),
                    "New gen {} found {:?} by the new collector",
                    page,
                    gs
                );
            } else if gs.gen_bits() & Gen::OLD_AND_PERM_MASK != 0
                && state >= PageState::Allocating
                && state <= PageState::Relocated
            {
                skipped.add_skipped_page(page, 1, 0, 0, 0);
            }
        }
    }

    /// Classify old and perm granules for the old collector. Pages with no dead words are still
    /// selected when badly fragmented and in this cycle's fragment stripe.
    pub fn old_gc_collect_sparse_populations(
        &self,
        fragment_mask: u32,
        fragment_stripe: u32,
        no_perm_relocation: bool,
        population: &mut PopulationArray,
        skipped: &mut PopulationArray,
        release_empty: &mut dyn FnMut(PageNum),
    ) {
        let words_in_page = self.meta.words_in_page();
        for page in self.granules() {
            let info = self.info(page);
            let gs = info.gen_and_state();
            let gen = gs.gen();
            let state = gs.state();
            if matches!(gen, Some(Gen::Old) | Some(Gen::Perm)) && is_allocating_or_allocated(state) {
                fence(Ordering::Acquire);
                // The first small page holds the perm objects the runtime boots from.
                if gen == Some(Gen::Perm)
                    && (no_perm_relocation || page == self.meta.layout.small_space_start)
                {
                    skipped.add_skipped_page(page, 0, 0, 0, 0);
                    continue;
                }
                let live_words = info.live_words() as u32;
                let allocated_pages = self.allocated_pages(page, info);
                let occupancy = live_words / allocated_pages.max(1) as u32;
                if info.has_flag(flags::NO_RELOCATE) || info.has_flag(flags::PINNED) {
                    population.add_no_relocate_pages(allocated_pages as u32);
                    skipped.add_skipped_page(page, allocated_pages as u32, live_words, 0, 0);
                    continue;
                }
                self.debug_check_mark_count(page, info);
                if live_words == 0 {
                    population.add_empty_page(allocated_pages as u32);
                    release_empty(page);
                    continue;
                }
                let (frag_words, dead_words) =
                    self.frag_and_dead_words(page, info, allocated_pages, words_in_page);
                if dead_words > 0 {
                    population.add_page(page, info.time(), occupancy, live_words, frag_words, dead_words);
                } else if frag_words as usize > (allocated_pages * words_in_page) / 16
                    && page.0 & fragment_mask == fragment_stripe
                {
                    population.add_page(page, info.time(), occupancy, live_words, frag_words, dead_words);
                    population.increment_defrag_pages_selected();
                } else {
                    skipped.add_skipped_page(page, allocated_pages as u32, live_words, frag_words, dead_words);
                }
            } else if gen == Some(Gen::New) && state >= PageState::Allocating {
                skipped.add_skipped_page(page, 1, 0, 0, 0);
            }
        }
    }

    fn frag_and_dead_words(
        &self,
        page: PageNum,
        info: &PageInfo,
        allocated_pages: usize,
        words_in_page: usize,
    ) -> (u32, u32) {
        let end = self.meta.page_to_addr(page.plus(allocated_pages));
        let top = info.top();
        assert!(end >= top, "Top {} of {} past its pages", top, page);
        let word_size = allocated_pages * words_in_page;
        let frag_words = end.words_from(top);
        let live_words = info.live_words() as usize;
        assert!(
            word_size >= frag_words + live_words,
            "{} has {} live and {} frag words in {} words",
            page,
            live_words,
            frag_words,
            word_size
        );
        (frag_words as u32, (word_size - frag_words - live_words) as u32)
    }

    fn debug_check_mark_count(&self, page: PageNum, info: &PageInfo) {
        if cfg!(debug_assertions) {
            let start = self.meta.page_to_addr(page);
            let end = self.meta.page_to_addr(page.plus(self.block_size));
            let marks = self.meta.marks.live_objects(start, end).len() as u64;
            debug_assert_eq!(marks, info.live_objs(), "Mark count mismatch on {}", page);
            debug_assert!(info.live_words() > 0 || info.live_objs() == 0);
        }
    }

    /// Clear the live marks and counts of every `sections`th granule, starting at `section`.
    pub fn clear_page_marks(&self, gen_mask: u8, section: usize, sections: usize) {
        for page in self.granules().skip(section).step_by(sections) {
            let info = self.info(page);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0 && is_allocating_or_allocated(gs.state()) {
                info.zero_raw_stats();
                self.meta.marks.clear_live_marks(page, self.block_size);
            }
        }
    }

    pub fn verify_no_live_marks(&self, gen_mask: u8) {
        for page in self.granules() {
            let info = self.info(page);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0 && is_allocating_or_allocated(gs.state()) {
                fence(Ordering::Acquire);
                assert_eq!(
                    info.live_objs(),
                    0,
                    "{} has {} live objects counted",
                    page,
                    info.live_objs()
                );
                self.meta.marks.verify_no_live_marks(page, self.block_size);
            }
        }
    }

    /// Visit the objects of `gen` in every `sections`th granule from `section`.
    pub fn object_iterate_section(
        &self,
        gen: Gen,
        model: &dyn ObjectModel,
        section: usize,
        sections: usize,
        f: &mut dyn FnMut(Address),
    ) {
        let alignment = if self.small_space {
            1
        } else {
            self.meta.layout.mid_object_alignment_words
        };
        for page in self.granules().skip(section).step_by(sections) {
            let info = self.info(page);
            let gs = info.gen_and_state();
            if gs.gen() != Some(gen) || !is_allocating_or_allocated(gs.state()) {
                continue;
            }
            fence(Ordering::Acquire);
            let mut p = self.meta.page_to_addr(page);
            while p < info.top() {
                f(p);
                let words = model.size_in_words(p);
                p = p.plus_words(crate::util::conversions::raw_align_up(words, alignment));
            }
        }
    }

    pub fn object_iterate(&self, gen: Gen, model: &dyn ObjectModel, f: &mut dyn FnMut(Address)) {
        self.object_iterate_section(gen, model, 0, 1, f);
    }

    /// Let marking-time allocations be relocated again.
    pub fn clear_no_relocate(&self, gen_mask: u8) {
        for page in self.granules() {
            let info = self.info(page);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0
                && is_allocating_or_allocated(gs.state())
                && info.has_flag(flags::NO_RELOCATE)
            {
                info.atomic_clear_flag(flags::NO_RELOCATE);
            }
        }
    }

    /// Pages of `gen` the space holds. Only reliable at a safepoint.
    pub fn verify_capacity(&self, gen: Gen) -> usize {
        let mut capacity = 0;
        for page in self.granules() {
            let info = self.info(page);
            let gs = info.gen_and_state();
            if gs.gen() != Some(gen) {
                continue;
            }
            match gs.state() {
                PageState::Unmapped | PageState::Relocated => continue,
                PageState::Allocating | PageState::Allocated => {}
                _ => panic!("{} in state {:?} during capacity verification", page, gs),
            }
            capacity += self.allocated_pages(page, info);
        }
        capacity
    }

    /// Live object and word counts of the allocated granules of `gen_mask`.
    pub fn sum_raw_stats(&self, gen_mask: u8) -> (u64, u64) {
        let mut objects = 0;
        let mut words = 0;
        for page in self.granules() {
            let info = self.info(page);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0 && gs.state() == PageState::Allocated {
                objects += info.live_objs();
                words += info.live_words();
            }
        }
        (objects, words)
    }

    /// Split the expanded range into at most `tasks` runs of whole granules.
    pub fn page_ranges(&self, tasks: usize) -> Vec<(PageNum, PageNum)> {
        let top = self.top_page();
        let blocks = top.distance_from(self.start_page) / self.block_size;
        let blocks_per_task = (blocks / tasks.max(1)).max(1);
        let pages_per_task = blocks_per_task * self.block_size;
        let mut ranges = vec![];
        let mut start = self.start_page;
        let mut i = 1;
        while start < top {
            let end = if i == tasks { top } else { top.min(start.plus(pages_per_task)) };
            ranges.push((start, end));
            start = end;
            i += 1;
        }
        ranges
    }

    fn name(&self) -> &'static str {
        if self.small_space {
            "small"
        } else {
            "mid"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory::{MmapMemory, VirtualMemory};
    use crate::util::test_util::test_options;

    fn small_space() -> OnePageSpace {
        let memory: Arc<dyn VirtualMemory> = Arc::new(MmapMemory::new());
        let meta = Arc::new(HeapMeta::new(&test_options(), memory, 4).unwrap());
        let (start, end) = (meta.layout.small_space_start, meta.layout.small_space_end);
        OnePageSpace::new(meta, start, end, true)
    }

    fn mid_space() -> OnePageSpace {
        let memory: Arc<dyn VirtualMemory> = Arc::new(MmapMemory::new());
        let meta = Arc::new(HeapMeta::new(&test_options(), memory, 4).unwrap());
        let (start, end) = (meta.layout.mid_space_start, meta.layout.mid_space_end);
        OnePageSpace::new(meta, start, end, false)
    }

    #[test]
    fn expands_in_order() {
        let space = small_space();
        let first = space.select_page();
        let second = space.select_page();
        assert_eq!(first, space.start_page());
        assert_eq!(second, first.plus(1));
        assert_eq!(space.top_page(), first.plus(2));
        assert_eq!(space.info(first).state(), PageState::Unmapped);
        assert_eq!(space.allocated_pages_count(), 2);
    }

    #[test]
    fn mid_space_expands_by_blocks() {
        let space = mid_space();
        let first = space.select_page();
        let second = space.select_page();
        assert_eq!(second.distance_from(first), 16);
        assert_eq!(space.block_size(), 16);
    }

    #[test]
    fn exhausts() {
        let space = small_space();
        let pages = space.end_page().distance_from(space.start_page());
        for _ in 0..pages {
            assert!(space.select_page().is_some());
        }
        assert!(space.select_page().is_none());
    }

    #[test]
    fn returned_pages_are_reused_first() {
        let space = small_space();
        let a = space.select_page();
        let b = space.select_page();
        space.return_available_page(a);
        let tag = space.available_list_tag();
        assert_eq!(space.select_page(), a);
        assert_eq!(space.available_list_tag(), tag + 1);
        assert_ne!(space.select_page(), b);
    }

    #[test]
    fn held_pages_wait_for_resync() {
        let space = small_space();
        let a = space.select_page();
        space.hold_page_for_tlb_resync(a);
        assert_eq!(space.held_pages_count(), 1);
        assert_ne!(space.select_page(), a);
        assert_eq!(space.prepare_for_tlb_resync(), 1);
        assert_ne!(space.select_page(), a);
        assert_eq!(space.tlb_resync_occurred(), 1);
        assert_eq!(space.select_page(), a);
    }

    #[test]
    fn page_ranges_cover_the_space() {
        let space = small_space();
        for _ in 0..10 {
            space.select_page();
        }
        let ranges = space.page_ranges(3);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].0, space.start_page());
        assert_eq!(ranges[2].1, space.top_page());
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }
}
