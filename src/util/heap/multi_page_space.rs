//! Large space: contiguous blocks of one or more pages for objects too big for a mid block.
//!
//! Free blocks are kept in page groups, one group per distinct block size, each a list of same-size
//! blocks threaded through `PageInfo::ll_next`. Every mutation happens under one space lock. Freed
//! blocks are not reinserted into the groups directly; they wait on a hold list, and after the TLB
//! resync the groups are rebuilt by a scan of the whole space, which coalesces adjacent free blocks.
//!
//! The block length lives in `PageInfo::block_size` of the head page. Tail pages of an allocated block
//! hold the negated distance to their head.

use crate::collector::population::PopulationArray;
use crate::collector::CollectionState;
use crate::util::heap::heap_meta::HeapMeta;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::{flags, Gen, GenAndState, PageInfo, PageState};
use crate::util::Address;
use crate::vm::ObjectModel;
use atomic::Atomic;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// Blocks larger than this are split into several card-scanning chunks.
const CARDMARK_CHUNK_THRESHOLD_PAGES: usize = 40;

struct PageGroups {
    /// Block size to the first block of that size.
    groups: BTreeMap<usize, PageNum>,
    blocks_on_hold: PageNum,
    /// Pages detached from the hold list by the last prepare, waiting for the rebuild.
    pending_pages: usize,
    allocated_pages: usize,
    available_pages: usize,
    held_pages: usize,
    /// Freed blocks whose address range is never handed out again.
    retired: HashSet<PageNum>,
    retired_pages: usize,
}

pub struct MultiPageSpace {
    meta: Arc<HeapMeta>,
    start_page: PageNum,
    end_page: PageNum,
    /// Written under the lock, readable without it.
    top_page: Atomic<PageNum>,
    lock: spin::Mutex<PageGroups>,
}

impl MultiPageSpace {
    pub fn new(meta: Arc<HeapMeta>, start: PageNum, end: PageNum) -> Self {
        assert!(start < end, "Invalid page range {}..{}", start, end);
        MultiPageSpace {
            meta,
            start_page: start,
            end_page: end,
            top_page: Atomic::new(start),
            lock: spin::Mutex::new(PageGroups {
                groups: BTreeMap::new(),
                blocks_on_hold: PageNum::NONE,
                pending_pages: 0,
                allocated_pages: 0,
                available_pages: 0,
                held_pages: 0,
                retired: HashSet::new(),
                retired_pages: 0,
            }),
        }
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

    pub fn allocated_pages_count(&self) -> usize {
        self.lock.lock().allocated_pages
    }

    pub fn available_pages_count(&self) -> usize {
        self.lock.lock().available_pages
    }

    pub fn held_pages_count(&self) -> usize {
        self.lock.lock().held_pages
    }

    pub fn retired_pages_count(&self) -> usize {
        self.lock.lock().retired_pages
    }

    /// Number of distinct free block sizes.
    pub fn page_group_count(&self) -> usize {
        self.lock.lock().groups.len()
    }

    fn info(&self, page: PageNum) -> &PageInfo {
        self.meta.info(page)
    }

    /// The head of the block holding `page`.
    pub fn block_head(&self, page: PageNum) -> PageNum {
        let size = self.info(page).block_size();
        if size < 0 {
            page.minus((-size) as usize)
        } else {
            page
        }
    }

    /// Every block head below the top watermark and its length, read under the lock.
    fn blocks(&self) -> Vec<(PageNum, usize)> {
        let _groups = self.lock.lock();
        let top = self.top_page();
        let mut blocks = vec![];
        let mut block = self.start_page;
        while block < top {
            let pages = self.info(block).block_size();
            assert!(pages > 0, "Block {} has length {}", block, pages);
            blocks.push((block, pages as usize));
            block = block.plus(pages as usize);
        }
        blocks
    }

    fn add_block_to_page_group(&self, groups: &mut PageGroups, block: PageNum, pages: usize) {
        let info = self.info(block);
        let next = groups.groups.get(&pages).copied().unwrap_or(PageNum::NONE);
        info.set_ll_next(next);
        info.set_block_size(pages as i64);
        groups.groups.insert(pages, block);
    }

    /// Pop the first block of the smallest group that fits `pages`, splitting off the surplus.
    fn get_available_block(&self, groups: &mut PageGroups, pages: usize) -> PageNum {
        let (size, block) = match groups.groups.range(pages..).next() {
            Some((&size, &block)) => (size, block),
            None => return PageNum::NONE,
        };
        let info = self.info(block);
        debug_assert_eq!(info.block_size(), size as i64);
        let next = info.ll_next();
        if next.is_none() {
            groups.groups.remove(&size);
        } else {
            groups.groups.insert(size, next);
        }
        info.set_ll_next(PageNum::NONE);
        info.set_block_size(pages as i64);

        let unneeded_pages = size - pages;
        if unneeded_pages > 0 {
            let unneeded_block = block.plus(pages);
            self.info(unneeded_block)
                .set_gen_and_state(None, PageState::Unmapped);
            self.add_block_to_page_group(groups, unneeded_block, unneeded_pages);
        }
        groups.available_pages -= pages;
        block
    }

    /// Grow the space by `pages` at the top watermark.
    fn get_expansion_block(&self, pages: usize) -> PageNum {
        let block = self.top_page();
        let new_top = block.plus(pages);
        if new_top > self.end_page {
            return PageNum::NONE;
        }
        self.meta.page_info.expand_pages_in_use(block, pages);
        for i in 0..pages {
            self.info(block.plus(i)).initialize();
        }
        self.info(block).set_block_size(pages as i64);
        self.top_page.store(new_top, Ordering::Release);
        block
    }

    /// A block of `pages` pages, published as `Allocated` in `gen`. The caller commits the memory and
    /// initializes the read trap, and returns the block with [`Self::return_available_block`] if that
    /// fails.
    pub fn select_block(&self, pages: usize, gen: Gen, no_relocate: bool) -> PageNum {
        assert!(pages > 0);
        let mut groups = self.lock.lock();
        let mut block = self.get_available_block(&mut groups, pages);
        if block.is_none() {
            block = self.get_expansion_block(pages);
        }
        if block.is_none() {
            return block;
        }
        groups.allocated_pages += pages;

        // Initialized under the lock, or a rebuild could put the block back on a group.
        for i in 1..pages {
            self.info(block.plus(i)).set_block_size(-(i as i64));
        }
        let info = self.info(block);
        info.set_flags_non_atomic(if no_relocate { flags::NO_RELOCATE } else { 0 });
        info.zero_raw_stats();
        info.set_ll_next(PageNum::NONE);
        info.set_relocations(crate::util::heap::page_info::NO_RELOCATIONS);
        info.set_gen_and_state(Some(gen), PageState::Allocated);
        trace!("Selected block {} of {} pages for {}", block, pages, gen);
        block
    }

    /// Give a block back. It is held until the next TLB resync like any freed block.
    pub fn return_available_block(&self, block: PageNum) {
        let mut groups = self.lock.lock();
        self.hold_block_locked(&mut groups, block);
    }

    /// Park a freed block until the next TLB resync.
    pub fn hold_block_for_tlb_resync(&self, block: PageNum) {
        let mut groups = self.lock.lock();
        self.hold_block_locked(&mut groups, block);
    }

    fn hold_block_locked(&self, groups: &mut PageGroups, block: PageNum) {
        assert!(block.is_some());
        let info = self.info(block);
        let pages = info.block_size();
        assert!(pages > 0, "Holding block {} of length {}", block, pages);
        info.set_gen_and_state(None, PageState::Unmapped);
        info.set_ll_next(groups.blocks_on_hold);
        groups.blocks_on_hold = block;
        groups.allocated_pages -= pages as usize;
        groups.held_pages += pages as usize;
    }

    /// Free a block for good: it stays out of every page group and is never coalesced with its
    /// neighbours, so its address range is not reused.
    pub fn retire_block(&self, block: PageNum) {
        assert!(block.is_some());
        let mut groups = self.lock.lock();
        let info = self.info(block);
        let pages = info.block_size();
        assert!(pages > 0, "Retiring block {} of length {}", block, pages);
        info.set_gen_and_state(None, PageState::Unmapped);
        info.set_ll_next(PageNum::NONE);
        groups.retired.insert(block);
        groups.allocated_pages -= pages as usize;
        groups.retired_pages += pages as usize;
    }

    /// Detach the hold list. Returns the pages detached.
    pub fn prepare_for_tlb_resync(&self) -> usize {
        let mut groups = self.lock.lock();
        assert_eq!(groups.pending_pages, 0, "TLB resync already prepared");
        let mut pages = 0;
        let mut block = groups.blocks_on_hold;
        while block.is_some() {
            let info = self.info(block);
            pages += info.block_size() as usize;
            block = info.ll_next();
        }
        groups.blocks_on_hold = PageNum::NONE;
        groups.held_pages = 0;
        groups.pending_pages = pages;
        pages
    }

    /// Rebuild the page groups from a scan of the space, coalescing runs of free blocks. Blocks held
    /// since the prepare stay out. Returns the available pages.
    pub fn tlb_resync_occurred(&self) -> usize {
        let mut groups = self.lock.lock();
        if groups.pending_pages == 0 {
            return groups.available_pages;
        }
        groups.pending_pages = 0;
        groups.groups.clear();
        groups.available_pages = 0;

        let mut on_hold = HashSet::new();
        let mut held = groups.blocks_on_hold;
        while held.is_some() {
            on_hold.insert(held);
            held = self.info(held).ll_next();
        }
        let retired = std::mem::take(&mut groups.retired);
        let is_free = |block: PageNum| {
            self.info(block).state() == PageState::Unmapped
                && !on_hold.contains(&block)
                && !retired.contains(&block)
        };

        let top = self.top_page();
        let mut block = self.start_page;
        while block < top {
            let info = self.info(block);
            let mut pages = info.block_size() as usize;
            assert!(pages > 0, "Block {} has length {}", block, pages);
            if !is_free(block) {
                block = block.plus(pages);
                continue;
            }
            while block.plus(pages) < top && is_free(block.plus(pages)) {
                let absorbed = self.info(block.plus(pages));
                let absorbed_pages = absorbed.block_size() as usize;
                absorbed.set_block_size(0);
                pages += absorbed_pages;
            }
            self.add_block_to_page_group(&mut groups, block, pages);
            groups.available_pages += pages;
            block = block.plus(pages);
        }
        groups.retired = retired;
        debug!(
            "Large space rebuilt: {} available pages in {} groups",
            groups.available_pages,
            groups.groups.len()
        );
        groups.available_pages
    }

    /// Pin an allocated block. Refused while the owning collector could still decide to relocate it.
    pub fn pin_block(&self, block: PageNum, gc_state: impl FnOnce(Gen) -> CollectionState) {
        assert!(self.meta.layout.page_in_large_space(block));
        let _groups = self.lock.lock();
        let info = self.info(block);
        let gs = info.gen_and_state();
        assert!(info.block_size() > 0, "Pinning {} which is not a block head", block);
        assert_eq!(
            gs.state(),
            PageState::Allocated,
            "Pinning block {} in state {:?}",
            block,
            gs
        );
        if !info.has_flag(flags::NO_RELOCATE) {
            let gen = gs.gen().unwrap_or_else(|| panic!("Pinning {} with no generation", block));
            assert!(
                !gc_state(gen).may_select_for_relocation(),
                "Attempting to pin block {} that could be relocated by the collector",
                block
            );
        }
        info.atomic_add_pinned();
    }

    pub fn unpin_block(&self, block: PageNum) {
        assert!(self.meta.layout.page_in_large_space(block));
        let _groups = self.lock.lock();
        let info = self.info(block);
        assert!(info.block_size() > 0);
        assert_eq!(info.state(), PageState::Allocated);
        info.atomic_subtract_pinned();
    }

    fn frag_words(&self, block: PageNum, pages: usize, info: &PageInfo) -> u32 {
        let end = self.meta.page_to_addr(block.plus(pages));
        end.words_from(info.top()) as u32
    }

    /// Allocated pages and unusable tail words of the generations in `gen_mask`. Blocks allocated
    /// during marking are left out.
    pub fn page_and_frag_words_count(&self, gen_mask: u8) -> (usize, usize) {
        let mut pages_total = 0;
        let mut frag_total = 0;
        for (block, pages) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask == 0 || gs.state() != PageState::Allocated {
                continue;
            }
            fence(Ordering::Acquire);
            if info.has_flag(flags::NO_RELOCATE) {
                continue;
            }
            pages_total += pages;
            frag_total += self.frag_words(block, pages, info) as usize;
        }
        (pages_total, frag_total)
    }

    /// Classify the new-generation blocks: those allocated before the promotion threshold go to
    /// `promoting`, the rest to `surviving`. Empty blocks are handed to `release_empty`.
    pub fn new_gc_collect_blocks(
        &self,
        promotion_threshold_time: i64,
        surviving: &mut PopulationArray,
        promoting: &mut PopulationArray,
        release_empty: &mut dyn FnMut(PageNum),
    ) {
        let mut empty = vec![];
        for (block, pages) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            debug_assert!(
                gs.state() != PageState::Allocating,
                "Large block {} found allocating",
                block
            );
            if gs.gen() != Some(Gen::New) || gs.state() != PageState::Allocated {
                continue;
            }
            fence(Ordering::Acquire);
            if info.has_flag(flags::NO_RELOCATE) || info.has_flag(flags::PINNED) {
                surviving.add_no_relocate_pages(pages as u32);
                continue;
            }
            let live_words = info.live_words() as u32;
            if live_words == 0 {
                surviving.add_empty_block(pages as u64);
                empty.push(block);
                continue;
            }
            let frag_words = self.frag_words(block, pages, info);
            if info.time() < promotion_threshold_time {
                promoting.add_block(block, info.time(), pages as u64, live_words, frag_words);
            } else {
                surviving.add_block(block, info.time(), pages as u64, live_words, frag_words);
            }
        }
        empty.into_iter().for_each(release_empty);
    }

    /// Classify the old and perm blocks. Only empty blocks are released; the rest are counted.
    pub fn old_gc_collect_blocks(
        &self,
        old_blocks: &mut PopulationArray,
        perm_blocks: &mut PopulationArray,
        no_perm_relocation: bool,
        release_empty: &mut dyn FnMut(PageNum),
    ) {
        let mut empty = vec![];
        for (block, pages) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            let array = match gs.gen() {
                Some(Gen::Old) => &mut *old_blocks,
                Some(Gen::Perm) => &mut *perm_blocks,
                _ => continue,
            };
            if gs.state() != PageState::Allocated {
                continue;
            }
            fence(Ordering::Acquire);
            if no_perm_relocation && gs.gen() == Some(Gen::Perm) {
                continue;
            }
            if info.has_flag(flags::NO_RELOCATE) || info.has_flag(flags::PINNED) {
                array.add_no_relocate_pages(pages as u32);
                continue;
            }
            if info.live_objs() == 0 {
                array.add_empty_block(pages as u64);
                empty.push(block);
            } else {
                let frag_words = self.frag_words(block, pages, info);
                array.add_block(block, info.time(), pages as u64, info.live_words() as u32, frag_words);
            }
        }
        empty.into_iter().for_each(release_empty);
    }

    pub fn clear_no_relocate(&self, gen_mask: u8) {
        for (block, _) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0
                && gs.state() == PageState::Allocated
                && info.has_flag(flags::NO_RELOCATE)
            {
                info.atomic_clear_flag(flags::NO_RELOCATE);
            }
        }
    }

    pub fn clear_page_marks(&self, gen_mask: u8) {
        for (block, pages) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0 && gs.state() == PageState::Allocated {
                info.zero_raw_stats();
                self.meta.marks.clear_live_marks(block, pages);
            }
        }
    }

    pub fn verify_no_live_marks(&self, gen_mask: u8) {
        for (block, pages) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0 && gs.state() == PageState::Allocated {
                fence(Ordering::Acquire);
                assert_eq!(info.live_objs(), 0, "Block {} has live objects counted", block);
                self.meta.marks.verify_no_live_marks(block, pages);
            }
        }
    }

    /// Card-scanning work for the new collector: `(block, chunk, chunks)` for every old or perm
    /// block that can hold old-to-new pointers.
    pub fn cardmark_chunks(&self, workers: usize) -> Vec<(PageNum, usize, usize)> {
        let mut chunks = vec![];
        for (block, pages) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            if !matches!(gs.state(), PageState::Allocating | PageState::Allocated)
                || gs.gen() == Some(Gen::New)
                || info.has_flag(flags::NO_RELOCATE)
            {
                continue;
            }
            if pages > CARDMARK_CHUNK_THRESHOLD_PAGES {
                let count = (workers * 4).min(pages / 10);
                chunks.extend((0..count).map(|chunk| (block, chunk, count)));
            } else {
                chunks.push((block, 0, 1));
            }
        }
        chunks
    }

    /// The pages of chunk `chunk` of `chunks` of a block.
    pub fn chunk_range(&self, block: PageNum, chunk: usize, chunks: usize) -> (PageNum, usize) {
        let pages = self.info(block).block_size() as usize;
        let per_chunk = pages.div_ceil(chunks);
        let start = (chunk * per_chunk).min(pages);
        let end = ((chunk + 1) * per_chunk).min(pages);
        (block.plus(start), end - start)
    }

    /// Visit the single object of every block of `gen`.
    pub fn object_iterate(&self, gen: Gen, model: &dyn ObjectModel, f: &mut dyn FnMut(Address)) {
        for (block, _) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            if gs.gen() != Some(gen) || !matches!(gs.state(), PageState::Allocating | PageState::Allocated) {
                continue;
            }
            fence(Ordering::Acquire);
            let start = self.meta.page_to_addr(block);
            if start < info.top() {
                f(start);
                debug_assert_eq!(start.plus_words(model.size_in_words(start)), info.top());
            }
        }
    }

    /// Allocated block heads with their lengths and generation-and-state, for trap array setup.
    pub fn allocated_blocks(&self) -> Vec<(PageNum, usize, GenAndState)> {
        self.blocks()
            .into_iter()
            .filter_map(|(block, pages)| {
                let gs = self.info(block).gen_and_state();
                (gs.state() >= PageState::Allocating).then_some((block, pages, gs))
            })
            .collect()
    }

    pub fn sum_raw_stats(&self, gen_mask: u8) -> (u64, u64) {
        let mut objects = 0;
        let mut words = 0;
        for (block, _) in self.blocks() {
            let info = self.info(block);
            let gs = info.gen_and_state();
            if gs.gen_bits() & gen_mask != 0 && gs.state() == PageState::Allocated {
                objects += info.live_objs();
                words += info.live_words();
            }
        }
        (objects, words)
    }

    /// Pages of `gen` the space holds. Only reliable at a safepoint.
    pub fn verify_capacity(&self, gen: Gen) -> usize {
        let mut capacity = 0;
        for (block, pages) in self.blocks() {
            let gs = self.info(block).gen_and_state();
            if gs.gen() != Some(gen) {
                continue;
            }
            match gs.state() {
                PageState::Unmapped | PageState::Relocated => {}
                PageState::Allocated => capacity += pages,
                _ => panic!("Block {} in state {:?} during capacity verification", block, gs),
            }
        }
        capacity
    }
}
