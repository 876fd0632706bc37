//! One generation: its allocation paths, relocation slots and capacity counters.
//!
//! A generation allocates from all three spaces. Small objects are bump-allocated in a shared small
//! page, mid objects in a shared mid block that commits its pages as the top crosses them, and large
//! objects get a block of their own. Objects of exactly one page get a whole small page.
//!
//! Shared pages stay `Allocating` while mutators may still be bumping their top. A filled page goes
//! onto a full list and is only closed to `Allocated` at the next safepoint, by
//! [`Generation::clear_allocation_buffers`].

use crate::collector::spike::RelocationSpike;
use crate::collector::CollectorKind;
use crate::policy::space::Spaces;
use crate::util::constants::{MAX_RELOCATION_SLOTS, PAGES_IN_MID_BLOCK, RELOCATION_SLOT_SPIN_LIMIT};
use crate::util::conversions::raw_align_up;
use crate::util::heap::heap_meta::HeapMeta;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_audit::{why, why_for, AuditAction};
use crate::util::heap::page_info::{flags, Gen, GenAndState, PageInfo, PageState, NO_RELOCATIONS};
use crate::util::worker::WorkerContext;
use crate::util::Address;
use crate::vm::ObjectModel;
use atomic::Atomic;
use crossbeam::utils::CachePadded;
use enum_map::{Enum, EnumMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// The three page spaces, for capacity bookkeeping.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum, strum_macros::Display)]
pub enum SpaceKind {
    Small,
    Mid,
    Large,
}

struct MidAllocation {
    page: PageNum,
    full_list: PageNum,
}

/// A slot mutators relocating objects on behalf of the collector allocate from.
#[derive(Default)]
struct RelocationSlot {
    lock: spin::Mutex<()>,
    page: Atomic<PageNum>,
}

/// Relocation pages, spread over up to `MAX_RELOCATION_SLOTS` slots by thread. More slots are
/// opened while threads keep colliding on the open ones.
struct RelocationPages {
    slots: Vec<CachePadded<RelocationSlot>>,
    top_slot: AtomicUsize,
    page_count: AtomicUsize,
}

impl RelocationPages {
    fn new() -> Self {
        RelocationPages {
            slots: (0..MAX_RELOCATION_SLOTS)
                .map(|_| {
                    CachePadded::new(RelocationSlot {
                        lock: spin::Mutex::new(()),
                        page: Atomic::new(PageNum::NONE),
                    })
                })
                .collect(),
            top_slot: AtomicUsize::new(1),
            page_count: AtomicUsize::new(0),
        }
    }

    fn expand(&self) {
        let top = self.top_slot.load(Ordering::Acquire);
        if top < MAX_RELOCATION_SLOTS {
            let _ = self
                .top_slot
                .compare_exchange(top, top + 1, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn flush(&self) -> usize {
        for slot in &self.slots {
            slot.page.store(PageNum::NONE, Ordering::Release);
        }
        self.top_slot.store(1, Ordering::Release);
        self.page_count.swap(0, Ordering::AcqRel)
    }
}

pub struct Generation {
    gen: Gen,
    spaces: Arc<Spaces>,
    marking_underway: AtomicBool,

    small_alloc_page: Atomic<PageNum>,
    /// Head of the list of filled small pages waiting to be closed.
    small_lock: Mutex<PageNum>,
    mid_lock: Mutex<MidAllocation>,

    relocation_pages: RelocationPages,
    promotion_pages: RelocationPages,
    /// Relocated source pages, waiting for the next marking cleanup.
    relocated_pages: Atomic<PageNum>,
    relocated_blocks: Mutex<Vec<PageNum>>,

    pages_allocated: AtomicUsize,
    capacity: EnumMap<SpaceKind, AtomicUsize>,
}

impl Generation {
    pub fn new(gen: Gen, spaces: Arc<Spaces>) -> Self {
        Generation {
            gen,
            spaces,
            marking_underway: AtomicBool::new(false),
            small_alloc_page: Atomic::new(PageNum::NONE),
            small_lock: Mutex::new(PageNum::NONE),
            mid_lock: Mutex::new(MidAllocation {
                page: PageNum::NONE,
                full_list: PageNum::NONE,
            }),
            relocation_pages: RelocationPages::new(),
            promotion_pages: RelocationPages::new(),
            relocated_pages: Atomic::new(PageNum::NONE),
            relocated_blocks: Mutex::new(vec![]),
            pages_allocated: AtomicUsize::new(0),
            capacity: EnumMap::default(),
        }
    }

    pub fn gen(&self) -> Gen {
        self.gen
    }

    fn meta(&self) -> &HeapMeta {
        &self.spaces.meta
    }

    fn info(&self, page: PageNum) -> &PageInfo {
        self.spaces.meta.info(page)
    }

    fn audit(&self, page: PageNum, action: AuditAction, site: u32) {
        self.meta().audit(page, action, why_for(site, self.gen));
    }

    /// Whether objects allocated in this generation must be born marked.
    pub fn marking_underway(&self) -> bool {
        self.marking_underway.load(Ordering::Acquire)
    }

    pub fn set_marking(&self, marking: bool) {
        self.marking_underway.store(marking, Ordering::Release);
    }

    fn new_page_flags(&self) -> u64 {
        if self.marking_underway() {
            flags::NO_RELOCATE
        } else {
            0
        }
    }

    // Capacity

    pub fn capacity(&self, space: SpaceKind) -> usize {
        self.capacity[space].load(Ordering::Acquire)
    }

    pub fn total_capacity(&self) -> usize {
        self.capacity.values().map(|c| c.load(Ordering::Acquire)).sum()
    }

    pub fn add_capacity(&self, space: SpaceKind, pages: usize) {
        self.capacity[space].fetch_add(pages, Ordering::AcqRel);
    }

    pub fn sub_capacity(&self, space: SpaceKind, pages: usize) {
        if let Err(current) = crate::util::heap::atomic_checked_update(&self.capacity[space], |c| {
            c.checked_sub(pages)
        }) {
            panic!(
                "{} {} space capacity underflow: removing {} from {}",
                self.gen, space, pages, current
            );
        }
    }

    /// Pages allocated since the counter was last taken, for the allocation rate.
    pub fn pages_allocated(&self) -> usize {
        self.pages_allocated.load(Ordering::Relaxed)
    }

    pub fn take_pages_allocated(&self) -> usize {
        self.pages_allocated.swap(0, Ordering::AcqRel)
    }

    pub fn count_allocated_pages(&self, pages: usize) {
        self.pages_allocated.fetch_add(pages, Ordering::Relaxed);
    }

    fn space_of(&self, page: PageNum) -> SpaceKind {
        let layout = &self.meta().layout;
        if layout.page_in_small_space(page) {
            SpaceKind::Small
        } else if layout.page_in_mid_space(page) {
            SpaceKind::Mid
        } else {
            SpaceKind::Large
        }
    }

    /// Pages of mid block `page` its top has crossed.
    pub fn committed_mid_pages(&self, page: PageNum) -> usize {
        let base = self.meta().page_to_addr(page);
        let top = self.info(page).top();
        if top > base {
            self.meta().addr_to_page(top - 1usize).distance_from(page) + 1
        } else {
            0
        }
    }

    /// Forget stale marks and cards on a page about to be handed out.
    fn clear_metadata(&self, page: PageNum, pages: usize) {
        self.meta().marks.clear_all_metadata(page, pages);
        self.meta().cards.clear_card_marks(page, pages);
    }

    fn init_trap(&self, page: PageNum, pages: usize, in_large_space: bool) {
        self.spaces
            .traps
            .init_trap(page, pages, &self.spaces.nmt, self.gen, in_large_space);
    }

    // Mutator allocation

    /// Allocate `words` words. `None` when the page budget or the space is exhausted.
    pub fn allocate(&self, words: usize, is_tlab: bool) -> Option<Address> {
        let layout = &self.meta().layout;
        debug_assert!(words > 0);
        if words == layout.words_in_page {
            self.allocate_full_page(is_tlab)
        } else if words < layout.mid_min_object_words {
            self.allocate_small(words)
        } else if words < layout.large_min_object_words {
            self.allocate_mid(words)
        } else {
            self.allocate_large(words)
        }
    }

    /// Select a small page and commit it. Returns the page still `Unmapped` and unpublished.
    fn select_and_commit_small_page(&self) -> Option<PageNum> {
        let page = self.spaces.small.select_page();
        if page.is_none() {
            return None;
        }
        if !self.meta().budget.allocate_page(page) {
            self.spaces.small.return_available_page(page);
            self.audit(page, AuditAction::FailedAlloc, why::NEW_SMALL_PAGE);
            return None;
        }
        self.audit(page, AuditAction::AllocPage, why::NEW_SMALL_PAGE);
        self.count_allocated_pages(1);
        self.add_capacity(SpaceKind::Small, 1);
        self.clear_metadata(page, 1);
        Some(page)
    }

    fn allocate_full_page(&self, is_tlab: bool) -> Option<Address> {
        let page = self.select_and_commit_small_page()?;
        let info = self.info(page);
        let base = self.meta().page_to_addr(page);
        let tlab = if is_tlab { flags::TLAB } else { 0 };
        info.set_flags_non_atomic(self.new_page_flags() | tlab);
        info.zero_raw_stats();
        info.set_time(if is_tlab { 0 } else { self.meta().now_millis() });
        info.set_top(self.meta().page_to_addr(page.plus(1)));
        self.init_trap(page, 1, false);
        info.set_gen_and_state(Some(self.gen), PageState::Allocated);
        self.audit(page, AuditAction::AllocPage, why::FULL_SMALL_PAGE);
        Some(base)
    }

    fn allocate_small(&self, words: usize) -> Option<Address> {
        loop {
            let page = self.small_alloc_page.load(Ordering::Acquire);
            if page.is_some() {
                let info = self.info(page);
                let end = self.meta().page_to_addr(page.plus(1));
                let mut top = info.top();
                while top.plus_words(words) <= end {
                    match info.cas_top(top, top.plus_words(words)) {
                        Ok(_) => return Some(top),
                        Err(actual) => top = actual,
                    }
                }
            }
            let mut full_list = self.small_lock.lock().unwrap();
            if self.small_alloc_page.load(Ordering::Acquire) != page {
                // Another thread replaced the page while we waited for the lock.
                continue;
            }
            let new_page = self.select_and_commit_small_page()?;
            if page.is_some() {
                let info = self.info(page);
                info.set_time(self.meta().now_millis());
                info.set_ll_next(*full_list);
                *full_list = page;
            }
            let info = self.info(new_page);
            let base = self.meta().page_to_addr(new_page);
            info.set_flags_non_atomic(self.new_page_flags());
            info.zero_raw_stats();
            info.set_time(0);
            info.set_top(base.plus_words(words));
            self.init_trap(new_page, 1, false);
            info.set_gen_and_state(Some(self.gen), PageState::Allocating);
            self.small_alloc_page.store(new_page, Ordering::Release);
            return Some(base);
        }
    }

    /// Take a fresh mid block for `mid`, closing the current one. The block's pages are committed by
    /// the caller as the top crosses them.
    fn new_mid_page(&self, mid: &mut MidAllocation) -> Option<PageNum> {
        if mid.page.is_some() {
            self.info(mid.page).set_time(self.meta().now_millis());
            self.info(mid.page).set_ll_next(mid.full_list);
            mid.full_list = mid.page;
            mid.page = PageNum::NONE;
        }
        let page = self.spaces.mid.select_page();
        if page.is_none() {
            return None;
        }
        let info = self.info(page);
        self.clear_metadata(page, PAGES_IN_MID_BLOCK);
        info.set_flags_non_atomic(self.new_page_flags());
        info.zero_raw_stats();
        info.set_time(0);
        info.set_top(self.meta().page_to_addr(page));
        self.init_trap(page, PAGES_IN_MID_BLOCK, false);
        info.set_gen_and_state(Some(self.gen), PageState::Allocating);
        self.audit(page, AuditAction::AllocPage, why::NEW_MID_PAGE);
        mid.page = page;
        Some(page)
    }

    fn allocate_mid(&self, words: usize) -> Option<Address> {
        let layout = &self.meta().layout;
        let alloc = raw_align_up(words, layout.mid_object_alignment_words);
        let mut mid = self.mid_lock.lock().unwrap();
        let mut fresh = false;
        if mid.page.is_none()
            || self
                .info(mid.page)
                .top()
                .plus_words(alloc)
                > self.meta().page_to_addr(mid.page.plus(PAGES_IN_MID_BLOCK))
        {
            self.new_mid_page(&mut mid)?;
            fresh = true;
        }
        let page = mid.page;
        let info = self.info(page);
        let base = self.meta().page_to_addr(page);
        let top = info.top();
        let new_top = top.plus_words(alloc);

        let first_uncommitted = if top == base {
            page
        } else {
            self.meta().addr_to_page(top - 1usize).plus(1)
        };
        let last_needed = self.meta().addr_to_page(new_top - 1usize);
        if last_needed >= first_uncommitted {
            let count = last_needed.distance_from(first_uncommitted) + 1;
            if !self.meta().budget.allocate_pages(first_uncommitted, count) {
                self.audit(page, AuditAction::FailedAlloc, why::MID_SUB_PAGES_FAILED);
                if fresh {
                    info.set_gen_and_state(None, PageState::Unmapped);
                    self.spaces.mid.return_available_page(page);
                    mid.page = PageNum::NONE;
                }
                return None;
            }
            self.audit(page, AuditAction::AllocPage, why::MID_SUB_PAGES);
            self.count_allocated_pages(count);
            self.add_capacity(SpaceKind::Mid, count);
        }
        info.set_top(new_top);
        Some(top)
    }

    fn allocate_large(&self, words: usize) -> Option<Address> {
        let layout = &self.meta().layout;
        let pages = raw_align_up(words, layout.words_in_page) / layout.words_in_page;
        let block = self
            .spaces
            .large
            .select_block(pages, self.gen, self.marking_underway());
        if block.is_none() {
            return None;
        }
        if !self.meta().budget.allocate_pages(block, pages) {
            self.meta()
                .audit_block(block, pages, AuditAction::FailedAlloc, why_for(why::MULTI_PAGE, self.gen));
            self.spaces.large.return_available_block(block);
            return None;
        }
        let info = self.info(block);
        let base = self.meta().page_to_addr(block);
        self.clear_metadata(block, pages);
        info.set_top(base.plus_words(words));
        info.set_time(self.meta().now_millis());
        self.init_trap(block, pages, true);
        self.count_allocated_pages(pages);
        self.add_capacity(SpaceKind::Large, pages);
        self.meta()
            .audit_block(block, pages, AuditAction::AllocPage, why_for(why::MULTI_PAGE, self.gen));
        Some(base)
    }

    /// Close the shared allocation pages. Only at a safepoint: no mutator may be bumping a top.
    pub fn clear_allocation_buffers(&self) {
        let now = self.meta().now_millis();
        {
            let mut full_list = self.small_lock.lock().unwrap();
            let current = self.small_alloc_page.swap(PageNum::NONE, Ordering::AcqRel);
            if current.is_some() {
                self.info(current).set_time(now);
                self.info(current).set_ll_next(*full_list);
                *full_list = current;
            }
            let page = std::mem::replace(&mut *full_list, PageNum::NONE);
            self.close_full_pages(page, why::CLOSE_SHARED_SMALL);
        }
        {
            let mut mid = self.mid_lock.lock().unwrap();
            if mid.page.is_some() {
                self.info(mid.page).set_time(now);
                self.info(mid.page).set_ll_next(mid.full_list);
                mid.full_list = mid.page;
                mid.page = PageNum::NONE;
            }
            let page = std::mem::replace(&mut mid.full_list, PageNum::NONE);
            self.close_full_pages(page, why::CLOSE_SHARED_MID);
        }
    }

    fn close_full_pages(&self, mut page: PageNum, site: u32) {
        while page.is_some() {
            let info = self.info(page);
            let next = info.ll_next();
            info.set_ll_next(PageNum::NONE);
            info.transition(self.gen, PageState::Allocating, PageState::Allocated);
            self.audit(page, AuditAction::CloseShared, site);
            page = next;
        }
    }

    // Relocation targets

    fn relocation_pages(&self, source_gen: Gen) -> &RelocationPages {
        if source_gen == self.gen {
            &self.relocation_pages
        } else {
            &self.promotion_pages
        }
    }

    /// A committed small page for objects relocated from `source_gen`, published `state` with its top
    /// at `base + words`. Mutators pass no worker and fail when the budget is exhausted; GC workers
    /// fall back on their spare page, and past that on a forced charge.
    pub fn allocate_small_relocation_page(
        &self,
        source_gen: Gen,
        words: usize,
        time: i64,
        worker: Option<&WorkerContext>,
        state: PageState,
    ) -> Option<PageNum> {
        let page = self.spaces.small.select_page();
        assert!(page.is_some(), "Small space exhausted relocating {} objects", source_gen);
        let budget = &self.meta().budget;
        if !budget.allocate_page(page) {
            match worker {
                Some(worker) if budget.get_preallocated_page(worker, page) => {
                    self.audit(page, AuditAction::GetPreAlloc, why::GC_SMALL_RELOCATION_PAGE);
                    budget.preallocate_page(worker);
                }
                Some(_) => {
                    budget.force_allocate(1);
                    let memory = &self.meta().memory;
                    if !memory.commit(self.meta().page_to_addr(page), self.meta().layout.bytes_in_page) {
                        panic!("Unable to commit relocation page {}", page);
                    }
                }
                None => {
                    self.spaces.small.return_available_page(page);
                    self.audit(page, AuditAction::FailedAlloc, why::RELOCATION_PAGE);
                    return None;
                }
            }
        }
        let site = if worker.is_some() {
            why::GC_SMALL_RELOCATION_PAGE
        } else {
            why::RELOCATION_PAGE
        };
        self.audit(page, AuditAction::AllocPage, site);
        if source_gen != self.gen {
            self.count_allocated_pages(1);
        }
        self.add_capacity(SpaceKind::Small, 1);
        self.spaces.spikes[CollectorKind::of(source_gen)].add_and_record_peak(1);

        let info = self.info(page);
        self.clear_metadata(page, 1);
        info.set_flags_non_atomic(self.new_page_flags());
        info.zero_raw_stats();
        info.set_time(time);
        info.set_top(self.meta().page_to_addr(page).plus_words(words));
        self.init_trap(page, 1, false);
        info.set_gen_and_state(Some(self.gen), state);
        Some(page)
    }

    /// Space for an object relocated from `source_gen`. A mutator gets `None` when the page budget is
    /// exhausted and backs off to retry; a GC worker falls back on its spare page.
    pub fn allocate_for_relocate(
        &self,
        source_gen: Gen,
        words: usize,
        time: i64,
        worker: &WorkerContext,
    ) -> Option<Address> {
        let pages = self.relocation_pages(source_gen);
        let mut spins = 0;
        loop {
            let top_slot = pages.top_slot.load(Ordering::Acquire);
            let slot = &pages.slots[worker.relocation_hash() % top_slot];
            let page = slot.page.load(Ordering::Acquire);
            if page.is_some() {
                let info = self.info(page);
                let end = self.meta().page_to_addr(page.plus(1));
                let top = info.top();
                if top.plus_words(words) <= end {
                    if info.cas_top(top, top.plus_words(words)).is_ok() {
                        return Some(top);
                    }
                    spins += 1;
                    if spins > RELOCATION_SLOT_SPIN_LIMIT {
                        pages.expand();
                        spins = 0;
                    }
                    continue;
                }
            }
            let _lock = slot.lock.lock();
            if slot.page.load(Ordering::Acquire) != page {
                continue;
            }
            let new_page = self.allocate_small_relocation_page(
                source_gen,
                words,
                time,
                worker.is_gc_worker().then_some(worker),
                PageState::Allocated,
            )?;
            slot.page.store(new_page, Ordering::Release);
            pages.page_count.fetch_add(1, Ordering::Relaxed);
            return Some(self.meta().page_to_addr(new_page));
        }
    }

    /// Drop the relocation slots' pages. At a safepoint; the pages stay allocated.
    pub fn flush_relocation_pages(&self) -> usize {
        self.relocation_pages.flush()
    }

    pub fn flush_promotion_pages(&self) -> usize {
        self.promotion_pages.flush()
    }

    /// A mid block to remap objects from `source_gen` into. The block is not committed: remapped
    /// pages bring their memory with them, and the rest is filled in when the block is healed.
    pub fn allocate_mid_remapping_page(&self, source_gen: Gen) -> PageNum {
        let page = self.spaces.mid.select_page();
        assert!(page.is_some(), "Mid space exhausted remapping {} objects", source_gen);
        self.audit(page, AuditAction::GetForRemap, why::MID_REMAPPING_PAGE);
        self.clear_metadata(page, PAGES_IN_MID_BLOCK);
        let info = self.info(page);
        info.set_flags_non_atomic(self.new_page_flags());
        info.zero_raw_stats();
        info.set_time(0);
        info.set_top(self.meta().page_to_addr(page));
        for i in 0..PAGES_IN_MID_BLOCK {
            let page_info = self.info(page.plus(i));
            if i > 0 {
                page_info.set_flags_non_atomic(0);
            }
            page_info.reset_unshatter_free_stats();
            page_info.set_relocate_space(source_gen);
        }
        self.init_trap(page, PAGES_IN_MID_BLOCK, false);
        info.set_gen_and_state(Some(self.gen), PageState::Allocated);
        page
    }

    // Retiring pages

    fn push_relocated_page(&self, page: PageNum) {
        let info = self.info(page);
        let mut head = self.relocated_pages.load(Ordering::Acquire);
        loop {
            info.set_ll_next(head);
            match self
                .relocated_pages
                .compare_exchange(head, page, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Every object of small `page` has been copied. Free the mirror holding its old contents.
    pub fn relocated_page(&self, page: PageNum, spike: &RelocationSpike, worker: Option<&WorkerContext>) {
        let info = self.info(page);
        info.transition(self.gen, PageState::Relocating, PageState::Relocated);
        let mirror = self.meta().layout.mirror_page(page);
        let freed = self.meta().budget.deallocate_mapped_page(worker, mirror);
        self.audit(page, AuditAction::FreeMirror, why::FREE_MIRROR);
        self.sub_capacity(SpaceKind::Small, 1);
        if freed {
            spike.subtract(1);
        }
        self.push_relocated_page(page);
    }

    /// Every object of mid block `page` has been remapped away. Free what is left of it.
    pub fn remapped_page(&self, page: PageNum, spike: &RelocationSpike) {
        let info = self.info(page);
        info.transition(self.gen, PageState::Relocating, PageState::Relocated);
        let layout = &self.meta().layout;
        self.meta()
            .memory
            .uncommit(layout.page_to_addr(page), layout.bytes_in_mid_block());
        self.audit(page, AuditAction::FreePage, why::FREE_REMAPPED);
        // Pages credited to a target went with the objects; the rest leave the heap here.
        let freed = info.unmap_free_count() as usize;
        self.meta().budget.account_for_deallocate(freed);
        self.sub_capacity(SpaceKind::Mid, self.committed_mid_pages(page));
        spike.subtract(freed as isize);
        self.push_relocated_page(page);
    }

    /// A large block whose object was cloned elsewhere. Released with the relocated pages.
    pub fn relocated_block(&self, block: PageNum) {
        self.relocated_blocks.lock().unwrap().push(block);
    }

    /// Make the pages relocated in the previous cycle selectable again. No reference to them can
    /// remain once a marking pass has remapped every reference.
    pub fn release_relocated_pages(&self) -> usize {
        let layout = &self.meta().layout;
        let mut released = 0;
        let mut page = self.relocated_pages.swap(PageNum::NONE, Ordering::AcqRel);
        while page.is_some() {
            let info = self.info(page);
            let next = info.ll_next();
            debug_assert_eq!(info.state(), PageState::Relocated);
            let (space, pages) = if layout.page_in_small_space(page) {
                (&self.spaces.small, 1)
            } else {
                (&self.spaces.mid, PAGES_IN_MID_BLOCK)
            };
            self.spaces.traps.clear_trap_on_page(page, pages);
            self.audit(page, AuditAction::Released, why::RELEASE_RELOCATED_PAGE);
            info.set_relocations(NO_RELOCATIONS);
            info.set_reloc_len(0);
            self.clear_metadata(page, pages);
            info.set_gen_and_state(None, PageState::Unmapped);
            if self.spaces.options.reuse_freed_pages {
                space.hold_page_for_tlb_resync(page);
            } else {
                space.retire_page(page);
            }
            released += pages;
            page = next;
        }
        let blocks = std::mem::take(&mut *self.relocated_blocks.lock().unwrap());
        for block in blocks {
            let pages = self.info(block).block_size() as usize;
            self.spaces.traps.clear_trap_on_block(block, pages);
            self.meta()
                .audit_block(block, pages, AuditAction::FreePage, why_for(why::RELEASE_RELOCATED_BLOCK, self.gen));
            self.info(block).set_ll_next(PageNum::NONE);
            self.clear_metadata(block, pages);
            if self.spaces.options.reuse_freed_pages {
                self.spaces.large.return_available_block(block);
            } else {
                self.spaces.large.retire_block(block);
            }
            released += pages;
        }
        if released > 0 {
            debug!("{}: released {} relocated pages", self.gen, released);
        }
        released
    }

    /// Free a small page or mid block found with no live objects.
    pub fn release_empty_page(&self, page: PageNum, worker: Option<&WorkerContext>, spike: &RelocationSpike) {
        let info = self.info(page);
        assert_eq!(
            info.gen_and_state(),
            GenAndState::new(Some(self.gen), PageState::Allocated),
            "Releasing empty {}",
            page
        );
        let layout = &self.meta().layout;
        let budget = &self.meta().budget;
        let (space, kind, pages, freed) = if layout.page_in_small_space(page) {
            let freed = budget.deallocate_mapped_page(worker, page) as usize;
            (&self.spaces.small, SpaceKind::Small, 1, freed)
        } else {
            let pages = self.committed_mid_pages(page);
            let freed = budget.deallocate_mapped_block(worker, page, pages);
            (&self.spaces.mid, SpaceKind::Mid, pages, freed)
        };
        info.set_gen_and_state(None, PageState::Unmapped);
        spike.subtract(freed as isize);
        self.sub_capacity(kind, pages);
        self.audit(page, AuditAction::FreePage, why::RELEASE_EMPTY_PAGE);
        if self.spaces.options.reuse_freed_pages {
            space.hold_page_for_tlb_resync(page);
        } else {
            space.retire_page(page);
        }
    }

    pub fn release_empty_block(&self, block: PageNum, worker: Option<&WorkerContext>, spike: &RelocationSpike) {
        let info = self.info(block);
        assert_eq!(info.state(), PageState::Allocated, "Releasing empty block {}", block);
        let pages = info.block_size() as usize;
        let freed = self.meta().budget.deallocate_mapped_block(worker, block, pages);
        spike.subtract(freed as isize);
        self.sub_capacity(SpaceKind::Large, pages);
        self.meta()
            .audit_block(block, pages, AuditAction::FreePage, why_for(why::RELEASE_EMPTY_BLOCK, self.gen));
        if self.spaces.options.reuse_freed_pages {
            self.spaces.large.hold_block_for_tlb_resync(block);
        } else {
            self.spaces.large.retire_block(block);
        }
    }

    pub fn release_empty(&self, page: PageNum, worker: Option<&WorkerContext>, spike: &RelocationSpike) {
        match self.space_of(page) {
            SpaceKind::Large => self.release_empty_block(page, worker, spike),
            _ => self.release_empty_page(page, worker, spike),
        }
    }

    // Walking and verification

    /// Visit every object of the generation. Not safe against concurrent allocation.
    pub fn object_iterate(&self, model: &dyn ObjectModel, f: &mut dyn FnMut(Address)) {
        self.spaces.small.object_iterate(self.gen, model, f);
        self.spaces.mid.object_iterate(self.gen, model, f);
        self.spaces.large.object_iterate(self.gen, model, f);
    }

    /// Check the capacity counters against a scan of the spaces. At a safepoint.
    pub fn verify_capacity(&self) {
        let scanned: EnumMap<SpaceKind, usize> = enum_map::enum_map! {
            SpaceKind::Small => self.spaces.small.verify_capacity(self.gen),
            SpaceKind::Mid => self.spaces.mid.verify_capacity(self.gen),
            SpaceKind::Large => self.spaces.large.verify_capacity(self.gen),
        };
        for (space, pages) in scanned {
            assert_eq!(
                self.capacity(space),
                pages,
                "{} {} space capacity counter disagrees with the space",
                self.gen,
                space
            );
        }
        trace!("{} capacity verified: {:?}", self.gen, scanned);
    }
}
