//! The heap context: the page spaces, the three generations, both collectors and the relocation
//! state, created once and passed to everything that touches the heap.

use crate::collector::interlock::{InterlockName, Interlocks};
use crate::collector::new_collector::NewCollector;
use crate::collector::nmt::Nmt;
use crate::collector::old_collector::OldCollector;
use crate::collector::read_trap_array::{ReadTrapArray, TrapState};
use crate::collector::spike::RelocationSpike;
use crate::collector::{CollectionHooks, CollectionState, CollectorKind};
use crate::policy::generation::{Generation, SpaceKind};
use crate::relocation::object_relocation::MAX_OLD_OFFSET;
use crate::relocation::page_relocation;
use crate::relocation::sideband::SidebandArena;
use crate::util::constants::{LARGE_MIN_PAGES, PAGES_IN_MID_BLOCK};
use crate::util::heap::heap_meta::HeapMeta;
use crate::util::heap::layout::PageNum;
use crate::util::heap::multi_page_space::MultiPageSpace;
use crate::util::heap::one_page_space::OnePageSpace;
use crate::util::heap::page_info::{Gen, PageState};
use crate::util::memory::{MmapMemory, VirtualMemory};
use crate::util::options::Options;
use crate::util::worker::WorkerContext;
use crate::util::Address;
use crate::vm::ObjectModel;
use enum_map::{enum_map, EnumMap};
use std::fmt;
use std::sync::Arc;

/// Why a heap could not be created.
#[derive(Debug)]
pub enum HeapError {
    /// The options describe a heap that cannot be laid out.
    InvalidOption(String),
    /// The address range for the heap or one of its side structures could not be reserved.
    Reservation(std::io::Error),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeapError::InvalidOption(msg) => write!(f, "invalid heap option: {}", msg),
            HeapError::Reservation(e) => write!(f, "unable to reserve the heap: {}", e),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::InvalidOption(_) => None,
            HeapError::Reservation(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for HeapError {
    fn from(e: std::io::Error) -> Self {
        HeapError::Reservation(e)
    }
}

/// The page spaces and the structures every generation shares.
pub struct Spaces {
    pub options: Options,
    pub meta: Arc<HeapMeta>,
    pub small: OnePageSpace,
    pub mid: OnePageSpace,
    pub large: MultiPageSpace,
    pub traps: ReadTrapArray,
    pub nmt: Nmt,
    pub spikes: EnumMap<CollectorKind, RelocationSpike>,
}

fn check_options(options: &Options) -> Result<(), HeapError> {
    if options.large_space_pages < LARGE_MIN_PAGES {
        return Err(HeapError::InvalidOption(format!(
            "large space of {} pages cannot hold a large object",
            options.large_space_pages
        )));
    }
    let words_in_mid_block = (PAGES_IN_MID_BLOCK << options.log_bytes_in_page) >> 3;
    if words_in_mid_block > MAX_OLD_OFFSET + 1 {
        return Err(HeapError::InvalidOption(format!(
            "pages of 2^{} bytes are too large for forwarding records",
            options.log_bytes_in_page
        )));
    }
    if options.sideband_percent == 0 {
        return Err(HeapError::InvalidOption("no sideband arena".to_string()));
    }
    Ok(())
}

pub struct HeapContext {
    spaces: Arc<Spaces>,
    generations: EnumMap<Gen, Generation>,
    pub model: Arc<dyn ObjectModel>,
    pub hooks: Arc<dyn CollectionHooks>,
    pub interlocks: Interlocks,
    pub sideband: SidebandArena,
    new_collector: NewCollector,
    old_collector: OldCollector,
}

impl HeapContext {
    /// A heap on anonymous memory.
    pub fn new(
        options: Options,
        model: Arc<dyn ObjectModel>,
        hooks: Arc<dyn CollectionHooks>,
    ) -> Result<Self, HeapError> {
        Self::new_with_memory(options, Arc::new(MmapMemory::new()), model, hooks)
    }

    pub fn new_with_memory(
        options: Options,
        memory: Arc<dyn VirtualMemory>,
        model: Arc<dyn ObjectModel>,
        hooks: Arc<dyn CollectionHooks>,
    ) -> Result<Self, HeapError> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("Initialized the logger."),
            Err(_) => debug!("Failed to initialize the logger. Possibly a logger has been initialized by user."),
        }
        check_options(&options)?;
        // One spare page per GC worker of either collector.
        let preallocated_pages = 2 * options.gc_threads;
        let meta = Arc::new(HeapMeta::new(&options, memory, preallocated_pages)?);
        let layout = &meta.layout;
        let spaces = Arc::new(Spaces {
            small: OnePageSpace::new(meta.clone(), layout.small_space_start, layout.small_space_end, true),
            mid: OnePageSpace::new(meta.clone(), layout.mid_space_start, layout.mid_space_end, false),
            large: MultiPageSpace::new(meta.clone(), layout.large_space_start, layout.large_space_end),
            traps: ReadTrapArray::new(layout.heap_pages())?,
            nmt: Nmt::default(),
            spikes: EnumMap::default(),
            options: options.clone(),
            meta: meta.clone(),
        });
        let sideband = SidebandArena::new(
            layout.sideband_words.max(1),
            options.sideband_max_percent.clamp(50, 100),
            options.sideband_padding_percent,
        )?;
        let generations = enum_map! {
            gen => Generation::new(gen, spaces.clone()),
        };
        info!(
            "Heap of {} pages of {} bytes: {} small, {} mid blocks, {} large; budget {} pages",
            layout.heap_pages(),
            layout.bytes_in_page,
            options.small_space_pages,
            options.mid_space_blocks,
            options.large_space_pages,
            options.max_heap_pages
        );
        Ok(HeapContext {
            generations,
            model,
            hooks,
            interlocks: Interlocks::new(),
            sideband,
            new_collector: NewCollector::new(&options),
            old_collector: OldCollector::new(&options),
            spaces,
        })
    }

    pub fn options(&self) -> &Options {
        &self.spaces.options
    }

    pub fn meta(&self) -> &HeapMeta {
        &self.spaces.meta
    }

    pub fn spaces(&self) -> &Spaces {
        &self.spaces
    }

    pub fn generation(&self, gen: Gen) -> &Generation {
        &self.generations[gen]
    }

    pub fn spike(&self, collector: CollectorKind) -> &RelocationSpike {
        &self.spaces.spikes[collector]
    }

    pub fn new_collector(&self) -> &NewCollector {
        &self.new_collector
    }

    pub fn old_collector(&self) -> &OldCollector {
        &self.old_collector
    }

    /// The phase of the collector responsible for `gen`.
    pub fn collector_state(&self, gen: Gen) -> CollectionState {
        match CollectorKind::of(gen) {
            CollectorKind::New => self.new_collector.state(),
            CollectorKind::Old => self.old_collector.state(),
        }
    }

    // Allocation

    /// Allocate an object of `words` words in `gen`. When the heap is full, asks for a collection
    /// and retries a bounded number of times before giving up.
    pub fn allocate(&self, gen: Gen, words: usize) -> Option<Address> {
        self.allocate_with_retries(gen, words, false)
    }

    /// A whole small page for a thread-local allocation buffer.
    pub fn allocate_tlab(&self, gen: Gen) -> Option<Address> {
        self.allocate_with_retries(gen, self.meta().words_in_page(), true)
    }

    fn allocate_with_retries(&self, gen: Gen, words: usize, is_tlab: bool) -> Option<Address> {
        assert!(words > 0, "Allocating an empty object");
        let mut attempts = 0;
        loop {
            if let Some(result) = self.generation(gen).allocate(words, is_tlab) {
                return Some(result);
            }
            if attempts >= self.options().allocation_retries {
                warn!(
                    "Allocation of {} words in {} failed after {} collections",
                    words, gen, attempts
                );
                return None;
            }
            attempts += 1;
            debug!("Allocation of {} words in {} failed, requesting a collection", words, gen);
            self.hooks.request_collection(self, gen);
        }
    }

    // Marking

    /// The page whose statistics count objects on `page`: the block head for mid and large pages.
    pub fn base_page(&self, page: PageNum) -> PageNum {
        let layout = &self.meta().layout;
        if layout.page_in_mid_space(page) {
            layout.mid_space_base_page(page)
        } else if layout.page_in_large_space(page) {
            self.spaces.large.block_head(page)
        } else {
            page
        }
    }

    /// Set the live bit of `object`. Returns true if this call marked it.
    pub fn mark_object(&self, object: Address) -> bool {
        if self.meta().marks.is_marked_live(object) {
            return false;
        }
        let words = self.model.size_in_words(object);
        self.mark_object_with_size(object, words)
    }

    /// Mark `object`, already known to be `words` words, and count it in its page's statistics.
    pub fn mark_object_with_size(&self, object: Address, words: usize) -> bool {
        debug_assert!(self.meta().layout.addr_in_heap_range(object));
        if !self.meta().marks.mark_live_if_not(object) {
            return false;
        }
        let page = self.base_page(self.meta().addr_to_page(object));
        self.meta().info(page).add_live_object(words as u64);
        true
    }

    pub fn is_marked(&self, object: Address) -> bool {
        self.meta().marks.is_marked_live(object)
    }

    // Read barrier

    /// The NMT value a reference to `object` must carry to pass the barrier untrapped.
    pub fn expected_nmt(&self, object: Address) -> bool {
        let page = self.meta().addr_to_page(object);
        let gen = self
            .meta()
            .info(self.base_page(page))
            .gen()
            .unwrap_or_else(|| panic!("Reference {} to {} which holds no generation", object, page));
        self.spaces.nmt.desired(gen)
    }

    /// Check a reference to `object` loaded with NMT bit `nmt` against the trap array. Returns the
    /// address to use: the object itself, or its new location if it was relocated.
    pub fn read_barrier(&self, object: Address, nmt: bool, worker: &WorkerContext) -> Address {
        let page = self.meta().addr_to_page(object);
        let trap = self.spaces.traps.read_trap(page, nmt);
        match trap {
            TrapState::UnTrapped => object,
            TrapState::Invalid | TrapState::Clear => {
                panic!("Reference {} to {} with trap state {}", object, page, trap)
            }
            _ => {
                let object = if trap.is_remap_trapped() {
                    page_relocation::remap_reference(self, object, worker)
                } else {
                    object
                };
                if trap.is_nmt_trapped() {
                    self.hooks.nmt_trapped(self, object);
                }
                object
            }
        }
    }

    // Pinning

    /// Keep the object at `object` from moving. Only mid and large objects can be pinned.
    pub fn pin(&self, object: Address) {
        let layout = &self.meta().layout;
        let page = self.meta().addr_to_page(object);
        let state = |gen| self.collector_state(gen);
        if layout.page_in_mid_space(page) {
            self.spaces.mid.pin_page(layout.mid_space_base_page(page), state);
        } else if layout.page_in_large_space(page) {
            self.spaces.large.pin_block(self.spaces.large.block_head(page), state);
        } else {
            panic!("Pinning small space object {}", object);
        }
    }

    pub fn unpin(&self, object: Address) {
        let layout = &self.meta().layout;
        let page = self.meta().addr_to_page(object);
        if layout.page_in_mid_space(page) {
            self.spaces.mid.unpin_page(layout.mid_space_base_page(page));
        } else if layout.page_in_large_space(page) {
            self.spaces.large.unpin_block(self.spaces.large.block_head(page));
        } else {
            panic!("Unpinning small space object {}", object);
        }
    }

    // Collection

    /// Run one new generation collection cycle on the calling thread.
    pub fn collect_new(&self) {
        self.new_collector.collect(self);
    }

    /// Run one old and perm generation collection cycle on the calling thread.
    pub fn collect_old(&self) {
        self.old_collector.collect(self);
    }

    /// Make the pages freed since the last resync selectable again, once no stale translation can
    /// reach them.
    pub fn tlb_resync(&self, collector: CollectorKind) {
        let _resync = self.interlocks.acquire(InterlockName::TlbResync, collector);
        let staged = self.spaces.small.prepare_for_tlb_resync()
            + self.spaces.mid.prepare_for_tlb_resync()
            + self.spaces.large.prepare_for_tlb_resync();
        self.meta().memory.invalidate_tlb();
        let published = self.spaces.small.tlb_resync_occurred()
            + self.spaces.mid.tlb_resync_occurred()
            + self.spaces.large.tlb_resync_occurred();
        debug!(
            "{} collector TLB resync: {} pages staged, {} made available",
            collector, staged, published
        );
    }

    /// Every page of the generations in `gen_mask` that can be referenced: mid blocks and large
    /// blocks contribute all of their pages.
    pub fn pages_of(&self, gen_mask: u8) -> Vec<PageNum> {
        let mut pages = vec![];
        for space in [&self.spaces.small, &self.spaces.mid] {
            let step = space.block_size();
            let mut page = space.start_page();
            let top = space.top_page();
            while page < top {
                let gs = self.meta().info(page).gen_and_state();
                if gs.gen_bits() & gen_mask != 0 && gs.state() >= PageState::Allocating {
                    pages.extend((0..step).map(|i| page.plus(i)));
                }
                page = page.plus(step);
            }
        }
        for (block, len, gs) in self.spaces.large.allocated_blocks() {
            if gs.gen_bits() & gen_mask != 0 {
                pages.extend((0..len).map(|i| block.plus(i)));
            }
        }
        pages
    }

    /// Visit the dirty card runs of old and perm pages, for finding old-to-new references. `f`
    /// returns true to keep a run dirty. Returns the runs visited.
    pub fn scan_card_marks(&self, f: &mut dyn FnMut(Address, Address) -> bool) -> usize {
        let _scan = self
            .interlocks
            .acquire(InterlockName::NewGcCardMarkScan, CollectorKind::New);
        let cards = &self.meta().cards;
        let mut runs = 0;
        for space in [&self.spaces.small, &self.spaces.mid] {
            let step = space.block_size();
            let mut page = space.start_page();
            let top = space.top_page();
            while page < top {
                let gs = self.meta().info(page).gen_and_state();
                if gs.gen_bits() & Gen::OLD_AND_PERM_MASK != 0
                    && matches!(gs.state(), PageState::Allocating | PageState::Allocated)
                {
                    runs += cards.scan_cardmarks(page, step, &mut *f);
                }
                page = page.plus(step);
            }
        }
        for (block, chunk, chunks) in self.spaces.large.cardmark_chunks(self.options().gc_threads) {
            let (start, pages) = self.spaces.large.chunk_range(block, chunk, chunks);
            runs += cards.scan_cardmarks(start, pages, &mut *f);
        }
        runs
    }

    // Iteration and reporting

    /// Visit every object of every generation. Not safe against concurrent allocation or relocation.
    pub fn object_iterate(&self, f: &mut dyn FnMut(Address)) {
        for gen in [Gen::New, Gen::Old, Gen::Perm] {
            self.generation(gen).object_iterate(&*self.model, f);
        }
    }

    /// Allocated pages and unusable tail words of the generations in `gen_mask`.
    pub fn page_and_frag_words_count(&self, gen_mask: u8) -> (usize, usize) {
        let (small_pages, small_frag) = self.spaces.small.page_and_frag_words_count(gen_mask);
        let (mid_pages, mid_frag) = self.spaces.mid.page_and_frag_words_count(gen_mask);
        let (large_pages, large_frag) = self.spaces.large.page_and_frag_words_count(gen_mask);
        (
            small_pages + mid_pages + large_pages,
            small_frag + mid_frag + large_frag,
        )
    }

    /// Live objects and live words marked in the generations in `gen_mask`.
    pub fn sum_raw_stats(&self, gen_mask: u8) -> (u64, u64) {
        [
            self.spaces.small.sum_raw_stats(gen_mask),
            self.spaces.mid.sum_raw_stats(gen_mask),
            self.spaces.large.sum_raw_stats(gen_mask),
        ]
        .iter()
        .fold((0, 0), |(objects, words), (o, w)| (objects + o, words + w))
    }

    /// Check every generation's capacity counters against the spaces. At a safepoint.
    pub fn verify_capacity(&self, gen_mask: u8) {
        for gen in [Gen::New, Gen::Old, Gen::Perm] {
            if gen.bits() & gen_mask != 0 {
                self.generation(gen).verify_capacity();
            }
        }
    }

    /// Log the capacity of every generation and the page budget.
    pub fn report(&self) {
        for gen in [Gen::New, Gen::Old, Gen::Perm] {
            let generation = self.generation(gen);
            info!(
                "{}: {} pages (small {}, mid {}, large {})",
                gen,
                generation.total_capacity(),
                generation.capacity(SpaceKind::Small),
                generation.capacity(SpaceKind::Mid),
                generation.capacity(SpaceKind::Large)
            );
        }
        let budget = &self.meta().budget;
        info!(
            "Page budget: {} used of {}, {} pause pages, {} preallocated",
            budget.used_pages(),
            budget.committed_budget(),
            budget.pause_pages(),
            budget.preallocated_pages()
        );
    }
}
