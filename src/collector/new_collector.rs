//! The new generation collector.
//!
//! A cycle marks new space, frees empty pages, and relocates sparse pages: pages allocated before
//! the promotion threshold move to the old generation, the rest are compacted within new space.
//! Large blocks old enough to be promoted are remapped whole into old space.

use crate::collector::interlock::InterlockName;
use crate::collector::phases::{self, RelocationBatch};
use crate::collector::population::Population;
use crate::collector::workers::GcWorkers;
use crate::collector::{CollectionState, CollectorKind};
use crate::policy::space::HeapContext;
use crate::relocation::page_relocation::{allocate_sideband, clone_block, cloned_block_relocated};
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::Gen;
use crate::util::options::Options;
use atomic::Atomic;
use atomic_refcell::AtomicRefCell;
use itertools::Itertools;
use std::sync::atomic::{AtomicUsize, Ordering};

const KIND: CollectorKind = CollectorKind::New;

pub struct NewCollector {
    state: Atomic<CollectionState>,
    population: AtomicRefCell<Population>,
    workers: GcWorkers,
    cycles: AtomicUsize,
}

impl NewCollector {
    pub fn new(options: &Options) -> Self {
        NewCollector {
            state: Atomic::new(CollectionState::NotCollecting),
            population: AtomicRefCell::new(Population::new(
                options.small_space_pages,
                options.mid_space_blocks,
                options.large_space_pages,
            )),
            workers: GcWorkers::new(KIND, options.gc_threads),
            cycles: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> CollectionState {
        self.state.load(Ordering::Acquire)
    }

    fn set_state(&self, state: CollectionState) {
        debug!("New collector: {}", state);
        self.state.store(state, Ordering::Release);
    }

    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::Acquire)
    }

    /// Run one cycle on the calling thread.
    pub fn collect(&self, heap: &HeapContext) {
        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        assert_eq!(self.state(), CollectionState::NotCollecting, "New collection already running");
        info!("New GC cycle {} starting", cycle);
        let spaces = heap.spaces();
        let new_gen = heap.generation(Gen::New);

        self.set_state(CollectionState::CollectionStarting);
        spaces.small.clear_no_relocate(Gen::NEW_GEN_MASK);
        spaces.mid.clear_no_relocate(Gen::NEW_GEN_MASK);
        spaces.large.clear_no_relocate(Gen::NEW_GEN_MASK);
        heap.spike(KIND).reset();
        self.workers.preallocate_pages(heap);

        self.set_state(CollectionState::MarkRemapSetup);
        {
            let _flip = heap.interlocks.acquire(InterlockName::NewGcNmtFlipping, KIND);
            let _batch = heap.interlocks.acquire(InterlockName::BatchedMemoryOps, KIND);
            phases::prepare_nmt_flip(heap, Gen::New, Gen::NEW_GEN_MASK);

            self.set_state(CollectionState::InitialMarkSafepoint);
            phases::at_safepoint(heap, KIND, CollectionState::InitialMarkSafepoint, || {
                new_gen.clear_allocation_buffers();
                new_gen.set_marking(true);
                let flushed = new_gen.flush_relocation_pages() + heap.generation(Gen::Old).flush_promotion_pages();
                spaces.nmt.toggle_new_nmt();
                spaces.traps.swap_readbarrier_arrays();
                trace!("{} relocation pages flushed", flushed);
            });
        }

        self.set_state(CollectionState::ConcurrentMarking);
        heap.hooks.mark(heap, KIND);
        self.set_state(CollectionState::WeakRefSafepoint);
        phases::at_safepoint(heap, KIND, CollectionState::WeakRefSafepoint, || ());
        self.set_state(CollectionState::ConcurrentRefProcessing);
        heap.hooks.process_references(heap, KIND);
        self.set_state(CollectionState::FinalMarkSafepoint);
        phases::at_safepoint(heap, KIND, CollectionState::FinalMarkSafepoint, || ());
        self.set_state(CollectionState::ConcurrentWeakMarking);
        heap.hooks.weak_marking(heap, KIND);

        self.set_state(CollectionState::MarkingCleanup);
        // Marking has remapped every reference into the pages relocated last cycle.
        new_gen.release_relocated_pages();

        self.set_state(CollectionState::RelocationSetup);
        let _relocate = heap.interlocks.acquire(InterlockName::NewGcRelocate, KIND);
        let _old_relocate = heap.interlocks.acquire(InterlockName::OldGcRelocateOld, KIND);
        let mut population = self.population.borrow_mut();
        self.select_pages(heap, &mut population);
        new_gen.set_marking(false);
        if heap.options().new_gc_no_relocation {
            population.reset_populations();
        }
        let population = &mut *population;
        let tables = allocate_sideband(
            heap,
            KIND,
            &mut [
                &mut population.small_space_1,
                &mut population.mid_space_1,
                &mut population.small_space_2,
                &mut population.mid_space_2,
            ],
        );
        let population = &*population;
        let batch = RelocationBatch {
            small: vec![(&population.small_space_1, Gen::New), (&population.small_space_2, Gen::Old)],
            mid: vec![(&population.mid_space_1, Gen::New), (&population.mid_space_2, Gen::Old)],
        };
        population.set_source_pages_to_new_gen(
            population.small_space_1.max_cursor() + population.mid_space_1.max_cursor(),
        );
        population.set_source_pages_to_old_gen(
            population.small_space_2.max_cursor() + population.mid_space_2.max_cursor(),
        );
        debug!("{} forwarding tables for {} pages", tables, batch.pages());

        {
            let _batch = heap.interlocks.acquire(InterlockName::BatchedMemoryOps, KIND);
            heap.meta().memory.start_batch();
            phases::setup_relocation(heap, &self.workers, &batch, &population.mid_space_targets);
            let cloned: Vec<PageNum> = population
                .large_space_2
                .selected()
                .iter()
                .map(|pop| pop.page)
                .filter(|&block| clone_block(heap, block))
                .collect();
            spaces.traps.batched_array_swap();

            self.set_state(CollectionState::RelocationSafepoint);
            phases::at_safepoint(heap, KIND, CollectionState::RelocationSafepoint, || {
                phases::commit_relocation(heap);
                for &block in &cloned {
                    cloned_block_relocated(heap, block);
                }
            });
            debug!("{} large blocks promoted", cloned.len());
        }

        self.set_state(CollectionState::ConcurrentRelocation);
        phases::concurrent_relocation(heap, &self.workers, &batch, &population.mid_space_targets);
        drop(_old_relocate);
        drop(_relocate);

        self.set_state(CollectionState::CycleCleanup);
        heap.sideband.new_gc_reset();
        {
            let _clearing = heap.interlocks.acquire(InterlockName::NewGcMarkClearing, KIND);
            phases::clear_marks(heap, Gen::NEW_GEN_MASK);
        }
        heap.tlb_resync(KIND);
        self.workers.release_preallocated_pages(heap);
        if heap.options().verify_capacity {
            phases::at_safepoint(heap, KIND, CollectionState::CycleCleanup, || {
                heap.verify_capacity(Gen::NEW_GEN_MASK | Gen::OLD_AND_PERM_MASK);
            });
        }
        self.report(heap, cycle, population);
        self.set_state(CollectionState::NotCollecting);
    }

    /// Classify new space into the population arrays: `*_1` for pages compacted within new space,
    /// `*_2` for pages promoted. Empty pages are freed on the way.
    fn select_pages(&self, heap: &HeapContext, population: &mut Population) {
        population.reset_populations();
        let options = heap.options();
        let spaces = heap.spaces();
        let new_gen = heap.generation(Gen::New);
        let spike = heap.spike(KIND);
        let threshold = heap
            .meta()
            .now_millis()
            .saturating_sub(options.promotion_threshold_ms as i64);
        let mut release = |page: PageNum| new_gen.release_empty(page, None, spike);

        spaces.small.new_gc_collect_sparse_populations(
            threshold,
            &mut population.small_space_1,
            &mut population.small_space_skipped_pages,
            &mut release,
        );
        if options.collect_mid_space {
            spaces.mid.new_gc_collect_sparse_populations(
                threshold,
                &mut population.mid_space_1,
                &mut population.mid_space_skipped_pages,
                &mut release,
            );
        }
        if options.collect_large_space {
            spaces.large.new_gc_collect_blocks(
                threshold,
                &mut population.large_space_1,
                &mut population.large_space_2,
                &mut release,
            );
        }

        for (staying, promoting) in [
            (&mut population.small_space_1, &mut population.small_space_2),
            (&mut population.mid_space_1, &mut population.mid_space_2),
        ] {
            for pop in staying.split_off(|pop| pop.time_stripe < threshold) {
                promoting.add_page_pop(pop);
            }
            staying.sort_by_new_gc_relocation_priority();
            promoting.sort_by_new_gc_relocation_priority();
        }
        population.reset_max_cursor();

        // Promotion takes every old enough page; compaction only the sparse ones.
        let cutoff = (heap.meta().words_in_page() * options.relocation_occupancy_percent / 100) as u32;
        population.small_space_1.occupancy_cutoff(cutoff);
        population.mid_space_1.occupancy_cutoff(cutoff);
    }

    fn report(&self, heap: &HeapContext, cycle: usize, population: &Population) {
        let words_in_page = heap.meta().words_in_page();
        let arrays = [
            ("small", &population.small_space_1, &population.small_space_2),
            ("mid", &population.mid_space_1, &population.mid_space_2),
            ("large", &population.large_space_1, &population.large_space_2),
        ];
        let selected = arrays
            .iter()
            .map(|(name, staying, promoting)| {
                format!("{} {}+{}", name, staying.max_cursor(), promoting.max_cursor())
            })
            .join(", ");
        info!(
            "New GC cycle {}: {} pages allocated since the last cycle, released {} empty pages, \
             relocated [{}] ({} pages compacted, {} promoted), {} garbage words of {} collected, \
             {} words left by sideband limit, spike peak {} pages",
            cycle,
            heap.generation(Gen::New).take_pages_allocated(),
            population.total_released(),
            selected,
            population.source_pages_to_new_gen(),
            population.source_pages_to_old_gen(),
            population.garbage_words_to_collect(words_in_page),
            population.total_garbage_words(words_in_page),
            population.sideband_limited_words(),
            heap.spike(KIND).peak()
        );
        let budget = &heap.meta().budget;
        budget.report_peak_usage("New GC");
        budget.reset_peak_usage();
    }
}
