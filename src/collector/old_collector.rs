//! The old generation collector, covering old and perm space.
//!
//! Marking works as in the new collector. Relocation runs in two rounds, perm pages first and then
//! old pages, each behind its own interlock so the new collector can promote into old space while
//! perm space is compacted. Large blocks are never moved; empty ones are freed.

use crate::collector::interlock::InterlockName;
use crate::collector::phases::{self, RelocationBatch};
use crate::collector::population::{PopulationArray, RemapTargetArray};
use crate::collector::population::Population;
use crate::collector::workers::GcWorkers;
use crate::collector::{CollectionState, CollectorKind};
use crate::policy::space::HeapContext;
use crate::relocation::page_relocation::allocate_sideband;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::Gen;
use crate::util::options::Options;
use atomic::Atomic;
use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

const KIND: CollectorKind = CollectorKind::Old;
/// Fragmented pages with no garbage are compacted one stripe of page numbers per cycle.
const FRAGMENT_STRIPE_MASK: u32 = 0x3;

/// One of the two relocation rounds of a cycle.
struct Round {
    gen: Gen,
    interlock: InterlockName,
    setup: CollectionState,
    safepoint: CollectionState,
    concurrent: CollectionState,
}

const PERM_ROUND: Round = Round {
    gen: Gen::Perm,
    interlock: InterlockName::OldGcRelocatePerm,
    setup: CollectionState::RelocationSetup,
    safepoint: CollectionState::RelocationSafepoint,
    concurrent: CollectionState::ConcurrentRelocation,
};

const OLD_ROUND: Round = Round {
    gen: Gen::Old,
    interlock: InterlockName::OldGcRelocateOld,
    setup: CollectionState::RelocationSetup2,
    safepoint: CollectionState::RelocationSafepoint2,
    concurrent: CollectionState::ConcurrentRelocation2,
};

pub struct OldCollector {
    state: Atomic<CollectionState>,
    population: AtomicRefCell<Population>,
    workers: GcWorkers,
    cycles: AtomicUsize,
}

impl OldCollector {
    pub fn new(options: &Options) -> Self {
        OldCollector {
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
        debug!("Old collector: {}", state);
        self.state.store(state, Ordering::Release);
    }

    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::Acquire)
    }

    /// Run one cycle on the calling thread.
    pub fn collect(&self, heap: &HeapContext) {
        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        assert_eq!(self.state(), CollectionState::NotCollecting, "Old collection already running");
        info!("Old GC cycle {} starting", cycle);
        let spaces = heap.spaces();
        let (old_gen, perm_gen) = (heap.generation(Gen::Old), heap.generation(Gen::Perm));

        self.set_state(CollectionState::CollectionStarting);
        spaces.small.clear_no_relocate(Gen::OLD_AND_PERM_MASK);
        spaces.mid.clear_no_relocate(Gen::OLD_AND_PERM_MASK);
        spaces.large.clear_no_relocate(Gen::OLD_AND_PERM_MASK);
        heap.spike(KIND).reset();
        self.workers.preallocate_pages(heap);

        self.set_state(CollectionState::MarkRemapSetup);
        {
            // No promotion may be half done while old references change their NMT bit.
            let _new_relocate = heap.interlocks.acquire(InterlockName::NewGcRelocate, KIND);
            let _batch = heap.interlocks.acquire(InterlockName::BatchedMemoryOps, KIND);
            phases::prepare_nmt_flip(heap, Gen::Old, Gen::OLD_AND_PERM_MASK);

            self.set_state(CollectionState::InitialMarkSafepoint);
            phases::at_safepoint(heap, KIND, CollectionState::InitialMarkSafepoint, || {
                for gen in [old_gen, perm_gen] {
                    gen.clear_allocation_buffers();
                    gen.set_marking(true);
                    gen.flush_relocation_pages();
                }
                spaces.nmt.toggle_old_nmt();
                spaces.traps.swap_readbarrier_arrays();
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
        old_gen.release_relocated_pages();
        perm_gen.release_relocated_pages();

        let mut population = self.population.borrow_mut();
        {
            // Selection runs alongside any promotion into old space by the new collector.
            let _old_relocate = heap.interlocks.acquire(InterlockName::OldGcRelocateOld, KIND);
            self.select_pages(heap, &mut population, cycle);
            old_gen.set_marking(false);
            perm_gen.set_marking(false);
        }
        if heap.options().old_gc_no_relocation {
            population.reset_populations();
        }

        let population = &mut *population;
        let Population {
            small_space_1,
            small_space_2,
            mid_space_1,
            mid_space_2,
            mid_space_targets,
            ..
        } = population;
        self.relocate(heap, &PERM_ROUND, small_space_2, mid_space_2, mid_space_targets);
        mid_space_targets.reset();
        self.relocate(heap, &OLD_ROUND, small_space_1, mid_space_1, mid_space_targets);

        self.set_state(CollectionState::CycleCleanup);
        heap.sideband.old_gc_reset();
        {
            let _clearing = heap.interlocks.acquire(InterlockName::OldGcMarkClearing, KIND);
            phases::clear_marks(heap, Gen::OLD_AND_PERM_MASK);
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

    /// One relocation round: compact the selected small and mid pages of `round.gen` in place.
    fn relocate(
        &self,
        heap: &HeapContext,
        round: &Round,
        small: &mut PopulationArray,
        mid: &mut PopulationArray,
        targets: &RemapTargetArray,
    ) {
        self.set_state(round.setup);
        let _relocate = heap.interlocks.acquire(round.interlock, KIND);
        let tables = allocate_sideband(heap, KIND, &mut [&mut *small, &mut *mid]);
        let batch = RelocationBatch {
            small: vec![(&*small, round.gen)],
            mid: vec![(&*mid, round.gen)],
        };
        debug!("{} round: {} forwarding tables for {} pages", round.gen, tables, batch.pages());
        {
            let _batch = heap.interlocks.acquire(InterlockName::BatchedMemoryOps, KIND);
            heap.meta().memory.start_batch();
            phases::setup_relocation(heap, &self.workers, &batch, targets);
            heap.spaces().traps.batched_array_swap();

            self.set_state(round.safepoint);
            phases::at_safepoint(heap, KIND, round.safepoint, || phases::commit_relocation(heap));
        }
        self.set_state(round.concurrent);
        phases::concurrent_relocation(heap, &self.workers, &batch, targets);
    }

    /// Classify old and perm space: `*_1` arrays hold old pages and `*_2` perm pages. Empty pages
    /// and blocks are freed on the way.
    fn select_pages(&self, heap: &HeapContext, population: &mut Population, cycle: usize) {
        population.reset_populations();
        let options = heap.options();
        let spaces = heap.spaces();
        let meta = heap.meta();
        let spike = heap.spike(KIND);
        let mut release = |page: PageNum| {
            let gen = meta
                .info(page)
                .gen()
                .unwrap_or_else(|| panic!("Releasing {} with no generation", page));
            heap.generation(gen).release_empty(page, None, spike);
        };
        let stripe = cycle as u32 & FRAGMENT_STRIPE_MASK;

        spaces.small.old_gc_collect_sparse_populations(
            FRAGMENT_STRIPE_MASK,
            stripe,
            options.no_perm_relocation,
            &mut population.small_space_1,
            &mut population.small_space_skipped_pages,
            &mut release,
        );
        if options.collect_mid_space {
            spaces.mid.old_gc_collect_sparse_populations(
                FRAGMENT_STRIPE_MASK,
                stripe,
                options.no_perm_relocation,
                &mut population.mid_space_1,
                &mut population.mid_space_skipped_pages,
                &mut release,
            );
        }
        if options.collect_large_space {
            spaces.large.old_gc_collect_blocks(
                &mut population.large_space_1,
                &mut population.large_space_2,
                options.no_perm_relocation,
                &mut release,
            );
        }

        let is_perm = |page: PageNum| meta.info(page).gen() == Some(Gen::Perm);
        let cutoff = (meta.words_in_page() * options.old_gc_occupancy_percent / 100) as u32;
        for (old, perm) in [
            (&mut population.small_space_1, &mut population.small_space_2),
            (&mut population.mid_space_1, &mut population.mid_space_2),
        ] {
            for pop in old.split_off(|pop| is_perm(pop.page)) {
                perm.add_page_pop(pop);
            }
            for array in [old, perm] {
                array.sort_by_old_gc_relocation_priority();
                array.reset_max_cursor();
                array.occupancy_cutoff(cutoff);
            }
        }
    }

    fn report(&self, heap: &HeapContext, cycle: usize, population: &Population) {
        let words_in_page = heap.meta().words_in_page();
        info!(
            "Old GC cycle {}: released {} empty pages, relocated {} pages ({} old, {} perm), \
             {} no-relocate pages, {} garbage words of {} collected, spike peak {} pages",
            cycle,
            population.total_released(),
            population.total_pops_to_relocate(),
            population.small_space_1.max_cursor() + population.mid_space_1.max_cursor(),
            population.small_space_2.max_cursor() + population.mid_space_2.max_cursor(),
            population.no_relocate_pages(),
            population.garbage_words_to_collect(words_in_page),
            population.total_garbage_words(words_in_page),
            heap.spike(KIND).peak()
        );
        let budget = &heap.meta().budget;
        budget.report_peak_usage("Old GC");
        budget.reset_peak_usage();
    }
}
