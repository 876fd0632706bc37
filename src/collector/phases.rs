//! Steps both collectors take the same way.

use crate::collector::interlock::InterlockName;
use crate::collector::population::{PopulationArray, RemapTargetArray};
use crate::collector::workers::GcWorkers;
use crate::collector::{CollectionState, CollectorKind};
use crate::policy::space::HeapContext;
use crate::relocation::page_relocation::{
    heal_mid_remapping_page, init_page_relocation, mid_page_remapped, relocate_small_page, remap_mid_page,
};
use crate::relocation::reloc_buffer::RelocBuffers;
use crate::relocation::remap_buffer::RemapBuffers;
use crate::util::heap::page_info::Gen;

/// Population entries claimed at a time by one worker.
pub const WORK_UNIT: usize = 4;

/// Run `f` with every mutator stopped. The two collectors' safepoints never overlap.
pub fn at_safepoint<R>(
    heap: &HeapContext,
    collector: CollectorKind,
    state: CollectionState,
    f: impl FnOnce() -> R,
) -> R {
    let _safepoint = heap.interlocks.acquire(InterlockName::GpgcSafepoint, collector);
    heap.hooks.begin_safepoint(heap, collector, state);
    let result = f();
    heap.hooks.end_safepoint(heap, collector, state);
    trace!("{} collector safepoint {} done", collector, state);
    result
}

/// Stage the flip of `gen`'s NMT bit in the staging trap array. Published by the next swap.
pub fn prepare_nmt_flip(heap: &HeapContext, gen: Gen, gen_mask: u8) {
    let spaces = heap.spaces();
    spaces.nmt.prepare_flip(gen);
    let mut pages = heap.pages_of(gen_mask).into_iter();
    spaces.traps.prepare_nmt_flip(spaces.nmt.upcoming(gen), &mut pages);
}

/// Drop the live marks and counts of every page in `gen_mask`.
pub fn clear_marks(heap: &HeapContext, gen_mask: u8) {
    let spaces = heap.spaces();
    spaces.small.clear_page_marks(gen_mask, 0, 1);
    spaces.mid.clear_page_marks(gen_mask, 0, 1);
    spaces.large.clear_page_marks(gen_mask);
    #[cfg(feature = "extreme_assertions")]
    {
        spaces.small.verify_no_live_marks(gen_mask);
        spaces.mid.verify_no_live_marks(gen_mask);
        spaces.large.verify_no_live_marks(gen_mask);
    }
}

/// The pages one relocation round moves, each array paired with the generation its objects go to.
pub struct RelocationBatch<'a> {
    pub small: Vec<(&'a PopulationArray, Gen)>,
    pub mid: Vec<(&'a PopulationArray, Gen)>,
}

impl RelocationBatch<'_> {
    pub fn pages(&self) -> usize {
        self.small
            .iter()
            .chain(&self.mid)
            .map(|(array, _)| array.max_cursor())
            .sum()
    }

    fn reset_cursors(&self) {
        for (array, _) in self.small.iter().chain(&self.mid) {
            array.reset_cursor();
        }
    }
}

/// Stage the moves of a relocation round. Run with a memory batch open: nothing moves until it
/// commits at the relocation safepoint.
pub fn setup_relocation(
    heap: &HeapContext,
    workers: &GcWorkers,
    batch: &RelocationBatch,
    targets: &RemapTargetArray,
) {
    debug_assert!(heap.meta().memory.batch_in_progress());
    for (array, target) in batch.small.iter().chain(&batch.mid) {
        for pop in array.selected() {
            init_page_relocation(heap, pop.page, *target);
        }
    }
    batch.reset_cursors();
    workers.run("mid space remap", |_| {
        let mut buffers = RemapBuffers::default();
        for (array, _) in &batch.mid {
            array.for_each_claimed(WORK_UNIT, |_, pop| {
                remap_mid_page(heap, pop.page, &mut buffers, targets);
            });
        }
        buffers.close_all();
    });
}

/// Publish the staged moves and traps. At the relocation safepoint.
pub fn commit_relocation(heap: &HeapContext) {
    heap.meta().memory.commit_batch();
    let swapped = heap.spaces().traps.commit_batched_array_swap();
    debug_assert!(swapped, "Relocation committed without a staged trap array swap");
}

/// Finish a committed relocation round: free the remapped mid blocks, heal their targets and copy
/// every small object no mutator has copied yet.
pub fn concurrent_relocation(
    heap: &HeapContext,
    workers: &GcWorkers,
    batch: &RelocationBatch,
    targets: &RemapTargetArray,
) {
    for (array, _) in &batch.mid {
        for pop in array.selected() {
            mid_page_remapped(heap, pop.page);
        }
    }
    batch.reset_cursors();
    let remap_targets = targets.snapshot();
    let stride = workers.len();
    workers.run("relocation", |worker| {
        for target in remap_targets.iter().skip(worker.ordinal()).step_by(stride) {
            heal_mid_remapping_page(heap, target.page, worker);
        }
        let mut buffers = RelocBuffers::default();
        for (array, _) in &batch.small {
            array.for_each_claimed(WORK_UNIT, |_, pop| {
                relocate_small_page(heap, pop.page, &mut buffers, worker);
            });
        }
        buffers.close_all(heap);
    });
}
