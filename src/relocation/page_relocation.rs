//! Relocation of whole pages: forwarding-table setup, the three ways pages move (copying small
//! objects out of a mirror, remapping mid objects, cloning large blocks), and the entry point the read
//! barrier takes when it traps on a relocated page.
//!
//! Setup happens with a memory batch open. Small pages are staged to move to their mirror, mid
//! objects to their target blocks and large blocks to their clones; nothing moves until the batch
//! commits at the relocation safepoint, together with the trap array swap that makes mutators see
//! the pages as relocated.

use crate::collector::population::{PopulationArray, RemapTargetArray};
use crate::collector::read_trap_array::TrapState;
use crate::collector::CollectorKind;
use crate::collector::interlock::InterlockName;
use crate::policy::generation::SpaceKind;
use crate::policy::space::HeapContext;
use crate::relocation::object_relocation::{relocate_object, RelocationState, RelocationTable};
use crate::relocation::reloc_buffer::RelocBuffers;
use crate::relocation::remap_buffer::RemapBuffers;
use crate::util::constants::{LOG_BYTES_IN_WORD, PAGES_IN_MID_BLOCK};
use crate::util::conversions::raw_align_up;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_audit::{why, why_for, AuditAction};
use crate::util::heap::page_info::{flags, Gen, PageState};
use crate::util::worker::WorkerContext;
use crate::util::Address;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Sleep between failed attempts of a mutator to heal a mid page.
const HEAL_RETRY_SLEEP: Duration = Duration::from_millis(1);
/// Failed attempts between warnings.
const HEAL_RETRY_WARN_INTERVAL: usize = 100;

fn collector_allocate(heap: &HeapContext, collector: CollectorKind, live_objects: usize) -> Option<(Address, usize)> {
    match collector {
        CollectorKind::New => heap.sideband.new_gc_allocate(live_objects),
        CollectorKind::Old => heap.sideband.old_gc_allocate(live_objects),
    }
}

/// Give every selected page of `arrays` a forwarding table, in order. When the arena runs out the
/// array at hand is cut at the first page without a table, and every later array is cut to nothing.
/// Returns the tables handed out.
pub fn allocate_sideband(
    heap: &HeapContext,
    collector: CollectorKind,
    arrays: &mut [&mut PopulationArray],
) -> usize {
    let _sideband = heap.interlocks.acquire(InterlockName::SidebandAlloc, collector);
    let mut tables = 0;
    let mut exhausted = false;
    for array in arrays.iter_mut() {
        if exhausted {
            if array.max_cursor() > 0 {
                array.sideband_limit_reclaim_cutoff(0);
            }
            continue;
        }
        for i in 0..array.max_cursor() {
            let page = array.page(i);
            let info = heap.meta().info(page);
            let live_objects = info.live_objs() as usize;
            match collector_allocate(heap, collector, live_objects) {
                Some((table, len)) => {
                    info.set_relocations(table.as_usize());
                    info.set_reloc_len(len);
                    tables += 1;
                }
                None => {
                    warn!(
                        "{} collector sideband arena exhausted at {} ({} of {} pages have tables)",
                        collector,
                        page,
                        i,
                        array.max_cursor()
                    );
                    array.sideband_limit_reclaim_cutoff(i);
                    exhausted = true;
                    break;
                }
            }
        }
    }
    tables
}

/// Fill the forwarding table of `page` from its live marks, make it `Relocating` towards `target`
/// and stage its remap trap. Small pages are staged to move to their mirror, from which their
/// objects are copied once the batch commits.
pub fn init_page_relocation(heap: &HeapContext, page: PageNum, target: Gen) {
    let meta = heap.meta();
    let layout = &meta.layout;
    let info = meta.info(page);
    let gen = info
        .gen()
        .unwrap_or_else(|| panic!("Relocating {} which holds no generation", page));
    let table = RelocationTable::of(info)
        .unwrap_or_else(|| panic!("Relocating {} without a forwarding table", page));
    let start = meta.page_to_addr(page);
    meta.marks
        .for_each_live_object(start, info.top(), |object| table.insert(object.words_from(start)));

    let small = layout.page_in_small_space(page);
    info.set_relocate_space(target);
    if !small {
        info.reset_unmap_free_stats();
    }
    info.transition(gen, PageState::Allocated, PageState::Relocating);
    let pages = if small { 1 } else { PAGES_IN_MID_BLOCK };
    let spaces = heap.spaces();
    spaces
        .traps
        .set_trap_state(page, pages, spaces.nmt.desired(gen), TrapState::remap_for(gen));
    if small {
        meta.memory
            .batched_relocate(start, layout.mirror_addr(start), layout.bytes_in_page);
        meta.audit(page, AuditAction::RemapToMirror, why_for(why::REMAP_TO_MIRROR, gen));
    }
    trace!("{} set up for relocation to {} ({} records)", page, target, table.len());
}

/// Stage the move of every live object of mid block `page` into target blocks, and record which
/// physical pages go where.
///
/// Each committed source page either travels with exactly one object, which credits it to the target
/// page it lands on, or is counted to be freed when the source is unmapped. Healing a target page
/// later settles its credits against the one page it ends up needing.
pub fn remap_mid_page(
    heap: &HeapContext,
    page: PageNum,
    buffers: &mut RemapBuffers,
    targets: &RemapTargetArray,
) {
    let meta = heap.meta();
    let layout = &meta.layout;
    let info = meta.info(page);
    debug_assert_eq!(info.state(), PageState::Relocating);
    let source = info.gen().unwrap_or_else(|| panic!("Remapping {} with no generation", page));
    let target = info
        .relocate_space()
        .unwrap_or_else(|| panic!("Remapping {} with no target generation", page));
    let table = RelocationTable::of(info)
        .unwrap_or_else(|| panic!("Remapping {} without a forwarding table", page));
    let base = meta.page_to_addr(page);
    let heap_base = layout.heap_base;
    let words_in_page = meta.words_in_page();
    let committed = heap.generation(source).committed_mid_pages(page);
    let objects = meta.marks.live_objects(base, info.top());
    let page_index = |addr: Address| meta.addr_to_page(addr).distance_from(page);

    let mut cursor = 0;
    let mut owned = 0;
    for (i, &object) in objects.iter().enumerate() {
        let words = heap.model.size_in_words(object);
        let alloc = raw_align_up(words, layout.mid_object_alignment_words);
        let new = buffers.allocate(heap, targets, source, target, alloc, info.time());
        meta.memory
            .batched_relocate(object, new, alloc << LOG_BYTES_IN_WORD);

        let offset = object.words_from(base);
        let record = table.lookup(offset);
        debug_assert_eq!(record.state(), RelocationState::Unclaimed);
        table
            .find(offset)
            .store(record.relocated_to(new.words_from(heap_base)).raw(), Ordering::Release);
        if heap.generation(target).marking_underway() {
            heap.mark_object_with_size(new, words);
        }
        if source != target {
            meta.cards.card_mark_across_region(new, new.plus_words(words));
        }

        let first = page_index(object);
        let last = page_index(object.plus_words(alloc) - 1usize);
        let shares_last = objects
            .get(i + 1)
            .is_some_and(|&next| page_index(next) == last);
        let end = if shares_last { last } else { last + 1 };
        let target_first = meta.addr_to_page(new);
        let target_last = meta.addr_to_page(new.plus_words(alloc) - 1usize);
        for p in cursor.max(first)..end {
            let credited = target_first.plus(p - first).min(target_last);
            meta.info(credited).increment_free_on_unshatter(words_in_page);
            owned += 1;
        }
        cursor = cursor.max(end);
    }
    debug_assert!(owned <= committed);
    if committed > owned {
        info.increment_free_on_unmap((committed - owned) as u64, words_in_page);
    }
    trace!(
        "{} remapped {} objects: {} of {} pages travel with them",
        page,
        objects.len(),
        owned,
        committed
    );
}

/// Stage the promotion of new large block `block` by remapping it whole into a fresh old block.
/// Returns false, leaving the block in place, when large space has no room for the clone.
pub fn clone_block(heap: &HeapContext, block: PageNum) -> bool {
    let meta = heap.meta();
    let layout = &meta.layout;
    let spaces = heap.spaces();
    let info = meta.info(block);
    let pages = info.block_size() as usize;
    let old = heap.generation(Gen::Old);
    let clone = spaces.large.select_block(pages, Gen::Old, old.marking_underway());
    if clone.is_none() {
        debug!("No room to promote large block {} of {} pages", block, pages);
        return false;
    }
    let start = meta.page_to_addr(block);
    let clone_start = meta.page_to_addr(clone);
    meta.memory
        .batched_relocate(start, clone_start, pages << layout.log_bytes_in_page);

    let words = info.top().words_from(start);
    let clone_info = meta.info(clone);
    meta.marks.clear_all_metadata(clone, pages);
    meta.cards.clear_card_marks(clone, pages);
    clone_info.set_top(clone_start.plus_words(words));
    clone_info.set_time(info.time());
    spaces.traps.init_trap(clone, pages, &spaces.nmt, Gen::Old, true);
    if old.marking_underway() {
        heap.mark_object_with_size(clone_start, words);
    }
    meta.cards
        .card_mark_across_region(clone_start, clone_start.plus_words(words));

    heap.generation(Gen::New).sub_capacity(SpaceKind::Large, pages);
    old.add_capacity(SpaceKind::Large, pages);
    old.count_allocated_pages(pages);
    meta.audit_block(clone, pages, AuditAction::AllocPage, why_for(why::CLONE_BLOCK, Gen::Old));

    info.set_ll_next(clone);
    info.transition(Gen::New, PageState::Allocated, PageState::Relocating);
    spaces.traps.set_trap_state(
        block,
        1,
        spaces.nmt.desired(Gen::New),
        TrapState::remap_for(Gen::New),
    );
    trace!("Large block {} of {} pages cloned to {}", block, pages, clone);
    true
}

/// A cloned block's memory has moved. At the relocation safepoint, after the batch commits.
pub fn cloned_block_relocated(heap: &HeapContext, block: PageNum) {
    heap.meta()
        .info(block)
        .transition(Gen::New, PageState::Relocating, PageState::Relocated);
    heap.generation(Gen::New).relocated_block(block);
}

/// Copy every object of small `page` out of its mirror, racing mutators that trap on them, then free
/// the mirror.
pub fn relocate_small_page(
    heap: &HeapContext,
    page: PageNum,
    buffers: &mut RelocBuffers,
    worker: &WorkerContext,
) {
    let meta = heap.meta();
    let info = meta.info(page);
    let source = info.gen().unwrap_or_else(|| panic!("Relocating {} with no generation", page));
    let target = info
        .relocate_space()
        .unwrap_or_else(|| panic!("Relocating {} with no target generation", page));
    let table = RelocationTable::of(info)
        .unwrap_or_else(|| panic!("Relocating {} without a forwarding table", page));
    let base = meta.page_to_addr(page);
    let time = info.time();
    let mut relocated = 0;
    for index in 0..table.len() {
        let record = table.load(index);
        if record.state() == RelocationState::Empty {
            continue;
        }
        let object = base.plus_words(record.old_offset());
        let copy_from = meta.layout.mirror_addr(object);
        relocate_object(
            heap,
            table.slot(index),
            object,
            copy_from,
            source,
            target,
            &mut |words| Some(buffers.allocate(heap, source, target, words, time, worker)),
        )
        .unwrap_or_else(|| panic!("GC relocation of {} failed", object));
        relocated += 1;
    }
    heap.generation(source)
        .relocated_page(page, heap.spike(CollectorKind::of(source)), Some(worker));
    trace!("{} relocated {} objects to {}", page, relocated, target);
}

/// Free what is left of remapped mid block `page` once its objects have moved. After the batch
/// commits.
pub fn mid_page_remapped(heap: &HeapContext, page: PageNum) {
    let source = heap
        .meta()
        .info(page)
        .gen()
        .unwrap_or_else(|| panic!("Remapped {} with no generation", page));
    heap.generation(source)
        .remapped_page(page, heap.spike(CollectorKind::of(source)));
}

// Healing remap targets

/// Turn shattered target page `page` back into a whole page, settling the page credits it received.
/// GC workers always succeed; a mutator may fail for lack of memory and must retry.
pub fn heal_mid_page(heap: &HeapContext, page: PageNum, worker: &WorkerContext) -> bool {
    let meta = heap.meta();
    let budget = &meta.budget;
    let info = meta.info(page);
    let credits = loop {
        if !info.has_flag(flags::UNSHATTER_FREE_STATS) {
            return true;
        }
        let credits = info.flags_count();
        let charged = credits == 0;
        if charged && !budget.account_for_allocate(1) {
            if !worker.is_gc_worker() {
                return false;
            }
            if !budget.consume_preallocated_page(worker) {
                budget.force_allocate(1);
            }
        }
        if info.set_first_unshatter() {
            if !unshatter(heap, page, worker) {
                if charged {
                    budget.account_for_deallocate(1);
                }
                info.atomic_clear_flag(flags::FIRST_UNSHATTER);
                return false;
            }
            break credits;
        }
        // Someone else is healing the page.
        if charged {
            budget.account_for_deallocate(1);
        }
        while info.has_flag(flags::FIRST_UNSHATTER) && info.has_flag(flags::UNSHATTER_FREE_STATS) {
            std::thread::yield_now();
        }
    };

    let collector = CollectorKind::of(
        info.relocate_space()
            .unwrap_or_else(|| panic!("Healing {} with no source generation", page)),
    );
    let spike = heap.spike(collector);
    if credits == 0 {
        spike.add_and_record_peak(1);
    } else if credits > 1 {
        budget.account_for_deallocate(credits as usize - 1);
        spike.subtract(credits as isize - 1);
    }
    let block = meta.layout.mid_space_base_page(page);
    let gen = meta
        .info(block)
        .gen()
        .unwrap_or_else(|| panic!("Healing {} of a block with no generation", page));
    heap.generation(gen).add_capacity(SpaceKind::Mid, 1);
    let taken = info.take_unshatter_free_count();
    debug_assert_eq!(taken, credits);
    trace!("Healed {} ({} credits)", page, credits);
    true
}

fn unshatter(heap: &HeapContext, page: PageNum, worker: &WorkerContext) -> bool {
    let meta = heap.meta();
    let start = meta.page_to_addr(page);
    let bytes = meta.layout.bytes_in_page;
    if worker.is_gc_worker() {
        meta.memory.unshatter_all(start, bytes);
        true
    } else {
        meta.memory.partial_unshatter(start, bytes, start)
    }
}

/// Heal `page` on behalf of a mutator, sleeping between failed attempts until memory is found.
pub fn mutator_heal_mid_page(heap: &HeapContext, page: PageNum, worker: &WorkerContext) {
    let mut attempts = 0;
    while !heal_mid_page(heap, page, worker) {
        attempts += 1;
        if attempts % HEAL_RETRY_WARN_INTERVAL == 0 {
            warn!("Mutator {} still waiting to heal {} after {} attempts", worker.ordinal(), page, attempts);
        }
        std::thread::sleep(HEAL_RETRY_SLEEP);
    }
}

/// Heal every page of target block `block` holding remapped objects, and drop the stats of the
/// pages past its top, which never will.
pub fn heal_mid_remapping_page(heap: &HeapContext, block: PageNum, worker: &WorkerContext) {
    let meta = heap.meta();
    let gen = meta
        .info(block)
        .gen()
        .unwrap_or_else(|| panic!("Healing block {} with no generation", block));
    let committed = heap.generation(gen).committed_mid_pages(block);
    for i in 0..PAGES_IN_MID_BLOCK {
        let page = block.plus(i);
        if i < committed {
            let healed = heal_mid_page(heap, page, worker);
            debug_assert!(healed);
            continue;
        }
        let info = meta.info(page);
        if info.has_flag(flags::UNSHATTER_FREE_STATS) && info.set_first_unshatter() {
            let credits = info.take_unshatter_free_count();
            assert_eq!(credits, 0, "Unused target page {} holds {} credits", page, credits);
        }
    }
}

// The read barrier's way in

/// The current address of `object`, on a page the read barrier found remap-trapped. Copies the object
/// first if no one has yet.
pub fn remap_reference(heap: &HeapContext, object: Address, worker: &WorkerContext) -> Address {
    let layout = &heap.meta().layout;
    let page = heap.meta().addr_to_page(object);
    if layout.page_in_small_space(page) {
        remap_small_reference(heap, page, object, worker)
    } else if layout.page_in_mid_space(page) {
        remap_mid_reference(heap, page, object, worker)
    } else {
        remap_large_reference(heap, page, object)
    }
}

fn remap_small_reference(heap: &HeapContext, page: PageNum, object: Address, worker: &WorkerContext) -> Address {
    let meta = heap.meta();
    let info = meta.info(page);
    let source = info.gen().unwrap_or_else(|| panic!("Remapping {} on a page with no generation", object));
    let target = info
        .relocate_space()
        .unwrap_or_else(|| panic!("Remapping {} on {} with no target generation", object, page));
    let table = RelocationTable::of(info)
        .unwrap_or_else(|| panic!("Remapping {} on {} without a forwarding table", object, page));
    let slot = table.find(object.words_from(meta.page_to_addr(page)));
    let copy_from = meta.layout.mirror_addr(object);
    let time = info.time();
    let mut attempts = 0usize;
    loop {
        if let Some(new) = relocate_object(heap, slot, object, copy_from, source, target, &mut |words| {
            heap.generation(target).allocate_for_relocate(source, words, time, worker)
        }) {
            return new;
        }
        attempts += 1;
        if attempts % HEAL_RETRY_WARN_INTERVAL == 0 {
            warn!("No memory to relocate {} after {} attempts", object, attempts);
        }
        std::thread::sleep(HEAL_RETRY_SLEEP);
    }
}

fn remap_mid_reference(heap: &HeapContext, page: PageNum, object: Address, worker: &WorkerContext) -> Address {
    let meta = heap.meta();
    let layout = &meta.layout;
    let block = layout.mid_space_base_page(page);
    let table = RelocationTable::of(meta.info(block))
        .unwrap_or_else(|| panic!("Remapping {} on {} without a forwarding table", object, block));
    let record = table.lookup(object.words_from(meta.page_to_addr(block)));
    assert_eq!(
        record.state(),
        RelocationState::Relocated,
        "Mid object {} not remapped: {:?}",
        object,
        record
    );
    let new = layout.heap_base.plus_words(record.new_index());
    let words = raw_align_up(heap.model.size_in_words(new), layout.mid_object_alignment_words);
    let first = meta.addr_to_page(new);
    let last = meta.addr_to_page(new.plus_words(words) - 1usize);
    let mut target = first;
    while target <= last {
        if worker.is_gc_worker() {
            heal_mid_page(heap, target, worker);
        } else {
            mutator_heal_mid_page(heap, target, worker);
        }
        target = target.plus(1);
    }
    new
}

fn remap_large_reference(heap: &HeapContext, page: PageNum, object: Address) -> Address {
    let meta = heap.meta();
    let block = heap.spaces().large.block_head(page);
    let clone = meta.info(block).ll_next();
    assert!(clone.is_some(), "Large block {} trapped with no clone", block);
    meta.page_to_addr(clone).plus_words(object.words_from(meta.page_to_addr(block)))
}
