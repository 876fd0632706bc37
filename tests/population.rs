//! Classifying pages by occupancy and picking relocation candidates.

use gpgc::collector::population::PopulationArray;
use gpgc::collector::CollectorKind;
use gpgc::util::heap::page_info::GenAndState;
use gpgc::util::test_util::fixtures::TestHeap;
use gpgc::{Gen, PageNum, PageState};

const OBJECTS_PER_PAGE: usize = 10;

/// Fill one small page per entry of `live` with ten objects, marking the first `live[i]` of them.
fn pages_with_live_objects(heap: &TestHeap, gen: Gen, live: &[usize]) -> Vec<PageNum> {
    let meta = heap.meta();
    let words = meta.words_in_page() / OBJECTS_PER_PAGE;
    let mut pages = vec![];
    for &marked in live {
        let objects: Vec<_> = (0..OBJECTS_PER_PAGE).map(|_| heap.alloc(gen, words)).collect();
        let page = meta.addr_to_page(objects[0]);
        assert!(objects.iter().all(|&o| meta.addr_to_page(o) == page));
        for &object in &objects[..marked] {
            heap.mark_object(object);
        }
        pages.push(page);
    }
    heap.generation(gen).clear_allocation_buffers();
    pages
}

#[test]
fn new_gc_orders_candidates_by_occupancy() {
    let heap = TestHeap::new();
    let pages = pages_with_live_objects(&heap, Gen::New, &[1, 9, 5, 0]);
    let mut population = PopulationArray::default();
    let mut skipped = PopulationArray::default();
    let mut released = vec![];
    let new_gen = heap.generation(Gen::New);
    let spike = heap.spike(CollectorKind::New);

    heap.spaces().small.new_gc_collect_sparse_populations(
        i64::MIN,
        &mut population,
        &mut skipped,
        &mut |page| {
            released.push(page);
            new_gen.release_empty(page, None, spike);
        },
    );
    population.sort_by_new_gc_relocation_priority();
    population.reset_max_cursor();

    assert_eq!(released, vec![pages[3]]);
    assert_eq!(population.released_pages(), 1);
    assert_eq!(
        heap.meta().info(pages[3]).gen_and_state(),
        GenAndState::new(None, PageState::Unmapped)
    );
    let order: Vec<PageNum> = population.selected().iter().map(|pop| pop.page).collect();
    assert_eq!(order, vec![pages[0], pages[2], pages[1]]);
    let occupancies: Vec<u32> = (0..population.len()).map(|i| population.occupancy(i)).collect();
    assert!(occupancies.windows(2).all(|w| w[0] < w[1]));

    // With a cutoff at 60% the nearly full page stays put.
    let words_in_page = heap.meta().words_in_page();
    population.occupancy_cutoff((words_in_page * 60 / 100) as u32);
    assert_eq!(population.max_cursor(), 2);
}

#[test]
fn old_gc_skips_the_boot_perm_page() {
    let heap = TestHeap::new();
    let pages = pages_with_live_objects(&heap, Gen::Perm, &[2, 3]);
    assert_eq!(pages[0], heap.meta().layout.small_space_start);
    let mut population = PopulationArray::default();
    let mut skipped = PopulationArray::default();

    heap.spaces().small.old_gc_collect_sparse_populations(
        0x3,
        0,
        false,
        &mut population,
        &mut skipped,
        &mut |page| panic!("{} is not empty", page),
    );
    population.reset_max_cursor();

    let selected: Vec<PageNum> = population.selected().iter().map(|pop| pop.page).collect();
    assert_eq!(selected, vec![pages[1]]);
}

#[test]
fn new_gc_leaves_old_space_out() {
    let heap = TestHeap::new();
    let old_pages = pages_with_live_objects(&heap, Gen::Old, &[1]);
    let new_pages = pages_with_live_objects(&heap, Gen::New, &[2]);
    let mut population = PopulationArray::default();
    let mut skipped = PopulationArray::default();

    heap.spaces().small.new_gc_collect_sparse_populations(
        i64::MIN,
        &mut population,
        &mut skipped,
        &mut |page| panic!("{} is not empty", page),
    );
    population.reset_max_cursor();

    let selected: Vec<PageNum> = population.selected().iter().map(|pop| pop.page).collect();
    assert_eq!(selected, new_pages);
    assert!(!selected.contains(&old_pages[0]));
    assert_eq!(skipped.skipped_pages(), 1);
}
