//! Whole collection cycles on a test heap: compaction, promotion and release of empty pages.

use gpgc::collector::CollectionState;
use gpgc::util::heap::page_info::{flags, GenAndState};
use gpgc::util::test_util::fixtures::{payload, TestHeap};
use gpgc::util::test_util::test_options;
use gpgc::{Address, Gen, PageNum, PageState, WorkerContext};
use std::thread;
use std::time::Duration;

/// A heap that never promotes: every page stays younger than the threshold.
fn compacting_heap() -> TestHeap {
    let mut options = test_options();
    options.promotion_threshold_ms = 1_000_000;
    TestHeap::with_options(options)
}

fn page_of(heap: &TestHeap, object: Address) -> PageNum {
    heap.base_page(heap.meta().addr_to_page(object))
}

fn gen_of(heap: &TestHeap, object: Address) -> Option<Gen> {
    heap.meta().info(page_of(heap, object)).gen()
}

/// Where a mutator finds `object` now.
fn resolve(heap: &TestHeap, object: Address) -> Address {
    let mutator = WorkerContext::mutator(0);
    heap.read_barrier(object, heap.expected_nmt(object), &mutator)
}

#[test]
fn new_gc_compacts_sparse_small_pages() {
    let heap = compacting_heap();
    let live = heap.alloc_with(Gen::New, 16, 0xC0FFEE);
    for _ in 0..20 {
        heap.alloc(Gen::New, 64);
    }
    let root = heap.add_root(live);
    let source = page_of(&heap, live);

    heap.collect_new();

    assert_eq!(heap.new_collector().cycles(), 1);
    assert_eq!(heap.new_collector().state(), CollectionState::NotCollecting);
    assert_eq!(heap.test_hooks().marking_passes(), 1);
    assert!(heap.test_hooks().safepoints() >= 3);
    assert_eq!(heap.meta().info(source).state(), PageState::Relocated);

    let moved = resolve(&heap, heap.root(root));
    assert_ne!(moved, live);
    assert_eq!(gen_of(&heap, moved), Some(Gen::New));
    assert_eq!(payload(moved), 0xC0FFEE);
    assert_eq!(heap.model.size_in_words(moved), 16);
}

#[test]
fn marking_heals_roots_and_frees_relocated_pages() {
    let heap = compacting_heap();
    let live = heap.alloc_with(Gen::New, 16, 42);
    heap.alloc(Gen::New, 512);
    let root = heap.add_root(live);
    let source = page_of(&heap, live);

    heap.collect_new();
    heap.collect_new();

    let healed = heap.root(root);
    assert_ne!(healed, live);
    assert_eq!(resolve(&heap, healed), healed);
    assert_eq!(payload(healed), 42);
    assert_eq!(
        heap.meta().info(source).gen_and_state(),
        GenAndState::new(None, PageState::Unmapped)
    );
}

#[test]
fn new_gc_releases_empty_pages() {
    let heap = compacting_heap();
    let words_in_page = heap.meta().words_in_page();
    let garbage = heap.alloc(Gen::New, words_in_page);
    let page = page_of(&heap, garbage);
    assert_eq!(heap.generation(Gen::New).capacity(gpgc::policy::generation::SpaceKind::Small), 1);

    heap.collect_new();

    assert_eq!(
        heap.meta().info(page).gen_and_state(),
        GenAndState::new(None, PageState::Unmapped)
    );
    assert_eq!(heap.generation(Gen::New).total_capacity(), 0);
    // The resync at the end of the cycle made the page selectable again.
    assert_eq!(page_of(&heap, heap.alloc(Gen::New, words_in_page)), page);
}

#[test]
fn new_gc_promotes_aged_pages() {
    let heap = TestHeap::new();
    let words_in_page = heap.meta().words_in_page();
    let live = heap.alloc_with(Gen::New, words_in_page, 7);
    let root = heap.add_root(live);
    thread::sleep(Duration::from_millis(20));

    heap.collect_new();

    let moved = resolve(&heap, heap.root(root));
    assert_ne!(moved, live);
    assert_eq!(gen_of(&heap, moved), Some(Gen::Old));
    assert_eq!(payload(moved), 7);
    assert_eq!(heap.model.size_in_words(moved), words_in_page);
}

#[test]
fn new_gc_remaps_mid_blocks() {
    let heap = compacting_heap();
    let layout = &heap.meta().layout;
    let words = layout.mid_min_object_words * 2;
    heap.alloc(Gen::New, words);
    let live = heap.alloc_with(Gen::New, words, 0xBEEF);
    heap.alloc(Gen::New, words);
    let root = heap.add_root(live);

    heap.collect_new();

    let moved = resolve(&heap, heap.root(root));
    assert!(layout.page_in_mid_space(heap.meta().addr_to_page(moved)));
    assert_eq!(gen_of(&heap, moved), Some(Gen::New));
    assert_eq!(payload(moved), 0xBEEF);
    assert_eq!(heap.model.size_in_words(moved), words);
}

#[test]
fn pinned_mid_blocks_stay_put() {
    let heap = compacting_heap();
    let words = heap.meta().layout.mid_min_object_words * 2;
    heap.alloc(Gen::New, words);
    let pinned = heap.alloc_with(Gen::New, words, 0x1234);
    let root = heap.add_root(pinned);
    let block = page_of(&heap, pinned);
    heap.pin(pinned);
    heap.pin(pinned);

    heap.collect_new();

    assert_eq!(resolve(&heap, heap.root(root)), pinned);
    assert_eq!(heap.meta().info(block).state(), PageState::Allocated);
    assert_eq!(payload(pinned), 0x1234);

    heap.unpin(pinned);
    assert!(heap.meta().info(block).has_flag(flags::PINNED));
    heap.unpin(pinned);
    assert!(!heap.meta().info(block).has_flag(flags::PINNED));
}

#[test]
fn card_scan_visits_dirty_old_pages() {
    let heap = TestHeap::new();
    let old = heap.alloc(Gen::Old, 64);
    let young = heap.alloc(Gen::New, 64);
    let cards = &heap.meta().cards;
    let field = old.plus_words(4);
    cards.card_mark(field);
    cards.card_mark(young);

    let mut runs = vec![];
    let visited = heap.scan_card_marks(&mut |start, end| {
        runs.push((start, end));
        true
    });
    assert_eq!(visited, 1);
    assert!(runs[0].0 <= field && field < runs[0].1);
    // Kept dirty, so the next scan sees it again; new space is never scanned.
    assert!(cards.is_card_marked(field));
    assert!(cards.is_card_marked(young));

    assert_eq!(heap.scan_card_marks(&mut |_, _| false), 1);
    assert!(!cards.is_card_marked(field));
    assert_eq!(heap.scan_card_marks(&mut |_, _| false), 0);
}

#[test]
fn new_gc_promotes_large_blocks_whole() {
    let heap = TestHeap::new();
    let words = heap.meta().layout.large_min_object_words;
    let live = heap.alloc_with(Gen::New, words, 0xAB);
    let root = heap.add_root(live);
    thread::sleep(Duration::from_millis(20));

    heap.collect_new();

    let moved = resolve(&heap, heap.root(root));
    assert!(heap.meta().layout.page_in_large_space(heap.meta().addr_to_page(moved)));
    assert_eq!(gen_of(&heap, moved), Some(Gen::Old));
    assert_eq!(payload(moved), 0xAB);
}

#[test]
fn old_gc_compacts_old_pages() {
    let heap = TestHeap::new();
    let live = heap.alloc_with(Gen::Old, 32, 0x0DD);
    for _ in 0..30 {
        heap.alloc(Gen::Old, 128);
    }
    let root = heap.add_root(live);
    let source = page_of(&heap, live);

    heap.collect_old();

    assert_eq!(heap.old_collector().cycles(), 1);
    assert_eq!(heap.old_collector().state(), CollectionState::NotCollecting);
    assert_eq!(heap.meta().info(source).state(), PageState::Relocated);
    let moved = resolve(&heap, heap.root(root));
    assert_ne!(moved, live);
    assert_eq!(gen_of(&heap, moved), Some(Gen::Old));
    assert_eq!(payload(moved), 0x0DD);
}

#[test]
fn old_gc_leaves_new_space_alone() {
    let heap = compacting_heap();
    let young = heap.alloc_with(Gen::New, 16, 1);
    heap.alloc(Gen::New, 256);
    let garbage = heap.alloc(Gen::Perm, heap.meta().words_in_page());
    let perm_page = page_of(&heap, garbage);
    heap.add_root(young);

    heap.collect_old();

    assert_eq!(resolve(&heap, young), young);
    assert_eq!(payload(young), 1);
    assert_eq!(heap.meta().info(page_of(&heap, young)).gen(), Some(Gen::New));
    assert_eq!(
        heap.meta().info(perm_page).gen_and_state(),
        GenAndState::new(None, PageState::Unmapped)
    );
}

#[test]
fn alternating_cycles_keep_objects() {
    let heap = TestHeap::new();
    let mut roots = vec![];
    for i in 0..8 {
        let object = heap.alloc_with(Gen::New, 24, 1000 + i);
        heap.alloc(Gen::New, 200);
        roots.push(heap.add_root(object));
    }
    thread::sleep(Duration::from_millis(5));
    heap.collect_new();
    heap.collect_old();
    heap.collect_new();

    for (i, root) in roots.into_iter().enumerate() {
        let object = resolve(&heap, heap.root(root));
        assert_eq!(payload(object), 1000 + i);
    }
}
