//! Page lifecycle: allocation into fresh and shared pages, release and reuse, and the order of the
//! states a page passes through.

use gpgc::collector::CollectorKind;
use gpgc::util::heap::page_info::{flags, GenAndState};
use gpgc::util::test_util::fixtures::TestHeap;
use gpgc::util::test_util::test_options;
use gpgc::{Gen, PageState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[test]
fn full_page_allocation() {
    let heap = TestHeap::new();
    let meta = heap.meta();
    let words_in_page = meta.words_in_page();
    let object = heap.alloc(Gen::New, words_in_page);
    let page = meta.addr_to_page(object);
    let info = meta.info(page);

    assert!(meta.layout.page_in_small_space(page));
    assert_eq!(object, meta.page_to_addr(page));
    assert_eq!(info.gen_and_state(), GenAndState::new(Some(Gen::New), PageState::Allocated));
    assert_eq!(info.top(), object.plus_words(words_in_page));
    assert_eq!(heap.generation(Gen::New).pages_allocated(), 1);
}

#[test]
fn shared_page_bumps_in_order() {
    let heap = TestHeap::new();
    let meta = heap.meta();
    let first = heap.alloc(Gen::New, 10);
    let info = meta.info(meta.addr_to_page(first));
    assert_eq!(info.top(), first.plus_words(10));
    assert_eq!(info.state(), PageState::Allocating);

    let second = heap.alloc(Gen::New, 10);
    assert_eq!(meta.addr_to_page(second), meta.addr_to_page(first));
    assert_eq!(second, first.plus_words(10));
    assert_eq!(info.top(), second.plus_words(10));
}

#[test]
fn released_page_comes_back_clean() {
    let heap = TestHeap::new();
    let meta = heap.meta();
    let tlab = heap
        .allocate_tlab(Gen::Old)
        .unwrap_or_else(|| panic!("No room for a TLAB"));
    let page = meta.addr_to_page(tlab);
    unsafe {
        for i in 0..16 {
            tlab.plus_words(i).to_mut_ptr::<usize>().write(0xDEAD_0000 + i);
        }
    }
    assert!(meta.info(page).has_flag(flags::TLAB));
    assert_eq!(meta.info(page).live_words(), 0);

    heap.generation(Gen::Old)
        .release_empty_page(page, None, heap.spike(CollectorKind::Old));
    assert_eq!(meta.info(page).gen_and_state(), GenAndState::new(None, PageState::Unmapped));
    heap.tlb_resync(CollectorKind::Old);

    let again = heap.alloc(Gen::New, meta.words_in_page());
    assert_eq!(meta.addr_to_page(again), page);
    let info = meta.info(page);
    assert_eq!(info.gen_and_state(), GenAndState::new(Some(Gen::New), PageState::Allocated));
    assert_eq!(info.flags(), 0);
    assert_eq!(info.raw_stats(), 0);
    assert!(!heap.is_marked(again));
}

#[test]
fn freed_pages_are_not_reused_when_reuse_is_off() {
    let mut options = test_options();
    options.reuse_freed_pages = false;
    let heap = TestHeap::with_options(options);
    let meta = heap.meta();
    let object = heap.alloc(Gen::New, meta.words_in_page());
    let page = meta.addr_to_page(object);
    let small = &heap.spaces().small;
    let allocated = small.allocated_pages_count();

    heap.generation(Gen::New)
        .release_empty_page(page, None, heap.spike(CollectorKind::New));
    assert_eq!(small.allocated_pages_count(), allocated - 1);
    assert_eq!(small.retired_pages_count(), 1);
    assert_eq!(small.held_pages_count(), 0);
    heap.tlb_resync(CollectorKind::New);

    let next = heap.alloc(Gen::New, meta.words_in_page());
    assert_ne!(meta.addr_to_page(next), page);
}

#[test]
fn freed_large_blocks_are_not_reused_when_reuse_is_off() {
    let mut options = test_options();
    options.reuse_freed_pages = false;
    let heap = TestHeap::with_options(options);
    let meta = heap.meta();
    let words = meta.layout.large_min_object_words;
    let large = &heap.spaces().large;
    let object = heap.alloc(Gen::New, words);
    let block = meta.addr_to_page(object);
    let pages = meta.info(block).block_size() as usize;
    assert_eq!(large.allocated_pages_count(), pages);

    heap.generation(Gen::New)
        .release_empty(block, None, heap.spike(CollectorKind::New));
    assert_eq!(large.allocated_pages_count(), 0);
    assert_eq!(large.retired_pages_count(), pages);
    assert_eq!(meta.info(block).state(), PageState::Unmapped);
    heap.tlb_resync(CollectorKind::New);

    let next = heap.alloc(Gen::New, words);
    assert_ne!(meta.addr_to_page(next), block);
    assert_eq!(large.available_pages_count(), 0);
}

/// Whether `to` may follow `from`: states only move forward, except that a page in use may be
/// freed back to `Unmapped`.
fn forward(from: PageState, to: PageState) -> bool {
    to > from || (to == PageState::Unmapped && from >= PageState::Allocated)
}

#[test]
fn states_only_move_forward() {
    let mut options = test_options();
    options.promotion_threshold_ms = 1_000_000;
    let heap = TestHeap::with_options(options);
    let meta = heap.meta();
    let live = heap.alloc_with(Gen::New, 16, 3);
    for _ in 0..10 {
        heap.alloc(Gen::New, 100);
    }
    heap.add_root(live);
    let page = meta.addr_to_page(live);

    let done = AtomicBool::new(false);
    let observed = thread::scope(|s| {
        let watcher = s.spawn(|| {
            let mut seen = vec![meta.info(page).state()];
            while !done.load(Ordering::Acquire) {
                let state = meta.info(page).state();
                if Some(&state) != seen.last() {
                    seen.push(state);
                }
            }
            let state = meta.info(page).state();
            if Some(&state) != seen.last() {
                seen.push(state);
            }
            seen
        });
        heap.collect_new();
        heap.collect_new();
        done.store(true, Ordering::Release);
        watcher.join().unwrap()
    });

    assert_eq!(observed.first(), Some(&PageState::Allocating));
    assert_eq!(observed.last(), Some(&PageState::Unmapped));
    for pair in observed.windows(2) {
        assert!(forward(pair[0], pair[1]), "{} followed {} in {:?}", pair[1], pair[0], observed);
    }
}
