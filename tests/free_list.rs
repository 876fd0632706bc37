//! The available list of a one-page space under concurrent pops and pushes, and the two halves of
//! a TLB resync.

use gpgc::collector::CollectorKind;
use gpgc::util::heap::one_page_space::OnePageSpace;
use gpgc::util::test_util::fixtures::TestHeap;
use gpgc::PageNum;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::{Barrier, Mutex};
use std::thread;

const SEED64: u64 = 0x4050cb1b5ab26c70;

/// Expand `count` granules and put them all on the available list.
fn fill_available(space: &OnePageSpace, count: usize) -> Vec<PageNum> {
    let pages: Vec<PageNum> = (0..count).map(|_| space.select_page()).collect();
    assert!(pages.iter().all(|page| page.is_some()));
    for &page in &pages {
        space.return_available_page(page);
    }
    pages
}

/// `threads` threads pop and push at random. A page is owned by at most one thread at a time, and
/// the tags one thread sees from its own pops keep increasing.
fn churn(threads: usize, steps: usize, pages: usize) {
    let heap = TestHeap::new();
    let space = &heap.spaces().small;
    let all = fill_available(space, pages);
    let owned = Mutex::new(HashSet::new());
    let start = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads {
            let owned = &owned;
            let start = &start;
            s.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(SEED64 + t as u64);
                let mut mine: Vec<PageNum> = vec![];
                let mut last_tag = None;
                start.wait();
                for _ in 0..steps {
                    if mine.is_empty() || rng.random_bool(0.5) {
                        if let Some((page, tag)) = space.pop_available_page() {
                            if let Some(last) = last_tag {
                                assert!(tag > last, "Tag {} after {} on thread {}", tag, last, t);
                            }
                            last_tag = Some(tag);
                            assert!(owned.lock().unwrap().insert(page), "{} handed out twice", page);
                            mine.push(page);
                        }
                    } else {
                        let page = mine.swap_remove(rng.random_range(0..mine.len()));
                        assert!(owned.lock().unwrap().remove(&page));
                        space.return_available_page(page);
                    }
                }
                for page in mine {
                    assert!(owned.lock().unwrap().remove(&page));
                    space.return_available_page(page);
                }
            });
        }
    });

    assert!(owned.lock().unwrap().is_empty());
    assert_eq!(space.available_pages_count(), pages as isize);
    let mut drained = HashSet::new();
    while let Some((page, _)) = space.pop_available_page() {
        assert!(drained.insert(page));
    }
    assert_eq!(drained, all.into_iter().collect());
}

macro_rules! churn_tests {
    ($($name: ident: $threads: expr, $steps: expr, $pages: expr;)*) => {
        paste::paste! {
            $(
                #[test]
                fn [<available_list_ $name>]() {
                    churn($threads, $steps, $pages);
                }
            )*
        }
    };
}

churn_tests! {
    single_thread: 1, 2000, 8;
    two_threads_few_pages: 2, 5000, 2;
    four_threads: 4, 5000, 16;
    eight_threads_contended: 8, 3000, 4;
}

#[test]
fn every_pop_advances_the_tag() {
    let heap = TestHeap::new();
    let space = &heap.spaces().small;
    fill_available(space, 3);
    let before = space.available_list_tag();
    let (page, tag) = space.pop_available_page().unwrap();
    assert_eq!(tag, before + 1);
    space.return_available_page(page);
    // Pushing keeps the tag.
    assert_eq!(space.available_list_tag(), tag);
    let (again, next) = space.pop_available_page().unwrap();
    assert_eq!(again, page);
    assert_eq!(next, tag + 1);
}

#[test]
fn held_pages_stay_out_until_the_resync_completes() {
    let heap = TestHeap::new();
    let space = &heap.spaces().small;
    let held: Vec<PageNum> = (0..4).map(|_| space.select_page()).collect();
    for &page in &held {
        space.hold_page_for_tlb_resync(page);
    }
    assert_eq!(space.held_pages_count(), 4);
    assert_eq!(space.prepare_for_tlb_resync(), 4);
    assert_eq!(space.pending_pages(), 4);

    // Everything selectable between the two halves comes from expansion.
    let selected: Vec<PageNum> = (0..8).map(|_| space.select_page()).collect();
    assert!(selected.iter().all(|page| !held.contains(page)));
    // Pages freed after the prepare wait for the next resync.
    space.hold_page_for_tlb_resync(selected[0]);

    assert_eq!(space.tlb_resync_occurred(), 4);
    assert_eq!(space.pending_pages(), 0);
    let reused: HashSet<PageNum> = (0..4).map(|_| space.select_page()).collect();
    assert_eq!(reused, held.iter().copied().collect());
    assert_eq!(space.held_pages_count(), 1);
}

#[test]
fn concurrent_selectors_never_see_pending_pages() {
    let heap = TestHeap::new();
    let space = &heap.spaces().small;
    let held: HashSet<PageNum> = (0..16).map(|_| space.select_page()).collect();
    for &page in &held {
        space.hold_page_for_tlb_resync(page);
    }
    space.prepare_for_tlb_resync();

    let selected = Mutex::new(vec![]);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..16 {
                    let page = space.select_page();
                    assert!(page.is_some());
                    selected.lock().unwrap().push(page);
                }
            });
        }
    });
    assert!(selected.lock().unwrap().iter().all(|page| !held.contains(page)));

    assert_eq!(space.tlb_resync_occurred(), 16);
    assert_eq!(space.available_pages_count(), 16);
    // A full resync with nothing held publishes nothing more.
    heap.tlb_resync(CollectorKind::New);
    assert_eq!(space.available_pages_count(), 16);
}
