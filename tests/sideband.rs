//! Forwarding tables carved from both ends of the sideband arena.

use gpgc::relocation::sideband::SidebandArena;
use gpgc::Address;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn overlaps(a: (Address, usize), b: (Address, usize)) -> bool {
    a.0 < b.0.plus_words(b.1) && b.0 < a.0.plus_words(a.1)
}

/// Interleave allocations from both collectors until both fail. No two tables may share a word,
/// and once a collector fails it keeps failing for the same size.
fn fill_from_both_ends(seed: u64, words: usize, max_percent: usize) {
    let arena = SidebandArena::new(words, max_percent, 25).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut tables: Vec<(Address, usize)> = vec![];
    let (mut new_full, mut old_full) = (false, false);
    while !(new_full && old_full) {
        let live = rng.random_range(1..64);
        let from_new = rng.random_bool(0.5);
        let table = if from_new {
            arena.new_gc_allocate(live)
        } else {
            arena.old_gc_allocate(live)
        };
        match table {
            Some((start, len)) => {
                assert!(arena.contains(start) && arena.contains(start.plus_words(len - 1)));
                assert!(len >= live && len.is_power_of_two());
                for &other in &tables {
                    assert!(!overlaps((start, len), other), "{:?} overlaps {:?}", (start, len), other);
                }
                tables.push((start, len));
            }
            None => {
                // A collector that cannot fit even a single-record table is done.
                let retry = if from_new {
                    arena.new_gc_allocate(1)
                } else {
                    arena.old_gc_allocate(1)
                };
                match retry {
                    Some(table) => {
                        for &other in &tables {
                            assert!(!overlaps(table, other));
                        }
                        tables.push(table);
                    }
                    None if from_new => new_full = true,
                    None => old_full = true,
                }
            }
        }
    }
    assert!(arena.new_gc_words_used() <= arena.max_words_per_gc());
    assert!(arena.old_gc_words_used() <= arena.max_words_per_gc());
    assert!(arena.new_gc_words_used() + arena.old_gc_words_used() <= arena.words());
}

#[test]
fn tables_never_overlap() {
    for seed in 0..16 {
        fill_from_both_ends(seed, 4096, 75);
    }
}

#[test]
fn tables_never_overlap_with_full_shares() {
    for seed in 0..16 {
        fill_from_both_ends(0x1000 + seed, 2048, 100);
    }
}

#[test]
fn reset_frees_only_one_end() {
    let arena = SidebandArena::new(1024, 100, 0).unwrap();
    let (low, _) = arena.new_gc_allocate(256).unwrap();
    let (high, _) = arena.old_gc_allocate(512).unwrap();
    assert!(arena.new_gc_allocate(512).is_none());

    arena.new_gc_reset();
    assert_eq!(arena.new_gc_words_used(), 0);
    assert_eq!(arena.old_gc_words_used(), 512);
    let (again, len) = arena.new_gc_allocate(512).unwrap();
    assert_eq!(again, low);
    assert_eq!(again.plus_words(len), high);
    assert!(arena.old_gc_allocate(1).is_none());
}

#[test]
fn fresh_tables_are_zeroed() {
    let arena = SidebandArena::new(256, 100, 0).unwrap();
    let (table, len) = arena.new_gc_allocate(64).unwrap();
    for i in 0..len {
        unsafe { table.plus_words(i).to_mut_ptr::<u64>().write(u64::MAX) };
    }
    arena.new_gc_reset();
    let (again, len) = arena.new_gc_allocate(64).unwrap();
    assert_eq!(again, table);
    for i in 0..len {
        assert_eq!(unsafe { again.plus_words(i).to_ptr::<u64>().read() }, 0);
    }
}
