//! Per-page bookkeeping.
//!
//! Every page of the heap has one [`PageInfo`]. The records live in a flat table indexed by
//! [`PageNum`] that only ever grows: spaces call [`PageInfoTable::expand_pages_in_use`] before the
//! pages they expand over can be selected, and records are never torn down afterwards.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::heap::layout::{HeapLayout, PageNum};
use crate::util::Address;
use atomic::Atomic;
use enum_map::Enum;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use strum_macros::{Display, EnumCount, FromRepr};

/// Lifecycle state of a page. Transitions only move forward, wrapping from Relocated to Unmapped.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumCount, FromRepr)]
pub enum PageState {
    Invalid = 0,
    Unmapped = 1,
    Allocating = 2,
    Allocated = 3,
    Relocating = 4,
    Relocated = 5,
}

/// A generation. Encoded as a bit so masks can select several generations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, Display)]
pub enum Gen {
    New,
    Old,
    Perm,
}

impl Gen {
    pub const NEW_GEN_MASK: u8 = 0x1;
    pub const OLD_AND_PERM_MASK: u8 = 0x6;

    pub const fn bits(self) -> u8 {
        match self {
            Gen::New => 0x1,
            Gen::Old => 0x2,
            Gen::Perm => 0x4,
        }
    }

    pub const fn from_bits(bits: u8) -> Option<Gen> {
        match bits {
            0x1 => Some(Gen::New),
            0x2 => Some(Gen::Old),
            0x4 => Some(Gen::Perm),
            _ => None,
        }
    }

    /// Space id stored in the relocate-space field of the flags word.
    pub const fn space_id(self) -> u64 {
        self.bits() as u64
    }

    pub const fn from_space_id(id: u64) -> Option<Gen> {
        Gen::from_bits(id as u8)
    }
}

const GEN_SHIFT: u8 = 4;
const STATE_MASK: u8 = 0xF;

/// Generation and state packed in one byte, always read and written together.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct GenAndState(u8);

impl GenAndState {
    pub const INVALID: GenAndState = GenAndState(PageState::Invalid as u8);

    pub const fn new(gen: Option<Gen>, state: PageState) -> Self {
        let gen_bits = match gen {
            Some(g) => g.bits(),
            None => 0,
        };
        GenAndState((gen_bits << GEN_SHIFT) | state as u8)
    }

    pub fn gen(self) -> Option<Gen> {
        Gen::from_bits(self.0 >> GEN_SHIFT)
    }

    pub fn gen_bits(self) -> u8 {
        self.0 >> GEN_SHIFT
    }

    pub fn state(self) -> PageState {
        // Only encodings produced by `new` are ever stored.
        PageState::from_repr(self.0 & STATE_MASK).unwrap_or(PageState::Invalid)
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for GenAndState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.gen() {
            Some(gen) => write!(f, "{}/{}", gen, self.state()),
            None => write!(f, "-/{}", self.state()),
        }
    }
}

/// Page flags. The low 32 bits of the flags word hold these bits and the relocate-space id, the
/// high 32 bits hold a count that shares the CAS with the flags.
pub mod flags {
    /// Allocated while marking was underway. Marking does not see all of its objects.
    pub const NO_RELOCATE: u64 = 0x1;
    /// Handed out whole as a thread-local allocation buffer.
    pub const TLAB: u64 = 0x2;
    /// Pinned; the count field holds the pin count.
    pub const PINNED: u64 = 0x4;
    /// The count field counts pages freed when the source mid page is unmapped.
    pub const UNMAP_FREE_STATS: u64 = 0x10;
    /// The count field counts pages freed when the target mid page is unshattered.
    pub const UNSHATTER_FREE_STATS: u64 = 0x20;
    /// Set by whoever unshatters a remapping target first.
    pub const FIRST_UNSHATTER: u64 = 0x40;
    pub const ALL_FREE_STAT_FLAGS: u64 = UNMAP_FREE_STATS | UNSHATTER_FREE_STATS | FIRST_UNSHATTER;

    pub const RELOCATE_SPACE_SHIFT: u32 = 24;
    pub const RELOCATE_SPACE_MASK: u64 = 0xFF;
    pub const RELOCATE_SPACE_MASK_IN_PLACE: u64 = RELOCATE_SPACE_MASK << RELOCATE_SPACE_SHIFT;
    pub const COUNT_SHIFT: u32 = 32;
    pub const ALL_BUT_COUNT_MASK: u64 = 0xFFFF_FFFF;
}

/// Sentinel for "no sideband forwarding table".
pub const NO_RELOCATIONS: usize = usize::MAX;

/// The record for one page.
///
/// Fields whose meaning depends on the lifecycle phase:
/// * `size` is the block length for large-space block heads (negative offsets to the head in the tail
///   pages), and the forwarding-table length for one-page-space pages being relocated.
/// * `ll_next` links the page into at most one list at a time: a free list, a full-allocation-page list,
///   a relocated-page list or, for a promoted large block, the clone block.
pub struct PageInfo {
    gen_and_state: AtomicU8,
    flags: AtomicU64,
    top: Atomic<Address>,
    /// `live_objects << 32 | live_words`
    raw_stats: AtomicU64,
    time: AtomicI64,
    size: AtomicI64,
    ll_next: Atomic<PageNum>,
    relocations: AtomicUsize,
}

impl Default for PageInfo {
    fn default() -> Self {
        PageInfo {
            gen_and_state: AtomicU8::new(GenAndState::INVALID.raw()),
            flags: AtomicU64::new(0),
            top: Atomic::new(Address::ZERO),
            raw_stats: AtomicU64::new(0),
            time: AtomicI64::new(0),
            size: AtomicI64::new(0),
            ll_next: Atomic::new(PageNum::NONE),
            relocations: AtomicUsize::new(NO_RELOCATIONS),
        }
    }
}

impl PageInfo {
    pub fn initialize(&self) {
        self.gen_and_state
            .store(GenAndState::INVALID.raw(), Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.top.store(Address::ZERO, Ordering::Relaxed);
        self.raw_stats.store(0, Ordering::Relaxed);
        self.time.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
        self.ll_next.store(PageNum::NONE, Ordering::Relaxed);
        self.relocations.store(NO_RELOCATIONS, Ordering::Relaxed);
    }

    // Generation and state

    #[inline(always)]
    pub fn gen_and_state(&self) -> GenAndState {
        GenAndState(self.gen_and_state.load(Ordering::Acquire))
    }

    pub fn gen(&self) -> Option<Gen> {
        self.gen_and_state().gen()
    }

    pub fn state(&self) -> PageState {
        self.gen_and_state().state()
    }

    /// Publish a generation and state. The release store orders every metadata write before it.
    pub fn set_gen_and_state(&self, gen: Option<Gen>, state: PageState) {
        self.gen_and_state
            .store(GenAndState::new(gen, state).raw(), Ordering::Release);
    }

    /// Change the state keeping the generation.
    pub fn set_state(&self, state: PageState) {
        let gen = self.gen();
        self.set_gen_and_state(gen, state);
    }

    /// Move from `from` to `to`, keeping the generation. The page must be in `from`.
    pub fn transition(&self, gen: Gen, from: PageState, to: PageState) {
        let old = GenAndState::new(Some(gen), from);
        let new = GenAndState::new(Some(gen), to);
        if let Err(actual) = self.gen_and_state.compare_exchange(
            old.raw(),
            new.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "Page state transition {:?} -> {:?} found {:?}",
                old,
                new,
                GenAndState(actual)
            );
        }
    }

    // Flags

    #[inline(always)]
    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags() & flag != 0
    }

    /// Overwrite the whole flags word. Only for pages no other thread can see yet.
    pub fn set_flags_non_atomic(&self, flags: u64) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    pub fn flags_count(&self) -> u64 {
        self.flags() >> flags::COUNT_SHIFT
    }

    pub fn relocate_space(&self) -> Option<Gen> {
        Gen::from_space_id((self.flags() >> flags::RELOCATE_SPACE_SHIFT) & flags::RELOCATE_SPACE_MASK)
    }

    fn update_flags<F: Fn(u64) -> u64>(&self, f: F) -> u64 {
        let mut old = self.flags();
        loop {
            let new = f(old);
            match self
                .flags
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return new,
                Err(actual) => old = actual,
            }
        }
    }

    pub fn set_relocate_space(&self, space: Gen) {
        self.update_flags(|old| {
            (old & !flags::RELOCATE_SPACE_MASK_IN_PLACE)
                | (space.space_id() << flags::RELOCATE_SPACE_SHIFT)
        });
    }

    /// Set `flag`. When `assert_not_set`, the flag must not already be set.
    pub fn atomic_set_flag(&self, flag: u64, assert_not_set: bool) {
        self.update_flags(|old| {
            assert!(
                !assert_not_set || old & flag == 0,
                "Flag {:#x} already set in {:#x}",
                flag,
                old
            );
            old | flag
        });
    }

    pub fn atomic_clear_flag(&self, flag: u64) {
        self.update_flags(|old| {
            assert!(old & flag != 0, "Flag {:#x} not set in {:#x}", flag, old);
            old & !flag
        });
    }

    /// Add `delta` to the count. The count never exceeds the words in a page.
    pub fn atomic_increment_flags_count(&self, delta: u64, words_in_page: usize) {
        self.update_flags(|old| {
            let count = (old >> flags::COUNT_SHIFT) + delta;
            assert!(
                count <= words_in_page as u64,
                "Flags count overflow: {}",
                count
            );
            (count << flags::COUNT_SHIFT) | (old & flags::ALL_BUT_COUNT_MASK)
        });
    }

    /// Subtract one from the count, returning the new count.
    pub fn atomic_decrement_flags_count(&self) -> u64 {
        let new = self.update_flags(|old| {
            let count = old >> flags::COUNT_SHIFT;
            assert!(count > 0, "Flags count underflow");
            ((count - 1) << flags::COUNT_SHIFT) | (old & flags::ALL_BUT_COUNT_MASK)
        });
        new >> flags::COUNT_SHIFT
    }

    fn reset_free_stats(&self, set: u64) {
        self.update_flags(|old| {
            assert!(old & flags::PINNED == 0, "Free stats on a pinned page");
            assert!(old & set == 0, "Free stats {:#x} already reset", set);
            assert!(
                (old >> flags::COUNT_SHIFT) == 0 || old & flags::UNSHATTER_FREE_STATS != 0,
                "Free stats reset with a live count {:#x}",
                old
            );
            (old & flags::ALL_BUT_COUNT_MASK & !flags::ALL_FREE_STAT_FLAGS) | set
        });
    }

    /// Start counting pages freed when this source page is unmapped.
    pub fn reset_unmap_free_stats(&self) {
        self.reset_free_stats(flags::UNMAP_FREE_STATS);
    }

    /// Start counting pages freed when this target page is unshattered.
    pub fn reset_unshatter_free_stats(&self) {
        self.reset_free_stats(flags::UNSHATTER_FREE_STATS);
    }

    pub fn increment_free_on_unmap(&self, delta: u64, words_in_page: usize) {
        debug_assert!(self.has_flag(flags::UNMAP_FREE_STATS));
        self.atomic_increment_flags_count(delta, words_in_page);
    }

    pub fn increment_free_on_unshatter(&self, words_in_page: usize) {
        debug_assert!(self.has_flag(flags::UNSHATTER_FREE_STATS));
        self.atomic_increment_flags_count(1, words_in_page);
    }

    pub fn unmap_free_count(&self) -> u64 {
        debug_assert!(self.has_flag(flags::UNMAP_FREE_STATS));
        self.flags_count()
    }

    pub fn unshatter_free_count(&self) -> u64 {
        debug_assert!(self.has_flag(flags::UNSHATTER_FREE_STATS));
        self.flags_count()
    }

    /// Returns false if someone else unshattered first.
    pub fn set_first_unshatter(&self) -> bool {
        let mut old = self.flags();
        loop {
            if old & flags::FIRST_UNSHATTER != 0 {
                return false;
            }
            match self.flags.compare_exchange_weak(
                old,
                old | flags::FIRST_UNSHATTER,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    /// Finish unshattering: drop the unshatter stats and return the count they held. Only the thread
    /// that won [`PageInfo::set_first_unshatter`] calls this.
    pub fn take_unshatter_free_count(&self) -> u64 {
        let mut old = self.flags();
        loop {
            assert!(
                old & flags::FIRST_UNSHATTER != 0,
                "Unshatter finished without a claim: {:#x}",
                old
            );
            let new = old
                & flags::ALL_BUT_COUNT_MASK
                & !(flags::UNSHATTER_FREE_STATS | flags::FIRST_UNSHATTER);
            match self
                .flags
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return old >> flags::COUNT_SHIFT,
                Err(actual) => old = actual,
            }
        }
    }

    pub fn atomic_add_pinned(&self) {
        self.update_flags(|old| {
            assert!(
                old & flags::ALL_FREE_STAT_FLAGS == 0,
                "Pinning a page with free stats {:#x}",
                old
            );
            let count = (old >> flags::COUNT_SHIFT) + 1;
            (count << flags::COUNT_SHIFT) | (old & flags::ALL_BUT_COUNT_MASK) | flags::PINNED
        });
    }

    pub fn atomic_subtract_pinned(&self) {
        self.update_flags(|old| {
            assert!(old & flags::PINNED != 0, "Unpinning an unpinned page");
            let count = (old >> flags::COUNT_SHIFT) - 1;
            let low = if count == 0 {
                old & flags::ALL_BUT_COUNT_MASK & !flags::PINNED
            } else {
                old & flags::ALL_BUT_COUNT_MASK
            };
            (count << flags::COUNT_SHIFT) | low
        });
    }

    // Top

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Acquire)
    }

    pub fn set_top(&self, top: Address) {
        self.top.store(top, Ordering::Release);
    }

    /// Bump-allocation CAS on the top pointer.
    #[inline(always)]
    pub fn cas_top(&self, old: Address, new: Address) -> Result<Address, Address> {
        self.top
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
    }

    // Stats

    pub fn raw_stats(&self) -> u64 {
        self.raw_stats.load(Ordering::Acquire)
    }

    pub fn set_raw_stats(&self, raw: u64) {
        self.raw_stats.store(raw, Ordering::Release);
    }

    pub fn zero_raw_stats(&self) {
        self.set_raw_stats(0);
    }

    pub fn live_objs(&self) -> u64 {
        self.raw_stats() >> 32
    }

    pub fn live_words(&self) -> u64 {
        self.raw_stats() & 0xFFFF_FFFF
    }

    /// Count one more live object of `words` words. Called by marking.
    pub fn add_live_object(&self, words: u64) {
        debug_assert!(
            matches!(self.state(), PageState::Allocating | PageState::Allocated),
            "Live object on a page in state {}",
            self.state()
        );
        self.raw_stats
            .fetch_add((1 << 32) | words, Ordering::AcqRel);
    }

    // Time

    pub fn time(&self) -> i64 {
        self.time.load(Ordering::Relaxed)
    }

    pub fn set_time(&self, time: i64) {
        self.time.store(time, Ordering::Relaxed);
    }

    // Block size / relocation table length

    /// Block length at a large-space block head. Tail pages hold the negated distance to the head.
    pub fn block_size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_block_size(&self, pages: i64) {
        self.size.store(pages, Ordering::Release);
    }

    /// Forwarding-table length of a one-page-space page selected for relocation.
    pub fn reloc_len(&self) -> usize {
        debug_assert!(self.state() >= PageState::Allocated);
        self.size.load(Ordering::Acquire) as usize
    }

    pub fn set_reloc_len(&self, len: usize) {
        self.size.store(len as i64, Ordering::Release);
    }

    // Links

    pub fn ll_next(&self) -> PageNum {
        self.ll_next.load(Ordering::Acquire)
    }

    pub fn set_ll_next(&self, next: PageNum) {
        self.ll_next.store(next, Ordering::Release);
    }

    pub fn relocations(&self) -> usize {
        self.relocations.load(Ordering::Acquire)
    }

    pub fn set_relocations(&self, table: usize) {
        self.relocations.store(table, Ordering::Release);
    }
}

impl fmt::Debug for PageInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageInfo")
            .field("gen_and_state", &self.gen_and_state())
            .field("flags", &format_args!("{:#x}", self.flags()))
            .field("top", &self.top())
            .field("live_objs", &self.live_objs())
            .field("live_words", &self.live_words())
            .field("time", &self.time())
            .field("size", &self.size.load(Ordering::Relaxed))
            .field("ll_next", &self.ll_next())
            .finish()
    }
}

/// The page-info table: one record for every heap page.
pub struct PageInfoTable {
    infos: Box<[PageInfo]>,
    /// Set once a record has been initialized by an expansion.
    in_use: Box<[AtomicBool]>,
    expansion_lock: Mutex<()>,
    words_in_page: usize,
}

impl PageInfoTable {
    pub fn new(layout: &HeapLayout) -> Self {
        let pages = layout.heap_pages();
        PageInfoTable {
            infos: (0..pages).map(|_| PageInfo::default()).collect(),
            in_use: (0..pages).map(|_| AtomicBool::new(false)).collect(),
            expansion_lock: Mutex::new(()),
            words_in_page: layout.words_in_page,
        }
    }

    pub fn words_in_page(&self) -> usize {
        self.words_in_page
    }

    pub fn bytes_in_page(&self) -> usize {
        self.words_in_page * BYTES_IN_WORD
    }

    /// Make the records of `[start, start + pages)` usable. Records already in use are left alone.
    pub fn expand_pages_in_use(&self, start: PageNum, pages: usize) {
        assert!(
            start.index() + pages <= self.infos.len(),
            "Page info expansion past the heap: {} + {}",
            start,
            pages
        );
        let _guard = self.expansion_lock.lock().unwrap();
        for index in start.index()..start.index() + pages {
            if !self.in_use[index].load(Ordering::Relaxed) {
                self.infos[index].initialize();
                self.in_use[index].store(true, Ordering::Release);
            }
        }
        fence(Ordering::SeqCst);
    }

    pub fn page_in_use(&self, page: PageNum) -> bool {
        page.index() < self.in_use.len() && self.in_use[page.index()].load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn info(&self, page: PageNum) -> &PageInfo {
        debug_assert!(self.page_in_use(page), "Page info for {} not in use", page);
        &self.infos[page.index()]
    }

    pub fn pages(&self) -> usize {
        self.infos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORDS: usize = 8192;

    fn allocated(gen: Gen) -> PageInfo {
        let info = PageInfo::default();
        info.initialize();
        info.set_gen_and_state(Some(gen), PageState::Allocated);
        info
    }

    #[test]
    fn gen_and_state_packing() {
        let packed = GenAndState::new(Some(Gen::Old), PageState::Relocating);
        assert_eq!(packed.raw(), 0x24);
        assert_eq!(packed.gen(), Some(Gen::Old));
        assert_eq!(packed.state(), PageState::Relocating);
        assert_eq!(GenAndState::INVALID.gen(), None);
        assert_eq!(GenAndState::INVALID.state(), PageState::Invalid);
        assert_eq!(Gen::from_bits(Gen::Perm.bits()), Some(Gen::Perm));
        assert!(Gen::New.bits() & Gen::NEW_GEN_MASK != 0);
        assert!(Gen::Old.bits() & Gen::OLD_AND_PERM_MASK != 0);
        assert!(Gen::Perm.bits() & Gen::OLD_AND_PERM_MASK != 0);
    }

    #[test]
    fn transition_forward() {
        let info = allocated(Gen::New);
        info.transition(Gen::New, PageState::Allocated, PageState::Relocating);
        assert_eq!(info.state(), PageState::Relocating);
        assert_eq!(info.gen(), Some(Gen::New));
    }

    #[test]
    #[should_panic]
    fn transition_from_wrong_state() {
        let info = allocated(Gen::New);
        info.transition(Gen::New, PageState::Relocating, PageState::Relocated);
    }

    #[test]
    fn live_object_stats() {
        let info = allocated(Gen::New);
        info.add_live_object(10);
        info.add_live_object(6);
        assert_eq!(info.live_objs(), 2);
        assert_eq!(info.live_words(), 16);
        info.zero_raw_stats();
        assert_eq!(info.raw_stats(), 0);
    }

    #[test]
    fn flags_and_count_share_a_word() {
        let info = allocated(Gen::Old);
        info.atomic_set_flag(flags::NO_RELOCATE, true);
        info.set_relocate_space(Gen::Perm);
        info.atomic_increment_flags_count(3, WORDS);
        assert!(info.has_flag(flags::NO_RELOCATE));
        assert_eq!(info.relocate_space(), Some(Gen::Perm));
        assert_eq!(info.flags_count(), 3);
        assert_eq!(info.atomic_decrement_flags_count(), 2);
        info.atomic_clear_flag(flags::NO_RELOCATE);
        assert!(!info.has_flag(flags::NO_RELOCATE));
        assert_eq!(info.relocate_space(), Some(Gen::Perm));
        assert_eq!(info.flags_count(), 2);
    }

    #[test]
    #[should_panic]
    fn double_set_flag() {
        let info = allocated(Gen::Old);
        info.atomic_set_flag(flags::TLAB, true);
        info.atomic_set_flag(flags::TLAB, true);
    }

    #[test]
    fn pinning_counts() {
        let info = allocated(Gen::Old);
        info.atomic_add_pinned();
        info.atomic_add_pinned();
        assert!(info.has_flag(flags::PINNED));
        assert_eq!(info.flags_count(), 2);
        info.atomic_subtract_pinned();
        assert!(info.has_flag(flags::PINNED));
        info.atomic_subtract_pinned();
        assert!(!info.has_flag(flags::PINNED));
        assert_eq!(info.flags_count(), 0);
    }

    #[test]
    fn unshatter_stats() {
        let info = allocated(Gen::New);
        info.reset_unshatter_free_stats();
        info.increment_free_on_unshatter(WORDS);
        info.increment_free_on_unshatter(WORDS);
        assert_eq!(info.unshatter_free_count(), 2);
        assert!(info.set_first_unshatter());
        assert!(!info.set_first_unshatter());
        assert_eq!(info.take_unshatter_free_count(), 2);
        assert!(!info.has_flag(flags::UNSHATTER_FREE_STATS));
        assert!(!info.has_flag(flags::FIRST_UNSHATTER));
        assert_eq!(info.flags_count(), 0);
    }

    #[test]
    fn unmap_stats_reset_clears_count() {
        let info = allocated(Gen::New);
        info.reset_unshatter_free_stats();
        info.increment_free_on_unshatter(WORDS);
        // A count left from unshatter stats may be reset.
        info.reset_unmap_free_stats();
        assert_eq!(info.unmap_free_count(), 0);
        info.increment_free_on_unmap(4, WORDS);
        assert_eq!(info.unmap_free_count(), 4);
        assert!(!info.has_flag(flags::UNSHATTER_FREE_STATS));
    }

    #[test]
    #[should_panic]
    fn free_stats_on_pinned_page() {
        let info = allocated(Gen::New);
        info.atomic_add_pinned();
        info.reset_unmap_free_stats();
    }

    #[test]
    fn concurrent_count_updates() {
        let info = allocated(Gen::New);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        info.atomic_increment_flags_count(1, WORDS);
                        info.atomic_set_flag(flags::TLAB, false);
                    }
                });
            }
        });
        assert_eq!(info.flags_count(), 400);
        assert!(info.has_flag(flags::TLAB));
    }

    #[test]
    fn initialize_resets_everything() {
        let info = allocated(Gen::Perm);
        info.add_live_object(3);
        info.set_ll_next(PageNum(7));
        info.set_top(unsafe { Address::from_usize(0x1000) });
        info.initialize();
        assert_eq!(info.gen_and_state(), GenAndState::INVALID);
        assert_eq!(info.raw_stats(), 0);
        assert!(info.ll_next().is_none());
        assert_eq!(info.relocations(), NO_RELOCATIONS);
    }
}
