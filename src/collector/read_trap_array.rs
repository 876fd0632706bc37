//! The per-page trap states the read barrier checks.
//!
//! There is one entry per page and NMT value. The array is double buffered: collectors stage new
//! states in the dupe copy while mutators read the live one, and the two are swapped at a safepoint,
//! so mutators see a whole batch of trap changes at once. Writers serialise on one lock; readers
//! never take it.

use crate::collector::nmt::Nmt;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::Gen;
use crate::util::metadata::SideTable;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::FromRepr)]
pub enum TrapState {
    UnTrapped = 0,
    NmtTrapped = 1,
    NewGcRemapTrapped = 2,
    NewGcNmtRemapTrapped = 3,
    OldGcRemapTrapped = 4,
    OldGcNmtRemapTrapped = 5,
    /// Tail pages of a large block. References never point there.
    Invalid = 6,
    /// Released pages.
    Clear = 7,
}

impl TrapState {
    fn from_raw(raw: u8) -> Self {
        TrapState::from_repr(raw).unwrap_or_else(|| panic!("Corrupt trap state {}", raw))
    }

    /// The state seen through a reference with a stale NMT bit.
    pub fn with_nmt(self) -> Self {
        match self {
            TrapState::Invalid | TrapState::Clear => self,
            _ => Self::from_raw(self as u8 | 1),
        }
    }

    /// The state seen through a reference with a good NMT bit.
    pub fn without_nmt(self) -> Self {
        match self {
            TrapState::Invalid | TrapState::Clear => self,
            _ => Self::from_raw(self as u8 & !1),
        }
    }

    pub fn is_nmt_trapped(self) -> bool {
        (self as u8) < TrapState::Invalid as u8 && self as u8 & 1 != 0
    }

    pub fn is_remap_trapped(self) -> bool {
        matches!(
            self,
            TrapState::NewGcRemapTrapped
                | TrapState::NewGcNmtRemapTrapped
                | TrapState::OldGcRemapTrapped
                | TrapState::OldGcNmtRemapTrapped
        )
    }

    /// The remap state for pages relocated by the collector of `gen`.
    pub fn remap_for(gen: Gen) -> Self {
        match gen {
            Gen::New => TrapState::NewGcRemapTrapped,
            Gen::Old | Gen::Perm => TrapState::OldGcRemapTrapped,
        }
    }
}

pub struct ReadTrapArray {
    heap_pages: usize,
    nmt_index_bit: u32,
    arrays: [SideTable<AtomicU8>; 2],
    /// Index of the array mutators read.
    live: AtomicUsize,
    swap_pending: AtomicBool,
    write_lock: spin::Mutex<()>,
}

impl ReadTrapArray {
    pub fn new(heap_pages: usize) -> std::io::Result<Self> {
        let nmt_index_bit = heap_pages.next_power_of_two().trailing_zeros();
        let len = 2usize << nmt_index_bit;
        Ok(ReadTrapArray {
            heap_pages,
            nmt_index_bit,
            arrays: [SideTable::new(len)?, SideTable::new(len)?],
            live: AtomicUsize::new(0),
            swap_pending: AtomicBool::new(false),
            write_lock: spin::Mutex::new(()),
        })
    }

    pub fn nmt_index_bit(&self) -> u32 {
        self.nmt_index_bit
    }

    #[inline(always)]
    fn index(&self, page: PageNum, nmt: bool) -> usize {
        debug_assert!(page.index() < self.heap_pages, "{} outside the trap array", page);
        page.index() | ((nmt as usize) << self.nmt_index_bit)
    }

    fn live_array(&self) -> &SideTable<AtomicU8> {
        &self.arrays[self.live.load(Ordering::Acquire)]
    }

    fn dupe_array(&self) -> &SideTable<AtomicU8> {
        &self.arrays[self.live.load(Ordering::Acquire) ^ 1]
    }

    fn set_pair(&self, array: &SideTable<AtomicU8>, page: PageNum, nmt: bool, state: TrapState) {
        array[self.index(page, nmt)].store(state as u8, Ordering::Release);
        array[self.index(page, !nmt)].store(state.with_nmt() as u8, Ordering::Release);
    }

    /// The state a mutator sees loading a reference to `page` with NMT bit `nmt`.
    #[inline(always)]
    pub fn read_trap(&self, page: PageNum, nmt: bool) -> TrapState {
        TrapState::from_raw(self.live_array()[self.index(page, nmt)].load(Ordering::Acquire))
    }

    /// The staged state, visible to mutators after the next swap.
    pub fn staged_trap(&self, page: PageNum, nmt: bool) -> TrapState {
        TrapState::from_raw(self.dupe_array()[self.index(page, nmt)].load(Ordering::Acquire))
    }

    /// Untrap freshly allocated pages in both copies. Tail pages of a large block are invalid.
    pub fn init_trap(&self, page: PageNum, pages: usize, nmt: &Nmt, gen: Gen, in_large_space: bool) {
        let _lock = self.write_lock.lock();
        let (desired, upcoming) = (nmt.desired(gen), nmt.upcoming(gen));
        for i in 0..pages {
            let state = if in_large_space && i > 0 {
                TrapState::Invalid
            } else {
                TrapState::UnTrapped
            };
            self.set_pair(self.live_array(), page.plus(i), desired, state);
            self.set_pair(self.dupe_array(), page.plus(i), upcoming, state);
        }
    }

    /// Stage `state` for references with NMT bit `nmt`, and its NMT-trapped form for the others.
    pub fn set_trap_state(&self, page: PageNum, pages: usize, nmt: bool, state: TrapState) {
        let _lock = self.write_lock.lock();
        for i in 0..pages {
            self.set_pair(self.dupe_array(), page.plus(i), nmt, state);
        }
    }

    pub fn clear_trap_on_page(&self, page: PageNum, pages: usize) {
        let _lock = self.write_lock.lock();
        for i in 0..pages {
            for array in &self.arrays {
                self.set_pair(array, page.plus(i), false, TrapState::Clear);
            }
        }
    }

    pub fn clear_trap_on_block(&self, block: PageNum, pages: usize) {
        self.clear_trap_on_page(block, pages);
    }

    /// Stage the flip of a collector's NMT bit for `pages`: the states stay, but which references
    /// see them NMT-trapped swaps over.
    pub fn prepare_nmt_flip(&self, upcoming: bool, pages: &mut dyn Iterator<Item = PageNum>) {
        let _lock = self.write_lock.lock();
        let live = self.live_array();
        let dupe = self.dupe_array();
        for page in pages {
            let state =
                TrapState::from_raw(live[self.index(page, !upcoming)].load(Ordering::Acquire));
            self.set_pair(dupe, page, upcoming, state.without_nmt());
        }
    }

    pub fn is_any_trapped(&self, page: PageNum, nmt: bool) -> bool {
        self.read_trap(page, nmt) != TrapState::UnTrapped
    }

    pub fn is_remap_trapped(&self, page: PageNum, nmt: bool) -> bool {
        self.read_trap(page, nmt).is_remap_trapped()
    }

    pub fn is_new_gc_remap_trapped(&self, page: PageNum, nmt: bool) -> bool {
        self.read_trap(page, nmt).without_nmt() == TrapState::NewGcRemapTrapped
    }

    pub fn is_old_gc_remap_trapped(&self, page: PageNum, nmt: bool) -> bool {
        self.read_trap(page, nmt).without_nmt() == TrapState::OldGcRemapTrapped
    }

    /// Publish the staged copy. Only at a safepoint. The new staging copy starts as a copy of it.
    pub fn swap_readbarrier_arrays(&self) {
        let _lock = self.write_lock.lock();
        let live = self.live.load(Ordering::Acquire) ^ 1;
        self.live.store(live, Ordering::Release);
        let (from, to) = (&self.arrays[live], &self.arrays[live ^ 1]);
        for i in 0..from.len() {
            to[i].store(from[i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        trace!("Read barrier trap arrays swapped, {} live", live);
    }

    /// Stage a swap to happen with the commit of the current memory batch.
    pub fn batched_array_swap(&self) {
        let was_pending = self.swap_pending.swap(true, Ordering::AcqRel);
        assert!(!was_pending, "Trap array swap already staged");
    }

    /// Perform a staged swap. Returns false if none was staged.
    pub fn commit_batched_array_swap(&self) -> bool {
        if self.swap_pending.swap(false, Ordering::AcqRel) {
            self.swap_readbarrier_arrays();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array() -> ReadTrapArray {
        ReadTrapArray::new(100).unwrap()
    }

    #[test]
    fn nmt_bit_above_page_bits() {
        assert_eq!(array().nmt_index_bit(), 7);
    }

    #[test]
    fn fresh_pages_trap_only_stale_nmt() {
        let traps = array();
        let nmt = Nmt::default();
        traps.init_trap(PageNum(3), 1, &nmt, Gen::New, false);
        assert_eq!(traps.read_trap(PageNum(3), false), TrapState::UnTrapped);
        assert_eq!(traps.read_trap(PageNum(3), true), TrapState::NmtTrapped);
        assert!(!traps.is_any_trapped(PageNum(3), false));
        assert!(traps.is_any_trapped(PageNum(3), true));
    }

    #[test]
    fn large_tails_are_invalid() {
        let traps = array();
        traps.init_trap(PageNum(10), 3, &Nmt::default(), Gen::Old, true);
        assert_eq!(traps.read_trap(PageNum(10), false), TrapState::UnTrapped);
        assert_eq!(traps.read_trap(PageNum(11), false), TrapState::Invalid);
        assert_eq!(traps.read_trap(PageNum(12), true), TrapState::Invalid);
    }

    #[test]
    fn staged_states_appear_on_swap() {
        let traps = array();
        let nmt = Nmt::default();
        traps.init_trap(PageNum(5), 1, &nmt, Gen::New, false);
        traps.set_trap_state(PageNum(5), 1, false, TrapState::NewGcRemapTrapped);
        assert!(!traps.is_remap_trapped(PageNum(5), false));
        assert_eq!(traps.staged_trap(PageNum(5), true), TrapState::NewGcNmtRemapTrapped);

        traps.batched_array_swap();
        assert!(traps.commit_batched_array_swap());
        assert!(!traps.commit_batched_array_swap());
        assert!(traps.is_new_gc_remap_trapped(PageNum(5), false));
        assert!(!traps.is_old_gc_remap_trapped(PageNum(5), false));
        // The staging copy caught up with the live one.
        assert_eq!(traps.staged_trap(PageNum(5), false), TrapState::NewGcRemapTrapped);

        traps.clear_trap_on_page(PageNum(5), 1);
        assert_eq!(traps.read_trap(PageNum(5), false), TrapState::Clear);
        assert_eq!(traps.staged_trap(PageNum(5), true), TrapState::Clear);
    }

    #[test]
    fn nmt_flip_keeps_states() {
        let traps = array();
        let nmt = Nmt::default();
        traps.init_trap(PageNum(1), 1, &nmt, Gen::New, false);
        traps.init_trap(PageNum(2), 1, &nmt, Gen::New, false);
        traps.set_trap_state(PageNum(2), 1, false, TrapState::NewGcRemapTrapped);
        traps.swap_readbarrier_arrays();

        nmt.prepare_flip(Gen::New);
        traps.prepare_nmt_flip(nmt.upcoming(Gen::New), &mut [PageNum(1), PageNum(2)].into_iter());
        traps.swap_readbarrier_arrays();
        nmt.toggle_new_nmt();

        assert_eq!(traps.read_trap(PageNum(1), true), TrapState::UnTrapped);
        assert_eq!(traps.read_trap(PageNum(1), false), TrapState::NmtTrapped);
        assert_eq!(traps.read_trap(PageNum(2), true), TrapState::NewGcRemapTrapped);
        assert_eq!(traps.read_trap(PageNum(2), false), TrapState::NewGcNmtRemapTrapped);
    }
}
