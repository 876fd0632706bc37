//! Forwarding records and the claim protocol for copying one object.
//!
//! A record is one word: two state bits, the word index of the new copy relative to the heap base,
//! and the word offset of the object in its source page (or mid block). Records live in per-page
//! open-addressed tables keyed by the old offset.

use crate::policy::space::HeapContext;
use crate::util::heap::page_info::{Gen, PageInfo, NO_RELOCATIONS};
use crate::util::Address;
use std::sync::atomic::{fence, AtomicU64, Ordering};

#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocationState {
    Empty = 0,
    Unclaimed = 1,
    Claimed = 2,
    Relocated = 3,
}

const STATE_SHIFT: u32 = 62;
const NEW_ADDR_SHIFT: u32 = 24;
const NEW_ADDR_BITS: u32 = 38;
const NEW_ADDR_MASK: u64 = (1 << NEW_ADDR_BITS) - 1;
const OLD_OFFSET_BITS: u32 = 24;
const OLD_OFFSET_MASK: u64 = (1 << OLD_OFFSET_BITS) - 1;

/// Largest word offset a record can hold: the words of a mid block with the biggest pages.
pub const MAX_OLD_OFFSET: usize = OLD_OFFSET_MASK as usize;

const_assert!(STATE_SHIFT >= NEW_ADDR_SHIFT + NEW_ADDR_BITS);

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ObjectRelocation(u64);

impl ObjectRelocation {
    pub const EMPTY: ObjectRelocation = ObjectRelocation(0);

    pub fn unclaimed(old_offset: usize) -> Self {
        debug_assert!(old_offset <= MAX_OLD_OFFSET);
        ObjectRelocation(((RelocationState::Unclaimed as u64) << STATE_SHIFT) | old_offset as u64)
    }

    fn with_state(self, state: RelocationState) -> Self {
        ObjectRelocation((self.0 & !(3 << STATE_SHIFT)) | ((state as u64) << STATE_SHIFT))
    }

    /// This record, relocated to the word at `new_index` from the heap base.
    pub fn relocated_to(self, new_index: usize) -> Self {
        debug_assert!((new_index as u64) <= NEW_ADDR_MASK);
        let cleared = self.0 & !(NEW_ADDR_MASK << NEW_ADDR_SHIFT);
        ObjectRelocation(cleared | ((new_index as u64) << NEW_ADDR_SHIFT))
            .with_state(RelocationState::Relocated)
    }

    pub fn state(self) -> RelocationState {
        match self.0 >> STATE_SHIFT {
            0 => RelocationState::Empty,
            1 => RelocationState::Unclaimed,
            2 => RelocationState::Claimed,
            _ => RelocationState::Relocated,
        }
    }

    pub fn old_offset(self) -> usize {
        (self.0 & OLD_OFFSET_MASK) as usize
    }

    pub fn new_index(self) -> usize {
        ((self.0 >> NEW_ADDR_SHIFT) & NEW_ADDR_MASK) as usize
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for ObjectRelocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?}(old +{}, new #{})",
            self.state(),
            self.old_offset(),
            self.new_index()
        )
    }
}

fn hash(old_offset: usize) -> usize {
    ((old_offset as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
}

/// The forwarding table of one page, in the sideband arena.
#[derive(Copy, Clone, Debug)]
pub struct RelocationTable {
    base: Address,
    len: usize,
}

impl RelocationTable {
    pub fn new(base: Address, len: usize) -> Self {
        assert!(len.is_power_of_two());
        RelocationTable { base, len }
    }

    /// The table installed on a page selected for relocation, if any.
    pub fn of(info: &PageInfo) -> Option<Self> {
        let table = info.relocations();
        if table == NO_RELOCATIONS {
            return None;
        }
        // Safe: the arena hands out word-aligned addresses.
        let base = unsafe { Address::from_usize(table) };
        Some(RelocationTable::new(base, info.reloc_len()))
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.len);
        // The table is zeroed words owned by this page until the sideband is reset.
        unsafe { &*self.base.plus_words(index).to_ptr::<AtomicU64>() }
    }

    pub fn load(&self, index: usize) -> ObjectRelocation {
        ObjectRelocation(self.slot(index).load(Ordering::Acquire))
    }

    /// Add an unclaimed record for the object at `old_offset`.
    pub fn insert(&self, old_offset: usize) {
        let mask = self.len - 1;
        let record = ObjectRelocation::unclaimed(old_offset);
        let mut index = hash(old_offset) & mask;
        for _ in 0..self.len {
            match self.slot(index).compare_exchange(
                0,
                record.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    assert_ne!(
                        ObjectRelocation(actual).old_offset(),
                        old_offset,
                        "Duplicate forwarding record for +{}",
                        old_offset
                    );
                }
            }
            index = (index + 1) & mask;
        }
        panic!("Forwarding table of {} records full", self.len);
    }

    /// The slot holding the record for `old_offset`. Every live object has one.
    pub fn find(&self, old_offset: usize) -> &AtomicU64 {
        let mask = self.len - 1;
        let mut index = hash(old_offset) & mask;
        for _ in 0..self.len {
            let record = self.load(index);
            if record.state() == RelocationState::Empty {
                break;
            }
            if record.old_offset() == old_offset {
                return self.slot(index);
            }
            index = (index + 1) & mask;
        }
        panic!("No forwarding record for +{} in table at {}", old_offset, self.base);
    }

    pub fn lookup(&self, old_offset: usize) -> ObjectRelocation {
        ObjectRelocation(self.find(old_offset).load(Ordering::Acquire))
    }

    /// Slots holding a record, in table order.
    pub fn records(&self) -> impl Iterator<Item = &AtomicU64> + '_ {
        (0..self.len)
            .filter(move |&index| self.load(index).state() != RelocationState::Empty)
            .map(move |index| self.slot(index))
    }
}

/// Copy the object recorded in `slot`, or wait for the thread that claimed it.
///
/// `object` is its old address and `copy_from` where its contents can still be read (the mirror, for
/// small pages). `allocate` returns space for the copy in `target`; when it fails, the claim is
/// dropped and `None` returned so the caller can back off and retry. Returns the new address.
pub fn relocate_object(
    heap: &HeapContext,
    slot: &AtomicU64,
    object: Address,
    copy_from: Address,
    source: Gen,
    target: Gen,
    allocate: &mut dyn FnMut(usize) -> Option<Address>,
) -> Option<Address> {
    let heap_base = heap.meta().layout.heap_base;
    let mut spins = 0usize;
    loop {
        let record = ObjectRelocation(slot.load(Ordering::Acquire));
        match record.state() {
            RelocationState::Relocated => {
                return Some(heap_base.plus_words(record.new_index()));
            }
            RelocationState::Claimed => {
                spins += 1;
                if spins % 64 == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
            RelocationState::Unclaimed => {
                let claimed = record.with_state(RelocationState::Claimed);
                if slot
                    .compare_exchange(record.raw(), claimed.raw(), Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                let words = heap.model.size_in_words(copy_from);
                let new = match allocate(words) {
                    Some(new) => new,
                    None => {
                        slot.store(record.raw(), Ordering::Release);
                        return None;
                    }
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        copy_from.to_ptr::<u8>(),
                        new.to_mut_ptr::<u8>(),
                        words << crate::util::constants::LOG_BYTES_IN_WORD,
                    );
                }
                if heap.generation(target).marking_underway() {
                    heap.mark_object_with_size(new, words);
                }
                if source != target {
                    heap.meta().cards.card_mark_across_region(new, new.plus_words(words));
                }
                fence(Ordering::Release);
                slot.store(
                    claimed.relocated_to(new.words_from(heap_base)).raw(),
                    Ordering::Release,
                );
                trace!("Relocated {} to {} ({} words)", object, new, words);
                return Some(new);
            }
            RelocationState::Empty => panic!("Relocating {} through an empty record", object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory::mmap_zeroed_noreserve;

    fn table(len: usize) -> RelocationTable {
        let base = mmap_zeroed_noreserve(len * 8).unwrap();
        RelocationTable::new(base, len)
    }

    #[test]
    fn record_fields() {
        let record = ObjectRelocation::unclaimed(1234);
        assert_eq!(record.state(), RelocationState::Unclaimed);
        assert_eq!(record.old_offset(), 1234);
        let moved = record.relocated_to(987_654_321);
        assert_eq!(moved.state(), RelocationState::Relocated);
        assert_eq!(moved.old_offset(), 1234);
        assert_eq!(moved.new_index(), 987_654_321);
        assert_eq!(ObjectRelocation::EMPTY.state(), RelocationState::Empty);
    }

    #[test]
    fn insert_and_find() {
        let table = table(16);
        let offsets = [0, 8, 16, 1000, 4095, 77];
        for offset in offsets {
            table.insert(offset);
        }
        assert_eq!(table.records().count(), offsets.len());
        for offset in offsets {
            let record = ObjectRelocation(table.find(offset).load(Ordering::Acquire));
            assert_eq!(record.old_offset(), offset);
            assert_eq!(record.state(), RelocationState::Unclaimed);
        }
    }

    #[test]
    fn full_table_probes_everywhere() {
        let table = table(4);
        for offset in [3, 7, 11, 15] {
            table.insert(offset);
        }
        for offset in [3, 7, 11, 15] {
            assert_eq!(
                ObjectRelocation(table.find(offset).load(Ordering::Acquire)).old_offset(),
                offset
            );
        }
    }

    #[test]
    #[should_panic(expected = "No forwarding record")]
    fn missing_record_is_fatal() {
        let table = table(8);
        table.insert(5);
        table.find(6);
    }
}
