//! Side tables indexed by heap position: the mark bitmaps and the card table.

pub mod card_table;
pub mod marks;

use crate::util::memory::{mmap_zeroed_noreserve, try_munmap};
use crate::util::Address;
use std::marker::PhantomData;

/// A zero-initialized array of atomics in its own mapping. Only touched parts take physical memory.
pub struct SideTable<A: atomic_traits::Atomic> {
    start: Address,
    len: usize,
    _marker: PhantomData<A>,
}

// Safety: the table only hands out shared references to atomics.
unsafe impl<A: atomic_traits::Atomic + Sync> Sync for SideTable<A> {}
unsafe impl<A: atomic_traits::Atomic + Send> Send for SideTable<A> {}

impl<A: atomic_traits::Atomic> SideTable<A> {
    pub fn new(len: usize) -> std::io::Result<Self> {
        let bytes = (len * std::mem::size_of::<A>()).max(1);
        let start = mmap_zeroed_noreserve(bytes)?;
        Ok(SideTable {
            start,
            len,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[A] {
        // Atomics are valid for the all-zero bit pattern the mapping starts with.
        unsafe { std::slice::from_raw_parts(self.start.to_ptr::<A>(), self.len) }
    }
}

impl<A: atomic_traits::Atomic> std::ops::Index<usize> for SideTable<A> {
    type Output = A;

    #[inline(always)]
    fn index(&self, index: usize) -> &A {
        &self.as_slice()[index]
    }
}

impl<A: atomic_traits::Atomic> Drop for SideTable<A> {
    fn drop(&mut self) {
        let bytes = (self.len * std::mem::size_of::<A>()).max(1);
        if let Err(e) = try_munmap(self.start, bytes) {
            warn!("Unable to unmap side table at {}: {}", self.start, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn starts_zeroed() {
        let table = SideTable::<AtomicU64>::new(1 << 20).unwrap();
        assert_eq!(table.len(), 1 << 20);
        assert_eq!(table[12345].load(Ordering::Relaxed), 0);
        table[12345].store(7, Ordering::Relaxed);
        assert_eq!(table.as_slice()[12345].load(Ordering::Relaxed), 7);
    }
}
