use crate::util::heap::layout::PageNum;
use std::cell::Cell;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    Mutator,
    NewGC,
    OldGC,
}

/// State owned by one thread that calls into the heap.
///
/// GC workers keep one committed spare page here. Healing a mid-space page and relocating an object
/// must not fail for lack of memory, so a worker that frees a page refills its spare first, and uses
/// the spare when the page budget is exhausted.
pub struct WorkerContext {
    ordinal: usize,
    kind: WorkerKind,
    /// Index into the preallocated-page region, for GC workers.
    preallocated_slot: Option<usize>,
    preallocated: Cell<PageNum>,
}

impl WorkerContext {
    pub fn new(ordinal: usize, kind: WorkerKind, preallocated_slot: Option<usize>) -> Self {
        debug_assert!(kind != WorkerKind::Mutator || preallocated_slot.is_none());
        WorkerContext {
            ordinal,
            kind,
            preallocated_slot,
            preallocated: Cell::new(PageNum::NONE),
        }
    }

    pub fn mutator(ordinal: usize) -> Self {
        Self::new(ordinal, WorkerKind::Mutator, None)
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn is_gc_worker(&self) -> bool {
        self.kind != WorkerKind::Mutator
    }

    pub fn preallocated_slot(&self) -> Option<usize> {
        self.preallocated_slot
    }

    /// The spare page currently held, or `PageNum::NONE`.
    pub fn preallocated_page(&self) -> PageNum {
        self.preallocated.get()
    }

    pub fn set_preallocated_page(&self, page: PageNum) {
        self.preallocated.set(page);
    }

    pub fn take_preallocated_page(&self) -> PageNum {
        self.preallocated.replace(PageNum::NONE)
    }

    /// A cheap hash of the thread identity, spreading threads over relocation slots.
    pub fn relocation_hash(&self) -> usize {
        let h = (self.ordinal as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (h >> 32) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spare_page_handoff() {
        let worker = WorkerContext::new(3, WorkerKind::NewGC, Some(3));
        assert!(worker.is_gc_worker());
        assert!(worker.preallocated_page().is_none());
        worker.set_preallocated_page(PageNum(12));
        assert_eq!(worker.take_preallocated_page(), PageNum(12));
        assert!(worker.preallocated_page().is_none());
    }

    #[test]
    fn hashes_spread() {
        let hashes: std::collections::HashSet<usize> = (0..16)
            .map(|i| WorkerContext::mutator(i).relocation_hash() % 8)
            .collect();
        assert!(hashes.len() > 1);
    }
}
