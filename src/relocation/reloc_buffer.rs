//! Per-worker bump allocation of small relocation targets.

use crate::policy::space::HeapContext;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::{Gen, PageState};
use crate::util::worker::WorkerContext;
use crate::util::Address;
use enum_map::EnumMap;

/// The open target page of one GC worker for each generation it relocates into. A page stays
/// `Allocating` while open so that population counting leaves it alone, and is published `Allocated`
/// when the worker moves on.
pub struct RelocBuffers {
    pages: EnumMap<Gen, PageNum>,
}

impl Default for RelocBuffers {
    fn default() -> Self {
        RelocBuffers {
            pages: EnumMap::from_fn(|_| PageNum::NONE),
        }
    }
}

impl RelocBuffers {
    /// Space for `words` words copied from `source` into `target`.
    pub fn allocate(
        &mut self,
        heap: &HeapContext,
        source: Gen,
        target: Gen,
        words: usize,
        time: i64,
        worker: &WorkerContext,
    ) -> Address {
        let meta = heap.meta();
        let page = self.pages[target];
        if page.is_some() {
            let info = meta.info(page);
            let top = info.top();
            if top.plus_words(words) <= meta.page_to_addr(page.plus(1)) {
                info.set_top(top.plus_words(words));
                return top;
            }
            self.close(heap, target);
        }
        let page = heap
            .generation(target)
            .allocate_small_relocation_page(source, words, time, Some(worker), PageState::Allocating)
            .unwrap_or_else(|| panic!("GC worker {} found no relocation page", worker.ordinal()));
        self.pages[target] = page;
        meta.page_to_addr(page)
    }

    fn close(&mut self, heap: &HeapContext, target: Gen) {
        let page = std::mem::replace(&mut self.pages[target], PageNum::NONE);
        if page.is_some() {
            heap.meta()
                .info(page)
                .transition(target, PageState::Allocating, PageState::Allocated);
        }
    }

    /// Publish every open page. Before the worker finishes relocating.
    pub fn close_all(&mut self, heap: &HeapContext) {
        for gen in [Gen::New, Gen::Old, Gen::Perm] {
            self.close(heap, gen);
        }
    }
}

impl Drop for RelocBuffers {
    fn drop(&mut self) {
        debug_assert!(
            self.pages.values().all(|page| page.is_none()),
            "Relocation buffer dropped with open pages"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::fixtures::TestHeap;
    use crate::util::worker::WorkerKind;

    #[test]
    fn bumps_then_moves_to_a_new_page() {
        let heap = TestHeap::new();
        let worker = WorkerContext::new(0, WorkerKind::NewGC, Some(0));
        let mut buffers = RelocBuffers::default();
        let words_in_page = heap.meta().words_in_page();
        let a = buffers.allocate(&heap, Gen::New, Gen::Old, 16, 7, &worker);
        let b = buffers.allocate(&heap, Gen::New, Gen::Old, 16, 7, &worker);
        assert_eq!(b, a.plus_words(16));
        let page = heap.meta().addr_to_page(a);
        assert_eq!(heap.meta().info(page).state(), PageState::Allocating);
        assert_eq!(heap.meta().info(page).gen(), Some(Gen::Old));

        let c = buffers.allocate(&heap, Gen::New, Gen::Old, words_in_page - 16, 7, &worker);
        assert_ne!(heap.meta().addr_to_page(c), page);
        assert_eq!(heap.meta().info(page).state(), PageState::Allocated);
        buffers.close_all(&heap);
        assert_eq!(
            heap.meta().info(heap.meta().addr_to_page(c)).state(),
            PageState::Allocated
        );
    }
}
