//! Accounting of the physical pages the heap holds.
//!
//! Pages are charged to the normal account up to the committed budget. When that runs out, and a
//! pause-prevention account is configured and has not failed in this cycle, pages are charged there
//! instead. Frees pay back the pause account first.

use crate::util::heap::atomic_checked_update;
use crate::util::heap::layout::{HeapLayout, PageNum};
use crate::util::memory::VirtualMemory;
use crate::util::worker::WorkerContext;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct PageBudget {
    memory: Arc<dyn VirtualMemory>,
    layout: HeapLayout,
    committed_budget: usize,
    pause_budget: usize,
    normal_pages: AtomicUsize,
    pause_pages: AtomicUsize,
    peak_normal_pages: AtomicUsize,
    peak_pause_pages: AtomicUsize,
    /// Set when the pause account was exhausted; no further pause allocation until reset.
    pause_allocation_failed: AtomicBool,
    /// Pages held by GC workers as spares. Charged to the normal account.
    preallocated_pages: AtomicUsize,
}

fn record_peak(peak: &AtomicUsize, value: usize) {
    peak.fetch_max(value, Ordering::Relaxed);
}

impl PageBudget {
    pub fn new(
        memory: Arc<dyn VirtualMemory>,
        layout: HeapLayout,
        committed_budget: usize,
        pause_budget: usize,
    ) -> Self {
        PageBudget {
            memory,
            layout,
            committed_budget,
            pause_budget,
            normal_pages: AtomicUsize::new(0),
            pause_pages: AtomicUsize::new(0),
            peak_normal_pages: AtomicUsize::new(0),
            peak_pause_pages: AtomicUsize::new(0),
            pause_allocation_failed: AtomicBool::new(false),
            preallocated_pages: AtomicUsize::new(0),
        }
    }

    pub fn committed_budget(&self) -> usize {
        self.committed_budget
    }

    pub fn normal_pages(&self) -> usize {
        self.normal_pages.load(Ordering::Acquire)
    }

    pub fn pause_pages(&self) -> usize {
        self.pause_pages.load(Ordering::Acquire)
    }

    pub fn used_pages(&self) -> usize {
        self.normal_pages() + self.pause_pages()
    }

    pub fn preallocated_pages(&self) -> usize {
        self.preallocated_pages.load(Ordering::Acquire)
    }

    pub fn peak_normal_pages(&self) -> usize {
        self.peak_normal_pages.load(Ordering::Relaxed)
    }

    pub fn peak_pause_pages(&self) -> usize {
        self.peak_pause_pages.load(Ordering::Relaxed)
    }

    pub fn pause_allocation_failed(&self) -> bool {
        self.pause_allocation_failed.load(Ordering::Acquire)
    }

    /// Charge `pages` to the accounts without committing memory. All or nothing.
    fn charge(&self, pages: usize) -> bool {
        let budget = self.committed_budget;
        if let Ok(used) = atomic_checked_update(&self.normal_pages, |used| {
            (used + pages <= budget).then_some(used + pages)
        }) {
            record_peak(&self.peak_normal_pages, used);
            return true;
        }
        if self.pause_budget == 0 || self.pause_allocation_failed() {
            return false;
        }
        let pause_budget = self.pause_budget;
        match atomic_checked_update(&self.pause_pages, |used| {
            (used + pages <= pause_budget).then_some(used + pages)
        }) {
            Ok(used) => {
                record_peak(&self.peak_pause_pages, used);
                true
            }
            Err(_) => {
                if !self.pause_allocation_failed.swap(true, Ordering::AcqRel) {
                    warn!(
                        "Pause prevention budget of {} pages exhausted",
                        self.pause_budget
                    );
                }
                false
            }
        }
    }

    /// Return `pages` to the accounts, paying back the pause account first.
    pub fn account_for_deallocate(&self, pages: usize) {
        if pages == 0 {
            return;
        }
        let mut paid = 0;
        let mut pause = self.pause_pages.load(Ordering::Acquire);
        while pause > 0 {
            let take = pause.min(pages);
            match self.pause_pages.compare_exchange_weak(
                pause,
                pause - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    paid = take;
                    break;
                }
                Err(actual) => pause = actual,
            }
        }
        let remaining = pages - paid;
        if remaining > 0 {
            if let Err(used) =
                atomic_checked_update(&self.normal_pages, |used| used.checked_sub(remaining))
            {
                panic!(
                    "Page budget underflow: freeing {} pages with {} in use",
                    remaining, used
                );
            }
        }
    }

    /// Charge `pages` without committing anything, for memory the OS commits on our behalf.
    pub fn account_for_allocate(&self, pages: usize) -> bool {
        self.charge(pages)
    }

    /// Charge `pages` to the normal account even past the budget. Only for GC workers healing pages
    /// they have no spare for; the excess is paid back as the relocated source pages are freed.
    pub fn force_allocate(&self, pages: usize) {
        let used = self.normal_pages.fetch_add(pages, Ordering::AcqRel) + pages;
        record_peak(&self.peak_normal_pages, used);
        if used > self.committed_budget {
            debug!(
                "Forced charge of {} pages, {} over budget",
                pages,
                used - self.committed_budget
            );
        }
    }

    /// Charge and commit one page. Returns false if neither account has room.
    pub fn allocate_page(&self, page: PageNum) -> bool {
        self.allocate_pages(page, 1)
    }

    /// Charge and commit `pages` contiguous pages. All or nothing.
    pub fn allocate_pages(&self, page: PageNum, pages: usize) -> bool {
        if !self.charge(pages) {
            return false;
        }
        let bytes = pages << self.layout.log_bytes_in_page;
        if !self.memory.commit(self.layout.page_to_addr(page), bytes) {
            self.account_for_deallocate(pages);
            return false;
        }
        true
    }

    /// Uncommit a page. A GC worker without a spare page keeps it as its spare instead.
    /// Returns true if the page's physical memory left the heap.
    pub fn deallocate_mapped_page(&self, worker: Option<&WorkerContext>, page: PageNum) -> bool {
        if let Some(worker) = worker {
            if self.refill_preallocated_page(worker, page) {
                return false;
            }
        }
        self.memory.uncommit(
            self.layout.page_to_addr(page),
            self.layout.bytes_in_page,
        );
        self.account_for_deallocate(1);
        true
    }

    /// Uncommit a block of pages, keeping the first as a spare if `worker` needs one. Returns the
    /// number of pages whose memory left the heap.
    pub fn deallocate_mapped_block(
        &self,
        worker: Option<&WorkerContext>,
        page: PageNum,
        pages: usize,
    ) -> usize {
        let mut first = page;
        let mut freed = pages;
        if let Some(worker) = worker {
            if pages > 0 && self.refill_preallocated_page(worker, page) {
                first = page.plus(1);
                freed -= 1;
            }
        }
        if freed > 0 {
            self.memory.uncommit(
                self.layout.page_to_addr(first),
                freed << self.layout.log_bytes_in_page,
            );
            self.account_for_deallocate(freed);
        }
        freed
    }

    fn refill_preallocated_page(&self, worker: &WorkerContext, page: PageNum) -> bool {
        let slot = match worker.preallocated_slot() {
            Some(slot) => slot,
            None => return false,
        };
        if worker.preallocated_page().is_some() {
            return false;
        }
        let spare = self.layout.preallocated_page(slot);
        self.memory.relocate(
            self.layout.page_to_addr(page),
            self.layout.page_to_addr(spare),
            self.layout.bytes_in_page,
        );
        worker.set_preallocated_page(spare);
        self.preallocated_pages.fetch_add(1, Ordering::AcqRel);
        trace!("Page {} kept as spare of worker {}", page, worker.ordinal());
        true
    }

    /// Give a GC worker its spare page, charging the budget. Returns false if there is no room.
    pub fn preallocate_page(&self, worker: &WorkerContext) -> bool {
        if worker.preallocated_page().is_some() {
            return true;
        }
        let slot = match worker.preallocated_slot() {
            Some(slot) => slot,
            None => return false,
        };
        let spare = self.layout.preallocated_page(slot);
        if !self.allocate_page(spare) {
            return false;
        }
        worker.set_preallocated_page(spare);
        self.preallocated_pages.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Move the worker's spare page into `target`. The page stays charged to the budget.
    pub fn get_preallocated_page(&self, worker: &WorkerContext, target: PageNum) -> bool {
        let spare = worker.take_preallocated_page();
        if spare.is_none() {
            return false;
        }
        self.memory.relocate(
            self.layout.page_to_addr(spare),
            self.layout.page_to_addr(target),
            self.layout.bytes_in_page,
        );
        self.preallocated_pages.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Give up the worker's spare page so its charge covers memory committed elsewhere. The spare's
    /// own memory is uncommitted; the page stays charged to the budget.
    pub fn consume_preallocated_page(&self, worker: &WorkerContext) -> bool {
        let spare = worker.take_preallocated_page();
        if spare.is_none() {
            return false;
        }
        self.memory.uncommit(
            self.layout.page_to_addr(spare),
            self.layout.bytes_in_page,
        );
        self.preallocated_pages.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Drop the worker's spare page, returning it to the budget.
    pub fn release_preallocated_page(&self, worker: &WorkerContext) {
        let spare = worker.take_preallocated_page();
        if spare.is_some() {
            self.memory.uncommit(
                self.layout.page_to_addr(spare),
                self.layout.bytes_in_page,
            );
            self.preallocated_pages.fetch_sub(1, Ordering::AcqRel);
            self.account_for_deallocate(1);
        }
    }

    /// Move pages charged to the pause account back to the normal account while it has room, and
    /// re-arm the pause account.
    pub fn return_pause_pages(&self) {
        loop {
            let pause = self.pause_pages();
            if pause == 0 {
                break;
            }
            let budget = self.committed_budget;
            if atomic_checked_update(&self.normal_pages, |used| (used < budget).then_some(used + 1)).is_err() {
                break;
            }
            if atomic_checked_update(&self.pause_pages, |used| used.checked_sub(1)).is_err() {
                // Someone paid the pause account back concurrently.
                let _ = atomic_checked_update(&self.normal_pages, |used| used.checked_sub(1));
                break;
            }
        }
        self.pause_allocation_failed.store(false, Ordering::Release);
    }

    pub fn report_peak_usage(&self, label: &str) {
        info!(
            "{}: peak pages normal {} pause {} (budget {} + {}), now {} + {}",
            label,
            self.peak_normal_pages(),
            self.peak_pause_pages(),
            self.committed_budget,
            self.pause_budget,
            self.normal_pages(),
            self.pause_pages()
        );
    }

    pub fn reset_peak_usage(&self) {
        self.peak_normal_pages
            .store(self.normal_pages(), Ordering::Relaxed);
        self.peak_pause_pages.store(self.pause_pages(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory::MmapMemory;
    use crate::util::test_util::test_options;
    use crate::util::worker::WorkerKind;

    fn budget(normal: usize, pause: usize) -> PageBudget {
        let memory: Arc<dyn VirtualMemory> = Arc::new(MmapMemory::new());
        let mut layout = HeapLayout::new(&test_options(), 4);
        layout.heap_base = memory
            .reserve(layout.reserved_bytes(), layout.bytes_in_mid_block())
            .unwrap();
        PageBudget::new(memory, layout, normal, pause)
    }

    fn small_page(budget: &PageBudget, i: usize) -> PageNum {
        budget.layout.small_space_start.plus(i)
    }

    #[test]
    fn falls_back_to_pause_account() {
        let budget = budget(2, 1);
        assert!(budget.allocate_page(small_page(&budget, 0)));
        assert!(budget.allocate_page(small_page(&budget, 1)));
        assert!(budget.allocate_page(small_page(&budget, 2)));
        assert_eq!(budget.pause_pages(), 1);
        assert!(!budget.allocate_page(small_page(&budget, 3)));
        assert!(budget.pause_allocation_failed());
        assert_eq!(budget.used_pages(), 3);

        // Frees pay back the pause account first.
        assert!(budget.deallocate_mapped_page(None, small_page(&budget, 0)));
        assert_eq!(budget.pause_pages(), 0);
        assert_eq!(budget.normal_pages(), 2);
        budget.return_pause_pages();
        assert!(!budget.pause_allocation_failed());
    }

    #[test]
    fn allocate_pages_is_all_or_nothing() {
        let budget = budget(4, 0);
        assert!(!budget.allocate_pages(small_page(&budget, 0), 5));
        assert_eq!(budget.used_pages(), 0);
        assert!(budget.allocate_pages(small_page(&budget, 0), 4));
        assert_eq!(budget.peak_normal_pages(), 4);
        assert_eq!(budget.deallocate_mapped_block(None, small_page(&budget, 0), 4), 4);
        assert_eq!(budget.used_pages(), 0);
    }

    #[test]
    fn frees_pay_the_pause_account() {
        let budget = budget(1, 2);
        assert!(budget.allocate_page(small_page(&budget, 0)));
        assert!(budget.allocate_page(small_page(&budget, 1)));
        assert_eq!(budget.pause_pages(), 1);
        assert!(budget.deallocate_mapped_page(None, small_page(&budget, 1)));
        assert_eq!(budget.used_pages(), 1);
        assert_eq!(budget.pause_pages(), 0);
    }

    #[test]
    #[should_panic]
    fn underflow_is_fatal() {
        let budget = budget(1, 0);
        budget.account_for_deallocate(1);
    }

    #[test]
    fn worker_keeps_a_spare() {
        let budget = budget(4, 0);
        let worker = WorkerContext::new(0, WorkerKind::NewGC, Some(0));
        let page = small_page(&budget, 0);
        assert!(budget.allocate_page(page));
        unsafe { budget.layout.page_to_addr(page).store(99usize) };

        // The freed page becomes the worker's spare rather than leaving the heap.
        assert!(!budget.deallocate_mapped_page(Some(&worker), page));
        assert!(worker.preallocated_page().is_some());
        assert_eq!(budget.used_pages(), 1);
        assert_eq!(budget.preallocated_pages(), 1);

        let target = small_page(&budget, 5);
        assert!(budget.get_preallocated_page(&worker, target));
        assert!(worker.preallocated_page().is_none());
        unsafe { assert_eq!(budget.layout.page_to_addr(target).load::<usize>(), 99) };
        assert!(!budget.get_preallocated_page(&worker, target));

        assert!(budget.preallocate_page(&worker));
        assert_eq!(budget.used_pages(), 2);
        budget.release_preallocated_page(&worker);
        assert_eq!(budget.used_pages(), 1);
    }

    #[test]
    fn forced_charge_goes_over_budget() {
        let budget = budget(1, 0);
        assert!(budget.allocate_page(small_page(&budget, 0)));
        budget.force_allocate(2);
        assert_eq!(budget.normal_pages(), 3);
        assert_eq!(budget.peak_normal_pages(), 3);
        budget.account_for_deallocate(2);
        assert_eq!(budget.used_pages(), 1);
    }
}
