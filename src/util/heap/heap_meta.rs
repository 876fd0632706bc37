use crate::util::heap::layout::{HeapLayout, PageNum};
use crate::util::heap::page_audit::{AuditAction, PageAudit};
use crate::util::heap::page_budget::PageBudget;
use crate::util::heap::page_info::{PageInfo, PageInfoTable};
use crate::util::memory::VirtualMemory;
use crate::util::metadata::card_table::CardTable;
use crate::util::metadata::marks::Marks;
use crate::util::options::Options;
use crate::util::Address;
use std::sync::Arc;

/// The reserved heap range and the structures every space shares: the page-info table, the mark
/// bitmaps, the card table, the audit trail and the page budget.
pub struct HeapMeta {
    pub layout: HeapLayout,
    pub memory: Arc<dyn VirtualMemory>,
    pub page_info: PageInfoTable,
    pub marks: Marks,
    pub cards: CardTable,
    pub audit: PageAudit,
    pub budget: PageBudget,
}

impl HeapMeta {
    /// Reserve the heap range for `options` and build the side structures over it.
    pub fn new(
        options: &Options,
        memory: Arc<dyn VirtualMemory>,
        preallocated_pages: usize,
    ) -> std::io::Result<Self> {
        let mut layout = HeapLayout::new(options, preallocated_pages);
        layout.heap_base = memory.reserve(layout.reserved_bytes(), layout.bytes_in_mid_block())?;
        layout.validate();
        debug!(
            "Heap reserved at {} ({} bytes): mid {}..{}, large {}..{}, small {}..{}",
            layout.heap_base,
            layout.reserved_bytes(),
            layout.mid_space_start,
            layout.mid_space_end,
            layout.large_space_start,
            layout.large_space_end,
            layout.small_space_start,
            layout.small_space_end
        );
        let marks = Marks::new(&layout)?;
        let cards = CardTable::new(&layout)?;
        let budget = PageBudget::new(
            memory.clone(),
            layout.clone(),
            options.max_heap_pages,
            options.pause_prevention_pages,
        );
        Ok(HeapMeta {
            page_info: PageInfoTable::new(&layout),
            audit: PageAudit::new(layout.heap_pages(), options.page_audit),
            marks,
            cards,
            budget,
            memory,
            layout,
        })
    }

    #[inline(always)]
    pub fn info(&self, page: PageNum) -> &PageInfo {
        self.page_info.info(page)
    }

    pub fn words_in_page(&self) -> usize {
        self.layout.words_in_page
    }

    pub fn page_to_addr(&self, page: PageNum) -> Address {
        self.layout.page_to_addr(page)
    }

    pub fn addr_to_page(&self, addr: Address) -> PageNum {
        self.layout.addr_to_page(addr)
    }

    pub fn audit(&self, page: PageNum, action: AuditAction, why: u32) {
        self.audit.audit(page, action, why);
    }

    pub fn audit_block(&self, page: PageNum, pages: usize, action: AuditAction, why: u32) {
        self.audit.audit_block(page, pages, action, why);
    }

    /// Monotonic timestamp, in milliseconds, for page ages.
    pub fn now_millis(&self) -> i64 {
        lazy_static! {
            static ref EPOCH: std::time::Instant = std::time::Instant::now();
        }
        EPOCH.elapsed().as_millis() as i64
    }
}

impl Drop for HeapMeta {
    fn drop(&mut self) {
        self.memory
            .release(self.layout.heap_base, self.layout.reserved_bytes());
    }
}
