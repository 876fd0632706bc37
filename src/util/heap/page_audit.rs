//! A per-page trail of lifecycle operations, for post-mortem debugging.

use crate::util::constants::PAGE_AUDIT_ENTRIES;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::Gen;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use strum_macros::{Display, FromRepr};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
pub enum AuditAction {
    FailedAlloc = 1,
    AllocPage,
    GetPreAlloc,
    GetForRemap,
    FreeMirror,
    FreePage,
    Released,
    CloseShared,
    RemapToMirror,
}

/// Call-site codes. Each is or-ed with the bits of the generation involved.
pub mod why {
    pub const MID_SUB_PAGES_FAILED: u32 = 0x100;
    pub const MID_SUB_PAGES: u32 = 0x200;
    pub const NEW_SMALL_PAGE: u32 = 0x300;
    pub const NEW_MID_PAGE: u32 = 0x400;
    pub const FULL_SMALL_PAGE: u32 = 0x500;
    pub const CLEAR_BLOCK_STATE: u32 = 0x600;
    pub const MULTI_PAGE: u32 = 0x700;
    pub const MID_REMAPPING_PAGE: u32 = 0x800;
    pub const RELOCATION_PAGE: u32 = 0x900;
    pub const CLONE_BLOCK: u32 = 0xA00;
    pub const FREE_MIRROR: u32 = 0xB00;
    pub const FREE_REMAPPED: u32 = 0xC00;
    pub const RELEASE_RELOCATED_PAGE: u32 = 0xD00;
    pub const RELEASE_RELOCATED_BLOCK: u32 = 0xE00;
    pub const RELEASE_EMPTY_PAGE: u32 = 0xF00;
    pub const RELEASE_EMPTY_BLOCK: u32 = 0x1000;
    pub const CLOSE_SHARED_SMALL: u32 = 0x1100;
    pub const CLOSE_SHARED_MID: u32 = 0x1200;
    pub const GC_SMALL_RELOCATION_PAGE: u32 = 0x3000;
    pub const REMAP_TO_MIRROR: u32 = 0x3200;
}

pub fn why_for(site: u32, gen: Gen) -> u32 {
    site | gen.bits() as u32
}

pub struct PageAudit {
    enabled: bool,
    cursors: Box<[AtomicUsize]>,
    entries: Box<[AtomicU64]>,
}

impl PageAudit {
    /// An audit trail for `pages` pages. Nothing is allocated unless `enabled`.
    pub fn new(pages: usize, enabled: bool) -> Self {
        let pages = if enabled { pages } else { 0 };
        PageAudit {
            enabled,
            cursors: (0..pages).map(|_| AtomicUsize::new(0)).collect(),
            entries: (0..pages * PAGE_AUDIT_ENTRIES)
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[inline(always)]
    pub fn audit(&self, page: PageNum, action: AuditAction, why: u32) {
        if !self.enabled {
            return;
        }
        let slot = self.cursors[page.index()].fetch_add(1, Ordering::Relaxed) % PAGE_AUDIT_ENTRIES;
        let entry = ((action as u64) << 32) | why as u64;
        self.entries[page.index() * PAGE_AUDIT_ENTRIES + slot].store(entry, Ordering::Relaxed);
    }

    /// Audit every page of a block with the same record.
    pub fn audit_block(&self, page: PageNum, pages: usize, action: AuditAction, why: u32) {
        for i in 0..pages {
            self.audit(page.plus(i), action, why);
        }
    }

    /// The trail of `page`, oldest first. Only the last few entries are kept.
    pub fn history(&self, page: PageNum) -> Vec<(AuditAction, u32)> {
        if !self.enabled {
            return vec![];
        }
        let cursor = self.cursors[page.index()].load(Ordering::Relaxed);
        let first = cursor.saturating_sub(PAGE_AUDIT_ENTRIES);
        (first..cursor)
            .filter_map(|i| {
                let entry = self.entries[page.index() * PAGE_AUDIT_ENTRIES + i % PAGE_AUDIT_ENTRIES]
                    .load(Ordering::Relaxed);
                AuditAction::from_repr((entry >> 32) as u8).map(|action| (action, entry as u32))
            })
            .collect()
    }

    pub fn last(&self, page: PageNum) -> Option<(AuditAction, u32)> {
        self.history(page).pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_records_nothing() {
        let audit = PageAudit::new(4, false);
        audit.audit(PageNum(1), AuditAction::AllocPage, why::NEW_SMALL_PAGE);
        assert!(audit.history(PageNum(1)).is_empty());
    }

    #[test]
    fn records_in_order() {
        let audit = PageAudit::new(4, true);
        audit.audit(PageNum(2), AuditAction::AllocPage, why_for(why::NEW_SMALL_PAGE, Gen::New));
        audit.audit(PageNum(2), AuditAction::FreePage, why_for(why::RELEASE_EMPTY_PAGE, Gen::New));
        assert_eq!(
            audit.history(PageNum(2)),
            vec![
                (AuditAction::AllocPage, 0x301),
                (AuditAction::FreePage, 0xF01)
            ]
        );
        assert!(audit.history(PageNum(3)).is_empty());
    }

    #[test]
    fn ring_keeps_the_newest() {
        let audit = PageAudit::new(1, true);
        for i in 0..(PAGE_AUDIT_ENTRIES as u32 + 10) {
            audit.audit(PageNum(0), AuditAction::Released, i);
        }
        let history = audit.history(PageNum(0));
        assert_eq!(history.len(), PAGE_AUDIT_ENTRIES);
        assert_eq!(history[0].1, 10);
        assert_eq!(audit.last(PageNum(0)).unwrap().1, PAGE_AUDIT_ENTRIES as u32 + 9);
    }
}
