use std::sync::atomic::{AtomicIsize, Ordering};

/// Extra physical pages a collector holds while it relocates: target pages are allocated before
/// the source pages they replace are freed.
///
/// The count can dip below zero within a cycle: pages freed by releasing empty pages are subtracted
/// before any target page is charged.
#[derive(Default)]
pub struct RelocationSpike {
    current: AtomicIsize,
    peak: AtomicIsize,
}

impl RelocationSpike {
    pub fn add_and_record_peak(&self, pages: isize) {
        let current = self.current.fetch_add(pages, Ordering::AcqRel) + pages;
        self.peak.fetch_max(current, Ordering::AcqRel);
    }

    pub fn subtract(&self, pages: isize) {
        self.current.fetch_sub(pages, Ordering::AcqRel);
    }

    pub fn current(&self) -> isize {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> isize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::Release);
        self.peak.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_the_peak() {
        let spike = RelocationSpike::default();
        spike.add_and_record_peak(3);
        spike.subtract(2);
        spike.add_and_record_peak(1);
        assert_eq!(spike.current(), 2);
        assert_eq!(spike.peak(), 3);
        spike.subtract(5);
        assert_eq!(spike.current(), -3);
        spike.reset();
        assert_eq!((spike.current(), spike.peak()), (0, 0));
    }
}
