use crate::util::heap::page_info::Gen;
use std::sync::atomic::{AtomicBool, Ordering};

/// The not-marked-through bit value each collector currently expects in references to its pages.
///
/// A collector prepares the flipped value at mark-remap setup, while it rebuilds the staging trap
/// array for it, and installs it at its initial-mark safepoint. Perm pages follow the old collector.
#[derive(Default)]
pub struct Nmt {
    new_desired: AtomicBool,
    new_upcoming: AtomicBool,
    old_desired: AtomicBool,
    old_upcoming: AtomicBool,
}

impl Nmt {
    fn flags(&self, gen: Gen) -> (&AtomicBool, &AtomicBool) {
        match gen {
            Gen::New => (&self.new_desired, &self.new_upcoming),
            Gen::Old | Gen::Perm => (&self.old_desired, &self.old_upcoming),
        }
    }

    pub fn desired(&self, gen: Gen) -> bool {
        self.flags(gen).0.load(Ordering::Acquire)
    }

    pub fn upcoming(&self, gen: Gen) -> bool {
        self.flags(gen).1.load(Ordering::Acquire)
    }

    /// Make the upcoming value the flip of the desired one.
    pub fn prepare_flip(&self, gen: Gen) {
        let (desired, upcoming) = self.flags(gen);
        upcoming.store(!desired.load(Ordering::Acquire), Ordering::Release);
    }

    pub fn toggle_new_nmt(&self) {
        self.toggle(Gen::New);
    }

    pub fn toggle_old_nmt(&self) {
        self.toggle(Gen::Old);
    }

    fn toggle(&self, gen: Gen) {
        let (desired, upcoming) = self.flags(gen);
        debug_assert_ne!(
            desired.load(Ordering::Relaxed),
            upcoming.load(Ordering::Relaxed),
            "NMT flip of {} not prepared",
            gen
        );
        desired.store(upcoming.load(Ordering::Acquire), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_is_staged() {
        let nmt = Nmt::default();
        nmt.prepare_flip(Gen::New);
        assert!(!nmt.desired(Gen::New));
        assert!(nmt.upcoming(Gen::New));
        nmt.toggle_new_nmt();
        assert!(nmt.desired(Gen::New));
        // The old collector's bits are untouched.
        assert!(!nmt.desired(Gen::Perm));
        assert!(!nmt.upcoming(Gen::Old));
    }
}
