//! Named mutual-exclusion tokens the two collectors use to stay out of each other's way.
//!
//! An interlock is owned by a collector, not a thread: a collector acquires it in one phase and may
//! release it phases later, and asserts ownership with [`Interlocks::held_by`]. Acquiring an interlock
//! the same collector already holds is a protocol violation.

use crate::collector::CollectorKind;
use enum_map::EnumMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, enum_map::Enum, strum_macros::Display, strum_macros::EnumIter)]
pub enum InterlockName {
    TlbResync,
    OldGcRelocateOld,
    OldGcRelocatePerm,
    NewToOldRootsFlushed,
    NewGcRelocate,
    VerifyingMarking,
    OldGcMarkClearing,
    NewGcMarkClearing,
    NewGcNmtFlipping,
    GpgcSafepoint,
    SidebandAlloc,
    NewGcCardMarkScan,
    BatchedMemoryOps,
}

#[derive(Default)]
struct Interlock {
    owner: Mutex<Option<CollectorKind>>,
    released: Condvar,
}

#[derive(Default)]
pub struct Interlocks {
    locks: EnumMap<InterlockName, Interlock>,
}

impl Interlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The owner slot of `name`. A panic while it was locked leaves the slot consistent, so poisoning
    /// is ignored and the holder's guard can still release it while unwinding.
    fn slot(&self, name: InterlockName) -> MutexGuard<'_, Option<CollectorKind>> {
        self.locks[name].owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `name` is free, then take it for `owner`.
    pub fn acquire(&self, name: InterlockName, owner: CollectorKind) -> InterlockGuard<'_> {
        let lock = &self.locks[name];
        let mut current = self.slot(name);
        if *current == Some(owner) {
            drop(current);
            panic!("{} collector acquiring interlock {} it already holds", owner, name);
        }
        while current.is_some() {
            current = lock.released.wait(current).unwrap_or_else(PoisonError::into_inner);
        }
        *current = Some(owner);
        trace!("{} collector acquired interlock {}", owner, name);
        InterlockGuard {
            interlocks: self,
            name,
            owner,
        }
    }

    /// Take `name` for `owner` if it is free.
    pub fn try_acquire(&self, name: InterlockName, owner: CollectorKind) -> Option<InterlockGuard<'_>> {
        let mut current = self.slot(name);
        if current.is_some() {
            return None;
        }
        *current = Some(owner);
        Some(InterlockGuard {
            interlocks: self,
            name,
            owner,
        })
    }

    pub fn owner(&self, name: InterlockName) -> Option<CollectorKind> {
        *self.slot(name)
    }

    pub fn is_held(&self, name: InterlockName) -> bool {
        self.owner(name).is_some()
    }

    pub fn held_by(&self, name: InterlockName, owner: CollectorKind) -> bool {
        self.owner(name) == Some(owner)
    }

    fn release(&self, name: InterlockName, owner: CollectorKind) {
        let lock = &self.locks[name];
        let mut current = self.slot(name);
        if !std::thread::panicking() {
            assert_eq!(
                *current,
                Some(owner),
                "Interlock {} released by a collector not holding it",
                name
            );
        }
        *current = None;
        lock.released.notify_all();
        trace!("{} collector released interlock {}", owner, name);
    }
}

/// Releases its interlock when dropped.
#[must_use]
pub struct InterlockGuard<'a> {
    interlocks: &'a Interlocks,
    name: InterlockName,
    owner: CollectorKind,
}

impl InterlockGuard<'_> {
    pub fn name(&self) -> InterlockName {
        self.name
    }
}

impl Drop for InterlockGuard<'_> {
    fn drop(&mut self) {
        self.interlocks.release(self.name, self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn guard_releases() {
        let interlocks = Interlocks::new();
        {
            let _guard = interlocks.acquire(InterlockName::TlbResync, CollectorKind::New);
            assert!(interlocks.held_by(InterlockName::TlbResync, CollectorKind::New));
            assert!(interlocks
                .try_acquire(InterlockName::TlbResync, CollectorKind::Old)
                .is_none());
        }
        assert!(!interlocks.is_held(InterlockName::TlbResync));
        assert!(interlocks
            .try_acquire(InterlockName::TlbResync, CollectorKind::Old)
            .is_some());
    }

    #[test]
    fn acquire_waits_for_the_other_collector() {
        let interlocks = Interlocks::new();
        let released = AtomicBool::new(false);
        let guard = interlocks.acquire(InterlockName::BatchedMemoryOps, CollectorKind::Old);
        crossbeam::scope(|s| {
            s.spawn(|_| {
                let _guard = interlocks.acquire(InterlockName::BatchedMemoryOps, CollectorKind::New);
                assert!(released.load(Ordering::SeqCst));
            });
            std::thread::sleep(Duration::from_millis(20));
            released.store(true, Ordering::SeqCst);
            drop(guard);
        })
        .unwrap();
        assert!(!interlocks.is_held(InterlockName::BatchedMemoryOps));
    }

    #[test]
    fn contended_acquires_all_complete() {
        let interlocks = Arc::new(Interlocks::new());
        panic_after(5000, move || {
            crossbeam::scope(|s| {
                for owner in [CollectorKind::New, CollectorKind::Old] {
                    let interlocks = &interlocks;
                    s.spawn(move |_| {
                        for _ in 0..1000 {
                            let _guard = interlocks.acquire(InterlockName::SidebandAlloc, owner);
                        }
                    });
                }
            })
            .unwrap();
            assert!(!interlocks.is_held(InterlockName::SidebandAlloc));
        });
    }

    #[test]
    fn reacquire_panic_unwinds_and_releases() {
        let interlocks = Interlocks::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _first = interlocks.acquire(InterlockName::SidebandAlloc, CollectorKind::New);
            let _second = interlocks.acquire(InterlockName::SidebandAlloc, CollectorKind::New);
        }));
        assert!(result.is_err());
        assert!(!interlocks.is_held(InterlockName::SidebandAlloc));
        let _again = interlocks.acquire(InterlockName::SidebandAlloc, CollectorKind::Old);
        assert!(interlocks.held_by(InterlockName::SidebandAlloc, CollectorKind::Old));
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn reacquiring_is_fatal() {
        let interlocks = Interlocks::new();
        let _first = interlocks.acquire(InterlockName::SidebandAlloc, CollectorKind::New);
        let _second = interlocks.acquire(InterlockName::SidebandAlloc, CollectorKind::New);
    }
}
