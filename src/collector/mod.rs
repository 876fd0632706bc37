//! The two collectors and the machinery they share.
//!
//! A [`NewCollector`](new_collector::NewCollector) collects new space and promotes aged objects; an
//! [`OldCollector`](old_collector::OldCollector) collects old and perm space. Both step through the
//! same [`CollectionState`] sequence on their own schedules, and coordinate through [`interlock`]s.
//! Marking is done outside this crate, through [`CollectionHooks`].

pub mod interlock;
pub mod new_collector;
pub mod nmt;
pub mod old_collector;
pub mod phases;
pub mod population;
pub mod read_trap_array;
pub mod spike;
pub mod workers;

use crate::policy::space::HeapContext;
use crate::util::heap::page_info::Gen;
use crate::util::Address;
use downcast_rs::{impl_downcast, Downcast};

/// Phases of a collection cycle, in the order a cycle passes through them.
#[repr(u8)]
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    bytemuck::NoUninit,
    strum_macros::Display,
    strum_macros::EnumCount,
    strum_macros::FromRepr,
)]
pub enum CollectionState {
    NotCollecting = 1,
    CollectionStarting = 2,
    MarkRemapSetup = 3,
    InitialMarkSafepoint = 4,
    ConcurrentMarking = 5,
    WeakRefSafepoint = 6,
    ConcurrentRefProcessing = 7,
    FinalMarkSafepoint = 8,
    ConcurrentWeakMarking = 9,
    MarkingVerification = 10,
    MarkingCleanup = 11,
    RelocationSetup = 12,
    RelocationSafepoint = 13,
    ConcurrentRelocation = 14,
    RelocationSetup2 = 15,
    RelocationSafepoint2 = 16,
    ConcurrentRelocation2 = 17,
    CycleCleanup = 18,
}

impl CollectionState {
    /// From marking cleanup until the last relocation safepoint the collector may pick any page of
    /// its generations for relocation. Pages cannot be pinned then.
    pub fn may_select_for_relocation(self) -> bool {
        self >= CollectionState::MarkingCleanup && self <= CollectionState::RelocationSafepoint2
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, enum_map::Enum, strum_macros::Display)]
pub enum CollectorKind {
    New,
    Old,
}

impl CollectorKind {
    /// The collector responsible for pages of `gen`.
    pub fn of(gen: Gen) -> Self {
        match gen {
            Gen::New => CollectorKind::New,
            Gen::Old | Gen::Perm => CollectorKind::Old,
        }
    }

    /// Generation bits of the pages this collector collects.
    pub fn gen_mask(self) -> u8 {
        match self {
            CollectorKind::New => Gen::NEW_GEN_MASK,
            CollectorKind::Old => Gen::OLD_AND_PERM_MASK,
        }
    }
}

/// What the heap needs from the runtime around it: safepoints, marking and reference processing.
///
/// Marking implementations set live bits through [`HeapContext::mark_object`]. The default
/// implementations do nothing, which suits runtimes without weak references.
pub trait CollectionHooks: Downcast + Send + Sync {
    /// Bring every mutator to a stop. Returns once none is running heap code.
    fn begin_safepoint(&self, _heap: &HeapContext, _collector: CollectorKind, _state: CollectionState) {}

    /// Let the mutators run again.
    fn end_safepoint(&self, _heap: &HeapContext, _collector: CollectorKind, _state: CollectionState) {}

    /// Mark every object of the collector's generations reachable from the roots.
    fn mark(&self, heap: &HeapContext, collector: CollectorKind);

    fn process_references(&self, _heap: &HeapContext, _collector: CollectorKind) {}

    /// Mark what became reachable through reference processing.
    fn weak_marking(&self, _heap: &HeapContext, _collector: CollectorKind) {}

    /// A mutator loaded a reference to `object` whose NMT bit is stale.
    fn nmt_trapped(&self, _heap: &HeapContext, _object: Address) {}

    /// An allocation in `gen` failed. Run or wait for a collection before the allocation is retried.
    fn request_collection(&self, _heap: &HeapContext, _gen: Gen) {}
}
impl_downcast!(CollectionHooks);
