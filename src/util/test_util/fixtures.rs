//! A heap with a toy object model and runtime, for tests.
//!
//! Objects carry their size in words in their first word and an arbitrary payload in the second.
//! The runtime keeps a root list; marking resolves every root through the read barrier and marks
//! it. Mutator threads enter a [`SafepointGate`] around heap accesses so safepoints can stop them.

use crate::collector::{CollectionHooks, CollectionState, CollectorKind};
use crate::policy::space::HeapContext;
use crate::util::options::Options;
use crate::util::test_util::test_options;
use crate::util::worker::{WorkerContext, WorkerKind};
use crate::util::Address;
use crate::vm::ObjectModel;
use crate::Gen;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Word 0 of every object is its size in words.
pub struct HeaderModel;

impl ObjectModel for HeaderModel {
    fn klass_of(&self, object: Address) -> Address {
        object
    }

    fn size_given_klass(&self, klass: Address, _object: Address) -> usize {
        unsafe { klass.to_ptr::<usize>().read_volatile() }
    }
}

#[derive(Default)]
struct GateState {
    active: usize,
    stopped: bool,
}

/// Lets a safepoint wait for every mutator to leave heap code, and keeps them out until it ends.
#[derive(Default)]
pub struct SafepointGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

pub struct GateGuard<'a> {
    gate: &'a SafepointGate,
}

impl SafepointGate {
    pub fn enter(&self) -> GateGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.stopped {
            state = self.changed.wait(state).unwrap();
        }
        state.active += 1;
        GateGuard { gate: self }
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.stopped, "Nested safepoint");
        state.stopped = true;
        while state.active > 0 {
            state = self.changed.wait(state).unwrap();
        }
    }

    fn resume(&self) {
        self.state.lock().unwrap().stopped = false;
        self.changed.notify_all();
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.state.lock().unwrap().active -= 1;
        self.gate.changed.notify_all();
    }
}

#[derive(Default)]
pub struct TestHooks {
    roots: Mutex<Vec<Address>>,
    nmt_traps: AtomicUsize,
    safepoints: AtomicUsize,
    marking_passes: AtomicUsize,
    pub gate: SafepointGate,
}

impl TestHooks {
    pub fn nmt_traps(&self) -> usize {
        self.nmt_traps.load(Ordering::SeqCst)
    }

    pub fn safepoints(&self) -> usize {
        self.safepoints.load(Ordering::SeqCst)
    }

    pub fn marking_passes(&self) -> usize {
        self.marking_passes.load(Ordering::SeqCst)
    }

    pub fn roots(&self) -> MutexGuard<'_, Vec<Address>> {
        self.roots.lock().unwrap()
    }
}

impl CollectionHooks for TestHooks {
    fn begin_safepoint(&self, _heap: &HeapContext, _collector: CollectorKind, _state: CollectionState) {
        self.gate.stop();
        self.safepoints.fetch_add(1, Ordering::SeqCst);
    }

    fn end_safepoint(&self, _heap: &HeapContext, _collector: CollectorKind, _state: CollectionState) {
        self.gate.resume();
    }

    fn mark(&self, heap: &HeapContext, collector: CollectorKind) {
        let kind = match collector {
            CollectorKind::New => WorkerKind::NewGC,
            CollectorKind::Old => WorkerKind::OldGC,
        };
        let worker = WorkerContext::new(0, kind, None);
        let meta = heap.meta();
        for root in self.roots.lock().unwrap().iter_mut() {
            *root = heap.read_barrier(*root, heap.expected_nmt(*root), &worker);
            let page = heap.base_page(meta.addr_to_page(*root));
            let gen_bits = meta.info(page).gen_and_state().gen_bits();
            if gen_bits & collector.gen_mask() != 0 {
                heap.mark_object(*root);
            }
        }
        self.marking_passes.fetch_add(1, Ordering::SeqCst);
    }

    fn nmt_trapped(&self, _heap: &HeapContext, _object: Address) {
        self.nmt_traps.fetch_add(1, Ordering::SeqCst);
    }
}

/// A heap over anonymous memory with [`HeaderModel`] objects and [`TestHooks`].
pub struct TestHeap {
    heap: HeapContext,
    hooks: Arc<TestHooks>,
}

impl TestHeap {
    pub fn new() -> Self {
        Self::with_options(test_options())
    }

    pub fn with_options(options: Options) -> Self {
        let hooks = Arc::new(TestHooks::default());
        let heap = HeapContext::new(options, Arc::new(HeaderModel), hooks.clone())
            .unwrap_or_else(|e| panic!("Unable to create test heap: {}", e));
        TestHeap { heap, hooks }
    }

    pub fn test_hooks(&self) -> &TestHooks {
        &self.hooks
    }

    /// Allocate an object of `words` words, with `payload` as its second word.
    pub fn alloc_with(&self, gen: Gen, words: usize, payload: usize) -> Address {
        assert!(words >= 2);
        let object = self
            .heap
            .allocate(gen, words)
            .unwrap_or_else(|| panic!("Test heap out of memory allocating {} words in {}", words, gen));
        unsafe {
            object.to_mut_ptr::<usize>().write_volatile(words);
            object.plus_words(1).to_mut_ptr::<usize>().write_volatile(payload);
        }
        object
    }

    pub fn alloc(&self, gen: Gen, words: usize) -> Address {
        self.alloc_with(gen, words, 0)
    }

    pub fn add_root(&self, object: Address) -> usize {
        let mut roots = self.hooks.roots();
        roots.push(object);
        roots.len() - 1
    }

    /// The root at `index`, as the last marking pass left it.
    pub fn root(&self, index: usize) -> Address {
        self.hooks.roots()[index]
    }
}

impl Default for TestHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestHeap {
    type Target = HeapContext;

    fn deref(&self) -> &HeapContext {
        &self.heap
    }
}

/// The payload word of an object made by [`TestHeap::alloc_with`].
pub fn payload(object: Address) -> usize {
    unsafe { object.plus_words(1).to_ptr::<usize>().read_volatile() }
}
