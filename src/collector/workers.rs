//! The GC worker gang of one collector.

use crate::collector::CollectorKind;
use crate::policy::space::HeapContext;
use crate::util::worker::{WorkerContext, WorkerKind};
use std::sync::Mutex;

/// A fixed set of worker contexts. Each parallel phase runs one scoped thread per context; the
/// contexts outlive the threads so spare pages carry over from one phase to the next.
pub struct GcWorkers {
    kind: CollectorKind,
    contexts: Vec<Mutex<WorkerContext>>,
}

impl GcWorkers {
    /// `threads` workers. New collector workers take the first `threads` spare-page slots, old
    /// collector workers the next `threads`.
    pub fn new(kind: CollectorKind, threads: usize) -> Self {
        let (worker_kind, first_slot) = match kind {
            CollectorKind::New => (WorkerKind::NewGC, 0),
            CollectorKind::Old => (WorkerKind::OldGC, threads),
        };
        let contexts = (0..threads)
            .map(|ordinal| Mutex::new(WorkerContext::new(ordinal, worker_kind, Some(first_slot + ordinal))))
            .collect();
        GcWorkers { kind, contexts }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Run `f` on every worker in parallel and wait for all of them.
    pub fn run<F>(&self, phase: &str, f: F)
    where
        F: Fn(&WorkerContext) + Sync,
    {
        trace!("{} collector: {} on {} workers", self.kind, phase, self.len());
        crossbeam::scope(|s| {
            for context in &self.contexts {
                let f = &f;
                s.spawn(move |_| {
                    let worker = context.lock().unwrap();
                    f(&worker);
                });
            }
        })
        .unwrap();
    }

    /// Give every worker its spare page, if the budget has room.
    pub fn preallocate_pages(&self, heap: &HeapContext) {
        let budget = &heap.meta().budget;
        for context in &self.contexts {
            let worker = context.lock().unwrap();
            if !budget.preallocate_page(&worker) {
                debug!("{} collector worker {} has no spare page", self.kind, worker.ordinal());
            }
        }
    }

    pub fn release_preallocated_pages(&self, heap: &HeapContext) {
        let budget = &heap.meta().budget;
        for context in &self.contexts {
            budget.release_preallocated_page(&context.lock().unwrap());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_worker_runs_once() {
        let workers = GcWorkers::new(CollectorKind::Old, 3);
        let seen: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();
        workers.run("test", |worker| {
            assert_eq!(worker.kind(), WorkerKind::OldGC);
            assert_eq!(worker.preallocated_slot(), Some(3 + worker.ordinal()));
            seen[worker.ordinal()].fetch_add(1, Ordering::Relaxed);
        });
        assert!(seen.iter().all(|count| count.load(Ordering::Relaxed) == 1));
    }
}
