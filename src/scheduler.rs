// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker loop: poll inbound messages, pop the local workpile, steal,
//! or park.
//!
//! This generalizes the ancestor executor's `Worker::run`/`tick`/
//! `try_steal` loop shape from polling arbitrary `Future`s to invoking EDT
//! function pointers. Because an EDT runs to completion in one call rather
//! than being polled repeatedly, there is no per-tick budget/yield-point
//! concept to carry over — `execute` below *is* one tick.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use fastrand::Rng;
use tracing::trace;

use crate::deque::{steal_half, GlobalQueue, PopType, PushType, Workpile};
use crate::guid::Guid;
use crate::policy_domain::PolicyDomain;

/// A single worker thread's scheduler-facing state: its own workpile, a
/// handle to every sibling worker's stealer (for uniform-random victim
/// selection), and a link back to the owning policy domain for message
/// polling and EDT execution. The link is a `Weak` reference since the
/// policy domain owns the scheduler (and transitively every worker); a
/// strong reference here would be a cycle.
pub struct Worker {
    pub id: usize,
    pd: Weak<PolicyDomain>,
    workpile: Workpile,
    rng: spin::Mutex<Rng>,
    parked: AtomicBool,
    thread: spin::Mutex<Option<thread::Thread>>,
}

/// Shared scheduler state: every worker's workpile stealer handle, plus
/// the cross-PD / overflow injector.
pub struct Scheduler {
    pub workers: Vec<Arc<Worker>>,
    pub injector: GlobalQueue,
    stop: AtomicBool,
    num_stealing: AtomicUsize,
}

impl Scheduler {
    pub fn new(pd: Weak<PolicyDomain>, num_workers: usize, seed: u64) -> Arc<Self> {
        let workers = (0..num_workers.max(1))
            .map(|id| {
                Arc::new(Worker {
                    id,
                    pd: pd.clone(),
                    workpile: Workpile::new_fifo(),
                    rng: spin::Mutex::new(Rng::with_seed(seed.wrapping_add(id as u64))),
                    parked: AtomicBool::new(false),
                    thread: spin::Mutex::new(None),
                })
            })
            .collect();
        Arc::new(Self {
            workers,
            injector: GlobalQueue::new(),
            stop: AtomicBool::new(false),
            num_stealing: AtomicUsize::new(0),
        })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        for w in &self.workers {
            if let Some(t) = w.thread.lock().as_ref() {
                t.unpark();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Pushes a newly-runnable EDT onto its target worker's workpile (or
    /// the injector, if no worker is specified — used for messages
    /// arriving from a remote PD with no current-worker context).
    pub fn push_local(&self, worker: usize, guid: Guid) {
        self.workers[worker].workpile.push(PushType::Normal, guid);
        if let Some(t) = self.workers[worker].thread.lock().as_ref() {
            t.unpark();
        }
    }

    pub fn push_global(&self, guid: Guid) {
        self.injector.push(guid);
        for w in &self.workers {
            if let Some(t) = w.thread.lock().as_ref() {
                t.unpark();
            }
        }
    }

    /// Spawns one OS thread per worker and blocks until every worker's
    /// `run` loop returns (i.e. until [`Scheduler::stop`] is called and
    /// observed).
    pub fn run_to_completion(self: &Arc<Self>) {
        let handles: Vec<_> = self
            .workers
            .iter()
            .map(|w| {
                let sched = self.clone();
                let worker = w.clone();
                thread::Builder::new()
                    .name(format!("ocr-worker-{}", worker.id))
                    .spawn(move || {
                        *worker.thread.lock() = Some(thread::current());
                        worker.run(&sched);
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        for h in handles {
            let _ = h.join();
        }
    }
}

impl Worker {
    /// `poll → pop → steal → park`, matching the worker loop pseudocode.
    /// Message-EDTs (pushed onto this worker's workpile by the message
    /// pump ahead of ordinary work, per the pump's priority rule) are
    /// popped and run exactly like user EDTs — they are just EDTs whose
    /// body happens to process an inbound [`crate::message::Message`].
    fn run(&self, sched: &Scheduler) {
        let pd = self.pd.upgrade().expect("policy domain dropped while worker running");
        let mut idle_spins = 0u32;
        while !sched.is_stopped() {
            pd.poll_messages(self.id);
            let guid = self.workpile.pop();
            let guid = if guid.is_null() {
                self.try_steal(sched)
            } else {
                guid
            };
            let guid = if guid.is_null() {
                sched.injector.steal_into(&self.workpile)
            } else {
                guid
            };
            if guid.is_null() {
                idle_spins += 1;
                if idle_spins < 64 {
                    std::hint::spin_loop();
                } else {
                    self.park();
                    idle_spins = 0;
                }
                continue;
            }
            idle_spins = 0;
            pd.execute_edt(self.id, guid);
        }
    }

    fn park(&self) {
        self.parked.store(true, Ordering::Release);
        trace!(worker = self.id, "parking");
        thread::park_timeout(std::time::Duration::from_millis(10));
        self.parked.store(false, Ordering::Release);
    }

    /// Uniform-random victim selection with round-robin fallback on a
    /// failed steal, matching the scheduling design.
    fn try_steal(&self, sched: &Scheduler) -> Guid {
        if sched.workers.len() <= 1 {
            return Guid::NULL;
        }
        sched.num_stealing.fetch_add(1, Ordering::AcqRel);
        let start = self.rng.lock().usize(0..sched.workers.len());
        let mut result = Guid::NULL;
        for i in 0..sched.workers.len() {
            let idx = (start + i) % sched.workers.len();
            if idx == self.id {
                continue;
            }
            let victim = &sched.workers[idx];
            let stolen = steal_half(&victim.workpile.stealer(), &self.workpile);
            if !stolen.is_null() {
                result = stolen;
                break;
            }
        }
        sched.num_stealing.fetch_sub(1, Ordering::AcqRel);
        result
    }

    pub fn push_back(&self, _ty: PopType, guid: Guid) {
        self.workpile.push(PushType::Back, guid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_with_no_policy_domain_reports_stopped_after_stop() {
        // A Scheduler can be constructed and stopped without ever
        // upgrading its Weak<PolicyDomain> link, since `stop` only
        // touches worker thread handles.
        let sched = Scheduler::new(Weak::new(), 2, 0);
        assert!(!sched.is_stopped());
        sched.stop();
        assert!(sched.is_stopped());
    }

    #[test]
    fn push_global_lands_in_injector() {
        let sched = Scheduler::new(Weak::new(), 1, 0);
        let guid = crate::guid::PtrGuidProvider::new(0).mint(crate::guid::Kind::Edt, 1);
        sched.push_global(guid);
        assert_eq!(sched.injector.steal_into(&sched.workers[0].workpile), guid);
    }
}
