// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Event-driven tasks (EDTs) and their templates.
//!
//! An EDT's body is a plain function over `(paramc, paramv, depc, depv)`,
//! never an arbitrary `Future` — it runs to completion once invoked and is
//! never polled or awaited upon. That lets the task representation here
//! skip the generic `Task<F: Future, S: Schedule>` vtable-erasure machinery
//! this crate's ancestry uses for arbitrary async futures: every EDT is the
//! same concrete shape, so one non-generic struct suffices. The intrusive-
//! refcounted-pointer idiom and the atomic state word are kept.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::OcrError;
use crate::guid::Guid;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EdtProps: u32 {
        const NONE    = 0;
        const FINISH  = 1 << 0;
        const NO_HINT = 1 << 1;
    }
}

/// An EDT's body: invoked exactly once, with its resolved dependences,
/// returning the GUID its output event (if any) should be satisfied with.
pub type EdtFn = fn(paramc: u32, paramv: &[u64], depc: u32, depv: &[EdtDep]) -> Guid;

/// Sentinel `paramc` a template may declare to opt out of the
/// create-time `paramc == paramv.len()` check (the original runtime's
/// `EDT_PARAM_UNK`). Decided here (see DESIGN.md's Open Question
/// resolution): a template created with this value accepts any `paramv`
/// length, deferring validation to the body itself.
pub const EDT_PARAM_UNK: u32 = u32::MAX;

/// Immutable descriptor shared by every EDT instantiated from it.
pub struct Template {
    pub guid: Guid,
    pub func: EdtFn,
    pub paramc: u32,
    pub depc: u32,
}

/// One resolved (or still-pending) dependence slot.
#[derive(Copy, Clone, Debug)]
pub struct EdtDep {
    /// The event or data block this slot awaited. `Guid::NULL` if the
    /// slot was left pending-user-fill at create time.
    pub producer: Guid,
    /// The payload the producer resolved to; `Guid::ERROR` if the
    /// producer was destroyed/failed instead of completing normally.
    pub payload: Guid,
    /// Set when this slot names a data block the body should have
    /// acquired before invocation (vs. a plain event dependence).
    pub db_mode: Option<crate::datablock::Mode>,
    /// The acquired data block's base address, filled in by
    /// `PolicyDomain::execute_edt` just before the body runs. `None` for a
    /// plain event dependence, or a DB dependence the acquire failed.
    pub ptr: Option<*mut u8>,
}

// SAFETY: `ptr` is only read by the EDT body that acquired it, under the
// mode discipline `DataBlock::acquire` enforces; it is never dereferenced
// by the runtime itself.
unsafe impl Send for EdtDep {}
unsafe impl Sync for EdtDep {}

const STATE_PENDING: u32 = 0;
const STATE_RUNNABLE: u32 = 1;
const STATE_RUNNING: u32 = 2;
const STATE_DONE: u32 = 3;

/// State every EDT record carries between creation and destruction.
/// `depv` is mutated only through [`Edt::resolve_slot`], which the policy
/// domain calls at most once per slot (once per registered waiter
/// callback), so a `Mutex` around the whole vector would be needless
/// contention — each element is written at most once and read freely
/// thereafter.
pub struct Edt {
    pub guid: Guid,
    pub template: Guid,
    pub func: EdtFn,
    pub paramv: Vec<u64>,
    depv: spin::Mutex<Vec<EdtDep>>,
    /// Count of slots resolved so far; reaches `depv.len()` exactly when
    /// the EDT becomes runnable.
    frontier_index: AtomicUsize,
    depc: usize,
    pub output_event: Guid,
    pub affinity_hint: Option<Guid>,
    pub parent_finish_latch: Option<Guid>,
    pub props: EdtProps,
    state: AtomicU32,
}

impl Edt {
    pub fn new(
        guid: Guid,
        template: Guid,
        func: EdtFn,
        paramv: Vec<u64>,
        depv: Vec<EdtDep>,
        output_event: Guid,
        affinity_hint: Option<Guid>,
        parent_finish_latch: Option<Guid>,
        props: EdtProps,
    ) -> Arc<Self> {
        let depc = depv.len();
        let already_resolved = depv
            .iter()
            .take_while(|d| !d.producer.is_null())
            .count();
        let edt = Arc::new(Self {
            guid,
            template,
            func,
            paramv,
            depv: spin::Mutex::new(depv),
            frontier_index: AtomicUsize::new(already_resolved),
            depc,
            output_event,
            affinity_hint,
            parent_finish_latch,
            props,
            state: AtomicU32::new(STATE_PENDING),
        });
        if already_resolved == depc {
            edt.state.store(STATE_RUNNABLE, Ordering::Release);
        }
        edt
    }

    pub fn depc(&self) -> u32 {
        self.depc as u32
    }

    pub fn depv_snapshot(&self) -> Vec<EdtDep> {
        self.depv.lock().clone()
    }

    /// Called when slot `index`'s producer resolves with `payload`.
    /// Returns `true` exactly once: the call whose resolution makes the
    /// EDT runnable.
    pub fn resolve_slot(&self, index: usize, producer: Guid, payload: Guid) -> bool {
        {
            let mut depv = self.depv.lock();
            debug_assert!(index < depv.len());
            depv[index].producer = producer;
            depv[index].payload = payload;
        }
        let new_frontier = self.frontier_index.fetch_add(1, Ordering::AcqRel) + 1;
        if new_frontier == self.depc {
            self.state
                .compare_exchange(STATE_PENDING, STATE_RUNNABLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            false
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNABLE
    }

    pub fn mark_running(&self) -> Result<(), OcrError> {
        self.state
            .compare_exchange(STATE_RUNNABLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| OcrError::Fatal("edt invoked while not runnable"))
    }

    pub fn mark_done(&self) {
        self.state.store(STATE_DONE, Ordering::Release);
    }

    pub fn is_finish(&self) -> bool {
        self.props.contains(EdtProps::FINISH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u64) -> Guid {
        crate::guid::PtrGuidProvider::new(0).mint(crate::guid::Kind::Edt, n)
    }

    fn noop(_: u32, _: &[u64], _: u32, _: &[EdtDep]) -> Guid {
        Guid::NULL
    }

    #[test]
    fn zero_dep_edt_is_immediately_runnable() {
        let e = Edt::new(
            guid(1),
            guid(2),
            noop,
            vec![],
            vec![],
            Guid::NULL,
            None,
            None,
            EdtProps::NONE,
        );
        assert!(e.is_runnable());
    }

    #[test]
    fn pending_edt_becomes_runnable_on_last_slot() {
        let depv = vec![
            EdtDep {
                producer: Guid::NULL,
                payload: Guid::NULL,
                db_mode: None,
                ptr: None,
            },
            EdtDep {
                producer: Guid::NULL,
                payload: Guid::NULL,
                db_mode: None,
                ptr: None,
            },
        ];
        let e = Edt::new(
            guid(1),
            guid(2),
            noop,
            vec![],
            depv,
            Guid::NULL,
            None,
            None,
            EdtProps::NONE,
        );
        assert!(!e.is_runnable());
        assert!(!e.resolve_slot(0, guid(10), guid(10)));
        assert!(e.resolve_slot(1, guid(11), guid(11)));
        assert!(e.is_runnable());
    }

    #[test]
    fn mark_running_requires_runnable() {
        let depv = vec![EdtDep {
            producer: Guid::NULL,
            payload: Guid::NULL,
            db_mode: None,
            ptr: None,
        }];
        let e = Edt::new(
            guid(1),
            guid(2),
            noop,
            vec![],
            depv,
            Guid::NULL,
            None,
            None,
            EdtProps::NONE,
        );
        assert!(e.mark_running().is_err());
        e.resolve_slot(0, guid(5), guid(5));
        assert!(e.mark_running().is_ok());
    }
}
