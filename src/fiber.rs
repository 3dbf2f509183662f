// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The legacy-fiber suspension point (`legacy-fiber` feature).
//!
//! `ocrLegacyFiberSuspendOnEvent` in the original runtime let EDT code block
//! on an event the way a thread blocks on a condition variable, by swapping
//! the worker's stack out via `fcontext` and resuming a fresh one so the
//! worker keeps servicing its workpile while the suspended call waits. This
//! workspace has no stackful-coroutine crate to switch contexts with — the
//! teacher's sibling `libs/fiber` crate isn't published, and fabricating a
//! vendored stand-in defeats the point of depending on real, fetchable
//! crates — so [`suspend_on_event`] instead parks the calling OS thread and
//! registers a resume EDT that wakes it, matching [`crate::scheduler`]'s own
//! parking idiom. A worker blocked here stops servicing its workpile until
//! the event fires; that's an acceptable narrowing for an extension §1
//! scopes out of the core's own operation, but it means this feature is not
//! a drop-in replacement for the original's free-the-worker behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::datablock::Mode;
use crate::error::OcrError;
use crate::guid::Guid;
use crate::policy_domain::PolicyDomain;
use crate::task::{EdtDep, EdtProps};

/// What [`suspend_on_event`] hands back once the awaited event fires: the
/// payload it was satisfied with and, if a data block mode was requested,
/// the acquired pointer.
pub struct Resumed {
    pub payload: Guid,
    pub ptr: Option<*mut u8>,
}

struct Handoff {
    ready: AtomicBool,
    payload: spin::Mutex<Guid>,
    thread: thread::Thread,
}

/// The resume EDT: depends on the awaited event, and on running (meaning
/// the event fired) records the payload and wakes the parked caller. Mirrors
/// `fiberResumeEdt`'s role in the original extension.
fn resume_edt(paramc: u32, paramv: &[u64], depc: u32, depv: &[EdtDep]) -> Guid {
    debug_assert_eq!(paramc, 1);
    debug_assert_eq!(depc, 1);
    let handoff_ptr = paramv[0] as *const Handoff;
    // SAFETY: `handoff_ptr` was produced by `Arc::into_raw` in
    // `suspend_on_event` and is consumed exactly once, here, by the one EDT
    // invocation that dependence registration guarantees will run.
    let handoff = unsafe { Arc::from_raw(handoff_ptr) };
    *handoff.payload.lock() = depv[0].payload;
    handoff.ready.store(true, Ordering::Release);
    handoff.thread.unpark();
    Guid::NULL
}

/// Blocks the calling worker thread until `event` is satisfied. If `mode`
/// is given, additionally acquires the data block named by the event's
/// payload before returning, matching the original extension's trailing
/// `ocrDbAcquire` call.
pub fn suspend_on_event(pd: &Arc<PolicyDomain>, event: Guid, mode: Option<Mode>) -> Result<Resumed, OcrError> {
    let handoff = Arc::new(Handoff {
        ready: AtomicBool::new(false),
        payload: spin::Mutex::new(Guid::NULL),
        thread: thread::current(),
    });
    let handoff_ptr = Arc::into_raw(handoff.clone()) as u64;
    let tmpl = pd.edt_template_create(resume_edt, 1, 1);
    pd.edt_create(
        tmpl,
        vec![handoff_ptr],
        vec![(event, None)],
        EdtProps::NONE,
        None,
        None,
        false,
    )?;
    while !handoff.ready.load(Ordering::Acquire) {
        thread::park();
    }
    let payload = *handoff.payload.lock();
    let ptr = match mode {
        Some(m) => pd.db_acquire(payload, Guid::NULL, m).ok(),
        None => None,
    };
    Ok(Resumed { payload, ptr })
}
