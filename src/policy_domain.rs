// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The policy domain: a self-contained runtime instance owning a GUID
//! provider, a scheduler, a message pump, and the public user API.
//!
//! No part of the API reaches for a hidden global — every call goes
//! through an explicit `&PolicyDomain` handle, rather than a
//! `getCurrentEnv()`-style ambient context. The "current worker" an EDT
//! body needs for introspection is instead passed explicitly as the
//! `worker_id` the scheduler already has in hand when it invokes the body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, instrument, trace};

use crate::affinity::{AffinityCatalogue, AffinityKind, GuidMap};
use crate::config::Config;
use crate::datablock::{DataBlock, Mode as DbMode, Props as DbProps};
use crate::deque::PushType;
use crate::error::OcrError;
use crate::event::{self, Event, Waiter};
use crate::guid::{Guid, GuidProvider, Kind, PtrGuidProvider};
use crate::message::{CommPlatform, LocalTransport, Message, MsgFlags, MsgIdSource, MsgType};
use crate::runlevel::{Direction, Phase, Runlevel};
use crate::scheduler::Scheduler;
use crate::task::{Edt, EdtDep, EdtFn, EdtProps, Template};

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct GuidProps: u32 {
        const NONE       = 0;
        const IS_LABELED = 1 << 0;
        const CHECK      = 1 << 1;
    }
}

struct Tables {
    events: HashMap<Guid, Arc<Event>>,
    templates: HashMap<Guid, Arc<Template>>,
    edts: HashMap<Guid, Arc<Edt>>,
    datablocks: HashMap<Guid, Arc<DataBlock>>,
}

/// A single policy domain: the unit of placement affinity hints target,
/// and the boundary the message pump crosses.
pub struct PolicyDomain {
    pub location: u16,
    guids: Arc<dyn GuidProvider>,
    tables: spin::Mutex<Tables>,
    scheduler: Arc<Scheduler>,
    transport: Arc<dyn CommPlatform>,
    msg_ids: MsgIdSource,
    affinity: spin::Mutex<Option<AffinityCatalogue>>,
    shutdown: std::sync::atomic::AtomicBool,
    next_worker_hint: AtomicU32,
}

impl PolicyDomain {
    /// Builds a single-PD runtime instance (no remote neighbors). Use
    /// [`PolicyDomain::new_in_cluster`] with a shared transport to wire up
    /// several PDs in one process, as the cross-PD scenarios do.
    pub fn new(config: Config) -> Arc<Self> {
        Self::new_in_cluster(config, 0, Arc::new(LocalTransport::new(1, 1024)))
    }

    pub fn new_in_cluster(config: Config, location: u16, transport: Arc<dyn CommPlatform>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<PolicyDomain>| {
            let scheduler = Scheduler::new(weak.clone(), config.worker_count, location as u64);
            PolicyDomain {
                location,
                guids: Arc::new(PtrGuidProvider::new(location)),
                tables: spin::Mutex::new(Tables {
                    events: HashMap::new(),
                    templates: HashMap::new(),
                    edts: HashMap::new(),
                    datablocks: HashMap::new(),
                }),
                scheduler,
                transport,
                msg_ids: MsgIdSource::new(),
                affinity: spin::Mutex::new(None),
                shutdown: std::sync::atomic::AtomicBool::new(false),
                next_worker_hint: AtomicU32::new(0),
            }
        })
    }

    pub fn set_affinity_catalogue(&self, catalogue: AffinityCatalogue) {
        *self.affinity.lock() = Some(catalogue);
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Starts every worker thread and blocks until [`PolicyDomain::shutdown`]
    /// is called from within a running EDT (or another thread) and all
    /// workers observe it.
    pub fn run(self: &Arc<Self>) {
        self.scheduler.run_to_completion();
    }

    fn next_worker(&self) -> usize {
        let n = self.scheduler.workers.len().max(1);
        self.next_worker_hint.fetch_add(1, Ordering::Relaxed) as usize % n
    }

    // ---- Template -------------------------------------------------

    pub fn edt_template_create(&self, func: EdtFn, paramc: u32, depc: u32) -> Guid {
        let guid = self.guids.mint(Kind::Template, 0);
        let tmpl = Arc::new(Template {
            guid,
            func,
            paramc,
            depc,
        });
        self.tables.lock().templates.insert(guid, tmpl);
        guid
    }

    // ---- Event ------------------------------------------------------

    pub fn event_create(&self, kind: event::Kind) -> Guid {
        let guid = self.guids.mint(Kind::Event, 0);
        let ev = Arc::new(Event::new(guid, kind));
        self.tables.lock().events.insert(guid, ev);
        guid
    }

    /// Creates an event at a reserved, labeled-rendezvous GUID. Returns
    /// [`OcrError::GuidExists`] if `props` requests `CHECK` and another
    /// caller already claimed this index.
    pub fn event_create_labeled(
        &self,
        map: &GuidMap,
        index: u64,
        kind: event::Kind,
        props: GuidProps,
    ) -> Result<Guid, OcrError> {
        let guid = map.guid_from_index(index)?;
        self.guids
            .mint_at(guid, 0, props.contains(GuidProps::CHECK))?;
        let ev = Arc::new(Event::new(guid, kind));
        self.tables.lock().events.insert(guid, ev);
        Ok(guid)
    }

    fn event(&self, guid: Guid) -> Result<Arc<Event>, OcrError> {
        self.tables
            .lock()
            .events
            .get(&guid)
            .cloned()
            .ok_or(OcrError::GuidNotFound(guid))
    }

    #[instrument(skip(self))]
    pub fn event_satisfy_slot(&self, evt: Guid, payload: Guid, slot: u32) -> Result<(), OcrError> {
        let ev = self.event(evt)?;
        let outcome = ev.satisfy(payload, slot)?;
        self.propagate(&ev, outcome.notify, payload);
        if outcome.self_destruct {
            self.destroy_event(&ev);
        }
        Ok(())
    }

    fn propagate(&self, source: &Event, waiters: Vec<Waiter>, payload: Guid) {
        let _guard = event::PropagationGuard::enter();
        for w in waiters {
            if event::PropagationGuard::should_defer() {
                // Defer the remaining notifications onto the local
                // worker's deque as a message-EDT-like record instead of
                // recursing further.
                self.scheduler.push_global(w.target);
                continue;
            }
            if w.is_event {
                if let Ok(target) = self.event(w.target) {
                    if source.guid == target.guid {
                        trace!(guid = ?source.guid, "self-loop in propagation, reporting deadlock");
                        continue;
                    }
                    if let Ok(outcome) = target.satisfy(payload, w.slot) {
                        self.propagate(&target, outcome.notify, payload);
                        if outcome.self_destruct {
                            self.destroy_event(&target);
                        }
                    }
                }
            } else {
                self.resolve_edt_slot(w.target, w.slot, source.guid, payload);
            }
        }
    }

    fn destroy_event(&self, ev: &Event) {
        let waiters = ev.destroy();
        for w in waiters {
            if w.is_event {
                if let Ok(target) = self.event(w.target) {
                    let _ = target.satisfy(Guid::ERROR, w.slot);
                }
            } else {
                self.resolve_edt_slot(w.target, w.slot, ev.guid, Guid::ERROR);
            }
        }
        self.tables.lock().events.remove(&ev.guid);
        self.guids.release(ev.guid);
    }

    pub fn event_destroy(&self, evt: Guid) -> Result<(), OcrError> {
        let ev = self.event(evt)?;
        self.destroy_event(&ev);
        Ok(())
    }

    // ---- EDT ----------------------------------------------------------

    #[instrument(skip(self, depv))]
    #[allow(clippy::too_many_arguments)]
    pub fn edt_create(
        &self,
        tmpl: Guid,
        paramv: Vec<u64>,
        depv: Vec<(Guid, Option<DbMode>)>,
        props: EdtProps,
        affinity_hint: Option<Guid>,
        parent_finish_latch: Option<Guid>,
        wants_output_event: bool,
    ) -> Result<(Guid, Option<Guid>), OcrError> {
        let template = self
            .tables
            .lock()
            .templates
            .get(&tmpl)
            .cloned()
            .ok_or(OcrError::GuidNotFound(tmpl))?;
        if paramv.len() as u32 != template.paramc && template.paramc != u32::MAX {
            return Err(OcrError::InvalidArgument("paramc mismatch with template"));
        }
        let output_event = if wants_output_event {
            Some(self.event_create(event::Kind::Once))
        } else {
            None
        };
        let guid = self.guids.mint(Kind::Edt, 0);
        // `producer` starts NULL for every slot regardless of whether the
        // caller already named one: `Edt::new` reads a NULL producer as
        // "still pending" and a non-null one as "resolved at construction
        // time", and resolution always happens through `resolve_slot` below
        // (immediately, for an already-fired producer) rather than being
        // asserted up front — pre-filling it here would both mark
        // known-but-unfired dependences runnable too early and double-count
        // the frontier once `resolve_slot` runs for real.
        let edt_depv: Vec<EdtDep> = depv
            .iter()
            .map(|(_producer, mode)| EdtDep {
                producer: Guid::NULL,
                payload: Guid::NULL,
                db_mode: *mode,
                ptr: None,
            })
            .collect();
        let edt = Edt::new(
            guid,
            tmpl,
            template.func,
            paramv,
            edt_depv,
            output_event.unwrap_or(Guid::NULL),
            affinity_hint,
            parent_finish_latch,
            props,
        );
        self.tables.lock().edts.insert(guid, edt.clone());
        if let Some(latch) = parent_finish_latch {
            let _ = self.event_satisfy_slot(latch, Guid::NULL, 0); // incr
        }
        // `dispatch_runnable` must fire exactly once for this EDT: either
        // here, inline, the moment the slot that completes its frontier
        // resolves synchronously, or in the fallback check below for an
        // EDT that was already fully resolved (zero deps, or every named
        // producer already fired) without any slot resolving during this
        // loop. Tracking whether the loop itself dispatched keeps the
        // fallback from firing a second time and, for a remote affinity
        // hint, forwarding the same EDT over the wire twice.
        let mut dispatched_in_loop = false;
        for (slot, (producer, _mode)) in depv.iter().enumerate() {
            if producer.is_null() {
                continue;
            }
            if self.register_edt_dependence(&edt, slot, *producer)? {
                dispatched_in_loop = true;
            }
        }
        if !dispatched_in_loop && edt.is_runnable() {
            self.dispatch_runnable(&edt);
        }
        Ok((guid, output_event))
    }

    /// Registers `edt`'s slot `slot` against `producer`. Returns `true` if
    /// the producer resolved synchronously (an already-fired event, or a
    /// data block dependence) and that resolution made `edt` runnable and
    /// dispatched it — the caller must not dispatch `edt` again itself.
    fn register_edt_dependence(&self, edt: &Arc<Edt>, slot: usize, producer: Guid) -> Result<bool, OcrError> {
        let waiter = Waiter {
            target: edt.guid,
            slot: slot as u32,
            is_event: false,
        };
        match producer.kind() {
            Some(Kind::Event) => {
                let ev = self.event(producer)?;
                let outcome = ev.register_waiter(waiter)?;
                if outcome.self_destruct {
                    self.destroy_event(&ev);
                }
                if let Some(payload) = outcome.payload {
                    return Ok(self.resolve_edt_slot(edt.guid, slot, producer, payload));
                }
                Ok(false)
            }
            Some(Kind::DataBlock) => {
                // Data block dependences resolve once acquired; record the
                // producer now and acquire at execute() time (§4.5 step 1).
                // A pending registration against the DB's own waiter-queue
                // is unnecessary here since `execute` performs the acquire
                // synchronously and blocks the frontier on it directly.
                Ok(self.resolve_edt_slot(edt.guid, slot, producer, producer))
            }
            _ => Err(OcrError::InvalidArgument("dependence producer has unknown kind")),
        }
    }

    pub fn add_dependence(&self, src: Guid, dst: Guid, slot: u32, _mode: Option<DbMode>) -> Result<(), OcrError> {
        match dst.kind() {
            Some(Kind::Edt) => {
                let edt = self
                    .tables
                    .lock()
                    .edts
                    .get(&dst)
                    .cloned()
                    .ok_or(OcrError::GuidNotFound(dst))?;
                let dispatched = self.register_edt_dependence(&edt, slot as usize, src)?;
                if !dispatched && edt.is_runnable() {
                    self.dispatch_runnable(&edt);
                }
                Ok(())
            }
            Some(Kind::Event) => {
                let target = self.event(dst)?;
                let src_ev = self.event(src)?;
                let waiter = Waiter {
                    target: dst,
                    slot,
                    is_event: true,
                };
                let src_outcome = src_ev.register_waiter(waiter)?;
                if src_outcome.self_destruct {
                    self.destroy_event(&src_ev);
                }
                if let Some(payload) = src_outcome.payload {
                    let outcome = target.satisfy(payload, slot)?;
                    self.propagate(&target, outcome.notify, payload);
                    if outcome.self_destruct {
                        self.destroy_event(&target);
                    }
                }
                Ok(())
            }
            _ => Err(OcrError::InvalidArgument("unsupported addDependence destination")),
        }
    }

    /// Resolves `edt_guid`'s slot `slot`, dispatching it if this was the
    /// slot that completed its frontier. Returns whether it dispatched, so
    /// a caller that will itself check `is_runnable()` afterward knows not
    /// to dispatch a second time.
    fn resolve_edt_slot(&self, edt_guid: Guid, slot: usize, producer: Guid, payload: Guid) -> bool {
        let edt = match self.tables.lock().edts.get(&edt_guid).cloned() {
            Some(e) => e,
            None => return false,
        };
        if edt.resolve_slot(slot, producer, payload) {
            self.dispatch_runnable(&edt);
            true
        } else {
            false
        }
    }

    /// Placement policy: forward to a remote PD if an affinity hint names
    /// one, else push to a local worker's tail. An EDT is only ever
    /// dispatched once every dependence slot has resolved, so the record
    /// forwarded to a remote PD carries its fully-resolved `depv` rather
    /// than a reference requiring further negotiation.
    fn dispatch_runnable(&self, edt: &Arc<Edt>) {
        if let Some(hint) = edt.affinity_hint {
            if let Some(catalogue) = &*self.affinity.lock() {
                if let Some(target_loc) = catalogue.query(hint) {
                    if target_loc != self.location {
                        self.send_remote_edt(target_loc, edt);
                        // The record this PD created for `edt_create`'s own
                        // bookkeeping is now owned by the receiving PD (which
                        // inserts its own copy in `handle_message`); dropping
                        // it here avoids leaking a table entry that would
                        // never be executed or reclaimed locally.
                        self.tables.lock().edts.remove(&edt.guid);
                        self.guids.release(edt.guid);
                        return;
                    }
                }
            }
        }
        self.scheduler.push_local(self.next_worker(), edt.guid);
    }

    /// Marshals a fully-runnable EDT onto the wire. The function pointer is
    /// carried as a raw address: every policy domain in a cluster this core
    /// drives shares one process and binary (the model is several PDs on one
    /// node, not a distributed cluster across machines), so the address
    /// resolves to the same code on the receiving end. A real cross-node
    /// comm platform would carry a template registry index instead.
    fn send_remote_edt(&self, target_loc: u16, edt: &Arc<Edt>) {
        let mut msg = encode_edt_for_wire(edt);
        msg.header.ty = MsgType::WorkExecute;
        msg.header.flags = MsgFlags::REQUEST;
        msg.header.src_loc = self.location as u64;
        msg.header.dst_loc = target_loc as u64;
        msg.header.msg_id = self.msg_ids.next();
        let _ = self.transport.send(target_loc as u64, msg);
    }

    /// Drains inbound messages for `worker_id`, turning each into the
    /// local effect it names. Runs ahead of popping user EDTs, matching
    /// the pump's priority rule.
    pub fn poll_messages(&self, _worker_id: usize) {
        while let Some(msg) = self.transport.try_recv(self.location as u64) {
            self.handle_message(msg);
        }
    }

    fn handle_message(&self, msg: Message) {
        match msg.header.ty {
            MsgType::WorkExecute => {
                let edt = decode_edt_from_wire(&msg);
                self.tables.lock().edts.insert(edt.guid, edt.clone());
                self.scheduler.push_local(self.next_worker(), edt.guid);
            }
            MsgType::DepSatisfy => {
                if let (Some(evt), Some(&payload)) = (msg.guids.first().copied(), msg.guids.get(1)) {
                    let slot = msg.words.first().copied().unwrap_or(0) as u32;
                    let _ = self.event_satisfy_slot(evt, payload, slot);
                }
            }
            _ => debug!(ty = ?msg.header.ty, "unhandled message type"),
        }
    }

    // ---- Data block -----------------------------------------------------

    pub fn db_create(&self, size: usize, props: DbProps) -> Result<(Guid, *mut u8), OcrError> {
        let guid = self.guids.mint(Kind::DataBlock, 0);
        let db = Arc::new(DataBlock::create(guid, size, props, self.location as u32)?);
        let ptr = db.base_ptr();
        self.tables.lock().datablocks.insert(guid, db);
        Ok((guid, ptr))
    }

    fn datablock(&self, guid: Guid) -> Result<Arc<DataBlock>, OcrError> {
        self.tables
            .lock()
            .datablocks
            .get(&guid)
            .cloned()
            .ok_or(OcrError::GuidNotFound(guid))
    }

    pub fn db_acquire(&self, db: Guid, edt: Guid, mode: DbMode) -> Result<*mut u8, OcrError> {
        let block = self.datablock(db)?;
        block.acquire(edt, mode)?.ok_or(OcrError::GuidNotFound(db))
    }

    pub fn db_release(&self, db: Guid, edt: Guid) -> Result<(), OcrError> {
        let block = self.datablock(db)?;
        let promoted = block.release(edt);
        for (waiting_edt, _) in promoted {
            self.resolve_edt_slot(waiting_edt, 0, db, db);
        }
        Ok(())
    }

    pub fn db_destroy(&self, db: Guid) -> Result<(), OcrError> {
        let block = self.datablock(db)?;
        block.destroy();
        if block.is_destroyed() {
            self.tables.lock().datablocks.remove(&db);
            self.guids.release(db);
        }
        Ok(())
    }

    // ---- Worker-driven execution ----------------------------------------

    /// `execute()`: acquire inputs, invoke the body, release, satisfy the
    /// output event, decrement the parent latch, destroy the record.
    #[instrument(skip(self))]
    pub fn execute_edt(&self, _worker_id: usize, guid: Guid) {
        let edt = match self.tables.lock().edts.get(&guid).cloned() {
            Some(e) => e,
            None => return,
        };
        if edt.mark_running().is_err() {
            return;
        }
        let mut depv = edt.depv_snapshot();
        let mut acquired = Vec::new();
        for dep in depv.iter_mut() {
            if let Some(mode) = dep.db_mode {
                // `payload` holds the resolved data block GUID: for a
                // dependence named directly on a DB, `resolve_edt_slot` sets
                // producer == payload == the DB's own guid; for one
                // satisfied through an event, `producer` is the *event's*
                // guid and only `payload` carries the DB the event fired
                // with. Acquiring against `payload` handles both uniformly.
                let db = dep.payload;
                match self.db_acquire(db, guid, mode) {
                    Ok(ptr) => {
                        dep.ptr = Some(ptr);
                        acquired.push(db);
                    }
                    Err(err) => {
                        debug!(?err, "db acquire failed during execute");
                    }
                }
            }
        }
        let ret = (edt.func)(edt.paramv.len() as u32, &edt.paramv, edt.depc(), &depv);
        for db in acquired {
            let _ = self.db_release(db, guid);
        }
        if !edt.output_event.is_null() {
            let _ = self.event_satisfy_slot(edt.output_event, ret, 0);
        }
        if let Some(latch) = edt.parent_finish_latch {
            let _ = self.event_satisfy_slot(latch, Guid::NULL, 1); // decr
        }
        edt.mark_done();
        self.tables.lock().edts.remove(&guid);
        self.guids.release(guid);
    }

    // ---- Affinity / labeled GUIDs ---------------------------------------

    pub fn affinity_count(&self, kind: AffinityKind) -> Result<usize, OcrError> {
        self.affinity
            .lock()
            .as_ref()
            .map(|c| c.count(kind))
            .ok_or(OcrError::Unsupported("no affinity catalogue configured"))
    }

    pub fn affinity_get(&self, kind: AffinityKind, idx: usize) -> Result<Guid, OcrError> {
        self.affinity
            .lock()
            .as_ref()
            .ok_or(OcrError::Unsupported("no affinity catalogue configured"))?
            .get(kind, idx)
    }

    pub fn affinity_query(&self, guid: Guid) -> Option<u16> {
        self.affinity.lock().as_ref().and_then(|c| c.query(guid))
    }

    pub fn guid_map_create(&self, kind: Kind, count: u64) -> GuidMap {
        GuidMap::create(self.guids.as_ref(), kind, count)
    }

    pub fn guids(&self) -> &dyn GuidProvider {
        self.guids.as_ref()
    }

    // ---- Runlevel / shutdown ---------------------------------------------

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.scheduler.stop();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl crate::runlevel::Component for PolicyDomain {
    fn switch_runlevel(&self, level: Runlevel, _phase: Phase, dir: Direction) {
        trace!(?level, ?dir, "policy domain runlevel transition");
    }
}

fn db_mode_tag(m: Option<DbMode>) -> u64 {
    match m {
        None => 0,
        Some(DbMode::ReadOnly) => 1,
        Some(DbMode::ReadWrite) => 2,
        Some(DbMode::ExclusiveWrite) => 3,
        Some(DbMode::IntentToWrite) => 4,
    }
}

fn db_mode_from_tag(t: u64) -> Option<DbMode> {
    match t {
        1 => Some(DbMode::ReadOnly),
        2 => Some(DbMode::ReadWrite),
        3 => Some(DbMode::ExclusiveWrite),
        4 => Some(DbMode::IntentToWrite),
        _ => None,
    }
}

fn opt_guid(g: Guid) -> Option<Guid> {
    if g.is_null() {
        None
    } else {
        Some(g)
    }
}

/// Marshals a fully-resolved, runnable [`Edt`] onto a [`Message`]'s GUID and
/// word trailers. Layout: `guids = [guid, output_event, affinity_hint,
/// parent_finish_latch, (producer, payload)...]`, `words = [fn_ptr, props,
/// paramc, depc, paramv..., db_mode_tag...]`.
fn encode_edt_for_wire(edt: &Edt) -> Message {
    let mut msg = Message::request(MsgType::WorkExecute, 0, 0, 0);
    msg.guids.push(edt.guid);
    msg.guids.push(edt.output_event);
    msg.guids.push(edt.affinity_hint.unwrap_or(Guid::NULL));
    msg.guids.push(edt.parent_finish_latch.unwrap_or(Guid::NULL));
    let depv = edt.depv_snapshot();
    for dep in &depv {
        msg.guids.push(dep.producer);
        msg.guids.push(dep.payload);
    }
    msg.words.push(edt.func as usize as u64);
    msg.words.push(edt.props.bits() as u64);
    msg.words.push(edt.paramv.len() as u64);
    msg.words.push(depv.len() as u64);
    msg.words.extend(edt.paramv.iter().copied());
    for dep in &depv {
        msg.words.push(db_mode_tag(dep.db_mode));
    }
    msg
}

/// Inverse of [`encode_edt_for_wire`]; reconstructs a runnable local [`Edt`]
/// record from the wire trailers, ready to insert into the receiving PD's
/// own table.
fn decode_edt_from_wire(msg: &Message) -> Arc<Edt> {
    let guid = msg.guids[0];
    let output_event = msg.guids[1];
    let affinity_hint = opt_guid(msg.guids[2]);
    let parent_finish_latch = opt_guid(msg.guids[3]);
    let fn_ptr = msg.words[0] as usize;
    let props = EdtProps::from_bits_truncate(msg.words[1] as u32);
    let paramc = msg.words[2] as usize;
    let depc = msg.words[3] as usize;
    let paramv = msg.words[4..4 + paramc].to_vec();
    let tags = &msg.words[4 + paramc..4 + paramc + depc];
    let mut depv = Vec::with_capacity(depc);
    for i in 0..depc {
        depv.push(EdtDep {
            producer: msg.guids[4 + i * 2],
            payload: msg.guids[5 + i * 2],
            db_mode: db_mode_from_tag(tags[i]),
            ptr: None,
        });
    }
    // SAFETY: `fn_ptr` was produced by casting a real `EdtFn` value to
    // `usize` in `encode_edt_for_wire`, within the same process — every PD
    // this transport connects shares one address space.
    let func: EdtFn = unsafe { std::mem::transmute::<usize, EdtFn>(fn_ptr) };
    Edt::new(
        guid,
        Guid::NULL,
        func,
        paramv,
        depv,
        output_event,
        affinity_hint,
        parent_finish_latch,
        props,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    static LAST_RESULT: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    fn record(_: u32, paramv: &[u64], _: u32, _: &[EdtDep]) -> Guid {
        LAST_RESULT.lock().unwrap().push(paramv[0]);
        Guid::NULL
    }

    #[test]
    fn zero_dep_edt_runs_and_is_removed() {
        let mut cfg = Config::default_single_pd();
        cfg.worker_count = 1;
        let pd = PolicyDomain::new(cfg);
        LAST_RESULT.lock().unwrap().clear();
        let tmpl = pd.edt_template_create(record, 1, 0);
        let (edt_guid, _) = pd
            .edt_create(tmpl, vec![7], vec![], EdtProps::NONE, None, None, false)
            .unwrap();
        pd.execute_edt(0, edt_guid);
        assert_eq!(*LAST_RESULT.lock().unwrap(), vec![7]);
        assert!(pd.tables.lock().edts.get(&edt_guid).is_none());
    }

    #[test]
    fn event_chain_propagates_to_dependent_edt() {
        let mut cfg = Config::default_single_pd();
        cfg.worker_count = 1;
        let pd = PolicyDomain::new(cfg);
        let evt = pd.event_create(event::Kind::Once);
        let tmpl = pd.edt_template_create(record, 1, 1);
        LAST_RESULT.lock().unwrap().clear();
        let (edt_guid, _) = pd
            .edt_create(tmpl, vec![42], vec![(evt, None)], EdtProps::NONE, None, None, false)
            .unwrap();
        assert!(!pd.tables.lock().edts.get(&edt_guid).unwrap().is_runnable());
        pd.event_satisfy_slot(evt, Guid::NULL, 0).unwrap();
        assert!(pd.tables.lock().edts.get(&edt_guid).unwrap().is_runnable());
        pd.execute_edt(0, edt_guid);
        assert_eq!(*LAST_RESULT.lock().unwrap(), vec![42]);
    }

    static DB_READ_RESULT: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    fn read_db_ptr(_: u32, _: &[u64], _: u32, depv: &[EdtDep]) -> Guid {
        let val = unsafe { *(depv[0].ptr.expect("db should have been acquired") as *const u64) };
        DB_READ_RESULT.lock().unwrap().push(val);
        Guid::NULL
    }

    /// §8 scenario 1: a `Once` event carries a data block's guid to a
    /// dependent EDT, which observes the value written into it before
    /// `satisfy` through its resolved `depv[0].ptr`.
    #[test]
    fn once_event_carries_db_payload_into_edt_depv() {
        crate::test_util::init_tracing();
        let mut cfg = Config::default_single_pd();
        cfg.worker_count = 1;
        let pd = PolicyDomain::new(cfg);
        DB_READ_RESULT.lock().unwrap().clear();
        let (db, ptr) = pd.db_create(8, DbProps::NONE).unwrap();
        unsafe { *(ptr as *mut u64) = 42 };
        let evt = pd.event_create(event::Kind::Once);
        let tmpl = pd.edt_template_create(read_db_ptr, 0, 1);
        let (edt_guid, _) = pd
            .edt_create(
                tmpl,
                vec![],
                vec![(evt, Some(DbMode::ReadOnly))],
                EdtProps::NONE,
                None,
                None,
                false,
            )
            .unwrap();
        assert!(!pd.tables.lock().edts.get(&edt_guid).unwrap().is_runnable());
        pd.event_satisfy_slot(evt, db, 0).unwrap();
        assert!(pd.tables.lock().edts.get(&edt_guid).unwrap().is_runnable());
        pd.execute_edt(0, edt_guid);
        assert_eq!(*DB_READ_RESULT.lock().unwrap(), vec![42]);
    }

    static IDEM_RESULT: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    fn read_db_ptr_idem(_: u32, _: &[u64], _: u32, depv: &[EdtDep]) -> Guid {
        let val = unsafe { *(depv[0].ptr.expect("db should have been acquired") as *const u64) };
        IDEM_RESULT.lock().unwrap().push(val);
        Guid::NULL
    }

    /// §8 scenario 2: an idempotent event's second and third satisfies are
    /// silently discarded; a dependent EDT created afterwards still
    /// observes the first payload.
    #[test]
    fn idempotent_event_absorbs_later_satisfies() {
        let mut cfg = Config::default_single_pd();
        cfg.worker_count = 1;
        let pd = PolicyDomain::new(cfg);
        IDEM_RESULT.lock().unwrap().clear();
        let (db0, ptr0) = pd.db_create(8, DbProps::NONE).unwrap();
        unsafe { *(ptr0 as *mut u64) = 42 };
        let (db1, ptr1) = pd.db_create(8, DbProps::NONE).unwrap();
        unsafe { *(ptr1 as *mut u64) = 43 };
        let evt = pd.event_create(event::Kind::Idempotent);
        pd.event_satisfy_slot(evt, db0, 0).unwrap();
        pd.event_satisfy_slot(evt, db1, 0).unwrap();
        pd.event_satisfy_slot(evt, db1, 0).unwrap();
        let tmpl = pd.edt_template_create(read_db_ptr_idem, 0, 1);
        let (edt_guid, _) = pd
            .edt_create(
                tmpl,
                vec![],
                vec![(evt, Some(DbMode::ReadOnly))],
                EdtProps::NONE,
                None,
                None,
                false,
            )
            .unwrap();
        assert!(pd.tables.lock().edts.get(&edt_guid).unwrap().is_runnable());
        pd.execute_edt(0, edt_guid);
        assert_eq!(*IDEM_RESULT.lock().unwrap(), vec![42]);
    }

    fn noop_edt(_: u32, _: &[u64], _: u32, _: &[EdtDep]) -> Guid {
        Guid::NULL
    }

    static CONTINUATION_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn count_continuation(_: u32, _: &[u64], _: u32, _: &[EdtDep]) -> Guid {
        CONTINUATION_COUNT.fetch_add(1, Ordering::SeqCst);
        Guid::NULL
    }

    /// §8 scenario 3: a finish EDT's latch fires only once every child it
    /// spawned (and its own dynamic extent) has terminated; a continuation
    /// depending on the latch runs exactly once, after the last child.
    #[test]
    fn finish_edt_latch_fires_only_after_all_children_terminate() {
        let mut cfg = Config::default_single_pd();
        cfg.worker_count = 1;
        let pd = PolicyDomain::new(cfg);
        CONTINUATION_COUNT.store(0, Ordering::SeqCst);

        let latch = pd.event_create(event::Kind::Latch);
        // The finish EDT brackets its own dynamic extent: incr once before
        // spawning children, decr once after the spawning loop returns —
        // mirroring `edt_create`'s own incr-on-create / decr-on-execute
        // bookkeeping for each child, so the latch only fires once every
        // increment (10 children + the finish EDT itself) has a matching
        // decrement.
        pd.event_satisfy_slot(latch, Guid::NULL, 0).unwrap();

        let tmpl = pd.edt_template_create(noop_edt, 1, 0);
        let mut children = Vec::new();
        for i in 0..10u64 {
            let (guid, _) = pd
                .edt_create(tmpl, vec![i], vec![], EdtProps::NONE, None, Some(latch), false)
                .unwrap();
            children.push(guid);
        }
        pd.event_satisfy_slot(latch, Guid::NULL, 1).unwrap();

        let cont_tmpl = pd.edt_template_create(count_continuation, 0, 1);
        let (cont_guid, _) = pd
            .edt_create(cont_tmpl, vec![], vec![(latch, None)], EdtProps::NONE, None, None, false)
            .unwrap();
        assert!(!pd.tables.lock().edts.get(&cont_guid).unwrap().is_runnable());

        for (i, child) in children.iter().enumerate() {
            pd.execute_edt(0, *child);
            let should_be_runnable = i == children.len() - 1;
            assert_eq!(
                pd.tables.lock().edts.get(&cont_guid).unwrap().is_runnable(),
                should_be_runnable,
                "continuation runnable state wrong after child {i}",
            );
        }
        pd.execute_edt(0, cont_guid);
        assert_eq!(CONTINUATION_COUNT.load(Ordering::SeqCst), 1);
    }

    static CHANNEL_EDT0: Mutex<Vec<Guid>> = Mutex::new(Vec::new());
    static CHANNEL_EDT1: Mutex<Vec<Guid>> = Mutex::new(Vec::new());

    fn store_payload_0(_: u32, _: &[u64], _: u32, depv: &[EdtDep]) -> Guid {
        CHANNEL_EDT0.lock().unwrap().push(depv[0].payload);
        Guid::NULL
    }

    fn store_payload_1(_: u32, _: &[u64], _: u32, depv: &[EdtDep]) -> Guid {
        CHANNEL_EDT1.lock().unwrap().push(depv[0].payload);
        Guid::NULL
    }

    /// §8 scenario 6: two EDTs registered on a channel's slot 0 are paired
    /// with the two satisfactions in FIFO order of EDT creation.
    #[test]
    fn channel_event_pairs_satisfactions_with_waiters_fifo() {
        let mut cfg = Config::default_single_pd();
        cfg.worker_count = 1;
        let pd = PolicyDomain::new(cfg);
        CHANNEL_EDT0.lock().unwrap().clear();
        CHANNEL_EDT1.lock().unwrap().clear();
        let chan = pd.event_create(event::Kind::Channel { fan_in: 1, fan_out: 1 });
        let tmpl0 = pd.edt_template_create(store_payload_0, 0, 1);
        let tmpl1 = pd.edt_template_create(store_payload_1, 0, 1);
        let (edt0, _) = pd
            .edt_create(tmpl0, vec![], vec![(chan, None)], EdtProps::NONE, None, None, false)
            .unwrap();
        let (edt1, _) = pd
            .edt_create(tmpl1, vec![], vec![(chan, None)], EdtProps::NONE, None, None, false)
            .unwrap();
        let (db_a, _) = pd.db_create(8, DbProps::NONE).unwrap();
        let (db_b, _) = pd.db_create(8, DbProps::NONE).unwrap();
        pd.event_satisfy_slot(chan, db_a, 0).unwrap();
        pd.event_satisfy_slot(chan, db_b, 0).unwrap();
        pd.execute_edt(0, edt0);
        pd.execute_edt(0, edt1);
        assert_eq!(*CHANNEL_EDT0.lock().unwrap(), vec![db_a]);
        assert_eq!(*CHANNEL_EDT1.lock().unwrap(), vec![db_b]);
    }

    static CROSS_PD_RESULT: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    fn record_loc(_: u32, paramv: &[u64], _: u32, _: &[EdtDep]) -> Guid {
        CROSS_PD_RESULT.lock().unwrap().push(paramv[0]);
        Guid::NULL
    }

    /// §8 scenario 4: an EDT created with an affinity hint naming another
    /// PD is forwarded over the wire rather than run locally, and
    /// disappears from the creating PD's own table once forwarded.
    #[test]
    fn affinity_hint_to_remote_pd_forwards_edt_over_the_wire() {
        let transport: Arc<dyn CommPlatform> = Arc::new(LocalTransport::new(2, 64));
        let mut cfg0 = Config::default_single_pd();
        cfg0.worker_count = 1;
        let mut cfg1 = Config::default_single_pd();
        cfg1.worker_count = 1;
        let pd0 = PolicyDomain::new_in_cluster(cfg0, 0, transport.clone());
        let pd1 = PolicyDomain::new_in_cluster(cfg1, 1, transport.clone());
        let a0 = Guid(0x1000);
        let a1 = Guid(0x1001);
        pd0.set_affinity_catalogue(AffinityCatalogue::new(vec![a0, a1], 0, 0));
        pd1.set_affinity_catalogue(AffinityCatalogue::new(vec![a0, a1], 0, 1));
        assert_eq!(pd0.affinity_query(a1), Some(1));

        CROSS_PD_RESULT.lock().unwrap().clear();
        let tmpl = pd0.edt_template_create(record_loc, 1, 0);
        let (edt_guid, _) = pd0
            .edt_create(tmpl, vec![7], vec![], EdtProps::NONE, Some(a1), None, false)
            .unwrap();

        // The EDT was forwarded to pd1's mailbox rather than pd0's own
        // workpile. Draining pd1's inbound messages materializes it under
        // the same guid the wire carried, in pd1's own table.
        pd1.poll_messages(0);
        assert!(pd1.tables.lock().edts.get(&edt_guid).is_some());
        assert!(pd0.tables.lock().edts.get(&edt_guid).is_none());
        pd1.execute_edt(0, edt_guid);
        assert_eq!(*CROSS_PD_RESULT.lock().unwrap(), vec![7]);
    }
}
