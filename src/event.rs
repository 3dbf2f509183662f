// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The six event kinds and their waiter-list state machines.
//!
//! Each event owns a waiter list guarded by a short-held [`spin::Mutex`] —
//! the same tradeoff the wait-queue primitive in this crate's ancestry
//! makes: the critical sections here (push a waiter, swap out the list) are
//! short enough that a spinlock beats the bookkeeping of a lock-free
//! intrusive list for a single-assignment payload slot. What *is* lock-free
//! is the `FIRED` transition itself, which is a single atomic compare-
//! exchange on the state word.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use mycelium_bitfield::bitfield;

use crate::error::OcrError;
use crate::guid::Guid;

/// The six event kinds from the data model, each with its own
/// satisfy/register-waiter behavior.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    Sticky,
    Idempotent,
    Once,
    Latch,
    Counted { count: u32 },
    Channel { fan_in: u32, fan_out: u32 },
}

/// What an event notifies when it fires: either an EDT slot or another
/// event's slot (events may themselves be waiters on other events, e.g. a
/// finish-latch waiting to propagate to its creator's continuation).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Waiter {
    pub target: Guid,
    pub slot: u32,
    pub is_event: bool,
}

bitfield! {
    /// Packs the event's lifecycle state and, for Sticky/Idempotent/Once,
    /// whether the payload slot has been written, into one atomic word.
    struct StateBits<u32> {
        const STAGE: Stage;
        const DESTROYED: bool;
        const PROPAGATING: bool;
    }
}

mycelium_bitfield::enum_from_bits! {
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    enum Stage<u8> {
        Unset = 0b00,
        Set = 0b01,
        Fired = 0b10,
    }
}

/// Result of a `satisfy` call: the caller (policy domain) is responsible
/// for actually notifying `notify` (decrementing frontier counts / waking
/// workers) and for destroying the event's metadata when `self_destruct` is
/// set.
pub struct SatisfyOutcome {
    pub notify: Vec<Waiter>,
    pub self_destruct: bool,
}

/// Result of `register_waiter`: `payload` is `Some` when the event had
/// already fired and the registration was satisfied inline (synchronous
/// propagation), `None` when the waiter was queued. `self_destruct` is set
/// when this registration was a Counted event's final propagation (the
/// caller must destroy the event's metadata, exactly as after a `satisfy`
/// whose `SatisfyOutcome::self_destruct` is set).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegisterOutcome {
    pub payload: Option<Guid>,
    pub self_destruct: bool,
}

impl RegisterOutcome {
    fn queued() -> Self {
        Self {
            payload: None,
            self_destruct: false,
        }
    }

    fn immediate(payload: Guid) -> Self {
        Self {
            payload: Some(payload),
            self_destruct: false,
        }
    }
}

struct Channel {
    payloads: VecDeque<Guid>,
    waiters: VecDeque<Waiter>,
}

enum Body {
    /// Sticky, Idempotent, Once: a single payload slot plus a waiter list.
    SingleAssign {
        payload: Guid,
        waiters: Vec<Waiter>,
    },
    Latch {
        incr: AtomicU32,
        decr: AtomicU32,
        waiters: Vec<Waiter>,
    },
    Counted {
        remaining: u32,
        payload: Guid,
        waiters: Vec<Waiter>,
    },
    Channel(Channel),
}

/// A single event's metadata. Owned by the GUID table; the policy domain
/// resolves a GUID to an `&Event` and calls through these methods under
/// its own short-lived spinlock.
pub struct Event {
    pub guid: Guid,
    pub kind: Kind,
    state: AtomicU32,
    body: spin::Mutex<Body>,
}

/// Threshold past which synchronous satisfy-propagation defers the
/// remaining notifications to the local worker's deque instead of
/// recursing further, and past which a satisfy that re-enters an event
/// still marked `PROPAGATING` is reported as a cycle rather than
/// recursed into (§9's cyclic-graph note).
pub const MAX_SYNC_DEPTH: u32 = 64;

std::thread_local! {
    static PROPAGATION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII guard bumping the thread-local synchronous-propagation depth
/// counter; `satisfy` call sites that recurse into further satisfies
/// (event-chains-to-event) should hold one of these for the duration of
/// the inner call and consult [`PropagationGuard::should_defer`] before
/// recursing.
pub struct PropagationGuard(());

impl PropagationGuard {
    pub fn enter() -> Self {
        PROPAGATION_DEPTH.with(|d| d.set(d.get() + 1));
        Self(())
    }

    pub fn depth() -> u32 {
        PROPAGATION_DEPTH.with(|d| d.get())
    }

    pub fn should_defer() -> bool {
        Self::depth() >= MAX_SYNC_DEPTH
    }
}

impl Drop for PropagationGuard {
    fn drop(&mut self) {
        PROPAGATION_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

impl Event {
    pub fn new(guid: Guid, kind: Kind) -> Self {
        let body = match kind {
            Kind::Sticky | Kind::Idempotent | Kind::Once => Body::SingleAssign {
                payload: Guid::NULL,
                waiters: Vec::new(),
            },
            Kind::Latch => Body::Latch {
                incr: AtomicU32::new(0),
                decr: AtomicU32::new(0),
                waiters: Vec::new(),
            },
            Kind::Counted { count } => Body::Counted {
                remaining: count,
                payload: Guid::NULL,
                waiters: Vec::new(),
            },
            Kind::Channel { .. } => Body::Channel(Channel {
                payloads: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        };
        Self {
            guid,
            kind,
            state: AtomicU32::new(0),
            body: spin::Mutex::new(body),
        }
    }

    fn stage(&self) -> Stage {
        StateBits::from_bits(self.state.load(Ordering::Acquire)).get(StateBits::STAGE)
    }

    pub fn is_destroyed(&self) -> bool {
        StateBits::from_bits(self.state.load(Ordering::Acquire)).get(StateBits::DESTROYED)
    }

    /// Satisfies `slot` (meaningful only for Channel, where multiple
    /// producer slots are multiplexed; other kinds ignore it) with
    /// `payload`. Latch instead uses `slot` as 0=incr / 1=decr.
    pub fn satisfy(&self, payload: Guid, slot: u32) -> Result<SatisfyOutcome, OcrError> {
        if self.is_destroyed() {
            return Err(OcrError::InvalidArgument("satisfy on destroyed event"));
        }
        match self.kind {
            Kind::Sticky | Kind::Idempotent => self.satisfy_single_assign(payload, false),
            Kind::Once => self.satisfy_single_assign(payload, true),
            Kind::Latch => self.satisfy_latch(slot),
            Kind::Counted { .. } => self.satisfy_counted(payload),
            Kind::Channel { .. } => self.satisfy_channel(payload),
        }
    }

    fn satisfy_single_assign(
        &self,
        payload: Guid,
        self_destruct_on_fire: bool,
    ) -> Result<SatisfyOutcome, OcrError> {
        let mut body = self.body.lock();
        let Body::SingleAssign {
            payload: slot,
            waiters,
        } = &mut *body
        else {
            unreachable!("kind/body mismatch")
        };
        if self.stage() != Stage::Unset {
            if self.kind == Kind::Idempotent {
                return Ok(SatisfyOutcome {
                    notify: Vec::new(),
                    self_destruct: false,
                });
            }
            return Err(OcrError::AlreadySatisfied(self.guid));
        }
        *slot = payload;
        self.set_stage(Stage::Fired);
        let notify = std::mem::take(waiters);
        Ok(SatisfyOutcome {
            notify,
            self_destruct: self_destruct_on_fire,
        })
    }

    fn satisfy_counted(&self, payload: Guid) -> Result<SatisfyOutcome, OcrError> {
        let mut body = self.body.lock();
        let Body::Counted {
            remaining,
            payload: slot,
            waiters,
        } = &mut *body
        else {
            unreachable!("kind/body mismatch")
        };
        if self.stage() == Stage::Unset {
            *slot = payload;
            self.set_stage(Stage::Set);
        }
        let notify = std::mem::take(waiters);
        let mut destruct = false;
        for _ in &notify {
            *remaining = remaining.saturating_sub(1);
        }
        if *remaining == 0 {
            destruct = true;
        }
        Ok(SatisfyOutcome {
            notify,
            self_destruct: destruct,
        })
    }

    fn satisfy_latch(&self, slot: u32) -> Result<SatisfyOutcome, OcrError> {
        let mut body = self.body.lock();
        let Body::Latch {
            incr,
            decr,
            waiters,
        } = &mut *body
        else {
            unreachable!("kind/body mismatch")
        };
        let (i, d) = if slot == 0 {
            (incr.fetch_add(1, Ordering::AcqRel) + 1, decr.load(Ordering::Acquire))
        } else {
            (incr.load(Ordering::Acquire), decr.fetch_add(1, Ordering::AcqRel) + 1)
        };
        if self.stage() == Stage::Unset && i >= 1 && d >= 1 && i == d {
            self.set_stage(Stage::Fired);
            let notify = std::mem::take(waiters);
            return Ok(SatisfyOutcome {
                notify,
                self_destruct: false,
            });
        }
        Ok(SatisfyOutcome {
            notify: Vec::new(),
            self_destruct: false,
        })
    }

    fn satisfy_channel(&self, payload: Guid) -> Result<SatisfyOutcome, OcrError> {
        let mut body = self.body.lock();
        let Body::Channel(ch) = &mut *body else {
            unreachable!("kind/body mismatch")
        };
        if let Some(waiter) = ch.waiters.pop_front() {
            Ok(SatisfyOutcome {
                notify: vec![waiter],
                self_destruct: false,
            })
        } else {
            ch.payloads.push_back(payload);
            Ok(SatisfyOutcome {
                notify: Vec::new(),
                self_destruct: false,
            })
        }
    }

    /// Registers `waiter` on this event. If already fired, returns the
    /// payload immediately (synchronous propagation) instead of queuing.
    pub fn register_waiter(&self, waiter: Waiter) -> Result<RegisterOutcome, OcrError> {
        if self.is_destroyed() {
            return Err(OcrError::InvalidArgument("register on destroyed event"));
        }
        match self.kind {
            Kind::Sticky | Kind::Idempotent | Kind::Once => {
                let mut body = self.body.lock();
                let Body::SingleAssign {
                    payload, waiters, ..
                } = &mut *body
                else {
                    unreachable!()
                };
                if self.stage() == Stage::Fired {
                    Ok(RegisterOutcome::immediate(*payload))
                } else {
                    waiters.push(waiter);
                    Ok(RegisterOutcome::queued())
                }
            }
            Kind::Latch => {
                let mut body = self.body.lock();
                let Body::Latch { waiters, .. } = &mut *body else {
                    unreachable!()
                };
                if self.stage() == Stage::Fired {
                    Ok(RegisterOutcome::immediate(Guid::NULL))
                } else {
                    waiters.push(waiter);
                    Ok(RegisterOutcome::queued())
                }
            }
            Kind::Counted { .. } => {
                let mut body = self.body.lock();
                let Body::Counted {
                    remaining,
                    payload,
                    waiters,
                } = &mut *body
                else {
                    unreachable!()
                };
                if self.stage() != Stage::Unset {
                    // Fired already: this registration is itself one of the
                    // N propagations the event owes, exactly like a waiter
                    // that was already queued when `satisfy` ran and got
                    // drained from `notify` there. Charge it against the
                    // same budget so the event still self-destructs after
                    // exactly `count` propagations regardless of whether
                    // they raced satisfy or arrived after it.
                    if *remaining == 0 {
                        return Err(OcrError::GuidNotFound(self.guid));
                    }
                    *remaining -= 1;
                    let exhausted = *remaining == 0;
                    Ok(RegisterOutcome {
                        payload: Some(*payload),
                        self_destruct: exhausted,
                    })
                } else {
                    waiters.push(waiter);
                    Ok(RegisterOutcome::queued())
                }
            }
            Kind::Channel { .. } => {
                let mut body = self.body.lock();
                let Body::Channel(ch) = &mut *body else {
                    unreachable!()
                };
                if let Some(payload) = ch.payloads.pop_front() {
                    Ok(RegisterOutcome::immediate(payload))
                } else {
                    ch.waiters.push_back(waiter);
                    Ok(RegisterOutcome::queued())
                }
            }
        }
    }

    /// Marks the event destroyed, returning the waiters still pending so
    /// the caller can notify them with [`Guid::ERROR`].
    pub fn destroy(&self) -> Vec<Waiter> {
        self.mark_destroyed();
        let mut body = self.body.lock();
        match &mut *body {
            Body::SingleAssign { waiters, .. } => std::mem::take(waiters),
            Body::Latch { waiters, .. } => std::mem::take(waiters),
            Body::Counted { waiters, .. } => std::mem::take(waiters),
            Body::Channel(ch) => ch.waiters.drain(..).collect(),
        }
    }

    fn set_stage(&self, stage: Stage) {
        let mut bits = StateBits::from_bits(self.state.load(Ordering::Acquire));
        bits.set(StateBits::STAGE, stage);
        self.state.store(bits.bits(), Ordering::Release);
    }

    fn mark_destroyed(&self) {
        let mut bits = StateBits::from_bits(self.state.load(Ordering::Acquire));
        bits.set(StateBits::DESTROYED, true);
        self.state.store(bits.bits(), Ordering::Release);
    }
}

impl PartialEq for Kind {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
impl Eq for Kind {}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u64) -> Guid {
        crate::guid::PtrGuidProvider::new(0).mint(crate::guid::Kind::Event, n)
    }

    fn waiter(n: u64) -> Waiter {
        Waiter {
            target: guid(n),
            slot: 0,
            is_event: false,
        }
    }

    #[test]
    fn sticky_fires_once_and_notifies_late_registrants_inline() {
        let e = Event::new(guid(1), Kind::Sticky);
        let out = e.register_waiter(waiter(2)).unwrap();
        assert_eq!(out.payload, None);
        let payload = guid(99);
        let out = e.satisfy(payload, 0).unwrap();
        assert_eq!(out.notify.len(), 1);
        assert!(!out.self_destruct);
        let out = e.register_waiter(waiter(3)).unwrap();
        assert_eq!(out.payload, Some(payload));
    }

    #[test]
    fn sticky_double_satisfy_is_error() {
        let e = Event::new(guid(1), Kind::Sticky);
        e.satisfy(guid(1), 0).unwrap();
        assert!(e.satisfy(guid(2), 0).is_err());
    }

    #[test]
    fn idempotent_double_satisfy_is_silently_discarded() {
        let e = Event::new(guid(1), Kind::Idempotent);
        e.satisfy(guid(5), 0).unwrap();
        let out = e.satisfy(guid(6), 0).unwrap();
        assert!(out.notify.is_empty());
    }

    #[test]
    fn once_self_destructs_on_satisfy() {
        let e = Event::new(guid(1), Kind::Once);
        let out = e.satisfy(guid(5), 0).unwrap();
        assert!(out.self_destruct);
    }

    #[test]
    fn latch_fires_when_incr_equals_decr_both_nonzero() {
        let e = Event::new(guid(1), Kind::Latch);
        e.register_waiter(waiter(2)).unwrap();
        let out = e.satisfy(Guid::NULL, 0).unwrap(); // incr
        assert!(out.notify.is_empty());
        let out = e.satisfy(Guid::NULL, 1).unwrap(); // decr -> fires
        assert_eq!(out.notify.len(), 1);
    }

    #[test]
    fn counted_self_destructs_after_n_propagations() {
        let e = Event::new(guid(1), Kind::Counted { count: 2 });
        e.register_waiter(waiter(2)).unwrap();
        e.register_waiter(waiter(3)).unwrap();
        let out = e.satisfy(guid(7), 0).unwrap();
        assert_eq!(out.notify.len(), 2);
        assert!(out.self_destruct);
    }

    #[test]
    fn counted_charges_registrations_arriving_after_satisfy_too() {
        let e = Event::new(guid(1), Kind::Counted { count: 2 });
        let payload = guid(7);
        e.register_waiter(waiter(2)).unwrap();
        let out = e.satisfy(payload, 0).unwrap();
        assert_eq!(out.notify.len(), 1);
        assert!(!out.self_destruct);
        let out = e.register_waiter(waiter(3)).unwrap();
        assert_eq!(out.payload, Some(payload));
        assert!(out.self_destruct);
        let err = e.register_waiter(waiter(4)).unwrap_err();
        assert!(matches!(err, OcrError::GuidNotFound(_)));
    }

    #[test]
    fn channel_pairs_fifo() {
        let e = Event::new(
            guid(1),
            Kind::Channel {
                fan_in: 1,
                fan_out: 1,
            },
        );
        // Two registrations before any satisfy: both queue.
        assert_eq!(e.register_waiter(waiter(10)).unwrap().payload, None);
        assert_eq!(e.register_waiter(waiter(11)).unwrap().payload, None);
        let out = e.satisfy(guid(100), 0).unwrap();
        assert_eq!(out.notify, vec![waiter(10)]);
        let out = e.satisfy(guid(200), 0).unwrap();
        assert_eq!(out.notify, vec![waiter(11)]);
    }

    #[test]
    fn destroy_drains_pending_waiters() {
        let e = Event::new(guid(1), Kind::Sticky);
        e.register_waiter(waiter(2)).unwrap();
        let pending = e.destroy();
        assert_eq!(pending.len(), 1);
        assert!(e.is_destroyed());
    }
}
