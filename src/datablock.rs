// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Data blocks: raw byte buffers with a mode-disciplined acquire/release
//! protocol and deferred destruction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::OcrError;
use crate::guid::Guid;

/// The four acquire disciplines a data block can be held under
/// concurrently, per the mode policy table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
    ExclusiveWrite,
    IntentToWrite,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Props: u32 {
        const NONE              = 0;
        const SINGLE_ASSIGNMENT = 1 << 0;
        const NO_ACQUIRE        = 1 << 1;
    }
}

struct QueuedAcquirer {
    edt: Guid,
    mode: Mode,
}

enum HolderState {
    None,
    ReadOnly { count: u32 },
    ReadWrite { edt: Guid },
    ExclusiveWrite { edt: Guid, committed: bool },
    IntentToWrite { edt: Guid },
}

/// A single data block's metadata. `base` is the backing allocation;
/// `size` its length in bytes. Acquire/release state is guarded by a
/// small CAS-friendly lock (modeled here as a spinlock around an enum,
/// matching the "CAS-guarded small enum with a FIFO waiter queue"
/// description of the concurrency model).
pub struct DataBlock {
    pub guid: Guid,
    pub size: usize,
    pub props: Props,
    base: *mut u8,
    layout: std::alloc::Layout,
    active_users: AtomicUsize,
    free_requested: std::sync::atomic::AtomicBool,
    destroyed: std::sync::atomic::AtomicBool,
    state: spin::Mutex<HolderState>,
    waitq: spin::Mutex<VecDeque<QueuedAcquirer>>,
    owning_pd: AtomicU32,
}

// SAFETY: `base` is only dereferenced through `acquire`'s returned pointer,
// which callers use under the mode discipline this module enforces.
unsafe impl Send for DataBlock {}
unsafe impl Sync for DataBlock {}
static_assertions::assert_impl_all!(DataBlock: Send, Sync);

impl DataBlock {
    pub fn create(guid: Guid, size: usize, props: Props, owning_pd: u32) -> Result<Self, OcrError> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), 8)
            .map_err(|_| OcrError::InvalidArgument("data block size overflows alignment"))?;
        // SAFETY: layout has nonzero size per `size.max(1)`.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(OcrError::OutOfMemory);
        }
        Ok(Self {
            guid,
            size,
            props,
            base,
            layout,
            active_users: AtomicUsize::new(0),
            free_requested: std::sync::atomic::AtomicBool::new(false),
            destroyed: std::sync::atomic::AtomicBool::new(false),
            state: spin::Mutex::new(HolderState::None),
            waitq: spin::Mutex::new(VecDeque::new()),
            owning_pd: AtomicU32::new(owning_pd),
        })
    }

    pub fn owning_pd(&self) -> u32 {
        self.owning_pd.load(Ordering::Relaxed)
    }

    /// The backing allocation, returned to the creator of a fresh data
    /// block without going through the acquire/release dance (the
    /// creator is guaranteed sole access before any `dbCreate` caller can
    /// have handed the GUID to anyone else).
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Attempts to grant `mode` to `edt` immediately per the mode policy
    /// table. Returns `Ok(Some(ptr))` on immediate grant, `Ok(None)` when
    /// the acquirer was queued (caller must treat the EDT's dependence on
    /// this slot as still pending), or an error.
    pub fn acquire(&self, edt: Guid, mode: Mode) -> Result<Option<*mut u8>, OcrError> {
        if self.free_requested.load(Ordering::Acquire) {
            return Err(OcrError::GuidNotFound(self.guid));
        }
        let mut state = self.state.lock();
        let granted = match (&*state, mode) {
            (HolderState::None, _) => true,
            (HolderState::ReadOnly { .. }, Mode::ReadOnly) => true,
            (HolderState::ReadOnly { .. }, _) => false,
            (HolderState::ReadWrite { .. }, _) => false,
            (HolderState::ExclusiveWrite { committed, .. }, _) => {
                if mode == Mode::ExclusiveWrite && !*committed {
                    return Err(OcrError::WrongMode {
                        requested: mode,
                        current: Mode::ExclusiveWrite,
                    });
                }
                false
            }
            (HolderState::IntentToWrite { .. }, Mode::ReadOnly) => true,
            (HolderState::IntentToWrite { .. }, _) => false,
        };
        if !granted {
            self.waitq.lock().push_back(QueuedAcquirer { edt, mode });
            return Ok(None);
        }
        *state = match mode {
            Mode::ReadOnly => match &*state {
                HolderState::ReadOnly { count } => HolderState::ReadOnly { count: count + 1 },
                _ => HolderState::ReadOnly { count: 1 },
            },
            Mode::ReadWrite => HolderState::ReadWrite { edt },
            Mode::ExclusiveWrite => HolderState::ExclusiveWrite {
                edt,
                committed: false,
            },
            Mode::IntentToWrite => HolderState::IntentToWrite { edt },
        };
        self.active_users.fetch_add(1, Ordering::AcqRel);
        Ok(Some(self.base))
    }

    /// Releases `edt`'s hold, promoting the next queued acquirer(s) that
    /// now qualify. Returns the EDTs that were promoted, so the caller can
    /// re-check their frontier (a queued acquire counts as a still-pending
    /// dependence until granted).
    pub fn release(&self, edt: Guid) -> Vec<(Guid, *mut u8)> {
        {
            let mut state = self.state.lock();
            *state = match &*state {
                HolderState::ReadOnly { count } if *count > 1 => HolderState::ReadOnly {
                    count: count - 1,
                },
                HolderState::IntentToWrite { edt: holder } if *holder == edt => {
                    HolderState::None
                }
                _ => HolderState::None,
            };
        }
        self.active_users.fetch_sub(1, Ordering::AcqRel);
        let mut promoted = Vec::new();
        loop {
            let next = {
                let mut wq = self.waitq.lock();
                match wq.front() {
                    Some(q) => {
                        let can_grant = matches!(self.acquire_peek(q.mode), true);
                        if can_grant {
                            wq.pop_front()
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };
            match next {
                Some(q) => match self.acquire(q.edt, q.mode) {
                    Ok(Some(ptr)) => promoted.push((q.edt, ptr)),
                    _ => break,
                },
                None => break,
            }
        }
        if self.active_users.load(Ordering::Acquire) == 0 && self.free_requested.load(Ordering::Acquire) {
            self.finalize_destroy();
        }
        promoted
    }

    fn acquire_peek(&self, mode: Mode) -> bool {
        matches!(
            (&*self.state.lock(), mode),
            (HolderState::None, _)
                | (HolderState::ReadOnly { .. }, Mode::ReadOnly)
                | (HolderState::IntentToWrite { .. }, Mode::ReadOnly)
        )
    }

    /// Requests destruction. If no users currently hold the block it is
    /// reclaimed immediately; otherwise it is marked `FREE_REQUESTED` and
    /// reclaimed by the final `release`.
    pub fn destroy(&self) {
        self.free_requested.store(true, Ordering::Release);
        if self.active_users.load(Ordering::Acquire) == 0 {
            self.finalize_destroy();
        }
    }

    fn finalize_destroy(&self) {
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: `base`/`layout` were allocated together in `create`
            // and this runs exactly once, guarded by `destroyed`.
            unsafe { std::alloc::dealloc(self.base, self.layout) };
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        self.finalize_destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u64) -> Guid {
        crate::guid::PtrGuidProvider::new(0).mint(crate::guid::Kind::DataBlock, n)
    }

    #[test]
    fn read_only_is_shared() {
        let db = DataBlock::create(guid(1), 16, Props::NONE, 0).unwrap();
        assert!(db.acquire(guid(10), Mode::ReadOnly).unwrap().is_some());
        assert!(db.acquire(guid(11), Mode::ReadOnly).unwrap().is_some());
    }

    #[test]
    fn second_exclusive_write_is_rejected_while_first_uncommitted() {
        let db = DataBlock::create(guid(1), 16, Props::NONE, 0).unwrap();
        assert!(db
            .acquire(guid(10), Mode::ExclusiveWrite)
            .unwrap()
            .is_some());
        let err = db.acquire(guid(11), Mode::ExclusiveWrite).unwrap_err();
        assert!(matches!(err, OcrError::WrongMode { .. }));
    }

    #[test]
    fn read_write_after_read_only_queues_until_drained() {
        let db = DataBlock::create(guid(1), 16, Props::NONE, 0).unwrap();
        db.acquire(guid(10), Mode::ReadOnly).unwrap();
        let queued = db.acquire(guid(11), Mode::ReadWrite).unwrap();
        assert!(queued.is_none());
        let promoted = db.release(guid(10));
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].0, guid(11));
    }

    #[test]
    fn destroy_with_active_users_defers() {
        let db = DataBlock::create(guid(1), 16, Props::NONE, 0).unwrap();
        db.acquire(guid(10), Mode::ReadWrite).unwrap();
        db.destroy();
        assert!(!db.is_destroyed());
        assert!(db.acquire(guid(11), Mode::ReadOnly).is_err());
        db.release(guid(10));
        assert!(db.is_destroyed());
    }
}
