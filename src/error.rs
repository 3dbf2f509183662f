// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy for the runtime.
//!
//! Errors are split into five kinds. `Validation` and `Resource` are raised
//! synchronously from the API call that triggered them. `Protocol` and
//! `Remote` surface from the message pump and are reported to the affected
//! dataflow node (an event is satisfied with an error GUID rather than a
//! value) in addition to being logged. `Fatal` aborts the owning policy
//! domain's runlevel teardown sequence.

use onlyerror::Error;

/// The `errorCode` returned at process exit, mirrored from the wire ABI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    Inval = 1,
    NoMem = 2,
    NotSup = 3,
    Timeout = 4,
    GuidExists = 5,
    Busy = 6,
    Canceled = 7,
}

impl From<&OcrError> for ErrorCode {
    fn from(err: &OcrError) -> Self {
        match err {
            OcrError::InvalidArgument(_) => ErrorCode::Inval,
            OcrError::GuidNotFound(_) => ErrorCode::Inval,
            OcrError::GuidExists(_) => ErrorCode::GuidExists,
            OcrError::OutOfMemory => ErrorCode::NoMem,
            OcrError::Unsupported(_) => ErrorCode::NotSup,
            OcrError::WrongMode { .. } => ErrorCode::Inval,
            OcrError::AlreadySatisfied(_) => ErrorCode::Inval,
            OcrError::Deadlock(_) => ErrorCode::Busy,
            OcrError::Closed => ErrorCode::Canceled,
            OcrError::Protocol(_) => ErrorCode::Inval,
            OcrError::Remote(_) => ErrorCode::Timeout,
            OcrError::Fatal(_) => ErrorCode::NotSup,
        }
    }
}

/// The runtime's single error type, one variant per kind of failure the
/// component design calls out. `Display` messages are deliberately terse;
/// callers that need structured detail should match on the variant.
#[derive(Debug, Error)]
pub enum OcrError {
    /// Validation: a caller passed a malformed argument (bad mode, null
    /// `paramv` with nonzero `paramc`, depc mismatch).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Validation: resolution was attempted against a GUID the provider
    /// has never minted or has already released.
    #[error("guid not found")]
    GuidNotFound(crate::guid::Guid),

    /// Resource: a labeled-GUID create collided with an existing reservation.
    #[error("guid already exists")]
    GuidExists(crate::guid::Guid),

    /// Resource: allocation failed (DB backing store, task/event metadata).
    #[error("out of memory")]
    OutOfMemory,

    /// Validation: an unsupported mode/kind/flag combination.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Validation: an acquire was attempted with a mode the data block's
    /// current mode does not permit concurrently with.
    #[error("acquire mode {requested:?} conflicts with current mode {current:?}")]
    WrongMode {
        requested: crate::datablock::Mode,
        current: crate::datablock::Mode,
    },

    /// Validation: a single-assignment event (Sticky/Idempotent/Once) was
    /// satisfied twice with different payloads, or a Once event twice at all.
    #[error("event already satisfied")]
    AlreadySatisfied(crate::guid::Guid),

    /// Resource: lazy cycle detection caught a synchronous satisfy
    /// re-entering an event still propagating on the same worker stack.
    #[error("dependence cycle detected at {0:?}")]
    Deadlock(crate::guid::Guid),

    /// Resource: the policy domain is mid-or-post shutdown and rejects
    /// new work.
    #[error("policy domain closed")]
    Closed,

    /// Protocol: a malformed or out-of-sequence message was received over
    /// the wire (unknown message type, msgId reused while in flight).
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Remote: the comm platform could not deliver a message to the
    /// destination policy domain (retry budget exhausted, destination
    /// unknown).
    #[error("remote delivery failed: {0}")]
    Remote(&'static str),

    /// Fatal: an invariant the runtime relies on to stay live was violated;
    /// the owning policy domain should begin teardown.
    #[error("fatal: {0}")]
    Fatal(&'static str),
}

impl OcrError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}
