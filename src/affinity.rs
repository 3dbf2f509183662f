// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Affinity hints and labeled-GUID rendezvous.
//!
//! Affinity guids name placement targets (a PD, the PD that bootstrapped
//! the run, or "wherever this call is running"); a [`GuidMap`] reserves a
//! contiguous GUID range and a deterministic `tuple -> index` function so
//! two PDs that both compute the same tuple arrive at the same GUID
//! without a coordination round trip.

use crate::error::OcrError;
use crate::guid::{Guid, GuidProvider, Kind};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AffinityKind {
    CurrentPd,
    PdMaster,
    Pd(u16),
}

/// Per-PD affinity catalogue: every known PD's affinity GUID, with the
/// master (the PD that called `ocrInit`) and current PD singled out.
pub struct AffinityCatalogue {
    pds: Vec<Guid>,
    master: usize,
    current: usize,
}

impl AffinityCatalogue {
    pub fn new(pds: Vec<Guid>, master: usize, current: usize) -> Self {
        Self { pds, master, current }
    }

    pub fn count(&self, kind: AffinityKind) -> usize {
        match kind {
            AffinityKind::CurrentPd | AffinityKind::PdMaster => 1,
            AffinityKind::Pd(_) => self.pds.len(),
        }
    }

    pub fn get(&self, kind: AffinityKind, idx: usize) -> Result<Guid, OcrError> {
        match kind {
            AffinityKind::CurrentPd => {
                if idx == 0 {
                    Ok(self.pds[self.current])
                } else {
                    Err(OcrError::InvalidArgument("affinity index out of range"))
                }
            }
            AffinityKind::PdMaster => {
                if idx == 0 {
                    Ok(self.pds[self.master])
                } else {
                    Err(OcrError::InvalidArgument("affinity index out of range"))
                }
            }
            AffinityKind::Pd(_) => self
                .pds
                .get(idx)
                .copied()
                .ok_or(OcrError::InvalidArgument("affinity index out of range")),
        }
    }

    /// Which PD an affinity GUID names, used by the EDT placement policy
    /// to decide whether a ready EDT stays local or is forwarded.
    pub fn query(&self, affinity_guid: Guid) -> Option<u16> {
        self.pds
            .iter()
            .position(|g| *g == affinity_guid)
            .map(|i| i as u16)
    }
}

/// A reserved GUID range plus the mapping function from a user tuple
/// (hashed to `u64` by the caller) to an index in `0..count`.
pub struct GuidMap {
    pub start: Guid,
    pub stride: u64,
    pub count: u64,
    pub kind: Kind,
}

impl GuidMap {
    /// Reserves `count` GUIDs of `kind` and records the range; the caller
    /// supplies the actual `tuple -> index` hash, since that logic is
    /// user/application specific (the runtime only owns the range and the
    /// final `start + index * stride` arithmetic).
    pub fn create(provider: &dyn GuidProvider, kind: Kind, count: u64) -> Self {
        let start = provider.reserve(kind, count, 1);
        Self {
            start,
            stride: 1,
            count,
            kind,
        }
    }

    pub fn guid_from_index(&self, index: u64) -> Result<Guid, OcrError> {
        if index >= self.count {
            return Err(OcrError::InvalidArgument("guid map index out of range"));
        }
        Ok(Guid(self.start.0 + index * self.stride))
    }

    pub fn guid_from_label<F: Fn(u64) -> u64>(&self, map_fn: F, tuple_hash: u64) -> Result<Guid, OcrError> {
        let index = map_fn(tuple_hash) % self.count.max(1);
        self.guid_from_index(index)
    }

    /// Associates `value` with the GUID at `index`, checking for a prior
    /// creation when `check` is set — this is the atomic rendezvous
    /// primitive: whichever PD calls this first for a given index wins;
    /// the other observes [`OcrError::GuidExists`].
    pub fn claim(
        &self,
        provider: &dyn GuidProvider,
        index: u64,
        value: u64,
        check: bool,
    ) -> Result<Guid, OcrError> {
        let guid = self.guid_from_index(index)?;
        provider.mint_at(guid, value, check)?;
        Ok(guid)
    }

    pub fn destroy(&self, provider: &dyn GuidProvider) {
        provider.unreserve(self.start, self.count, self.stride);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::PtrGuidProvider;

    #[test]
    fn affinity_current_and_master_resolve_to_one_guid_each() {
        let cat = AffinityCatalogue::new(vec![Guid(1), Guid(2), Guid(3)], 0, 1);
        assert_eq!(cat.count(AffinityKind::CurrentPd), 1);
        assert_eq!(cat.get(AffinityKind::CurrentPd, 0).unwrap(), Guid(2));
        assert_eq!(cat.get(AffinityKind::PdMaster, 0).unwrap(), Guid(1));
    }

    #[test]
    fn guid_map_index_round_trips() {
        let provider = PtrGuidProvider::new(0);
        let map = GuidMap::create(&provider, Kind::Event, 8);
        let g3 = map.guid_from_index(3).unwrap();
        assert_eq!(g3.0, map.start.0 + 3);
    }

    #[test]
    fn labeled_rendezvous_second_claim_sees_guid_exists() {
        let provider = crate::guid::MapGuidProvider::new(0);
        let map = GuidMap::create(&provider, Kind::Event, 4);
        map.claim(&provider, 1, 100, true).unwrap();
        let err = map.claim(&provider, 1, 200, true).unwrap_err();
        assert!(matches!(err, OcrError::GuidExists(_)));
    }
}
