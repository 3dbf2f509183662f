// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime's config descriptor: key-value sections naming component
//! types per policy domain.
//!
//! Full `.ini`-style discovery (multiple files, environment overrides,
//! per-platform defaults) is out of scope for this core — a real
//! deployment's bring-up orchestration handles that before ever calling
//! `ocrInit`. What the core does own is the descriptor *type* callers
//! populate (by hand, or via [`Config::parse`]'s minimal loader) and read
//! during `CONFIG_PARSE`.

use std::collections::HashMap;

use crate::error::OcrError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Allocator {
    Tlsf,
    Quick,
    Simple,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedulerKind {
    Hc,
    Ce,
    Xe,
    Common,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommPlatformKind {
    Null,
    Ce,
    Xe,
    Mpi,
    Gasnet,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub allocator: Allocator,
    pub scheduler: SchedulerKind,
    pub comm_platform: CommPlatformKind,
    pub worker_count: usize,
    pub neighbors: Vec<u64>,
}

impl Config {
    /// A single-PD, in-process configuration: no neighbors, the `Null`
    /// comm platform, `worker_count` drawn from the available parallelism.
    pub fn default_single_pd() -> Self {
        Self {
            allocator: Allocator::Simple,
            scheduler: SchedulerKind::Hc,
            comm_platform: CommPlatformKind::Null,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            neighbors: Vec::new(),
        }
    }

    /// Parses the minimal `key=value` descriptor format from §6: one
    /// assignment per line, `#` comments, `neighbors` as a
    /// bracket-enclosed comma list.
    pub fn parse(text: &str) -> Result<Self, OcrError> {
        let mut kv: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (k, v) = line
                .split_once('=')
                .ok_or(OcrError::InvalidArgument("config line missing '='"))?;
            kv.insert(k.trim(), v.trim());
        }
        let allocator = match kv.get("allocator").copied().unwrap_or("SIMPLE") {
            "TLSF" => Allocator::Tlsf,
            "QUICK" => Allocator::Quick,
            "SIMPLE" => Allocator::Simple,
            _ => return Err(OcrError::InvalidArgument("unknown allocator")),
        };
        let scheduler = match kv.get("scheduler").copied().unwrap_or("HC") {
            "HC" => SchedulerKind::Hc,
            "CE" => SchedulerKind::Ce,
            "XE" => SchedulerKind::Xe,
            "COMMON" => SchedulerKind::Common,
            _ => return Err(OcrError::InvalidArgument("unknown scheduler")),
        };
        let comm_platform = match kv.get("commPlatform").copied().unwrap_or("NULL") {
            "NULL" => CommPlatformKind::Null,
            "CE" => CommPlatformKind::Ce,
            "XE" => CommPlatformKind::Xe,
            "MPI" => CommPlatformKind::Mpi,
            "GASNET" => CommPlatformKind::Gasnet,
            _ => return Err(OcrError::InvalidArgument("unknown comm platform")),
        };
        let worker_count = kv
            .get("workerCount")
            .map(|s| s.parse::<usize>())
            .transpose()
            .map_err(|_| OcrError::InvalidArgument("workerCount not a number"))?
            .unwrap_or(1);
        let neighbors = match kv.get("neighbors") {
            Some(s) => {
                let s = s.trim_start_matches('[').trim_end_matches(']');
                if s.is_empty() {
                    Vec::new()
                } else {
                    s.split(',')
                        .map(|tok| {
                            tok.trim()
                                .parse::<u64>()
                                .map_err(|_| OcrError::InvalidArgument("neighbor location not a number"))
                        })
                        .collect::<Result<Vec<_>, _>>()?
                }
            }
            None => Vec::new(),
        };
        Ok(Self {
            allocator,
            scheduler,
            comm_platform,
            worker_count,
            neighbors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_descriptor() {
        let cfg = Config::parse(
            "allocator=TLSF\nscheduler=HC\ncommPlatform=MPI\nworkerCount=4\nneighbors=[1,2,3]\n# comment\n",
        )
        .unwrap();
        assert_eq!(cfg.allocator, Allocator::Tlsf);
        assert_eq!(cfg.comm_platform, CommPlatformKind::Mpi);
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.neighbors, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_unknown_allocator() {
        assert!(Config::parse("allocator=BOGUS\n").is_err());
    }

    #[test]
    fn default_single_pd_has_no_neighbors() {
        let cfg = Config::default_single_pd();
        assert!(cfg.neighbors.is_empty());
        assert_eq!(cfg.comm_platform, CommPlatformKind::Null);
    }
}
