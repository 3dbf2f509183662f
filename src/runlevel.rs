// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runlevel bring-up/tear-down contract every core component
//! implements.
//!
//! This is the lifecycle hook, not the sysadmin-level orchestration
//! (config-file discovery, HAL/SAL shim selection) around it — that outer
//! layer is out of scope, but the per-component `switch_runlevel` contract
//! it drives is core: every piece of the runtime (the GUID provider, the
//! scheduler, the comm platform) needs a well-defined point at which it
//! allocates/releases its runlevel-gated resources (the workpile's deque
//! is allocated at `GUID_OK` bring-up and freed at `GUID_OK` tear-down,
//! mirroring the original component's own bring-up/tear-down halves).

/// Bring-up order; tear-down traverses the same list in reverse.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Runlevel {
    ConfigParse = 0,
    NetworkOk = 1,
    PdOk = 2,
    MemoryOk = 3,
    GuidOk = 4,
    ComputeOk = 5,
    UserOk = 6,
}

pub const RUNLEVELS: [Runlevel; 7] = [
    Runlevel::ConfigParse,
    Runlevel::NetworkOk,
    Runlevel::PdOk,
    Runlevel::MemoryOk,
    Runlevel::GuidOk,
    Runlevel::ComputeOk,
    Runlevel::UserOk,
];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    BringUp,
    TearDown,
}

/// A runlevel transition's phase: most components declare exactly one
/// phase per level during `CONFIG_PARSE`, but a level may have several,
/// each a barrier all components must cross before the next phase starts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Phase {
    pub index: u32,
    pub count: u32,
}

impl Phase {
    pub fn is_first(self) -> bool {
        self.index == 0
    }

    pub fn is_last(self) -> bool {
        self.index + 1 == self.count
    }
}

/// Implemented by every component the controller drives through bring-up
/// and tear-down: the GUID provider, the scheduler/workpiles, the comm
/// platform, the policy domain itself.
pub trait Component {
    fn switch_runlevel(&self, level: Runlevel, phase: Phase, dir: Direction);

    /// How many phases this component needs at `level`; declared once,
    /// during `CONFIG_PARSE`. Most components need exactly one.
    fn phases_for(&self, _level: Runlevel) -> u32 {
        1
    }
}

/// Drives every registered [`Component`] through one level at a time, in
/// bring-up order on the way up and reverse order on the way down,
/// honoring each component's declared phase count as a barrier.
pub struct RunlevelController {
    components: Vec<Box<dyn Component>>,
    current: spin::Mutex<Option<(Runlevel, Direction)>>,
}

impl RunlevelController {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            current: spin::Mutex::new(None),
        }
    }

    pub fn register(&mut self, component: Box<dyn Component>) {
        self.components.push(component);
    }

    pub fn bring_up(&self) {
        for level in RUNLEVELS {
            self.run_level(level, Direction::BringUp);
        }
    }

    pub fn tear_down(&self) {
        for level in RUNLEVELS.iter().rev() {
            self.run_level(*level, Direction::TearDown);
        }
    }

    fn run_level(&self, level: Runlevel, dir: Direction) {
        *self.current.lock() = Some((level, dir));
        let phase_count = self
            .components
            .iter()
            .map(|c| c.phases_for(level))
            .max()
            .unwrap_or(1);
        for phase_index in 0..phase_count {
            let phase = Phase {
                index: phase_index,
                count: phase_count,
            };
            for component in &self.components {
                component.switch_runlevel(level, phase, dir);
            }
        }
    }

    pub fn current(&self) -> Option<(Runlevel, Direction)> {
        *self.current.lock()
    }
}

impl Default for RunlevelController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Counter(Arc<AtomicU32>);
    impl Component for Counter {
        fn switch_runlevel(&self, _level: Runlevel, _phase: Phase, dir: Direction) {
            match dir {
                Direction::BringUp => self.0.fetch_add(1, Ordering::SeqCst),
                Direction::TearDown => self.0.fetch_sub(1, Ordering::SeqCst),
            };
        }
    }

    #[test]
    fn bring_up_visits_every_level_once_per_component() {
        let count = Arc::new(AtomicU32::new(0));
        let mut ctrl = RunlevelController::new();
        ctrl.register(Box::new(Counter(count.clone())));
        ctrl.bring_up();
        assert_eq!(count.load(Ordering::SeqCst), RUNLEVELS.len() as u32);
    }

    #[test]
    fn tear_down_unwinds_bring_up() {
        let count = Arc::new(AtomicU32::new(0));
        let mut ctrl = RunlevelController::new();
        ctrl.register(Box::new(Counter(count.clone())));
        ctrl.bring_up();
        ctrl.tear_down();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
