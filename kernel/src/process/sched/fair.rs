//! The fair scheduling class.
//!
//! Runtime is weighted by niceness into `vruntime`; the picker takes the
//! smallest `vruntime`, breaking ties by earlier arrival time and then by
//! lower pid, so two equal CPU-bound tasks alternate tick for tick.

use super::SchedClassRq;
use crate::process::pid::Pid;
use crate::process::task::Task;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Weight of nice 0; vruntime advances by `delta * WEIGHT_0 / weight`.
pub const WEIGHT_0: u64 = 1024;

/// Map a niceness to its load weight, each step worth ~25% of CPU share.
pub const fn nice_to_weight(nice: i8) -> u64 {
    const FACTOR_NUMERATOR: u64 = 5;
    const FACTOR_DENOMINATOR: u64 = 4;

    const NICE_TO_WEIGHT: [u64; 40] = const {
        let mut ret = [0u64; 40];
        let mut index = 0usize;
        let mut nice = -20i64;
        while nice <= 19 {
            ret[index] = if nice == 0 {
                WEIGHT_0
            } else if nice > 0 {
                let numerator = FACTOR_DENOMINATOR.pow(nice as u32);
                let denominator = FACTOR_NUMERATOR.pow(nice as u32);
                WEIGHT_0 * numerator / denominator
            } else {
                let numerator = FACTOR_NUMERATOR.pow((-nice) as u32);
                let denominator = FACTOR_DENOMINATOR.pow((-nice) as u32);
                WEIGHT_0 * numerator / denominator
            };
            index += 1;
            nice += 1;
        }
        ret
    };

    NICE_TO_WEIGHT[(nice as i32 + 20) as usize]
}

/// Run queue of the fair class.
pub struct FairClassRq {
    queued: Vec<Pid>,
    /// Smallest vruntime seen lately; newly woken tasks are clamped up to
    /// it so sleepers cannot hoard the CPU on wake.
    min_vruntime: u64,
}

impl FairClassRq {
    pub const fn new() -> Self {
        FairClassRq {
            queued: Vec::new(),
            min_vruntime: 0,
        }
    }

    /// Ordering key: (vruntime, arrivaltime, pid).
    fn key(task: &Task) -> (u64, u64, Pid) {
        (task.se.vruntime, task.se.arrivaltime, task.pid)
    }
}

impl SchedClassRq for FairClassRq {
    fn enqueue(&mut self, pid: Pid, tasks: &mut BTreeMap<Pid, Task>) {
        if self.queued.contains(&pid) {
            return;
        }
        if let Some(task) = tasks.get_mut(&pid) {
            if task.se.vruntime < self.min_vruntime {
                task.se.vruntime = self.min_vruntime;
            }
            self.queued.push(pid);
        }
    }

    fn pick_next(&mut self, tasks: &mut BTreeMap<Pid, Task>, _now: u64) -> Option<Pid> {
        let best = self
            .queued
            .iter()
            .filter_map(|pid| tasks.get(pid).map(|t| (Self::key(t), *pid)))
            .min()
            .map(|(_, pid)| pid)?;
        self.remove(best);
        if let Some(task) = tasks.get(&best) {
            self.min_vruntime = self.min_vruntime.max(task.se.vruntime);
        }
        Some(best)
    }

    fn remove(&mut self, pid: Pid) -> bool {
        match self.queued.iter().position(|&p| p == pid) {
            Some(at) => {
                self.queued.swap_remove(at);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.queued.len()
    }
}

/// Advance a task's accounting after it ran `delta` ticks.
pub fn account(task: &mut Task, delta: u64) {
    task.se.sum_exec_runtime += delta;
    let weight = nice_to_weight(task.se.nice);
    task.se.vruntime += delta * WEIGHT_0 / weight;
}
