//! The EDF class for periodic real-time tasks.
//!
//! A periodic task is admitted only while the total utilization
//! `Σ WCET/period` of admitted tasks stays at or below 1 (tracked in parts
//! per million). The picker takes the earliest absolute deadline, ties by
//! lower pid; a deadline in the past rolls forward by whole periods at
//! pick time, which starts the next instance.

use super::SchedClassRq;
use crate::process::pid::Pid;
use crate::process::task::Task;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

const FULL_UTILIZATION_PPM: u64 = 1_000_000;

/// Run queue of the periodic class.
pub struct EdfClassRq {
    queued: Vec<Pid>,
    /// Σ utilization of admitted tasks, parts per million.
    total_utilization_ppm: u64,
}

impl EdfClassRq {
    pub const fn new() -> Self {
        EdfClassRq {
            queued: Vec::new(),
            total_utilization_ppm: 0,
        }
    }

    /// EDF admission test: accept the new utilization only if the sum
    /// stays schedulable.
    pub fn try_admit(&mut self, utilization_ppm: u64) -> bool {
        if self.total_utilization_ppm + utilization_ppm > FULL_UTILIZATION_PPM {
            return false;
        }
        self.total_utilization_ppm += utilization_ppm;
        true
    }

    /// Release an admitted task's utilization (exit or de-elevation).
    pub fn release_utilization(&mut self, utilization_ppm: u64) {
        self.total_utilization_ppm = self
            .total_utilization_ppm
            .saturating_sub(utilization_ppm);
    }

    pub fn total_utilization_ppm(&self) -> u64 {
        self.total_utilization_ppm
    }
}

impl SchedClassRq for EdfClassRq {
    fn enqueue(&mut self, pid: Pid, tasks: &mut BTreeMap<Pid, Task>) {
        if self.queued.contains(&pid) {
            return;
        }
        if tasks
            .get(&pid)
            .map(|t| t.se.is_periodic())
            .unwrap_or(false)
        {
            self.queued.push(pid);
        }
    }

    fn pick_next(&mut self, tasks: &mut BTreeMap<Pid, Task>, now: u64) -> Option<Pid> {
        let best = self
            .queued
            .iter()
            .filter_map(|pid| {
                let task = tasks.get(pid)?;
                let p = task.se.periodic?;
                Some(((p.deadline, *pid), *pid))
            })
            .min()
            .map(|(_, pid)| pid)?;
        self.remove(best);

        // Start the next instance if the current deadline already passed.
        if let Some(task) = tasks.get_mut(&best) {
            if let Some(p) = task.se.periodic.as_mut() {
                while p.deadline <= now {
                    p.deadline += p.period;
                }
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::task::PeriodicParams;

    fn periodic_task(pid: Pid, period: u64, wcet: u64, deadline: u64) -> Task {
        let mut t = Task::alloc(None, pid, 0, 0);
        t.se.periodic = Some(PeriodicParams {
            period,
            wcet,
            deadline,
        });
        t
    }

    #[test]
    fn admission_boundary_is_full_utilization() {
        let mut rq = EdfClassRq::new();
        // 0.5 + 0.3 + 0.2 = 1.0 exactly: all admitted.
        assert!(rq.try_admit(500_000));
        assert!(rq.try_admit(300_000));
        assert!(rq.try_admit(200_000));
        // Anything more is rejected.
        assert!(!rq.try_admit(1));
        rq.release_utilization(200_000);
        assert!(rq.try_admit(150_000));
    }

    #[test]
    fn earliest_deadline_first() {
        let mut tasks = BTreeMap::new();
        let mut rq = EdfClassRq::new();
        tasks.insert(1, periodic_task(1, 100, 10, 80));
        tasks.insert(2, periodic_task(2, 100, 10, 40));
        tasks.insert(3, periodic_task(3, 100, 10, 60));
        for pid in [1, 2, 3] {
            rq.enqueue(pid, &mut tasks);
        }
        assert_eq!(rq.pick_next(&mut tasks, 0), Some(2));
        assert_eq!(rq.pick_next(&mut tasks, 0), Some(3));
        assert_eq!(rq.pick_next(&mut tasks, 0), Some(1));
    }

    #[test]
    fn expired_deadline_rolls_to_next_period() {
        let mut tasks = BTreeMap::new();
        let mut rq = EdfClassRq::new();
        tasks.insert(7, periodic_task(7, 50, 5, 40));
        rq.enqueue(7, &mut tasks);
        assert_eq!(rq.pick_next(&mut tasks, 95), Some(7));
        let p = tasks.get(&7).unwrap().se.periodic.unwrap();
        assert_eq!(p.deadline, 140);
    }

    #[test]
    fn non_periodic_tasks_are_not_queued() {
        let mut tasks = BTreeMap::new();
        let mut rq = EdfClassRq::new();
        tasks.insert(4, Task::alloc(None, 4, 0, 0));
        rq.enqueue(4, &mut tasks);
        assert!(rq.is_empty());
    }
}
