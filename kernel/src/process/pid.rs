//! Process-id allocation.

use super::task::Task;
use alloc::collections::BTreeMap;

/// POSIX process ID.
pub type Pid = u32;

/// The init task's pid. Init is the root of the process tree and cannot be
/// reaped.
pub const INIT_PID: Pid = 1;

/// Largest pid handed out before wrapping back to 1.
pub const PID_MAX: Pid = 32768;

/// Lowest-free pid allocator.
///
/// Pids are never reported free while a task slot (including a zombie)
/// still holds them; reaping the zombie releases the pid.
pub struct PidAllocator {
    last: Pid,
}

impl PidAllocator {
    pub const fn new() -> Self {
        PidAllocator { last: 0 }
    }

    /// Allocate the lowest free pid, wrapping at [`PID_MAX`]. Returns
    /// `None` when every pid is in use.
    pub fn alloc(&mut self, tasks: &BTreeMap<Pid, Task>) -> Option<Pid> {
        for offset in 0..PID_MAX {
            let candidate = (self.last + offset) % PID_MAX + 1;
            if !tasks.contains_key(&candidate) {
                self.last = candidate;
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::task::Task;

    fn table_with(pids: &[Pid]) -> BTreeMap<Pid, Task> {
        let mut tasks = BTreeMap::new();
        for &pid in pids {
            tasks.insert(pid, Task::alloc(None, pid, 0, 0));
        }
        tasks
    }

    #[test]
    fn never_returns_an_in_use_pid() {
        let mut alloc = PidAllocator::new();
        let mut tasks = BTreeMap::new();
        for _ in 0..64 {
            let pid = alloc.alloc(&tasks).unwrap();
            assert!(!tasks.contains_key(&pid));
            tasks.insert(pid, Task::alloc(None, pid, 0, 0));
        }
        assert_eq!(tasks.len(), 64);
    }

    #[test]
    fn wraps_and_reuses_released_pids() {
        let mut alloc = PidAllocator::new();
        let tasks = table_with(&[1, 2, 4]);
        assert_eq!(alloc.alloc(&tasks), Some(3));
        // 3 was not inserted, so the allocator moves on from its cursor.
        assert_eq!(alloc.alloc(&tasks), Some(5));
    }
}
