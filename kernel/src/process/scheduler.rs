//! The scheduler.
//!
//! A pid-indexed task arena plus two class run queues (EDF for periodic
//! tasks, fair vruntime for the rest). Single CPU: tasks are preempted
//! only by the timer IRQ and at syscall boundaries.
//!
//! ## The run path
//!
//! `run()` is called on every preemption point with the interrupted
//! context in `frame`:
//!
//! 1. `store_context` snapshots `frame` into the outgoing task and its
//!    runtime is accounted into `vruntime`/`sum_exec_runtime`;
//! 2. deferred timer work is drained (alarm flags become queued SIGALRMs);
//! 3. the classes pick the next task, EDF before fair;
//! 4. `restore_context` delivers pending signals against the incoming
//!    task and, if it survives delivery, writes its snapshot into `frame`
//!    and reloads CR3 when the address space differs. A task killed by
//!    delivery becomes a zombie and the pick repeats.
//!
//! With no runnable task the scheduler falls back to the boot idle
//! context; with no tasks at all it panics, because a kernel with nothing
//! to run is broken.

use super::pid::{Pid, PidAllocator, INIT_PID};
use super::sched::fair::{self, FairClassRq};
use super::sched::periodic::EdfClassRq;
use super::sched::SchedClassRq;
use super::signal::{self, Delivery};
use super::task::{PeriodicParams, Task, TaskState};
use crate::arch::TrapFrame;
use crate::memory::PhysicalMemory;
use crate::sync::SpinLock;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use osmium_abi::{Errno, Signal};
use osmium_vmem::Pfn;

/// Result of a non-blocking scan for exited children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChildResult {
    Reaped { pid: Pid, status: i32 },
    NoChildren,
    StillRunning,
}

pub struct Scheduler {
    tasks: BTreeMap<Pid, Task>,
    current: Option<Pid>,
    fair: FairClassRq,
    periodic: EdfClassRq,
    pids: PidAllocator,

    /// Page directory currently loaded in CR3, as tracked by us.
    last_pgd: Option<Pfn>,
    /// CR3 reloads performed; global mappings make most switches cheap,
    /// so this is worth watching.
    pub cr3_loads: u64,
    /// Kernel-mode context to resume when nothing is runnable.
    idle_frame: Option<TrapFrame>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            tasks: BTreeMap::new(),
            current: None,
            fair: FairClassRq::new(),
            periodic: EdfClassRq::new(),
            pids: PidAllocator::new(),
            last_pgd: None,
            cr3_loads: 0,
            idle_frame: None,
        }
    }

    // ─── Arena access ────────────────────────────────────────────────────

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(&pid)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.and_then(|pid| self.tasks.get(&pid))
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        let pid = self.current?;
        self.tasks.get_mut(&pid)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn alloc_pid(&mut self) -> Option<Pid> {
        self.pids.alloc(&self.tasks)
    }

    /// Add a task to the arena without making it runnable.
    pub fn insert_task(&mut self, task: Task) {
        debug_assert!(!self.tasks.contains_key(&task.pid));
        self.tasks.insert(task.pid, task);
    }

    /// Make a task runnable and queue it in its class.
    pub fn enqueue_task(&mut self, pid: Pid) {
        let is_periodic = {
            let Some(task) = self.tasks.get_mut(&pid) else {
                return;
            };
            task.state = TaskState::Running;
            task.se.is_periodic()
        };
        if is_periodic {
            self.periodic.enqueue(pid, &mut self.tasks);
        } else {
            self.fair.enqueue(pid, &mut self.tasks);
        }
    }

    /// Wake a sleeping or stopped task.
    pub fn wake(&mut self, pid: Pid) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            if matches!(task.state, TaskState::Sleeping | TaskState::Stopped) {
                task.sleep_until = None;
                task.waiting_for_child = false;
                self.enqueue_task(pid);
            }
        }
    }

    /// Put the current task into interruptible sleep. It stops being
    /// picked until woken; the caller must re-enter the scheduler.
    pub fn sleep_current(&mut self, until: Option<u64>, waiting_for_child: bool) {
        if let Some(task) = self.current_task_mut() {
            task.state = TaskState::Sleeping;
            task.sleep_until = until;
            task.waiting_for_child = waiting_for_child;
        }
    }

    /// Install the kernel idle context used when no task is runnable.
    pub fn set_idle_context(&mut self, frame: TrapFrame) {
        self.idle_frame = Some(frame);
    }

    // ─── Periodic admission ──────────────────────────────────────────────

    /// Promote a task to the periodic (EDF) class.
    ///
    /// Admission requires the total utilization Σ WCET/period of admitted
    /// periodic tasks to stay ≤ 1; a non-schedulable request fails with
    /// `EAGAIN` and the task stays in the fair class.
    pub fn set_periodic(
        &mut self,
        pid: Pid,
        period: u64,
        wcet: u64,
        now: u64,
    ) -> Result<(), Errno> {
        if period == 0 || wcet == 0 || wcet > period {
            return Err(Errno::InvalidArgument);
        }
        let params = PeriodicParams {
            period,
            wcet,
            deadline: now + period,
        };
        if !self.periodic.try_admit(params.utilization_ppm()) {
            return Err(Errno::Again);
        }
        let Some(task) = self.tasks.get_mut(&pid) else {
            self.periodic.release_utilization(params.utilization_ppm());
            return Err(Errno::NoProcess);
        };
        task.se.periodic = Some(params);
        let runnable = task.is_runnable();
        // Migrate between class queues if it was waiting in fair.
        let was_queued = self.fair.remove(pid);
        if was_queued || (runnable && self.current != Some(pid)) {
            self.periodic.enqueue(pid, &mut self.tasks);
        }
        Ok(())
    }

    /// Total admitted periodic utilization, parts per million.
    pub fn periodic_utilization_ppm(&self) -> u64 {
        self.periodic.total_utilization_ppm()
    }

    // ─── Timer integration ───────────────────────────────────────────────

    /// Per-tick bookkeeping from the timer ISR. Allocation-free: expiring
    /// interval timers only mark `alarm_pending`, and sleepers whose
    /// deadline passed are made runnable.
    pub fn on_tick(&mut self, now: u64) {
        let mut to_wake: [Pid; 8] = [0; 8];
        let mut wake_count = 0;
        for (pid, task) in self.tasks.iter_mut() {
            if task.itimer.check_expired(now) {
                task.alarm_pending = true;
            }
            if task.state == TaskState::Sleeping {
                if let Some(until) = task.sleep_until {
                    if until <= now && wake_count < to_wake.len() {
                        to_wake[wake_count] = *pid;
                        wake_count += 1;
                    }
                }
            }
        }
        for &pid in &to_wake[..wake_count] {
            self.wake(pid);
        }
    }

    // ─── Context switching ───────────────────────────────────────────────

    /// Save the interrupted user context into the current task.
    pub fn store_context(&mut self, frame: &TrapFrame) {
        if let Some(task) = self.current_task_mut() {
            task.frame = *frame;
        }
    }

    /// Finish switching to `pid`: deliver pending signals, write its
    /// snapshot into `frame`, and reload CR3 iff the address space
    /// changed. Returns `false` when delivery killed or stopped the task
    /// and another pick is needed.
    pub fn restore_context(
        &mut self,
        pid: Pid,
        now: u64,
        frame: &mut TrapFrame,
        memory: &SpinLock<PhysicalMemory>,
    ) -> bool {
        let outcome = {
            let Some(task) = self.tasks.get_mut(&pid) else {
                return false;
            };
            signal::deliver_pending(task, memory)
        };

        match outcome {
            Delivery::Resume => {
                let task = self.tasks.get_mut(&pid).expect("picked task exists");
                task.se.exec_start = now;
                *frame = task.frame;
                let pgd = task.mm.as_ref().map(|mm| mm.pgd);
                self.current = Some(pid);
                self.switch_address_space(pgd);
                true
            }
            Delivery::Terminated(sig) => {
                self.exit_task(memory, pid, sig.as_u32() as i32);
                false
            }
            Delivery::Stopped => false,
        }
    }

    /// Switch CR3 to `pgd` unconditionally tracked; exec uses this right
    /// after installing a fresh image so the old directory can be freed.
    pub fn force_address_space(&mut self, pgd: Pfn) {
        self.switch_address_space(Some(pgd));
    }

    fn switch_address_space(&mut self, pgd: Option<Pfn>) {
        let Some(pgd) = pgd else {
            return;
        };
        if self.last_pgd != Some(pgd) {
            crate::arch::write_cr3(pgd.phys().as_u32());
            self.last_pgd = Some(pgd);
            self.cr3_loads += 1;
        }
    }

    /// The scheduler entry point; see the module docs.
    pub fn run(&mut self, now: u64, frame: &mut TrapFrame, memory: &SpinLock<PhysicalMemory>) {
        self.store_context(frame);

        if let Some(prev) = self.current.take() {
            let requeue = match self.tasks.get_mut(&prev) {
                Some(task) => {
                    let delta = now.saturating_sub(task.se.exec_start);
                    fair::account(task, delta);
                    task.se.exec_start = now;
                    task.is_runnable()
                }
                None => false,
            };
            if requeue {
                self.enqueue_task(prev);
            }
        }

        self.drain_deferred_alarms();

        loop {
            let next = self
                .periodic
                .pick_next(&mut self.tasks, now)
                .or_else(|| self.fair.pick_next(&mut self.tasks, now));

            let Some(pid) = next else {
                if self
                    .tasks
                    .values()
                    .all(|task| task.state == TaskState::Zombie)
                {
                    panic!("scheduler: no runnable task");
                }
                // Everyone is sleeping or stopped: resume the boot idle
                // context until an interrupt wakes someone.
                match self.idle_frame {
                    Some(idle) => *frame = idle,
                    None => panic!("scheduler: nothing runnable and no idle context"),
                }
                self.current = None;
                return;
            };

            if self.restore_context(pid, now, frame, memory) {
                return;
            }
        }
    }

    /// Convert deferred ISR work into queued signals. Runs with the
    /// scheduler lock held, where allocation is allowed.
    fn drain_deferred_alarms(&mut self) {
        let expired: Vec<Pid> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.alarm_pending)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in expired {
            if let Some(task) = self.tasks.get_mut(&pid) {
                task.alarm_pending = false;
            }
            let _ = signal::send_signal(self, pid, Signal::SIGALRM);
        }
    }

    // ─── Exit and reaping ────────────────────────────────────────────────

    /// Turn `pid` into a zombie: release its address space, close its
    /// files, reparent its children to init, record the status, and wake a
    /// parent blocked in `waitpid`.
    pub fn exit_task(&mut self, memory: &SpinLock<PhysicalMemory>, pid: Pid, status: i32) {
        if pid == INIT_PID {
            panic!("init exited with status {status}");
        }

        let (parent, children, mm, periodic) = {
            let Some(task) = self.tasks.get_mut(&pid) else {
                return;
            };
            task.state = TaskState::Zombie;
            task.exit_status = status;
            task.sig.flush_pending();
            task.fds.clear();
            (
                task.parent,
                core::mem::take(&mut task.children),
                task.mm.take(),
                task.se.periodic.take(),
            )
        };

        if let Some(mm) = mm {
            let mut mem = memory.lock();
            mm.release(&mut mem);
        }
        if let Some(p) = periodic {
            self.periodic.release_utilization(p.utilization_ppm());
        }
        self.fair.remove(pid);
        self.periodic.remove(pid);

        for child in children {
            if let Some(c) = self.tasks.get_mut(&child) {
                c.parent = INIT_PID;
            }
            if let Some(init) = self.tasks.get_mut(&INIT_PID) {
                init.children.push(child);
            }
        }

        if parent != 0 {
            let parent_waits = self
                .tasks
                .get(&parent)
                .map(|p| p.state == TaskState::Sleeping && p.waiting_for_child)
                .unwrap_or(false);
            let _ = signal::send_signal(self, parent, Signal::SIGCHLD);
            if parent_waits {
                self.wake(parent);
            }
        }

        if self.current == Some(pid) {
            self.current = None;
        }
        log::debug!("pid {} exited, status {:#x}", pid, status);
    }

    /// Non-blocking scan for an exited child of `parent`. `which`
    /// restricts the scan to one child pid.
    pub fn try_wait_child(&mut self, parent: Pid, which: Option<Pid>) -> WaitChildResult {
        let children: Vec<Pid> = match self.tasks.get(&parent) {
            Some(p) => p
                .children
                .iter()
                .copied()
                .filter(|c| which.map(|w| w == *c).unwrap_or(true))
                .collect(),
            None => return WaitChildResult::NoChildren,
        };
        if children.is_empty() {
            return WaitChildResult::NoChildren;
        }

        for child in children {
            let is_zombie = self
                .tasks
                .get(&child)
                .map(|c| c.state == TaskState::Zombie)
                .unwrap_or(false);
            if is_zombie {
                let status = self.tasks.get(&child).map(|c| c.exit_status).unwrap_or(0);
                // Reaping is a pure slot-state transition: drop the slot,
                // which releases the pid, and unlink from the parent.
                self.tasks.remove(&child);
                if let Some(p) = self.tasks.get_mut(&parent) {
                    p.children.retain(|&c| c != child);
                }
                return WaitChildResult::Reaped { pid: child, status };
            }
        }
        WaitChildResult::StillRunning
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
