//! The process control block.

use super::pid::Pid;
use super::signal::SignalState;
use super::timer::IntervalTimer;
use crate::arch::TrapFrame;
use crate::klib::RingBuffer;
use crate::memory::MemoryDescriptor;
use crate::vfs::FdTable;
use alloc::string::String;
use alloc::vec::Vec;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable (or running right now).
    Running,
    /// Interruptible sleep: waiting for a child, a timeout, or input.
    Sleeping,
    /// Stopped by SIGSTOP/SIGTSTP until SIGCONT.
    Stopped,
    /// Exited; holds only the exit status until the parent reaps it.
    Zombie,
}

/// User and group credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Real user id.
    pub ruid: u32,
    /// Real group id.
    pub rgid: u32,
    /// Session id.
    pub sid: u32,
    /// Process group id.
    pub pgid: u32,
}

impl Credentials {
    pub const fn root() -> Self {
        Credentials {
            uid: 0,
            gid: 0,
            ruid: 0,
            rgid: 0,
            sid: 0,
            pgid: 0,
        }
    }
}

/// Parameters of an admitted periodic (EDF) task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicParams {
    /// Activation period in ticks.
    pub period: u64,
    /// Worst-case execution time in ticks.
    pub wcet: u64,
    /// Absolute deadline of the current instance.
    pub deadline: u64,
}

impl PeriodicParams {
    /// Utilization in parts per million, the unit the EDF admission test
    /// sums in.
    pub fn utilization_ppm(&self) -> u64 {
        self.wcet * 1_000_000 / self.period
    }
}

/// Scheduling entity embedded in every task.
#[derive(Debug, Clone, Copy)]
pub struct SchedEntity {
    /// Niceness, -20 (greedy) to 19 (generous).
    pub nice: i8,
    /// Weighted virtual runtime; the fair picker minimizes this.
    pub vruntime: u64,
    /// Tick at which the task became runnable for the first time.
    pub arrivaltime: u64,
    /// Tick of the last dispatch.
    pub exec_start: u64,
    /// Total ticks of CPU time consumed.
    pub sum_exec_runtime: u64,
    /// EDF parameters when the task is periodic.
    pub periodic: Option<PeriodicParams>,
}

impl SchedEntity {
    pub fn new(now: u64) -> Self {
        SchedEntity {
            nice: 0,
            vruntime: 0,
            arrivaltime: now,
            exec_start: now,
            sum_exec_runtime: 0,
            periodic: None,
        }
    }

    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.periodic.is_some()
    }
}

/// Terminal settings; only the local-mode flags matter to this kernel.
#[derive(Debug, Clone, Copy)]
pub struct Termios {
    pub lflag: u32,
}

impl Termios {
    pub const ICANON: u32 = 1 << 1;
    pub const ECHO: u32 = 1 << 3;
    pub const ECHOE: u32 = 1 << 4;
    pub const ECHOK: u32 = 1 << 5;
    pub const ECHONL: u32 = 1 << 6;
    pub const ISIG: u32 = 1 << 0;
}

impl Default for Termios {
    fn default() -> Self {
        Termios {
            lflag: Termios::ICANON
                | Termios::ECHO
                | Termios::ECHOE
                | Termios::ECHOK
                | Termios::ECHONL
                | Termios::ISIG,
        }
    }
}

/// A process control block.
///
/// Tasks live in the scheduler's pid-indexed arena; parent/child links are
/// pids, never references, so tree edits and zombie reaping are plain slot
/// updates.
pub struct Task {
    pub pid: Pid,
    /// Parent pid; 0 only for init.
    pub parent: Pid,
    pub children: Vec<Pid>,
    pub name: String,

    pub state: TaskState,
    /// User-mode register snapshot, saved on kernel entry.
    pub frame: TrapFrame,
    /// Address space; `None` only for zombies and half-built tasks.
    pub mm: Option<MemoryDescriptor>,

    pub creds: Credentials,
    pub se: SchedEntity,
    pub cwd: String,
    pub fds: FdTable,
    pub sig: SignalState,
    pub itimer: IntervalTimer,

    /// Deferred SIGALRM marker set by the timer tick; converted into a
    /// queued signal by the scheduler on the next pass.
    pub alarm_pending: bool,
    /// Wake-up tick for a sleeping task, if it sleeps on time.
    pub sleep_until: Option<u64>,
    /// Whether the task sleeps in `waitpid`.
    pub waiting_for_child: bool,

    pub termios: Termios,
    pub keyboard: RingBuffer<256>,

    /// Encoded exit status once the task is a zombie.
    pub exit_status: i32,
}

impl Task {
    /// Allocate a fresh task.
    ///
    /// With a `source` task the file-descriptor table, working directory
    /// and credentials are duplicated from it; otherwise they are
    /// initialized empty/root. Signal dispositions always start at their
    /// defaults with nothing pending.
    pub fn alloc(source: Option<&Task>, pid: Pid, parent: Pid, now: u64) -> Task {
        let (fds, cwd, creds, name, termios) = match source {
            Some(src) => (
                src.fds.clone(),
                src.cwd.clone(),
                src.creds,
                src.name.clone(),
                src.termios,
            ),
            None => (
                FdTable::new(),
                String::from("/"),
                Credentials::root(),
                String::new(),
                Termios::default(),
            ),
        };

        Task {
            pid,
            parent,
            children: Vec::new(),
            name,
            state: TaskState::Running,
            frame: TrapFrame::new_user(),
            mm: None,
            creds,
            se: SchedEntity::new(now),
            cwd,
            fds,
            sig: SignalState::new(),
            itimer: IntervalTimer::new(),
            alarm_pending: false,
            sleep_until: None,
            waiting_for_child: false,
            termios,
            keyboard: RingBuffer::new(),
            exit_status: 0,
        }
    }

    /// Runnable right now.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Running
    }
}
