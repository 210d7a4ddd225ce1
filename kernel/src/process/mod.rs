//! Process management: tasks, pids, scheduling, signals, timers, ELF
//! loading.

pub mod elf;
pub mod pid;
pub mod sched;
pub mod scheduler;
pub mod signal;
pub mod task;
pub mod timer;

pub use pid::{Pid, PidAllocator, INIT_PID};
pub use task::{Credentials, SchedEntity, Task, TaskState, Termios};

#[cfg(test)]
mod scheduler_test;
#[cfg(test)]
mod signal_test;
