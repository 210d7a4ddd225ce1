//! Osmium kernel library.
//!
//! An educational x86 (32-bit, protected mode) kernel built around three
//! subsystems:
//!
//! - demand-paged, copy-on-write virtual memory over the classic two-level
//!   page table ([`memory`]),
//! - process lifecycle: fork with CoW address-space cloning, exec with ELF
//!   and shebang loading, exit/wait ([`process`], [`syscall`]),
//! - a tick-driven scheduler (fair vruntime + EDF for periodic tasks) with
//!   signal delivery on the return-to-user path.
//!
//! The library compiles for the bare-metal target and, with the hosted arch
//! fallback, for the build host — which is how the test suite exercises the
//! paging, fork/exec and scheduling cores without a machine emulator.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod drivers;
pub mod klib;
pub mod memory;
pub mod panic;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod vfs;

#[cfg(test)]
pub(crate) mod selftest;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::boot::BootInfo;
use crate::memory::PhysicalMemory;
use crate::process::scheduler::Scheduler;
use crate::sync::SpinLock;
use crate::vfs::Vfs;
use spin::Once;

/// Every process-wide singleton the kernel owns, constructed once at boot.
///
/// ISRs and syscalls receive it through [`kernel()`]; tests build private
/// instances instead, so nothing in the core paths depends on the global.
pub struct Kernel {
    pub memory: SpinLock<PhysicalMemory>,
    pub sched: SpinLock<Scheduler>,
    pub vfs: Vfs,
    ticks: AtomicU64,
}

static KERNEL: Once<Kernel> = Once::new();

impl Kernel {
    /// Build the kernel context from the bootloader handoff.
    ///
    /// Order matters: physical memory first (paging init needs frames for
    /// the main page directory), then the scheduler, then the VFS mounts.
    pub fn new(info: &BootInfo) -> Self {
        let mut memory = PhysicalMemory::new(info);
        memory::paging::init(&mut memory, info);

        let scheduler = Scheduler::new();
        let vfs = Vfs::with_builtin_mounts();

        Kernel {
            memory: SpinLock::new(memory),
            sched: SpinLock::new(scheduler),
            vfs,
            ticks: AtomicU64::new(0),
        }
    }

    /// Current timer tick count.
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Advance the tick counter by one. Called from the timer ISR only.
    #[inline]
    pub fn bump_ticks(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run the scheduler against the interrupted context in `frame`.
    ///
    /// On return `frame` holds the context of the task to resume; signal
    /// delivery has already run against it.
    pub fn schedule(&self, frame: &mut arch::TrapFrame) {
        let mut sched = self.sched.lock();
        sched.run(self.ticks(), frame, &self.memory);
    }
}

/// Install the boot-time kernel context. Called once from the entry path.
pub fn init_kernel(info: &BootInfo) -> &'static Kernel {
    KERNEL.call_once(|| Kernel::new(info))
}

/// The kernel context. Panics before [`init_kernel`].
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel context not initialized")
}
