//! `waitpid()` and child reaping.
//!
//! Blocking works by syscall restart: when no child has exited yet and
//! `WNOHANG` is absent, the task goes into interruptible sleep with EIP
//! rewound over the `int 0x80` (two bytes), so the wakeup re-executes the
//! syscall and rescans. `exit_task` wakes a parent sleeping in wait, and
//! a delivered signal interrupts the wait with `EINTR` on the rescan.
//!
//! Status encoding is the classic one: normal exit `code << 8`
//! (`WIFEXITED`), death by signal the bare signal number
//! (`WIFSIGNALED`/`WTERMSIG`).

use super::dispatcher::HandlerResult;
use crate::arch::TrapFrame;
use crate::memory::userslice::copy_to_user;
use crate::process::scheduler::WaitChildResult;
use crate::Kernel;
use osmium_abi::{Errno, WNOHANG};
use osmium_vmem::VirtAddr;

/// SYS_WAITPID (7).
///
/// `pid > 0` waits for that child, `pid == -1` for any child; other
/// selectors (process groups) are not supported.
pub fn sys_waitpid(
    kernel: &Kernel,
    frame: &mut TrapFrame,
    pid: i32,
    status_ptr: u32,
    options: u32,
) -> HandlerResult {
    let which = match pid {
        -1 => None,
        p if p > 0 => Some(p as u32),
        _ => return Some(Err(Errno::InvalidArgument)),
    };

    let mut sched = kernel.sched.lock();
    let Some(current) = sched.current_pid() else {
        return Some(Err(Errno::NoProcess));
    };

    match sched.try_wait_child(current, which) {
        WaitChildResult::Reaped { pid, status } => {
            if status_ptr != 0 {
                let pgd = match sched.task(current).and_then(|t| t.mm.as_ref()) {
                    Some(mm) => mm.pgd,
                    None => return Some(Err(Errno::Fault)),
                };
                let mut mem = kernel.memory.lock();
                if let Err(e) =
                    copy_to_user(&mut mem, pgd, VirtAddr::new(status_ptr), &status.to_le_bytes())
                {
                    return Some(Err(e));
                }
            }
            Some(Ok(pid))
        }
        WaitChildResult::NoChildren => Some(Err(Errno::NoChildren)),
        WaitChildResult::StillRunning => {
            if options & WNOHANG != 0 {
                return Some(Ok(0));
            }
            // A pending signal interrupts the wait instead of blocking
            // again.
            let has_signal = sched
                .task(current)
                .map(|t| t.sig.has_deliverable())
                .unwrap_or(false);
            if has_signal {
                return Some(Err(Errno::Interrupted));
            }

            // Block: rewind EIP over `int 0x80` so the wakeup re-executes
            // the syscall, then yield.
            frame.eip -= 2;
            sched.store_context(frame);
            sched.sleep_current(None, true);
            drop(sched);
            kernel.schedule(frame);
            None
        }
    }
}
