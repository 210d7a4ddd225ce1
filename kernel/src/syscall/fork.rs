//! `fork()`: duplicate the current process with a CoW address space.

use super::dispatcher::HandlerResult;
use crate::arch::{TrapFrame, EFLAGS_IF};
use crate::process::Task;
use crate::Kernel;
use osmium_abi::Errno;

/// SYS_FORK (2).
///
/// The parent's trap frame is snapshotted first so parent and child carry
/// identical user-visible register state; only EAX differs afterwards
/// (child 0, parent the child's pid). The child's address space is a CoW
/// clone of the parent's. Both tasks re-enter the scheduler.
pub fn sys_fork(kernel: &Kernel, frame: &mut TrapFrame) -> HandlerResult {
    let now = kernel.ticks();
    let result: Result<u32, Errno> = (|| {
        let mut sched = kernel.sched.lock();
        let parent_pid = sched.current_pid().ok_or(Errno::NoProcess)?;

        // Snapshot the parent registers as they are at this syscall.
        sched.store_context(frame);

        let child_pid = sched.alloc_pid().ok_or(Errno::Again)?;

        let (child_frame, child_mm) = {
            let parent = sched.task_mut(parent_pid).ok_or(Errno::NoProcess)?;
            let mut child_frame = parent.frame;
            child_frame.eax = 0;
            child_frame.eflags |= EFLAGS_IF;

            let parent_mm = parent.mm.as_ref().ok_or(Errno::NoProcess)?;
            let mut mem = kernel.memory.lock();
            let child_mm = parent_mm
                .clone_cow(&mut mem)
                .map_err(|_| Errno::OutOfMemory)?;
            (child_frame, child_mm)
        };

        let mut child = {
            let parent = sched.task(parent_pid).expect("parent exists");
            Task::alloc(Some(parent), child_pid, parent_pid, now)
        };
        child.frame = child_frame;
        child.mm = Some(child_mm);
        // Blocked mask and handler table are inherited; pending signals
        // are not.
        {
            let parent = sched.task(parent_pid).expect("parent exists");
            child.sig.blocked = parent.sig.blocked;
            for signum in 1..=osmium_abi::limits::NSIG as u32 {
                if let Some(sig) = osmium_abi::Signal::from_u32(signum) {
                    let action = parent.sig.action(sig);
                    let _ = child.sig.set_action(sig, action);
                }
            }
        }

        sched.insert_task(child);
        if let Some(parent) = sched.task_mut(parent_pid) {
            parent.children.push(child_pid);
        }
        sched.enqueue_task(child_pid);

        log::debug!("fork: {} -> {}", parent_pid, child_pid);
        Ok(child_pid)
    })();

    match result {
        Ok(child_pid) => {
            // Parent returns the child's pid; then both re-enter the
            // scheduler, which may pick either first.
            frame.eax = child_pid;
            kernel.schedule(frame);
            None
        }
        Err(errno) => Some(Err(errno)),
    }
}
