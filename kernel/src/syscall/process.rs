//! Process-state syscalls: exit, identity, cwd, sleep, timers.

use super::dispatcher::HandlerResult;
use crate::arch::TrapFrame;
use crate::drivers::timer::TICK_HZ;
use crate::memory::userslice::{copy_from_user, copy_to_user, read_user_cstr};
use crate::vfs::absolute_path;
use crate::Kernel;
use alloc::string::String;
use osmium_abi::limits::PATH_MAX;
use osmium_abi::{w_exitcode, Errno};
use osmium_vmem::VirtAddr;

/// SYS_EXIT (1): terminate the current task.
pub fn sys_exit(kernel: &Kernel, frame: &mut TrapFrame, code: i32) -> HandlerResult {
    {
        let mut sched = kernel.sched.lock();
        let Some(pid) = sched.current_pid() else {
            return Some(Err(Errno::NoProcess));
        };
        sched.exit_task(&kernel.memory, pid, w_exitcode(code & 0xFF));
    }
    kernel.schedule(frame);
    None
}

/// SYS_GETPID (20).
pub fn sys_getpid(kernel: &Kernel) -> HandlerResult {
    let sched = kernel.sched.lock();
    Some(sched.current_pid().ok_or(Errno::NoProcess))
}

/// SYS_GETPPID (64).
pub fn sys_getppid(kernel: &Kernel) -> HandlerResult {
    let sched = kernel.sched.lock();
    Some(
        sched
            .current_task()
            .map(|task| task.parent)
            .ok_or(Errno::NoProcess),
    )
}

/// SYS_GETCWD (183): copy the working directory into a user buffer.
pub fn sys_getcwd(kernel: &Kernel, buf: u32, size: u32) -> HandlerResult {
    let (pgd, cwd) = {
        let sched = kernel.sched.lock();
        let Some(task) = sched.current_task() else {
            return Some(Err(Errno::NoProcess));
        };
        let Some(mm) = task.mm.as_ref() else {
            return Some(Err(Errno::NoProcess));
        };
        (mm.pgd, task.cwd.clone())
    };

    let bytes = cwd.as_bytes();
    if (size as usize) < bytes.len() + 1 {
        return Some(Err(Errno::InvalidArgument));
    }
    let mut mem = kernel.memory.lock();
    if let Err(e) = copy_to_user(&mut mem, pgd, VirtAddr::new(buf), bytes) {
        return Some(Err(e));
    }
    if let Err(e) = copy_to_user(
        &mut mem,
        pgd,
        VirtAddr::new(buf + bytes.len() as u32),
        &[0u8],
    ) {
        return Some(Err(e));
    }
    Some(Ok(buf))
}

/// SYS_CHDIR (12).
pub fn sys_chdir(kernel: &Kernel, path_ptr: u32) -> HandlerResult {
    Some(do_chdir(kernel, path_ptr))
}

fn do_chdir(kernel: &Kernel, path_ptr: u32) -> Result<u32, Errno> {
    let (pid, pgd, cwd) = {
        let sched = kernel.sched.lock();
        let task = sched.current_task().ok_or(Errno::NoProcess)?;
        let mm = task.mm.as_ref().ok_or(Errno::NoProcess)?;
        (task.pid, mm.pgd, task.cwd.clone())
    };

    let raw = {
        let mut mem = kernel.memory.lock();
        read_user_cstr(&mut mem, pgd, VirtAddr::new(path_ptr), PATH_MAX)?
    };
    let path = String::from_utf8(raw).map_err(|_| Errno::InvalidArgument)?;
    let absolute = absolute_path(&cwd, &path);

    let stat = kernel.vfs.stat(&absolute)?;
    if !stat.is_dir() {
        return Err(Errno::NotADirectory);
    }

    let mut sched = kernel.sched.lock();
    let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
    task.cwd = absolute;
    Ok(0)
}

/// SYS_SLEEP (162): sleep for a number of ticks.
pub fn sys_sleep(kernel: &Kernel, frame: &mut TrapFrame, ticks: u32) -> HandlerResult {
    if ticks == 0 {
        return Some(Ok(0));
    }
    let until = kernel.ticks() + ticks as u64;
    {
        let mut sched = kernel.sched.lock();
        // The return value is written now; the task resumes with it once
        // the timer wakes it.
        frame.eax = 0;
        sched.store_context(frame);
        sched.sleep_current(Some(until), false);
    }
    kernel.schedule(frame);
    None
}

/// SYS_ALARM (27): one-shot SIGALRM after `seconds`, returning the
/// seconds that were left on a previous alarm.
pub fn sys_alarm(kernel: &Kernel, seconds: u32) -> HandlerResult {
    let now = kernel.ticks();
    let mut sched = kernel.sched.lock();
    let Some(task) = sched.current_task_mut() else {
        return Some(Err(Errno::NoProcess));
    };
    let remaining = task.itimer.arm(now, seconds as u64 * TICK_HZ, 0);
    Some(Ok(((remaining + TICK_HZ - 1) / TICK_HZ) as u32))
}

/// SYS_SETITIMER (104): arm the real interval timer.
///
/// The user structure is two little-endian u32 tick counts:
/// `{ interval, value }`. The old settings land in `old_ptr` when given.
pub fn sys_setitimer(kernel: &Kernel, which: u32, new_ptr: u32, old_ptr: u32) -> HandlerResult {
    Some(do_setitimer(kernel, which, new_ptr, old_ptr))
}

fn do_setitimer(kernel: &Kernel, which: u32, new_ptr: u32, old_ptr: u32) -> Result<u32, Errno> {
    // Only ITIMER_REAL exists.
    if which != 0 {
        return Err(Errno::InvalidArgument);
    }
    let now = kernel.ticks();
    let (pid, pgd) = current_pgd(kernel)?;

    let mut raw = [0u8; 8];
    {
        let mut mem = kernel.memory.lock();
        copy_from_user(&mut mem, pgd, VirtAddr::new(new_ptr), &mut raw)?;
    }
    let interval = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as u64;
    let value = u32::from_le_bytes(raw[4..8].try_into().unwrap()) as u64;

    let (old_interval, old_remaining) = {
        let mut sched = kernel.sched.lock();
        let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
        let old_interval = task.itimer.interval;
        let old_remaining = task.itimer.arm(now, value, interval);
        (old_interval, old_remaining)
    };

    if old_ptr != 0 {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&(old_interval as u32).to_le_bytes());
        out[4..8].copy_from_slice(&(old_remaining as u32).to_le_bytes());
        let mut mem = kernel.memory.lock();
        copy_to_user(&mut mem, pgd, VirtAddr::new(old_ptr), &out)?;
    }
    Ok(0)
}

/// SYS_GETITIMER (105).
pub fn sys_getitimer(kernel: &Kernel, which: u32, out_ptr: u32) -> HandlerResult {
    Some(do_getitimer(kernel, which, out_ptr))
}

fn do_getitimer(kernel: &Kernel, which: u32, out_ptr: u32) -> Result<u32, Errno> {
    if which != 0 {
        return Err(Errno::InvalidArgument);
    }
    let now = kernel.ticks();
    let (pid, pgd) = current_pgd(kernel)?;

    let (interval, remaining) = {
        let sched = kernel.sched.lock();
        let task = sched.task(pid).ok_or(Errno::NoProcess)?;
        (task.itimer.interval, task.itimer.remaining(now))
    };

    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(interval as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(remaining as u32).to_le_bytes());
    let mut mem = kernel.memory.lock();
    copy_to_user(&mut mem, pgd, VirtAddr::new(out_ptr), &out)?;
    Ok(0)
}

fn current_pgd(kernel: &Kernel) -> Result<(u32, osmium_vmem::Pfn), Errno> {
    let sched = kernel.sched.lock();
    let task = sched.current_task().ok_or(Errno::NoProcess)?;
    let mm = task.mm.as_ref().ok_or(Errno::NoProcess)?;
    Ok((task.pid, mm.pgd))
}
