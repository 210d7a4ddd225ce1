//! Signal syscalls: kill, sigaction, sigprocmask, sigreturn.

use super::dispatcher::HandlerResult;
use crate::arch::TrapFrame;
use crate::memory::userslice::{copy_from_user, copy_to_user};
use crate::process::signal::{self, SigAction, SigSet};
use crate::Kernel;
use osmium_abi::{Errno, Signal, SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK};
use osmium_vmem::VirtAddr;

/// Userspace representation of a sigaction: handler address (0 = SIG_DFL,
/// 1 = SIG_IGN), mask, and SA_* flags.
const SIG_DFL: u32 = 0;
const SIG_IGN: u32 = 1;

/// SYS_KILL (37): queue a signal on a process.
///
/// `sig` 0 probes for existence only. Unprivileged senders may only
/// signal processes running with their own (real or effective) uid.
pub fn sys_kill(kernel: &Kernel, pid: i32, sig: u32) -> HandlerResult {
    Some(do_kill(kernel, pid, sig))
}

fn do_kill(kernel: &Kernel, pid: i32, sig: u32) -> Result<u32, Errno> {
    if pid <= 0 {
        // Process groups are out of scope here.
        return Err(Errno::NotImplemented);
    }
    let target = pid as u32;

    let mut sched = kernel.sched.lock();
    let sender = sched.current_task().ok_or(Errno::NoProcess)?;
    let sender_creds = sender.creds;
    let target_task = sched.task(target).ok_or(Errno::NoProcess)?;
    let allowed = sender_creds.uid == 0
        || sender_creds.uid == target_task.creds.uid
        || sender_creds.ruid == target_task.creds.ruid;
    if !allowed {
        return Err(Errno::PermissionDenied);
    }

    if sig == 0 {
        return Ok(0);
    }
    let signal = Signal::from_u32(sig).ok_or(Errno::InvalidArgument)?;
    signal::send_signal(&mut sched, target, signal)?;
    Ok(0)
}

/// SYS_SIGACTION (67): install or query a signal disposition.
pub fn sys_sigaction(kernel: &Kernel, sig: u32, act_ptr: u32, old_ptr: u32) -> HandlerResult {
    Some(do_sigaction(kernel, sig, act_ptr, old_ptr))
}

fn do_sigaction(kernel: &Kernel, sig: u32, act_ptr: u32, old_ptr: u32) -> Result<u32, Errno> {
    let signal = Signal::from_u32(sig).ok_or(Errno::InvalidArgument)?;

    let (pid, pgd) = current_pgd(kernel)?;

    let new_action = if act_ptr != 0 {
        let mut raw = [0u8; 12];
        {
            let mut mem = kernel.memory.lock();
            copy_from_user(&mut mem, pgd, VirtAddr::new(act_ptr), &mut raw)?;
        }
        let handler = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let mask = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let flags = u32::from_le_bytes(raw[8..12].try_into().unwrap());
        Some(match handler {
            SIG_DFL => SigAction::Default,
            SIG_IGN => SigAction::Ignore,
            addr => SigAction::Handler {
                handler: addr,
                mask,
                flags,
            },
        })
    } else {
        None
    };

    let old = {
        let mut sched = kernel.sched.lock();
        let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
        match new_action {
            Some(action) => task.sig.set_action(signal, action)?,
            None => task.sig.action(signal),
        }
    };

    if old_ptr != 0 {
        let (handler, mask, flags) = match old {
            SigAction::Default => (SIG_DFL, 0, 0),
            SigAction::Ignore => (SIG_IGN, 0, 0),
            SigAction::Handler {
                handler,
                mask,
                flags,
            } => (handler, mask, flags),
        };
        let mut raw = [0u8; 12];
        raw[0..4].copy_from_slice(&handler.to_le_bytes());
        raw[4..8].copy_from_slice(&mask.to_le_bytes());
        raw[8..12].copy_from_slice(&flags.to_le_bytes());
        let mut mem = kernel.memory.lock();
        copy_to_user(&mut mem, pgd, VirtAddr::new(old_ptr), &raw)?;
    }
    Ok(0)
}

/// SYS_SIGPROCMASK (126): adjust the blocked-signal mask.
pub fn sys_sigprocmask(kernel: &Kernel, how: u32, set_ptr: u32, old_ptr: u32) -> HandlerResult {
    Some(do_sigprocmask(kernel, how, set_ptr, old_ptr))
}

fn do_sigprocmask(kernel: &Kernel, how: u32, set_ptr: u32, old_ptr: u32) -> Result<u32, Errno> {
    let (pid, pgd) = current_pgd(kernel)?;

    let old_bits = {
        let sched = kernel.sched.lock();
        sched
            .task(pid)
            .ok_or(Errno::NoProcess)?
            .sig
            .blocked
            .bits()
    };

    if set_ptr != 0 {
        let mut raw = [0u8; 4];
        {
            let mut mem = kernel.memory.lock();
            copy_from_user(&mut mem, pgd, VirtAddr::new(set_ptr), &mut raw)?;
        }
        let set = u32::from_le_bytes(raw);
        let new_bits = match how {
            SIG_BLOCK => old_bits | set,
            SIG_UNBLOCK => old_bits & !set,
            SIG_SETMASK => set,
            _ => return Err(Errno::InvalidArgument),
        };
        let mut blocked = SigSet::from_bits(new_bits);
        // SIGKILL and SIGSTOP can never be masked.
        blocked.remove(Signal::SIGKILL);
        blocked.remove(Signal::SIGSTOP);

        let mut sched = kernel.sched.lock();
        let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
        task.sig.blocked = blocked;
    }

    if old_ptr != 0 {
        let mut mem = kernel.memory.lock();
        copy_to_user(&mut mem, pgd, VirtAddr::new(old_ptr), &old_bits.to_le_bytes())?;
    }
    Ok(0)
}

/// SYS_SIGRETURN (119): unwind a signal-handler frame.
///
/// The trampoline page issues this once the handler returns; ESP then
/// points at the signal number pushed by delivery. The saved mask and
/// trap frame are restored, with the segment selectors and EFLAGS
/// sanitized so a corrupted frame cannot re-enter ring 0.
pub fn sys_sigreturn(kernel: &Kernel, frame: &mut TrapFrame) -> HandlerResult {
    match do_sigreturn(kernel, frame) {
        Ok(()) => None,
        Err(errno) => Some(Err(errno)),
    }
}

fn do_sigreturn(kernel: &Kernel, frame: &mut TrapFrame) -> Result<(), Errno> {
    use crate::arch::{EFLAGS_BASE, EFLAGS_IF, USER_CS, USER_DS};

    let (pid, pgd) = current_pgd(kernel)?;
    let sp = frame.useresp;

    let (mask, mut restored) = {
        let mut mem = kernel.memory.lock();
        let mut mask_raw = [0u8; 4];
        copy_from_user(&mut mem, pgd, VirtAddr::new(sp + 4), &mut mask_raw)?;

        let mut frame_raw = [0u8; core::mem::size_of::<TrapFrame>()];
        copy_from_user(&mut mem, pgd, VirtAddr::new(sp + 8), &mut frame_raw)?;
        // SAFETY: TrapFrame is repr(C) plain data; the buffer is exactly
        // its size.
        let restored =
            unsafe { core::ptr::read_unaligned(frame_raw.as_ptr() as *const TrapFrame) };
        (u32::from_le_bytes(mask_raw), restored)
    };

    restored.cs = USER_CS;
    restored.ss = USER_DS;
    restored.ds = USER_DS;
    restored.es = USER_DS;
    restored.fs = USER_DS;
    restored.gs = USER_DS;
    restored.eflags = (restored.eflags & 0xFFF) | EFLAGS_BASE | EFLAGS_IF;

    {
        let mut sched = kernel.sched.lock();
        let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
        let mut blocked = SigSet::from_bits(mask);
        blocked.remove(Signal::SIGKILL);
        blocked.remove(Signal::SIGSTOP);
        task.sig.blocked = blocked;
        task.frame = restored;
    }
    *frame = restored;
    Ok(())
}

fn current_pgd(kernel: &Kernel) -> Result<(u32, osmium_vmem::Pfn), Errno> {
    let sched = kernel.sched.lock();
    let task = sched.current_task().ok_or(Errno::NoProcess)?;
    let mm = task.mm.as_ref().ok_or(Errno::NoProcess)?;
    Ok((task.pid, mm.pgd))
}
