//! Syscall dispatch.

use crate::arch::TrapFrame;
use crate::Kernel;
use osmium_abi::{Errno, Sysno};

/// Outcome of one handler: `Some` is a plain value/errno for EAX, `None`
/// means the handler rewrote the frame itself (fork, exec, exit,
/// sigreturn, and every blocking path).
pub type HandlerResult = Option<Result<u32, Errno>>;

/// Decode and run one syscall against the interrupted context.
///
/// Returning with a deliverable signal pending on the current task is a
/// preemption point: the scheduler runs so delivery happens before user
/// code continues.
pub fn dispatch(kernel: &Kernel, frame: &mut TrapFrame) {
    let number = frame.eax;
    let (a1, a2, a3, a4, a5, a6) = (
        frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi, frame.ebp,
    );

    let result: HandlerResult = match Sysno::try_from(number) {
        Err(_) => {
            log::debug!("unknown syscall {}", number);
            Some(Err(Errno::NotImplemented))
        }
        Ok(nr) => match nr {
            Sysno::Exit => super::process::sys_exit(kernel, frame, a1 as i32),
            Sysno::Fork => super::fork::sys_fork(kernel, frame),
            Sysno::Read => super::io::sys_read(kernel, a1, a2, a3),
            Sysno::Write => super::io::sys_write(kernel, a1, a2, a3),
            Sysno::Open => super::io::sys_open(kernel, a1, a2, a3),
            Sysno::Close => super::io::sys_close(kernel, a1),
            Sysno::Waitpid => super::wait::sys_waitpid(kernel, frame, a1 as i32, a2, a3),
            Sysno::Execve => super::exec::sys_execve(kernel, frame, a1, a2, a3),
            Sysno::Chdir => super::process::sys_chdir(kernel, a1),
            Sysno::Getpid => super::process::sys_getpid(kernel),
            Sysno::Getppid => super::process::sys_getppid(kernel),
            Sysno::Alarm => super::process::sys_alarm(kernel, a1),
            Sysno::Kill => super::signal::sys_kill(kernel, a1 as i32, a2),
            Sysno::Brk => super::mmap::sys_brk(kernel, a1),
            Sysno::Sigaction => super::signal::sys_sigaction(kernel, a1, a2, a3),
            Sysno::Sigreturn => super::signal::sys_sigreturn(kernel, frame),
            Sysno::Sigprocmask => super::signal::sys_sigprocmask(kernel, a1, a2, a3),
            Sysno::Sleep => super::process::sys_sleep(kernel, frame, a1),
            Sysno::Getcwd => super::process::sys_getcwd(kernel, a1, a2),
            Sysno::Mmap => super::mmap::sys_mmap(kernel, a1, a2, a3, a4, a5, a6),
            Sysno::Munmap => super::mmap::sys_munmap(kernel, a1, a2),
            Sysno::Setitimer => super::process::sys_setitimer(kernel, a1, a2, a3),
            Sysno::Getitimer => super::process::sys_getitimer(kernel, a1, a2),
        },
    };

    if let Some(value) = result {
        frame.eax = match value {
            Ok(v) => v,
            Err(errno) => {
                log::trace!("syscall {} -> {}", number, errno.name());
                errno.to_raw()
            }
        };
    }

    // Preemption point: a syscall that produced a pending signal for the
    // current task re-enters the scheduler so delivery happens now.
    let pending = {
        let sched = kernel.sched.lock();
        sched
            .current_task()
            .map(|task| task.sig.has_deliverable())
            .unwrap_or(false)
    };
    if pending {
        kernel.schedule(frame);
    }
}
