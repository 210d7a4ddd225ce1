//! Signal delivery end to end: handlers on the user stack, sigreturn,
//! default dispositions, stop/continue, and the SIGSEGV path out of the
//! page-fault handler.

use crate::arch::{PF_ERR_USER, PF_ERR_WRITE};
use crate::memory::paging::{page_fault_handler, FaultOutcome};
use crate::memory::SIGRET_TRAMPOLINE;
use crate::process::TaskState;
use crate::selftest::{boot_with_init, peek_user, peek_user_u32, poke_user, scratch_base, syscall};
use osmium_abi::{wifsignaled, wtermsig, Signal, Sysno, SIG_SETMASK, WNOHANG};

const HANDLER_ADDR: u32 = 0x0804_9000;

/// Stage a `{handler, mask, flags}` sigaction struct in user scratch.
fn stage_sigaction(kernel: &crate::Kernel, at: u32, handler: u32, mask: u32, flags: u32) -> u32 {
    let mut raw = [0u8; 12];
    raw[0..4].copy_from_slice(&handler.to_le_bytes());
    raw[4..8].copy_from_slice(&mask.to_le_bytes());
    raw[8..12].copy_from_slice(&flags.to_le_bytes());
    poke_user(kernel, at, &raw);
    at
}

#[test]
fn handler_runs_once_with_the_signal_number() {
    let (kernel, mut frame) = boot_with_init();
    let scratch = scratch_base(kernel);

    let act = stage_sigaction(kernel, scratch, HANDLER_ADDR, 0, 0);
    syscall(kernel, &mut frame, Sysno::Sigaction, &[Signal::SIGUSR1 as u32, act, 0]);
    assert_eq!(frame.eax, 0);

    let user_frame = frame;

    // Kill ourselves: delivery happens on the syscall return path.
    syscall(kernel, &mut frame, Sysno::Kill, &[1, Signal::SIGUSR1 as u32]);

    // We are now "in" the handler.
    assert_eq!(frame.eip, HANDLER_ADDR);
    // The stack holds [trampoline][signum][mask][saved frame].
    let sp = frame.useresp;
    assert_eq!(peek_user_u32(kernel, sp), SIGRET_TRAMPOLINE);
    assert_eq!(peek_user_u32(kernel, sp + 4), Signal::SIGUSR1 as u32);

    // The signal itself is blocked while the handler runs.
    {
        let sched = kernel.sched.lock();
        let task = sched.current_task().unwrap();
        assert!(task.sig.blocked.contains(Signal::SIGUSR1));
    }

    // The handler "returns" through the trampoline: emulate the `ret` by
    // popping the return address, then the trampoline's int 0x80.
    frame.useresp += 4;
    syscall(kernel, &mut frame, Sysno::Sigreturn, &[]);

    // Original context restored, including EAX and the blocked mask.
    assert_eq!(frame.eip, user_frame.eip);
    assert_eq!(frame.useresp, user_frame.useresp);
    assert_eq!(frame.eax, user_frame.eax);
    {
        let sched = kernel.sched.lock();
        let task = sched.current_task().unwrap();
        assert!(!task.sig.blocked.contains(Signal::SIGUSR1));
    }
}

#[test]
fn trampoline_page_contains_the_sigreturn_stub() {
    let (kernel, _frame) = boot_with_init();
    let mut code = [0u8; 7];
    peek_user(kernel, SIGRET_TRAMPOLINE, &mut code);
    // mov eax, imm32 ; int 0x80
    assert_eq!(code[0], 0xB8);
    assert_eq!(
        u32::from_le_bytes(code[1..5].try_into().unwrap()),
        Sysno::Sigreturn as u32
    );
    assert_eq!(&code[5..7], &[0xCD, 0x80]);
}

#[test]
fn blocked_signals_wait_for_unblock() {
    let (kernel, mut frame) = boot_with_init();
    let scratch = scratch_base(kernel);

    let act = stage_sigaction(kernel, scratch, HANDLER_ADDR, 0, 0);
    syscall(kernel, &mut frame, Sysno::Sigaction, &[Signal::SIGUSR2 as u32, act, 0]);

    // Block SIGUSR2, then send it: no delivery.
    let mask_addr = scratch + 64;
    poke_user(kernel, mask_addr, &Signal::SIGUSR2.bit().to_le_bytes());
    syscall(kernel, &mut frame, Sysno::Sigprocmask, &[SIG_SETMASK, mask_addr, 0]);
    syscall(kernel, &mut frame, Sysno::Kill, &[1, Signal::SIGUSR2 as u32]);
    assert_ne!(frame.eip, HANDLER_ADDR);

    // Unblock: the pending signal is delivered on the way out of
    // sigprocmask.
    poke_user(kernel, mask_addr, &0u32.to_le_bytes());
    syscall(kernel, &mut frame, Sysno::Sigprocmask, &[SIG_SETMASK, mask_addr, 0]);
    assert_eq!(frame.eip, HANDLER_ADDR);
}

#[test]
fn default_terminate_reported_through_wait() {
    let (kernel, mut frame) = boot_with_init();
    let scratch = scratch_base(kernel);

    syscall(kernel, &mut frame, Sysno::Fork, &[]);
    let child = frame.eax;

    // Kill the child with SIGTERM (default: terminate).
    syscall(kernel, &mut frame, Sysno::Kill, &[child, Signal::SIGTERM as u32]);

    // The wait blocks first (the child has not run yet), the child dies
    // at its return-to-user, and the restarted wait reaps it.
    syscall(kernel, &mut frame, Sysno::Waitpid, &[child, scratch, 0]);
    assert_eq!(frame.eax, Sysno::Waitpid as u32, "wait restarted");
    crate::syscall::dispatch(kernel, &mut frame);
    assert_eq!(frame.eax, child);
    let status = peek_user_u32(kernel, scratch) as i32;
    assert!(wifsignaled(status));
    assert_eq!(wtermsig(status), Signal::SIGTERM as u32 as i32);
}

#[test]
fn sigsegv_on_bad_dereference_kills_with_signal_11() {
    let (kernel, mut frame) = boot_with_init();
    let scratch = scratch_base(kernel);

    syscall(kernel, &mut frame, Sysno::Fork, &[]);
    let child = frame.eax;

    // Block in waitpid: the child becomes current.
    syscall(kernel, &mut frame, Sysno::Waitpid, &[child, scratch, 0]);
    {
        let sched = kernel.sched.lock();
        assert_eq!(sched.current_pid(), Some(child));
    }

    // The child dereferences an unmapped address.
    frame.err_code = PF_ERR_USER | PF_ERR_WRITE;
    let outcome = page_fault_handler(kernel, &mut frame, 0x10);
    assert_eq!(outcome, FaultOutcome::SegfaultDelivered);

    // The parent was woken with EIP rewound over `int 0x80`; re-execute
    // the wait.
    {
        let sched = kernel.sched.lock();
        assert_eq!(sched.current_pid(), Some(1));
        assert_eq!(frame.eax, Sysno::Waitpid as u32);
    }
    crate::syscall::dispatch(kernel, &mut frame);

    assert_eq!(frame.eax, child);
    let status = peek_user_u32(kernel, scratch) as i32;
    assert!(wifsignaled(status));
    assert_eq!(wtermsig(status), 11);
}

#[test]
fn stop_and_continue() {
    let (kernel, mut frame) = boot_with_init();

    syscall(kernel, &mut frame, Sysno::Fork, &[]);
    let child = frame.eax;

    syscall(kernel, &mut frame, Sysno::Kill, &[child, Signal::SIGSTOP as u32]);
    // Sleep so the scheduler tries (and stops) the child.
    syscall(kernel, &mut frame, Sysno::Sleep, &[1]);
    {
        // The child was picked, delivery stopped it, and control fell
        // back to the idle context or another task.
        let sched = kernel.sched.lock();
        assert_eq!(sched.task(child).unwrap().state, TaskState::Stopped);
    }

    // SIGCONT makes it runnable again.
    {
        let mut sched = kernel.sched.lock();
        crate::process::signal::send_signal(&mut sched, child, Signal::SIGCONT).unwrap();
        assert_eq!(sched.task(child).unwrap().state, TaskState::Running);
    }
}

#[test]
fn wait_interrupted_by_signal_returns_eintr() {
    let (kernel, mut frame) = boot_with_init();
    let scratch = scratch_base(kernel);

    let act = stage_sigaction(kernel, scratch, HANDLER_ADDR, 0, 0);
    syscall(kernel, &mut frame, Sysno::Sigaction, &[Signal::SIGUSR1 as u32, act, 0]);

    syscall(kernel, &mut frame, Sysno::Fork, &[]);
    let child = frame.eax;

    // Parent blocks in waitpid; child is current now.
    syscall(kernel, &mut frame, Sysno::Waitpid, &[child, 0, 0]);

    // The child signals the parent, waking it, then yields.
    syscall(kernel, &mut frame, Sysno::Kill, &[1, Signal::SIGUSR1 as u32]);
    syscall(kernel, &mut frame, Sysno::Sleep, &[5]);

    // The parent's restarted waitpid sees the pending signal and bails
    // with EINTR before the handler runs.
    {
        let sched = kernel.sched.lock();
        assert_eq!(sched.current_pid(), Some(1));
    }
    crate::syscall::dispatch(kernel, &mut frame);
    // The handler is entered on this return path; under it sits the
    // EINTR-carrying frame.
    assert_eq!(frame.eip, HANDLER_ADDR);

    frame.useresp += 4;
    syscall(kernel, &mut frame, Sysno::Sigreturn, &[]);
    assert_eq!(frame.eax as i32, osmium_abi::Errno::Interrupted as i32);

    // Cleanliness: reap the child eventually.
    syscall(kernel, &mut frame, Sysno::Kill, &[child, Signal::SIGKILL as u32]);
    syscall(kernel, &mut frame, Sysno::Waitpid, &[child, 0, WNOHANG]);
}
