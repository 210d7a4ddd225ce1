//! The signal subsystem.
//!
//! Queued signal records live in a FIFO per task next to a pending bitset.
//! Delivery happens on the return-to-user path (`restore_context`): for
//! each unmasked pending signal the default disposition is applied, or the
//! registered handler is set up to run on the user stack with a trampoline
//! page that invokes `sigreturn` when the handler returns.
//!
//! Ordering: within one signal number records are delivered in the order
//! they were queued; across numbers the lowest number goes first.
//! `SIGKILL` and `SIGSTOP` are never catchable and never maskable.

use super::pid::{Pid, INIT_PID};
use super::scheduler::Scheduler;
use super::task::{Task, TaskState};
use crate::memory::userslice::{push_user_bytes, push_user_u32};
use crate::memory::{PhysicalMemory, SIGRET_TRAMPOLINE};
use crate::sync::SpinLock;
use alloc::collections::VecDeque;
use osmium_abi::limits::NSIG;
use osmium_abi::{Errno, SigDefault, Signal, SA_NODEFER, SA_RESETHAND};

/// A set of signals as a bitmask (bit N-1 ↔ signal N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u32);

impl SigSet {
    pub const fn empty() -> Self {
        SigSet(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        SigSet(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn add(&mut self, sig: Signal) {
        self.0 |= sig.bit();
    }

    pub fn remove(&mut self, sig: Signal) {
        self.0 &= !sig.bit();
    }

    pub fn contains(self, sig: Signal) -> bool {
        self.0 & sig.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Bits that can never be blocked or caught.
const UNBLOCKABLE: u32 = (1 << (Signal::SIGKILL as u32 - 1)) | (1 << (Signal::SIGSTOP as u32 - 1));

/// Disposition installed for one signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigAction {
    #[default]
    Default,
    Ignore,
    Handler {
        /// User-space handler entry point.
        handler: u32,
        /// Extra signals blocked while the handler runs.
        mask: u32,
        /// SA_* flags.
        flags: u32,
    },
}

/// Per-task signal state.
pub struct SignalState {
    actions: [SigAction; NSIG],
    pub blocked: SigSet,
    pub real_blocked: SigSet,
    pub saved_mask: Option<SigSet>,
    queue: VecDeque<Signal>,
    pending: SigSet,
}

impl SignalState {
    pub fn new() -> Self {
        SignalState {
            actions: [SigAction::Default; NSIG],
            blocked: SigSet::empty(),
            real_blocked: SigSet::empty(),
            saved_mask: None,
            queue: VecDeque::new(),
            pending: SigSet::empty(),
        }
    }

    pub fn action(&self, sig: Signal) -> SigAction {
        self.actions[(sig.as_u32() - 1) as usize]
    }

    /// Install a disposition. Rejected for SIGKILL/SIGSTOP.
    pub fn set_action(&mut self, sig: Signal, action: SigAction) -> Result<SigAction, Errno> {
        if sig.is_uncatchable() && action != SigAction::Default {
            return Err(Errno::InvalidArgument);
        }
        let old = self.action(sig);
        self.actions[(sig.as_u32() - 1) as usize] = action;
        Ok(old)
    }

    /// Reset every disposition to default (exec semantics).
    pub fn reset_actions(&mut self) {
        self.actions = [SigAction::Default; NSIG];
    }

    /// Append a signal record to the pending queue.
    pub fn enqueue(&mut self, sig: Signal) {
        self.queue.push_back(sig);
        self.pending.add(sig);
    }

    /// Bitmask of pending signals that would be delivered right now.
    pub fn deliverable_bits(&self) -> u32 {
        self.pending.bits() & (!self.blocked.bits() | UNBLOCKABLE)
    }

    pub fn has_deliverable(&self) -> bool {
        self.deliverable_bits() != 0
    }

    /// Take the next deliverable record: lowest pending unmasked number,
    /// FIFO within that number.
    pub fn take_next_deliverable(&mut self) -> Option<Signal> {
        let bits = self.deliverable_bits();
        if bits == 0 {
            return None;
        }
        let signum = bits.trailing_zeros() + 1;
        let sig = Signal::from_u32(signum)?;
        let at = self.queue.iter().position(|&s| s == sig)?;
        self.queue.remove(at);
        if !self.queue.contains(&sig) {
            self.pending.remove(sig);
        }
        Some(sig)
    }

    /// Drop every pending record (exec after a failed image load, exit).
    pub fn flush_pending(&mut self) {
        self.queue.clear();
        self.pending = SigSet::empty();
    }
}

/// Queue `sig` on `pid` and wake the target when the signal can make it
/// runnable: interruptible sleepers for any unblocked signal, stopped
/// tasks for SIGCONT, anyone for SIGKILL.
pub fn send_signal(sched: &mut Scheduler, pid: Pid, sig: Signal) -> Result<(), Errno> {
    let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
    if task.state == TaskState::Zombie {
        return Err(Errno::NoProcess);
    }
    task.sig.enqueue(sig);

    let wake = match sig {
        Signal::SIGKILL => true,
        Signal::SIGCONT => task.state == TaskState::Stopped,
        _ => task.state == TaskState::Sleeping && !task.sig.blocked.contains(sig),
    };
    if wake {
        sched.wake(pid);
    }
    Ok(())
}

/// What delivery decided for a task about to return to user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Run the task; its frame may now point at a handler.
    Resume,
    /// The task dies with this signal; the scheduler turns it into a
    /// zombie with the signal number as status.
    Terminated(Signal),
    /// The task was stopped; pick another one.
    Stopped,
}

/// Deliver pending signals to `task` just before it returns to user mode.
///
/// At most one handler is set up per pass; everything dispatched by
/// default action is consumed in the same pass.
pub fn deliver_pending(task: &mut Task, memory: &SpinLock<PhysicalMemory>) -> Delivery {
    loop {
        let Some(sig) = task.sig.take_next_deliverable() else {
            return Delivery::Resume;
        };

        // SIGKILL kills without ever consulting handlers; SIGSTOP stops.
        if sig == Signal::SIGKILL {
            if task.pid == INIT_PID {
                log::warn!("init received SIGKILL; ignored");
                continue;
            }
            return Delivery::Terminated(sig);
        }
        if sig == Signal::SIGSTOP {
            task.state = TaskState::Stopped;
            return Delivery::Stopped;
        }

        match task.sig.action(sig) {
            SigAction::Ignore => continue,
            SigAction::Default => match sig.default_action() {
                SigDefault::Ignore => continue,
                SigDefault::Continue => continue,
                SigDefault::Stop => {
                    task.state = TaskState::Stopped;
                    return Delivery::Stopped;
                }
                SigDefault::Terminate => {
                    if task.pid == INIT_PID {
                        log::warn!("init would die of {:?}; ignored", sig);
                        continue;
                    }
                    return Delivery::Terminated(sig);
                }
            },
            SigAction::Handler {
                handler,
                mask,
                flags,
            } => {
                match setup_handler_frame(task, memory, sig, handler) {
                    Ok(()) => {
                        // Handler mask: the action's mask plus the signal
                        // itself unless SA_NODEFER, never KILL/STOP.
                        let mut new_blocked = task.sig.blocked.bits() | mask;
                        if flags & SA_NODEFER == 0 {
                            new_blocked |= sig.bit();
                        }
                        task.sig.blocked = SigSet::from_bits(new_blocked & !UNBLOCKABLE);
                        if flags & SA_RESETHAND != 0 {
                            let _ = task.sig.set_action(sig, SigAction::Default);
                        }
                        return Delivery::Resume;
                    }
                    Err(_) => {
                        // No room on the user stack for the signal frame:
                        // the task cannot run its handler, so it dies as
                        // if the disposition were default.
                        log::error!(
                            "pid {}: failed to push signal frame for {:?}",
                            task.pid,
                            sig
                        );
                        return Delivery::Terminated(sig);
                    }
                }
            }
        }
    }
}

/// Layout pushed below the interrupted user stack pointer, low to high:
/// `[trampoline return address][signal number][saved mask][saved frame]`.
/// The handler returns into the trampoline, which issues `sigreturn`;
/// `sys_sigreturn` unwinds this frame.
fn setup_handler_frame(
    task: &mut Task,
    memory: &SpinLock<PhysicalMemory>,
    sig: Signal,
    handler: u32,
) -> Result<(), Errno> {
    let pgd = task.mm.as_ref().ok_or(Errno::Fault)?.pgd;
    let saved = task.frame;
    let saved_mask = task.sig.blocked.bits();

    let mut mem = memory.lock();
    let mut sp = saved.useresp;

    // SAFETY: TrapFrame is repr(C) plain data.
    let frame_bytes = unsafe {
        core::slice::from_raw_parts(
            (&saved as *const crate::arch::TrapFrame) as *const u8,
            core::mem::size_of::<crate::arch::TrapFrame>(),
        )
    };
    push_user_bytes(&mut mem, pgd, &mut sp, frame_bytes)?;
    push_user_u32(&mut mem, pgd, &mut sp, saved_mask)?;
    push_user_u32(&mut mem, pgd, &mut sp, sig.as_u32())?;
    push_user_u32(&mut mem, pgd, &mut sp, SIGRET_TRAMPOLINE)?;

    task.frame.eip = handler;
    task.frame.useresp = sp;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_lowest_number_first_then_fifo() {
        let mut sig = SignalState::new();
        sig.enqueue(Signal::SIGTERM);
        sig.enqueue(Signal::SIGUSR1);
        sig.enqueue(Signal::SIGTERM);
        assert_eq!(sig.take_next_deliverable(), Some(Signal::SIGUSR1));
        assert_eq!(sig.take_next_deliverable(), Some(Signal::SIGTERM));
        assert_eq!(sig.take_next_deliverable(), Some(Signal::SIGTERM));
        assert_eq!(sig.take_next_deliverable(), None);
    }

    #[test]
    fn blocked_signals_stay_pending() {
        let mut sig = SignalState::new();
        sig.blocked.add(Signal::SIGUSR1);
        sig.enqueue(Signal::SIGUSR1);
        assert_eq!(sig.take_next_deliverable(), None);
        sig.blocked.remove(Signal::SIGUSR1);
        assert_eq!(sig.take_next_deliverable(), Some(Signal::SIGUSR1));
    }

    #[test]
    fn kill_and_stop_ignore_the_mask() {
        let mut sig = SignalState::new();
        sig.blocked = SigSet::from_bits(!0);
        sig.enqueue(Signal::SIGKILL);
        assert_eq!(sig.take_next_deliverable(), Some(Signal::SIGKILL));
        sig.enqueue(Signal::SIGSTOP);
        assert_eq!(sig.take_next_deliverable(), Some(Signal::SIGSTOP));
    }

    #[test]
    fn uncatchable_actions_rejected() {
        let mut sig = SignalState::new();
        assert_eq!(
            sig.set_action(
                Signal::SIGKILL,
                SigAction::Handler {
                    handler: 0x1000,
                    mask: 0,
                    flags: 0
                }
            ),
            Err(Errno::InvalidArgument)
        );
        assert!(sig.set_action(Signal::SIGTERM, SigAction::Ignore).is_ok());
    }
}
