//! Signal numbers and default dispositions.

use num_enum::TryFromPrimitive;

/// Signal numbers (POSIX-compatible, 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Signal {
    /// Hangup detected on controlling terminal
    SIGHUP = 1,
    /// Interrupt from keyboard (Ctrl+C)
    SIGINT = 2,
    /// Quit from keyboard (Ctrl+\)
    SIGQUIT = 3,
    /// Illegal instruction
    SIGILL = 4,
    /// Trace/breakpoint trap
    SIGTRAP = 5,
    /// Abort signal
    SIGABRT = 6,
    /// Bus error (bad memory access)
    SIGBUS = 7,
    /// Floating-point exception
    SIGFPE = 8,
    /// Kill signal (cannot be caught or ignored)
    SIGKILL = 9,
    /// User-defined signal 1
    SIGUSR1 = 10,
    /// Segmentation fault
    SIGSEGV = 11,
    /// User-defined signal 2
    SIGUSR2 = 12,
    /// Broken pipe
    SIGPIPE = 13,
    /// Timer signal
    SIGALRM = 14,
    /// Termination signal
    SIGTERM = 15,
    /// Child stopped or terminated
    SIGCHLD = 17,
    /// Continue if stopped
    SIGCONT = 18,
    /// Stop process (cannot be caught or ignored)
    SIGSTOP = 19,
    /// Stop typed at terminal
    SIGTSTP = 20,
    /// Background read attempt
    SIGTTIN = 21,
    /// Background write attempt
    SIGTTOU = 22,
    /// Urgent data on socket
    SIGURG = 23,
    /// Window size changed
    SIGWINCH = 28,
    /// Bad system call
    SIGSYS = 31,
}

/// Default disposition applied when the action for a delivered signal is
/// `SIG_DFL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDefault {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

impl Signal {
    /// Convert a raw signal number.
    pub fn from_u32(num: u32) -> Option<Self> {
        Self::try_from(num).ok()
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// `SIGKILL` and `SIGSTOP` can be neither caught nor blocked.
    #[inline]
    pub fn is_uncatchable(self) -> bool {
        matches!(self, Signal::SIGKILL | Signal::SIGSTOP)
    }

    /// Bit position of this signal in a signal mask.
    #[inline]
    pub fn bit(self) -> u32 {
        1u32 << (self.as_u32() - 1)
    }

    /// Default disposition table.
    pub fn default_action(self) -> SigDefault {
        match self {
            Signal::SIGCHLD | Signal::SIGURG | Signal::SIGWINCH => SigDefault::Ignore,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                SigDefault::Stop
            }
            Signal::SIGCONT => SigDefault::Continue,
            _ => SigDefault::Terminate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_and_bits() {
        assert_eq!(Signal::SIGSEGV.as_u32(), 11);
        assert_eq!(Signal::SIGKILL.bit(), 1 << 8);
        assert_eq!(Signal::from_u32(14), Some(Signal::SIGALRM));
        assert_eq!(Signal::from_u32(0), None);
        assert_eq!(Signal::from_u32(64), None);
    }

    #[test]
    fn uncatchable_set_is_exactly_kill_and_stop() {
        for n in 1..32 {
            if let Some(sig) = Signal::from_u32(n) {
                assert_eq!(
                    sig.is_uncatchable(),
                    matches!(sig, Signal::SIGKILL | Signal::SIGSTOP)
                );
            }
        }
    }

    #[test]
    fn default_dispositions() {
        assert_eq!(Signal::SIGTERM.default_action(), SigDefault::Terminate);
        assert_eq!(Signal::SIGCHLD.default_action(), SigDefault::Ignore);
        assert_eq!(Signal::SIGTSTP.default_action(), SigDefault::Stop);
        assert_eq!(Signal::SIGCONT.default_action(), SigDefault::Continue);
    }
}
