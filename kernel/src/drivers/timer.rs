//! PIT tick source.
//!
//! The PIT runs at [`TICK_HZ`]; its ISR bumps the tick counter, does the
//! allocation-free per-tick bookkeeping (sleep wakeups, interval-timer
//! expiry flags), and re-enters the scheduler — the main preemption point.

use crate::arch::TrapFrame;
use crate::Kernel;

/// Timer frequency in Hz; one tick is the scheduler's accounting unit.
pub const TICK_HZ: u64 = 100;

/// Timer ISR body (IRQ 0).
pub fn handle_tick(kernel: &Kernel, frame: &mut TrapFrame) {
    let now = kernel.bump_ticks();
    {
        let mut sched = kernel.sched.lock();
        sched.on_tick(now);
    }
    kernel.schedule(frame);
}

/// Program PIT channel 0 for [`TICK_HZ`] periodic interrupts.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    use crate::arch::x86::outb;

    const PIT_BASE_HZ: u64 = 1_193_182;
    let divisor = (PIT_BASE_HZ / TICK_HZ) as u16;

    // Channel 0, lobyte/hibyte, rate generator.
    outb(0x43, 0x36);
    outb(0x40, (divisor & 0xFF) as u8);
    outb(0x40, (divisor >> 8) as u8);
    log::info!("pit: {} Hz tick", TICK_HZ);
}
