//! Hosted stand-ins for the privileged x86 operations.
//!
//! CR2/CR3 become atomics and TLB flushes a counter; everything else keeps
//! the bare-metal signatures. The kernel core never notices the
//! difference, which is what makes it testable off-target.

use super::IrqState;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static CR2: AtomicU32 = AtomicU32::new(0);
static CR3: AtomicU32 = AtomicU32::new(0);
static TLB_FLUSHES: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn read_cr2() -> u32 {
    CR2.load(Ordering::Relaxed)
}

/// Test hook: plant a faulting address the way the MMU would.
pub fn set_cr2(addr: u32) {
    CR2.store(addr, Ordering::Relaxed);
}

#[inline]
pub fn read_cr3() -> u32 {
    CR3.load(Ordering::Relaxed)
}

#[inline]
pub fn write_cr3(phys: u32) {
    CR3.store(phys, Ordering::Relaxed);
}

#[inline]
pub fn flush_tlb_single(_va: u32) {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

/// Number of single-page TLB invalidations issued so far.
pub fn tlb_flush_count() -> u64 {
    TLB_FLUSHES.load(Ordering::Relaxed)
}

#[inline]
pub fn save_flags_and_cli() -> IrqState {
    0
}

#[inline]
pub fn restore_flags(_state: IrqState) {}

#[inline]
pub fn enable_interrupts() {}
