//! Kernel panic plumbing.
//!
//! Recoverable errors travel as `Result`; anything that would corrupt
//! address-space or scheduling invariants panics instead. On bare metal the
//! handler dumps the panic message to the console and halts.

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    crate::arch::x86::save_flags_and_cli();

    // Bypass the console lock: the panicking context may hold it.
    // SAFETY: we never return and interrupts are off.
    let mut console = unsafe { crate::drivers::video::console_for_panic() };
    let _ = writeln!(console, "\n**** KERNEL PANIC ****");
    let _ = writeln!(console, "{}", info);

    loop {
        crate::arch::x86::halt();
    }
}
