//! Exception and IRQ entry stubs.
//!
//! Every vector funnels through one common stub that materializes a
//! [`TrapFrame`] on the kernel stack and calls [`isr_dispatch`]. The frame
//! layout must match `TrapFrame` field-for-field; the IRET tail pops it
//! back in reverse.

use crate::arch::TrapFrame;
use core::arch::naked_asm;

macro_rules! isr_no_err {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym isr_common,
            );
        }
    };
}

macro_rules! isr_err {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            // The CPU already pushed the error code.
            naked_asm!(
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym isr_common,
            );
        }
    };
}

isr_no_err!(isr_divide_error, 0);
isr_no_err!(isr_debug, 1);
isr_no_err!(isr_nmi, 2);
isr_no_err!(isr_breakpoint, 3);
isr_no_err!(isr_overflow, 4);
isr_no_err!(isr_bound_range, 5);
isr_no_err!(isr_invalid_opcode, 6);
isr_no_err!(isr_device_not_available, 7);
isr_err!(isr_double_fault, 8);
isr_err!(isr_invalid_tss, 10);
isr_err!(isr_segment_not_present, 11);
isr_err!(isr_stack_fault, 12);
isr_err!(isr_general_protection, 13);
isr_err!(isr_page_fault, 14);
isr_no_err!(isr_fpu_error, 16);
isr_err!(isr_alignment_check, 17);

isr_no_err!(irq_timer, 0x20);
isr_no_err!(irq_keyboard, 0x21);
isr_no_err!(irq_rtc, 0x28);
isr_no_err!(isr_syscall, 0x80);

#[unsafe(naked)]
unsafe extern "C" fn isr_common() {
    naked_asm!(
        "pusha",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov eax, esp",
        "push eax",
        "call {dispatch}",
        "add esp, 4",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popa",
        "add esp, 8",
        "iretd",
        dispatch = sym isr_dispatch,
    );
}

/// Populate the IDT with every stub above.
pub fn install() {
    use super::idt::set_gate;

    set_gate(0, isr_divide_error, 0);
    set_gate(1, isr_debug, 0);
    set_gate(2, isr_nmi, 0);
    set_gate(3, isr_breakpoint, 0);
    set_gate(4, isr_overflow, 0);
    set_gate(5, isr_bound_range, 0);
    set_gate(6, isr_invalid_opcode, 0);
    set_gate(7, isr_device_not_available, 0);
    set_gate(8, isr_double_fault, 0);
    set_gate(10, isr_invalid_tss, 0);
    set_gate(11, isr_segment_not_present, 0);
    set_gate(12, isr_stack_fault, 0);
    set_gate(13, isr_general_protection, 0);
    set_gate(14, isr_page_fault, 0);
    set_gate(16, isr_fpu_error, 0);
    set_gate(17, isr_alignment_check, 0);

    set_gate(0x20, irq_timer, 0);
    set_gate(0x21, irq_keyboard, 0);
    set_gate(0x28, irq_rtc, 0);
    // Reachable from ring 3.
    set_gate(0x80, isr_syscall, 3);

    // SAFETY: all delivered gates are populated above.
    unsafe {
        super::idt::load();
    }
}

extern "C" fn isr_dispatch(frame: *mut TrapFrame) {
    // SAFETY: the common stub passes a pointer to the frame it just built
    // on the kernel stack; it stays valid until IRET.
    let frame = unsafe { &mut *frame };
    let kernel = crate::kernel();

    match frame.int_no {
        14 => {
            let fault_va = super::read_cr2();
            crate::memory::paging::page_fault_handler(kernel, frame, fault_va);
        }
        0x20 => {
            crate::drivers::timer::handle_tick(kernel, frame);
            super::pic::eoi(0);
        }
        0x21 => {
            crate::drivers::video::keyboard_interrupt(kernel);
            super::pic::eoi(1);
        }
        0x28 => {
            super::pic::eoi(8);
        }
        0x80 => {
            crate::syscall::dispatch(kernel, frame);
        }
        vector => {
            panic!(
                "unhandled exception {} (err={:#x}) at {:#010x}\n{:#x?}",
                vector, frame.err_code, frame.eip, frame
            );
        }
    }
}
