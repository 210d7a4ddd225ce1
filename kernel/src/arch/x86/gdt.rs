//! Global descriptor table: flat segments for rings 0 and 3 plus one TSS.
//!
//! The TSS exists only so the CPU knows which stack to switch to on a
//! ring 3 → ring 0 transition; the kernel runs on a single kernel stack.

use core::arch::asm;
use core::mem::size_of;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (((limit >> 16) & 0x0F) as u8) | (granularity & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// Minimal 32-bit TSS; only `ss0`/`esp0` are consulted by the CPU here.
#[repr(C, packed)]
struct TaskStateSegment {
    prev: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 23],
}

static mut TSS: TaskStateSegment = TaskStateSegment {
    prev: 0,
    esp0: 0,
    ss0: super::super::KERNEL_DS,
    unused: [0; 23],
};

static mut GDT: [GdtEntry; 6] = [
    // Null descriptor.
    GdtEntry::new(0, 0, 0, 0),
    // Kernel code: base 0, limit 4 GiB, ring 0, execute/read.
    GdtEntry::new(0, 0xFFFFF, 0x9A, 0xC0),
    // Kernel data: ring 0, read/write.
    GdtEntry::new(0, 0xFFFFF, 0x92, 0xC0),
    // User code: ring 3.
    GdtEntry::new(0, 0xFFFFF, 0xFA, 0xC0),
    // User data: ring 3.
    GdtEntry::new(0, 0xFFFFF, 0xF2, 0xC0),
    // TSS slot, patched in `init`.
    GdtEntry::new(0, 0, 0, 0),
];

/// Install the GDT and load the TSS. `kernel_stack_top` becomes the ring 0
/// stack used on every trap from user mode.
///
/// # Safety
/// Must be called once, before interrupts are enabled.
pub unsafe fn init(kernel_stack_top: u32) {
    let tss_base = &raw const TSS as u32;
    let tss_limit = size_of::<TaskStateSegment>() as u32 - 1;
    GDT[5] = GdtEntry::new(tss_base, tss_limit, 0x89, 0x00);
    TSS.esp0 = kernel_stack_top;

    let pointer = GdtPointer {
        limit: (size_of::<[GdtEntry; 6]>() - 1) as u16,
        base: &raw const GDT as u32,
    };

    asm!(
        "lgdt [{ptr}]",
        // Reload segment registers with the new selectors.
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov ss, ax",
        // Far-jump to reload CS.
        "push 0x08",
        "lea eax, [2f]",
        "push eax",
        "retf",
        "2:",
        // Load the TSS selector.
        "mov ax, 0x28",
        "ltr ax",
        ptr = in(reg) &pointer,
        out("eax") _,
    );
}

/// Update the ring 0 stack pointer used on the next trap from user mode.
pub fn set_kernel_stack(top: u32) {
    // SAFETY: single CPU; written between traps.
    unsafe {
        TSS.esp0 = top;
    }
}
