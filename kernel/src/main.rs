//! Bare-metal entry point.
//!
//! The bootloader lands in `kernel_main` with a populated `BootInfo`.
//! Boot order: heap → GDT/IDT/PIC → logger → kernel context (physical
//! memory, paging, scheduler, VFS) → init process → PIT → idle loop.
//! The idle context is what the scheduler resumes when nothing is
//! runnable.

#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot_entry {
    use osmium_kernel::arch::x86::{self, gdt, interrupts, pic};
    use osmium_kernel::boot::BootInfo;
    use osmium_kernel::{arch, drivers, memory, syscall};

    /// Kernel heap carved out before the frame allocator takes over.
    const EARLY_HEAP_SIZE: usize = 2 * 1024 * 1024;

    #[no_mangle]
    pub extern "C" fn kernel_main(info: &'static BootInfo) -> ! {
        // SAFETY: single-threaded boot; the heap region comes out of the
        // bootloader-reserved window and is never given to the frame
        // allocator.
        unsafe {
            let heap_start = info.stack_end as *mut u8;
            memory::heap::init(heap_start, EARLY_HEAP_SIZE);
            gdt::init(info.stack_end);
        }
        interrupts::install();
        pic::init();

        osmium_kernel::boot::logger::init(log::LevelFilter::Info);
        log::info!("osmium: booting");

        let kernel = osmium_kernel::init_kernel(info);

        syscall::exec::create_init_process(kernel, "/bin/init")
            .expect("failed to build the init process");

        // The idle context the scheduler falls back to.
        let mut idle = arch::TrapFrame::new_user();
        idle.cs = arch::KERNEL_CS;
        idle.ss = arch::KERNEL_DS;
        idle.ds = arch::KERNEL_DS;
        idle.es = arch::KERNEL_DS;
        idle.fs = arch::KERNEL_DS;
        idle.gs = arch::KERNEL_DS;
        idle.eip = idle_loop as usize as u32;
        idle.useresp = info.stack_end;
        kernel.sched.lock().set_idle_context(idle);

        drivers::timer::init();
        x86::enable_interrupts();

        idle_loop();
    }

    extern "C" fn idle_loop() -> ! {
        loop {
            x86::halt();
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    eprintln!("osmium is a kernel image; build it for the bare-metal x86 target");
}
