//! Shared fixtures for the hosted test suite.
//!
//! Each test builds a private machine: a leaked heap arena standing in
//! for physical RAM, a `BootInfo` describing it, and a full `Kernel` on
//! top. Tests are therefore independent and can run in parallel.

use crate::boot::{BootInfo, MemoryKind, MemoryRegion};
use crate::Kernel;
use osmium_abi::{S_ISUID, S_IXUSR};

/// Managed RAM for one test machine (12 MiB, physically at 1 MiB).
const TEST_RAM_PHYS_START: u32 = 0x0010_0000;
const TEST_RAM_LEN: u32 = 12 * 1024 * 1024;
/// The fake kernel image occupies the first 64 KiB of the window.
const TEST_KERNEL_LEN: u32 = 0x1_0000;

/// Build a `BootInfo` over a fresh leaked arena.
pub fn boot_info() -> &'static BootInfo {
    let layout =
        std::alloc::Layout::from_size_align(TEST_RAM_LEN as usize, 4096).expect("layout");
    // SAFETY: a fresh zeroed allocation, intentionally leaked: the
    // machine lives for the rest of the test process.
    let arena = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!arena.is_null());

    let regions: &'static [MemoryRegion] = Box::leak(Box::new([MemoryRegion {
        start: TEST_RAM_PHYS_START,
        len: TEST_RAM_LEN,
        kind: MemoryKind::Free,
    }]));

    Box::leak(Box::new(BootInfo {
        kernel_virt_start: TEST_RAM_PHYS_START,
        kernel_virt_end: TEST_RAM_PHYS_START + TEST_KERNEL_LEN,
        kernel_phys_start: TEST_RAM_PHYS_START,
        kernel_phys_end: TEST_RAM_PHYS_START + TEST_KERNEL_LEN,
        stack_end: TEST_RAM_PHYS_START + TEST_KERNEL_LEN,
        ram_base: arena,
        ram_phys_start: TEST_RAM_PHYS_START,
        ram_phys_len: TEST_RAM_LEN,
        regions,
    }))
}

/// A full kernel over a fresh machine.
pub fn boot_kernel() -> &'static Kernel {
    Box::leak(Box::new(Kernel::new(boot_info())))
}

// ─── User-image fixtures ─────────────────────────────────────────────────────

/// Link base of the fixture binaries.
pub const FIXTURE_BASE: u32 = 0x0804_8000;

/// Build a minimal valid ELF32 `ET_EXEC` image for the fixture base: one
/// RX PT_LOAD segment whose file content is `payload`.
pub fn tiny_elf(payload: &[u8]) -> Vec<u8> {
    tiny_elf_at(FIXTURE_BASE, payload)
}

pub fn tiny_elf_at(vaddr: u32, payload: &[u8]) -> Vec<u8> {
    const EHSIZE: u32 = 52;
    const PHSIZE: u32 = 32;
    let entry = vaddr + EHSIZE + PHSIZE;
    let filesz = EHSIZE + PHSIZE + payload.len() as u32;

    let mut image = Vec::new();
    // e_ident
    image.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    image.extend_from_slice(&3u16.to_le_bytes()); // e_machine = EM_386
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&entry.to_le_bytes()); // e_entry
    image.extend_from_slice(&EHSIZE.to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHSIZE as u16).to_le_bytes()); // e_ehsize
    image.extend_from_slice(&(PHSIZE as u16).to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&40u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len(), EHSIZE as usize);

    // One PT_LOAD phdr covering the whole file.
    image.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
    image.extend_from_slice(&0u32.to_le_bytes()); // p_offset
    image.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&filesz.to_le_bytes()); // p_filesz
    image.extend_from_slice(&(filesz + 0x100).to_le_bytes()); // p_memsz (BSS tail)
    image.extend_from_slice(&5u32.to_le_bytes()); // p_flags = R|X
    image.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align

    image.extend_from_slice(payload);
    image
}

/// Register an executable in the kernel's root ramfs.
pub fn register_binary(kernel: &Kernel, path: &str, image: &[u8]) {
    register_binary_with_mode(kernel, path, image, S_IXUSR | 0o644, 0);
}

pub fn register_binary_with_mode(
    kernel: &Kernel,
    path: &str,
    image: &[u8],
    mode: u16,
    uid: u32,
) {
    let ramfs = kernel.vfs.ramfs().expect("boot ramfs mounted");
    let rel = path.trim_start_matches('/');
    ramfs.register(rel, image, mode, uid, 0);
}

/// Mode bits for a setuid root binary.
pub fn setuid_mode() -> u16 {
    S_ISUID | S_IXUSR | 0o755
}

// ─── Syscall harness ─────────────────────────────────────────────────────────

use crate::arch::TrapFrame;
use crate::memory::userslice::{copy_from_user, copy_to_user};
use osmium_abi::Sysno;
use osmium_vmem::{Pfn, VirtAddr};

/// Marker EIP of the hosted idle context.
pub const IDLE_EIP: u32 = 0xFFFF_0000;

/// Boot a kernel with `/bin/init` registered and running; the returned
/// frame is init's user context.
pub fn boot_with_init() -> (&'static Kernel, TrapFrame) {
    let kernel = boot_kernel();
    register_binary(kernel, "/bin/init", &tiny_elf(b"init image"));
    crate::syscall::exec::create_init_process(kernel, "/bin/init").expect("init");
    {
        let mut idle = TrapFrame::new_user();
        idle.eip = IDLE_EIP;
        kernel.sched.lock().set_idle_context(idle);
    }
    let mut frame = TrapFrame::new_user();
    kernel.schedule(&mut frame);
    (kernel, frame)
}

/// Page directory of the current task.
pub fn current_pgd(kernel: &Kernel) -> Pfn {
    let sched = kernel.sched.lock();
    sched
        .current_task()
        .and_then(|t| t.mm.as_ref())
        .map(|mm| mm.pgd)
        .expect("current task has an address space")
}

/// Low end of the current task's stack VMA — far below ESP, used as a
/// scratch area for staging syscall arguments in user memory.
pub fn scratch_base(kernel: &Kernel) -> u32 {
    let sched = kernel.sched.lock();
    sched
        .current_task()
        .and_then(|t| t.mm.as_ref())
        .map(|mm| mm.stack_start)
        .expect("current task has an address space")
}

/// Write bytes into the current task's user memory.
pub fn poke_user(kernel: &Kernel, va: u32, bytes: &[u8]) {
    let pgd = current_pgd(kernel);
    let mut mem = kernel.memory.lock();
    copy_to_user(&mut mem, pgd, VirtAddr::new(va), bytes).expect("poke_user");
}

/// Read bytes from a task's user memory.
pub fn peek_user_of(kernel: &Kernel, pgd: Pfn, va: u32, buf: &mut [u8]) {
    let mut mem = kernel.memory.lock();
    copy_from_user(&mut mem, pgd, VirtAddr::new(va), buf).expect("peek_user");
}

pub fn peek_user(kernel: &Kernel, va: u32, buf: &mut [u8]) {
    let pgd = current_pgd(kernel);
    peek_user_of(kernel, pgd, va, buf);
}

pub fn peek_user_u32(kernel: &Kernel, va: u32) -> u32 {
    let mut raw = [0u8; 4];
    peek_user(kernel, va, &mut raw);
    u32::from_le_bytes(raw)
}

/// Stage NUL-terminated strings plus their NULL-terminated pointer array
/// starting at `base`; returns the address of the array.
pub fn stage_str_array(kernel: &Kernel, base: u32, strs: &[&[u8]]) -> u32 {
    let mut cursor = base;
    let mut pointers: Vec<u32> = Vec::new();
    for s in strs {
        poke_user(kernel, cursor, s);
        poke_user(kernel, cursor + s.len() as u32, &[0u8]);
        pointers.push(cursor);
        cursor += s.len() as u32 + 1;
    }
    let array = (cursor + 3) & !3;
    let mut cursor = array;
    for ptr in pointers {
        poke_user(kernel, cursor, &ptr.to_le_bytes());
        cursor += 4;
    }
    poke_user(kernel, cursor, &0u32.to_le_bytes());
    array
}

/// Simulate `int 0x80` for the current frame.
pub fn syscall(kernel: &Kernel, frame: &mut TrapFrame, nr: Sysno, args: &[u32]) {
    frame.eax = nr as u32;
    let mut regs = [0u32; 6];
    let n = args.len().min(6);
    regs[..n].copy_from_slice(&args[..n]);
    frame.ebx = regs[0];
    frame.ecx = regs[1];
    frame.edx = regs[2];
    frame.esi = regs[3];
    frame.edi = regs[4];
    frame.ebp = regs[5];
    crate::syscall::dispatch(kernel, frame);
}
