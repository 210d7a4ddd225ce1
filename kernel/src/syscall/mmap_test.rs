//! mmap/munmap/brk through the syscall surface.

use crate::selftest::{self, boot_with_init, peek_user, poke_user, syscall};
use osmium_abi::{Errno, Sysno, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

const RW: u32 = PROT_READ | PROT_WRITE;
const ANON: u32 = MAP_PRIVATE | MAP_ANONYMOUS;

fn vma_count(kernel: &crate::Kernel) -> usize {
    let sched = kernel.sched.lock();
    sched
        .current_task()
        .and_then(|t| t.mm.as_ref())
        .map(|mm| mm.vmas().len())
        .unwrap()
}

#[test]
fn mmap_munmap_round_trip_restores_the_vma_list() {
    let (kernel, mut frame) = boot_with_init();
    let before = vma_count(kernel);

    syscall(kernel, &mut frame, Sysno::Mmap, &[0, 0x2000, RW, ANON]);
    let addr = frame.eax;
    assert!((addr as i32) > 0);
    assert_eq!(vma_count(kernel), before + 1);

    // The mapping is usable.
    poke_user(kernel, addr, b"pattern");
    let mut buf = [0u8; 7];
    peek_user(kernel, addr, &mut buf);
    assert_eq!(&buf, b"pattern");

    syscall(kernel, &mut frame, Sysno::Munmap, &[addr, 0x2000]);
    assert_eq!(frame.eax, 0);
    assert_eq!(vma_count(kernel), before);

    // The range is gone: kernel-side access faults too.
    let pgd = selftest::current_pgd(kernel);
    let mut mem = kernel.memory.lock();
    let mut probe = [0u8; 1];
    assert!(crate::memory::userslice::copy_from_user(
        &mut mem,
        pgd,
        osmium_vmem::VirtAddr::new(addr),
        &mut probe
    )
    .is_err());
}

#[test]
fn munmap_requires_an_exact_match() {
    let (kernel, mut frame) = boot_with_init();

    syscall(kernel, &mut frame, Sysno::Mmap, &[0, 0x3000, RW, ANON]);
    let addr = frame.eax;

    // Wrong length: positive indicator, the mapping survives.
    syscall(kernel, &mut frame, Sysno::Munmap, &[addr, 0x1000]);
    assert_eq!(frame.eax, 1);
    // Wrong base: same.
    syscall(kernel, &mut frame, Sysno::Munmap, &[addr + 0x1000, 0x2000]);
    assert_eq!(frame.eax, 1);

    poke_user(kernel, addr + 0x2000, b"still mapped");

    syscall(kernel, &mut frame, Sysno::Munmap, &[addr, 0x3000]);
    assert_eq!(frame.eax, 0);
}

#[test]
fn mmap_honors_a_usable_hint_and_ignores_a_busy_one() {
    let (kernel, mut frame) = boot_with_init();

    let hint = 0x5000_0000u32;
    syscall(kernel, &mut frame, Sysno::Mmap, &[hint, 0x1000, RW, ANON]);
    assert_eq!(frame.eax, hint);

    // Same hint again: busy, so the search provides a different range.
    syscall(kernel, &mut frame, Sysno::Mmap, &[hint, 0x1000, RW, ANON]);
    let second = frame.eax;
    assert!((second as i32) > 0);
    assert_ne!(second, hint);
}

#[test]
fn mmap_with_bad_fd_is_ebadf_and_short_file_is_einval() {
    let (kernel, mut frame) = boot_with_init();

    // No MAP_ANONYMOUS: fd must be valid.
    syscall(kernel, &mut frame, Sysno::Mmap, &[0, 0x1000, RW, MAP_PRIVATE, 99, 0]);
    assert_eq!(frame.eax as i32, Errno::BadHandle as i32);

    // A real but short file: offset + len exceeds its size.
    selftest::register_binary(kernel, "/data/small", b"tiny");
    let path_at = selftest::scratch_base(kernel);
    poke_user(kernel, path_at, b"/data/small\0");
    syscall(kernel, &mut frame, Sysno::Open, &[path_at, 0, 0]);
    let fd = frame.eax;
    assert!((fd as i32) >= 0);

    syscall(
        kernel,
        &mut frame,
        Sysno::Mmap,
        &[0, 0x1000, RW, MAP_PRIVATE, fd, 0],
    );
    assert_eq!(frame.eax as i32, Errno::InvalidArgument as i32);
}

#[test]
fn mmap_zero_length_is_einval() {
    let (kernel, mut frame) = boot_with_init();
    syscall(kernel, &mut frame, Sysno::Mmap, &[0, 0, RW, ANON]);
    assert_eq!(frame.eax as i32, Errno::InvalidArgument as i32);
}

#[test]
fn brk_grows_the_heap() {
    let (kernel, mut frame) = boot_with_init();

    syscall(kernel, &mut frame, Sysno::Brk, &[0]);
    let base = frame.eax;
    assert!(base > 0);

    syscall(kernel, &mut frame, Sysno::Brk, &[base + 0x4000]);
    assert_eq!(frame.eax, base + 0x4000);

    // The grown region is writable demand-zero memory.
    poke_user(kernel, base + 0x1000, b"heap bytes");
    let mut buf = [0u8; 10];
    peek_user(kernel, base + 0x1000, &mut buf);
    assert_eq!(&buf, b"heap bytes");

    // Shrinking only moves the pointer.
    syscall(kernel, &mut frame, Sysno::Brk, &[base]);
    assert_eq!(frame.eax, base);
}
