//! Memory-management syscalls: mmap, munmap, brk.

use super::dispatcher::HandlerResult;
use crate::Kernel;
use osmium_abi::{Errno, MAP_ANONYMOUS, PROT_WRITE};
use osmium_vmem::{MappingFlags, VirtAddr, PAGE_SIZE};

/// SYS_MMAP (192): create an anonymous demand-zero VMA.
///
/// The mapping itself is always anonymous; when a file descriptor is
/// given (no `MAP_ANONYMOUS`) it is validated — the descriptor must be
/// open and the file large enough for `offset + len` — but no file pages
/// are mapped.
///
/// A non-zero `addr` is a hint: it is used when the exact range is free,
/// otherwise the free-area search runs from the mmap base. Returns the
/// mapped address.
pub fn sys_mmap(
    kernel: &Kernel,
    addr: u32,
    len: u32,
    prot: u32,
    flags: u32,
    fd: u32,
    offset: u32,
) -> HandlerResult {
    Some(do_mmap(kernel, addr, len, prot, flags, fd, offset))
}

fn do_mmap(
    kernel: &Kernel,
    addr: u32,
    len: u32,
    prot: u32,
    flags: u32,
    fd: u32,
    offset: u32,
) -> Result<u32, Errno> {
    if len == 0 {
        return Err(Errno::InvalidArgument);
    }
    let len = len
        .checked_add(PAGE_SIZE - 1)
        .ok_or(Errno::InvalidArgument)?
        & !(PAGE_SIZE - 1);

    let mut sched = kernel.sched.lock();

    if flags & MAP_ANONYMOUS == 0 {
        // File-backed request: validate the descriptor and the span.
        let task = sched.current_task().ok_or(Errno::NoProcess)?;
        let file = task.fds.get(fd)?;
        let stat = file.stat()?;
        let end = offset.checked_add(len).ok_or(Errno::InvalidArgument)?;
        if end > stat.size {
            return Err(Errno::InvalidArgument);
        }
    }

    let mut mapping = MappingFlags::USER;
    if prot & PROT_WRITE != 0 {
        mapping |= MappingFlags::RW;
    }

    let task = sched.current_task_mut().ok_or(Errno::NoProcess)?;
    let mm = task.mm.as_mut().ok_or(Errno::NoProcess)?;

    let hint = VirtAddr::new(addr).align_down();
    let start = if addr != 0 && mm.is_range_free(hint, len) {
        hint
    } else {
        mm.find_free_region(len).ok_or(Errno::OutOfMemory)?
    };

    {
        let mut mem = kernel.memory.lock();
        mm.create_vma(&mut mem, start, len, mapping).map_err(|e| {
            log::error!("mmap: failed to create VMA at {:#x}: {:?}", start.as_u32(), e);
            Errno::OutOfMemory
        })?;
    }
    Ok(start.as_u32())
}

/// SYS_MUNMAP (91): destroy an anonymous VMA.
///
/// The `(addr, len)` pair must match an existing VMA exactly; partial
/// unmaps are not supported. An unmatched request returns the positive
/// indicator 1 rather than an errno.
pub fn sys_munmap(kernel: &Kernel, addr: u32, len: u32) -> HandlerResult {
    let mut sched = kernel.sched.lock();
    let Some(task) = sched.current_task_mut() else {
        return Some(Err(Errno::NoProcess));
    };
    let Some(mm) = task.mm.as_mut() else {
        return Some(Err(Errno::NoProcess));
    };

    let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mut mem = kernel.memory.lock();
    if mm.destroy_vma_exact(&mut mem, VirtAddr::new(addr), len) {
        Some(Ok(0))
    } else {
        log::debug!("munmap: no matching area at {:#010x} + {:#x}", addr, len);
        Some(Ok(1))
    }
}

/// SYS_BRK (45): move the program break.
///
/// Growth extends the heap with demand-zero pages; shrinking only moves
/// the break pointer (the frames are reclaimed at exit). Returns the new
/// break, or the current one when `addr` is 0 or out of range.
pub fn sys_brk(kernel: &Kernel, addr: u32) -> HandlerResult {
    let mut sched = kernel.sched.lock();
    let Some(task) = sched.current_task_mut() else {
        return Some(Err(Errno::NoProcess));
    };
    let Some(mm) = task.mm.as_mut() else {
        return Some(Err(Errno::NoProcess));
    };

    if addr == 0 || addr < mm.brk_start {
        return Some(Ok(mm.brk));
    }

    let old_top = VirtAddr::new(mm.brk).align_up();
    let new_top = VirtAddr::new(addr).align_up();
    if new_top > old_top {
        let mut mem = kernel.memory.lock();
        if mm
            .create_vma(
                &mut mem,
                old_top,
                new_top - old_top,
                MappingFlags::RW | MappingFlags::USER,
            )
            .is_err()
        {
            return Some(Ok(mm.brk));
        }
    }
    mm.brk = addr;
    Some(Ok(addr))
}
