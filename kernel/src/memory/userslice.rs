//! Bounded access to user memory from syscall context.
//!
//! All user bytes are reached through short-lived alias windows over the
//! target address space, never by dereferencing user pointers directly:
//! the same code path works whether or not the target directory is the one
//! in CR3, and writes split CoW pages exactly like a user-mode store
//! would.

use super::frame::PhysicalMemory;
use super::vmem;
use super::PagingError;
use alloc::vec::Vec;
use osmium_abi::Errno;
use osmium_vmem::{Pfn, VirtAddr, PAGE_SIZE};

impl From<PagingError> for Errno {
    fn from(err: PagingError) -> Self {
        match err {
            PagingError::OutOfMemory => Errno::OutOfMemory,
            _ => Errno::Fault,
        }
    }
}

/// Copy `data` into `[va, va + data.len())` of `pgd`.
pub fn copy_to_user(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    va: VirtAddr,
    data: &[u8],
) -> Result<(), Errno> {
    access_user(mem, pgd, va, data.len(), true, |ptr, offset, len| {
        // SAFETY: `ptr` spans `len` bytes of the resolved frame.
        unsafe {
            core::ptr::copy_nonoverlapping(data[offset..].as_ptr(), ptr, len);
        }
    })
}

/// Copy `[va, va + buf.len())` of `pgd` into `buf`.
pub fn copy_from_user(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    va: VirtAddr,
    buf: &mut [u8],
) -> Result<(), Errno> {
    let dst = buf.as_mut_ptr();
    access_user(mem, pgd, va, buf.len(), false, |ptr, offset, len| {
        // SAFETY: disjoint kernel buffer and user frame.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, dst.add(offset), len);
        }
    })
}

/// Read one little-endian u32 from user memory.
pub fn read_user_u32(mem: &mut PhysicalMemory, pgd: Pfn, va: VirtAddr) -> Result<u32, Errno> {
    let mut bytes = [0u8; 4];
    copy_from_user(mem, pgd, va, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Push a u32 onto a descending user stack; `sp` moves down first.
pub fn push_user_u32(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    sp: &mut u32,
    value: u32,
) -> Result<(), Errno> {
    *sp -= 4;
    copy_to_user(mem, pgd, VirtAddr::new(*sp), &value.to_le_bytes())
}

/// Push raw bytes onto a descending user stack.
pub fn push_user_bytes(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    sp: &mut u32,
    bytes: &[u8],
) -> Result<(), Errno> {
    *sp -= bytes.len() as u32;
    copy_to_user(mem, pgd, VirtAddr::new(*sp), bytes)
}

/// Read a NUL-terminated string of at most `max` bytes (terminator
/// included). Longer strings fail with `ENAMETOOLONG`.
pub fn read_user_cstr(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    va: VirtAddr,
    max: usize,
) -> Result<Vec<u8>, Errno> {
    let mut out = Vec::new();
    let mut cursor = va.as_u32();
    loop {
        if out.len() >= max {
            return Err(Errno::NameTooLong);
        }
        // Read up to the end of the current page in one window.
        let page_rest = (PAGE_SIZE - VirtAddr::new(cursor).page_offset()) as usize;
        let chunk = page_rest.min(max - out.len() + 1).min(256);
        let mut buf = [0u8; 256];
        copy_from_user(mem, pgd, VirtAddr::new(cursor), &mut buf[..chunk])?;
        for &b in &buf[..chunk] {
            if b == 0 {
                return Ok(out);
            }
            out.push(b);
            if out.len() > max {
                return Err(Errno::NameTooLong);
            }
        }
        cursor += chunk as u32;
    }
}

/// Read a NULL-terminated array of user string pointers (argv/envp shape),
/// each string capped at `str_max` bytes.
pub fn read_user_str_array(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    va: VirtAddr,
    str_max: usize,
) -> Result<Vec<Vec<u8>>, Errno> {
    let mut out = Vec::new();
    let mut slot = va.as_u32();
    loop {
        let ptr = read_user_u32(mem, pgd, VirtAddr::new(slot))?;
        if ptr == 0 {
            return Ok(out);
        }
        if out.len() >= 1024 {
            return Err(Errno::ArgumentListTooLong);
        }
        out.push(read_user_cstr(mem, pgd, VirtAddr::new(ptr), str_max)?);
        slot += 4;
    }
}

/// Core page-by-page access loop: map a window over each touched page,
/// resolve it for the access kind, and hand the chunk to `visit`.
fn access_user(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    va: VirtAddr,
    len: usize,
    write: bool,
    mut visit: impl FnMut(*mut u8, usize, usize),
) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    if !super::in_user_range(va.as_u32(), len as u32) {
        return Err(Errno::Fault);
    }

    let mut offset = 0usize;
    while offset < len {
        let cursor = VirtAddr::new(va.as_u32() + offset as u32);
        let page_rest = (PAGE_SIZE - cursor.page_offset()) as usize;
        let chunk = page_rest.min(len - offset);

        let window = vmem::map_user_window(mem, pgd, cursor, 1)?;
        let resolved = vmem::ensure_resolved(mem, window, 1, write)
            .and_then(|()| vmem::window_ptr(mem, VirtAddr::new(window.as_u32() + cursor.page_offset())));
        match resolved {
            Ok(ptr) => visit(ptr, offset, chunk),
            Err(err) => {
                vmem::unmap_window(mem, window, 1);
                return Err(err.into());
            }
        }
        vmem::unmap_window(mem, window, 1);

        offset += chunk;
    }
    Ok(())
}
