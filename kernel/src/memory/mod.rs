//! Physical and virtual memory management.
//!
//! Layered bottom-up:
//!
//! - [`frame`]/[`zone`]/[`buddy`] — per-frame descriptors and the zoned
//!   buddy allocator behind [`PhysicalMemory`],
//! - [`paging`] — the two-level page-table walker, mapping/cloning
//!   primitives and the page-fault handler,
//! - [`vmem`] — kernel alias windows onto process pages,
//! - [`vma`] — per-process address spaces (`MemoryDescriptor` + VMA list),
//! - [`userslice`] — bounded user-memory access for syscalls.

pub mod buddy;
pub mod frame;
#[cfg(test)]
mod paging_test;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod heap;
pub mod paging;
pub mod userslice;
pub mod vma;
pub mod vmem;
pub mod zone;

pub use frame::{Page, PhysicalMemory};
pub use osmium_vmem::{MappingFlags, PhysAddr, Pfn, VirtAddr, PAGE_SIZE};
pub use vma::{MemoryDescriptor, Vma};

/// Which frame pool an allocation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gfp {
    /// Kernel structures: page tables, directories. Normal zone only.
    Kernel,
    /// User pages: prefer the high-user zone, fall back to normal.
    HighUser,
}

/// Frame-allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory,
    InvalidOrder,
}

/// Failures of the paging primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    OutOfMemory,
    /// A virtual address was not covered by any mapping.
    NotMapped,
    /// The requested range is not usable (unaligned, busy, or out of user
    /// space).
    InvalidRange,
    /// An entry held a payload that is impossible at that location.
    CorruptEntry,
}

impl From<AllocError> for PagingError {
    fn from(_: AllocError) -> Self {
        PagingError::OutOfMemory
    }
}

// ─── Virtual address-space layout ────────────────────────────────────────────
//
// [0, ram_end)            identity-mapped kernel low memory, GLOBAL
// [USER_SPACE_START, USER_SPACE_END)  per-process user space
// [VMEM_START, +4 MiB)    kernel alias-window region, GLOBAL

/// Lowest user-space virtual address. Kernel low memory (and therefore all
/// managed RAM) must fit below this.
pub const USER_SPACE_START: u32 = 0x0400_0000;

/// Exclusive upper bound of user space.
pub const USER_SPACE_END: u32 = 0xC000_0000;

/// Base address `mmap` starts searching from.
pub const MMAP_BASE: u32 = 0x4000_0000;

/// Top of the user stack (exclusive); the stack grows down from here.
pub const USER_STACK_TOP: u32 = 0xBFFF_E000;

/// Default user stack size for a fresh process image.
pub const DEFAULT_STACK_SIZE: u32 = 256 * 1024;

/// Fixed user address of the shared signal-return trampoline page.
pub const SIGRET_TRAMPOLINE: u32 = 0xBFFF_F000;

#[inline]
pub fn in_user_range(va: u32, len: u32) -> bool {
    va >= USER_SPACE_START
        && va
            .checked_add(len)
            .map(|end| end <= USER_SPACE_END)
            .unwrap_or(false)
}
