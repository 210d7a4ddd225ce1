//! Per-process address spaces: the memory descriptor and its VMA list.
//!
//! A `MemoryDescriptor` owns a page directory and an ordered list of
//! virtual memory areas. Invariants:
//!
//! - VMAs are non-overlapping, page-aligned and sorted by start address;
//! - the union of the VMAs is exactly the set of valid user addresses of
//!   the process (the fault handler refuses anything outside);
//! - the descriptor must be released through [`MemoryDescriptor::release`]
//!   before being dropped, since tearing down mappings needs the physical
//!   memory manager.

use super::frame::PhysicalMemory;
use super::paging::{self, leaf_entry_ptr, mem_clone_vm_area, mem_upd_vm_area};
use super::{PagingError, DEFAULT_STACK_SIZE, MMAP_BASE, SIGRET_TRAMPOLINE, USER_SPACE_END,
    USER_SPACE_START, USER_STACK_TOP};
use alloc::vec::Vec;
use osmium_vmem::{MappingFlags, Pfn, PtEntry, VirtAddr, VpnRange, PAGE_SIZE};

/// One contiguous, uniformly-protected user address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: MappingFlags,
}

impl Vma {
    #[inline]
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start <= va && va < self.end
    }
}

/// A per-process address space.
pub struct MemoryDescriptor {
    /// The page directory frame (what CR3 points at when running).
    pub pgd: Pfn,
    /// Sorted, non-overlapping VMA list.
    vmas: Vec<Vma>,

    pub arg_start: u32,
    pub arg_end: u32,
    pub env_start: u32,
    pub env_end: u32,
    pub stack_start: u32,
    pub stack_top: u32,
    pub brk_start: u32,
    pub brk: u32,
    /// Set once [`release`](Self::release) ran; asserted in drop.
    released: bool,
}

impl MemoryDescriptor {
    /// Build a blank address space: global kernel entries shared from the
    /// boot directory, a demand-allocated stack, and the signal trampoline
    /// page.
    pub fn create_blank(mem: &mut PhysicalMemory, stack_size: u32) -> Result<Self, PagingError> {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            (stack_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
        };

        let pgd = mem.alloc_table_frame()?;
        share_global_entries(mem, pgd);

        let mut mm = MemoryDescriptor {
            pgd,
            vmas: Vec::new(),
            arg_start: 0,
            arg_end: 0,
            env_start: 0,
            env_end: 0,
            stack_start: USER_STACK_TOP - stack_size,
            stack_top: USER_STACK_TOP,
            brk_start: 0,
            brk: 0,
            released: false,
        };

        // Stack: anonymous, writable, demand-zero.
        mm.create_vma(
            mem,
            VirtAddr::new(USER_STACK_TOP - stack_size),
            stack_size,
            MappingFlags::RW | MappingFlags::USER,
        )?;

        // The shared signal-return trampoline, read-only.
        let trampoline = mem.trampoline;
        mem_upd_vm_area(
            mem,
            pgd,
            VirtAddr::new(SIGRET_TRAMPOLINE),
            trampoline.phys().as_u32(),
            PAGE_SIZE,
            MappingFlags::PRESENT | MappingFlags::USER | MappingFlags::UPDADDR,
        )?;
        mem.get_page(trampoline);
        mm.insert_vma(Vma {
            start: VirtAddr::new(SIGRET_TRAMPOLINE),
            end: VirtAddr::new(SIGRET_TRAMPOLINE + PAGE_SIZE),
            flags: MappingFlags::PRESENT | MappingFlags::USER,
        });

        Ok(mm)
    }

    /// Copy-on-write clone for fork.
    pub fn clone_cow(&self, mem: &mut PhysicalMemory) -> Result<Self, PagingError> {
        let pgd = mem.alloc_table_frame()?;
        share_global_entries(mem, pgd);

        let mut child = MemoryDescriptor {
            pgd,
            vmas: Vec::new(),
            arg_start: self.arg_start,
            arg_end: self.arg_end,
            env_start: self.env_start,
            env_end: self.env_end,
            stack_start: self.stack_start,
            stack_top: self.stack_top,
            brk_start: self.brk_start,
            brk: self.brk,
            released: false,
        };

        for vma in &self.vmas {
            mem_clone_vm_area(
                mem,
                self.pgd,
                pgd,
                vma.start,
                vma.start,
                vma.len(),
                vma.flags | MappingFlags::COW,
            )?;
            child.vmas.push(*vma);
        }

        Ok(child)
    }

    // ─── VMA list ────────────────────────────────────────────────────────

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    /// The VMA containing `va`, if any.
    pub fn vma_containing(&self, va: VirtAddr) -> Option<&Vma> {
        self.vmas.iter().find(|vma| vma.contains(va))
    }

    /// True when `[start, start + len)` is page-aligned user space free of
    /// existing VMAs.
    pub fn is_range_free(&self, start: VirtAddr, len: u32) -> bool {
        if !start.is_page_aligned() || len == 0 {
            return false;
        }
        if !super::in_user_range(start.as_u32(), len) {
            return false;
        }
        let end = start.as_u32() + len;
        self.vmas
            .iter()
            .all(|vma| vma.end.as_u32() <= start.as_u32() || vma.start.as_u32() >= end)
    }

    /// First-fit search for a free range of `len` bytes at or above the
    /// mmap base.
    pub fn find_free_region(&self, len: u32) -> Option<VirtAddr> {
        let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut candidate = MMAP_BASE.max(USER_SPACE_START);
        for vma in &self.vmas {
            if vma.end.as_u32() <= candidate {
                continue;
            }
            if candidate.checked_add(len)? <= vma.start.as_u32() {
                break;
            }
            candidate = vma.end.as_u32();
        }
        if candidate.checked_add(len)? <= USER_SPACE_END {
            Some(VirtAddr::new(candidate))
        } else {
            None
        }
    }

    fn insert_vma(&mut self, vma: Vma) {
        let at = self
            .vmas
            .iter()
            .position(|v| v.start > vma.start)
            .unwrap_or(self.vmas.len());
        self.vmas.insert(at, vma);
    }

    /// Create an anonymous demand-zero VMA and write its lazy leaf
    /// entries. The range must be free.
    pub fn create_vma(
        &mut self,
        mem: &mut PhysicalMemory,
        start: VirtAddr,
        len: u32,
        prot: MappingFlags,
    ) -> Result<(), PagingError> {
        let len = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        if !self.is_range_free(start, len) {
            return Err(PagingError::InvalidRange);
        }
        let lazy = (prot & (MappingFlags::RW | MappingFlags::USER)) | MappingFlags::COW;
        mem_upd_vm_area(mem, self.pgd, start, 0, len, lazy)?;
        self.insert_vma(Vma {
            start,
            end: VirtAddr::new(start.as_u32() + len),
            flags: prot | MappingFlags::COW,
        });
        Ok(())
    }

    /// Destroy the VMA whose range is exactly `[start, start + len)`.
    ///
    /// Returns `false` when no VMA matches exactly; partial unmaps are not
    /// supported in this design.
    pub fn destroy_vma_exact(
        &mut self,
        mem: &mut PhysicalMemory,
        start: VirtAddr,
        len: u32,
    ) -> bool {
        let Some(at) = self
            .vmas
            .iter()
            .position(|vma| vma.start == start && vma.len() == len)
        else {
            return false;
        };
        let vma = self.vmas.remove(at);
        release_vma_pages(mem, self.pgd, &vma);
        true
    }

    /// Number of leaf entries currently present (backed by a frame) inside
    /// the VMAs of this address space.
    pub fn mapped_page_count(&self, mem: &PhysicalMemory) -> usize {
        let mut count = 0;
        for vma in &self.vmas {
            let range = VpnRange::covering(vma.start, vma.len());
            for vpn in range.first..range.last {
                let va = VirtAddr::new(vpn << 12);
                if let Some(entry) = paging::leaf_entry(mem, self.pgd, va) {
                    if entry.present() {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Tear the whole address space down: drop every frame reference held
    /// by the VMAs, free the user-half page tables and the directory.
    pub fn release(mut self, mem: &mut PhysicalMemory) {
        let vmas = core::mem::take(&mut self.vmas);
        for vma in &vmas {
            release_vma_pages(mem, self.pgd, vma);
        }

        // Free user-half page tables; global (kernel) entries are shared
        // with the boot directory and stay.
        // SAFETY: the directory frame is still allocated.
        let dir = unsafe { &mut *paging::pgd_ptr(mem, self.pgd) };
        let mut tables = Vec::new();
        for index in 0..osmium_vmem::ENTRIES_PER_TABLE {
            let pde = dir.entries()[index];
            if pde.present() && !pde.global() {
                tables.push(Pfn(pde.frame()));
            }
        }
        for table in tables {
            mem.put_page(table);
        }
        mem.put_page(self.pgd);
        self.released = true;
    }
}

impl Drop for MemoryDescriptor {
    fn drop(&mut self) {
        debug_assert!(
            self.released,
            "MemoryDescriptor dropped without release(); frames leaked"
        );
    }
}

/// Copy the global (kernel) directory entries of the boot directory into a
/// fresh one, so kernel mappings are visible in every address space.
fn share_global_entries(mem: &mut PhysicalMemory, pgd: Pfn) {
    let main = mem.main_pgd;
    // SAFETY: both directory frames are live; entries are copied by value.
    unsafe {
        let src = &*paging::pgd_ptr(mem, main);
        let dst = &mut *paging::pgd_ptr(mem, pgd);
        for index in 0..osmium_vmem::ENTRIES_PER_TABLE {
            let pde = src.entries()[index];
            if pde.present() && pde.global() {
                dst.entries_mut()[index] = pde;
            }
        }
    }
}

/// Drop the frame references of every present leaf inside a VMA and clear
/// the entries.
fn release_vma_pages(mem: &mut PhysicalMemory, pgd: Pfn, vma: &Vma) {
    let range = VpnRange::covering(vma.start, vma.len());
    for vpn in range.first..range.last {
        let va = VirtAddr::new(vpn << 12);
        let Some(entry_ptr) = leaf_entry_ptr(mem, pgd, va) else {
            continue;
        };
        // SAFETY: leaf pointers target live table frames.
        let entry = unsafe { *entry_ptr };
        if entry.present() {
            mem.put_page(Pfn(entry.frame()));
        }
        // SAFETY: as above.
        unsafe {
            *entry_ptr = PtEntry::new();
        }
        mem.flush_tlb(va);
    }
}
