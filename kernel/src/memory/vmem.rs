//! Kernel alias windows onto process pages.
//!
//! The window region is one globally-shared page table mapped at
//! [`VMEM_START`] in every address space. A window over a process range is
//! built with `mem_clone_vm_area`: present non-CoW pages are mapped
//! directly, while CoW and demand-zero entries leave an alias payload — the
//! identity address of the process entry itself — to be chased on first
//! touch. Chasing resolves the process entry (materializing or splitting
//! the page as the access requires) and copies the frame back into the
//! window entry.
//!
//! A window must not outlive the address space it aliases; every user is a
//! single kernel operation that unmaps before returning.

use super::frame::{PhysicalMemory, VmemRegion};
use super::paging::{self, resolve_process_entry};
use super::PagingError;
use osmium_vmem::{
    EntryPayload, MappingFlags, Pfn, PtEntry, PtIndex, VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE,
};

/// Base of the alias-window region.
pub const VMEM_START: u32 = 0xC000_0000;
/// Window slots available (one shared page table).
pub const VMEM_PAGES: usize = ENTRIES_PER_TABLE;

/// True when `va` falls inside the window region.
#[inline]
pub fn contains(va: u32) -> bool {
    va >= VMEM_START && va < VMEM_START + (VMEM_PAGES as u32) * PAGE_SIZE
}

/// Install the window region: one table frame whose directory entry is
/// global, so every later page directory inherits it.
pub(super) fn init(mem: &mut PhysicalMemory) {
    let table = mem
        .alloc_table_frame()
        .expect("vmem init: no frame for the window table");

    let main = mem.main_pgd;
    // SAFETY: the boot directory frame is live; we hold the memory lock's
    // owner exclusively during init.
    let dir = unsafe { &mut *paging::pgd_ptr(mem, main) };
    let index = osmium_vmem::PdIndex::from_va(VirtAddr::new(VMEM_START));
    let pde = &mut dir[index];
    pde.set_frame(table.0);
    pde.apply_flags(MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::GLOBAL);

    mem.vmem = Some(VmemRegion {
        table,
        bitmap: [0; 32],
    });
}

fn region(mem: &PhysicalMemory) -> &VmemRegion {
    mem.vmem.as_ref().expect("vmem used before init")
}

fn slot_of(va: VirtAddr) -> usize {
    PtIndex::from_va(va).as_usize()
}

/// Pointer to a window entry.
fn window_entry_ptr(mem: &PhysicalMemory, va: VirtAddr) -> *mut PtEntry {
    debug_assert!(contains(va.as_u32()));
    let table = region(mem).table;
    let index = slot_of(va);
    // SAFETY: the window table frame lives as long as the manager.
    unsafe {
        core::ptr::addr_of_mut!(
            (*paging::table_ptr(mem, table)).entries_mut()[index]
        )
    }
}

/// Find `count` consecutive free slots and mark them used.
fn alloc_slots(mem: &mut PhysicalMemory, count: usize) -> Result<usize, PagingError> {
    let vmem = mem.vmem.as_mut().expect("vmem used before init");
    let mut run = 0usize;
    for slot in 0..VMEM_PAGES {
        let used = vmem.bitmap[slot / 32] & (1 << (slot % 32)) != 0;
        run = if used { 0 } else { run + 1 };
        if run == count {
            let first = slot + 1 - count;
            for s in first..=slot {
                vmem.bitmap[s / 32] |= 1 << (s % 32);
            }
            return Ok(first);
        }
    }
    Err(PagingError::OutOfMemory)
}

fn free_slots(mem: &mut PhysicalMemory, first: usize, count: usize) {
    let vmem = mem.vmem.as_mut().expect("vmem used before init");
    for s in first..first + count {
        vmem.bitmap[s / 32] &= !(1 << (s % 32));
    }
}

/// Map a window over `count` pages of `pgd` starting at `src_va`.
///
/// Returns the window base address. Entries referencing CoW or lazy
/// process pages stay unresolved until touched (or until
/// [`ensure_resolved`]).
pub fn map_user_window(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    src_va: VirtAddr,
    count: usize,
) -> Result<VirtAddr, PagingError> {
    let first = alloc_slots(mem, count)?;
    let window_va = VirtAddr::new(VMEM_START + (first as u32) * PAGE_SIZE);
    let window_flags = MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::GLOBAL;
    let main_pgd = mem.main_pgd;
    let result = paging::mem_clone_vm_area(
        mem,
        pgd,
        main_pgd,
        src_va.align_down(),
        window_va,
        (count as u32) * PAGE_SIZE,
        window_flags,
    );
    if let Err(err) = result {
        free_slots(mem, first, count);
        return Err(err);
    }
    Ok(window_va)
}

/// Tear a window down, dropping the frame references it took.
pub fn unmap_window(mem: &mut PhysicalMemory, window_va: VirtAddr, count: usize) {
    let first = slot_of(window_va);
    for i in 0..count {
        let va = VirtAddr::new(window_va.as_u32() + (i as u32) * PAGE_SIZE);
        let entry_ptr = window_entry_ptr(mem, va);
        // SAFETY: window entries live in the window table frame.
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
    free_slots(mem, first, count);
}

/// Resolve one faulting window entry: chase the alias to the process
/// entry, bring that entry to a state satisfying the access, then copy the
/// frame and flags back into the window.
pub fn resolve_window_fault(
    mem: &mut PhysicalMemory,
    fault_va: VirtAddr,
    write: bool,
) -> Result<(), PagingError> {
    let entry_ptr = window_entry_ptr(mem, fault_va.align_down());
    // SAFETY: window entries live in the window table frame.
    let entry = unsafe { *entry_ptr };
    match entry.decode() {
        EntryPayload::AliasOf(target) => {
            let target_ptr = mem.identity_ptr(target) as *mut PtEntry;
            let pfn = resolve_process_entry(mem, target_ptr, write)?;
            let mut window = PtEntry::new().with_frame(pfn.0);
            window.apply_flags(MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::GLOBAL);
            // SAFETY: as above.
            unsafe {
                *entry_ptr = window;
            }
            mem.get_page(pfn);
            mem.flush_tlb(fault_va.align_down());
            Ok(())
        }
        // Already resolved (spurious fault or double resolve): nothing to
        // do beyond refreshing the TLB.
        EntryPayload::Mapped { .. } => {
            mem.flush_tlb(fault_va.align_down());
            Ok(())
        }
        EntryPayload::Empty | EntryPayload::Lazy(_) => Err(PagingError::CorruptEntry),
    }
}

/// Resolve every entry of a window up front. The hosted kernel cannot take
/// real faults on window touches, so callers resolve eagerly; on hardware
/// this simply pre-faults the window.
pub fn ensure_resolved(
    mem: &mut PhysicalMemory,
    window_va: VirtAddr,
    count: usize,
    write: bool,
) -> Result<(), PagingError> {
    for i in 0..count {
        let va = VirtAddr::new(window_va.as_u32() + (i as u32) * PAGE_SIZE);
        let entry_ptr = window_entry_ptr(mem, va);
        // SAFETY: window entries live in the window table frame.
        let entry = unsafe { *entry_ptr };
        match entry.decode() {
            EntryPayload::Mapped { .. } => {}
            EntryPayload::AliasOf(_) => resolve_window_fault(mem, va, write)?,
            EntryPayload::Empty | EntryPayload::Lazy(_) => return Err(PagingError::NotMapped),
        }
    }
    Ok(())
}

/// Kernel pointer to the frame behind a resolved window page.
pub fn window_ptr(mem: &PhysicalMemory, va: VirtAddr) -> Result<*mut u8, PagingError> {
    let entry_ptr = window_entry_ptr(mem, va.align_down());
    // SAFETY: window entries live in the window table frame.
    let entry = unsafe { *entry_ptr };
    if !entry.present() {
        return Err(PagingError::NotMapped);
    }
    let base = mem.frame_ptr(Pfn(entry.frame()));
    // SAFETY: offset stays within one frame.
    Ok(unsafe { base.add(va.page_offset() as usize) })
}

/// Short-lived window over a single raw frame.
///
/// Frame contents are always touched through an explicit mapping like this
/// one, never through ad-hoc pointer arithmetic scattered around the
/// kernel; the window pins the frame with a reference for its lifetime.
pub fn with_frame_window<R>(
    mem: &mut PhysicalMemory,
    pfn: Pfn,
    f: impl FnOnce(*mut u8) -> R,
) -> Result<R, PagingError> {
    let first = alloc_slots(mem, 1)?;
    let va = VirtAddr::new(VMEM_START + (first as u32) * PAGE_SIZE);
    let entry_ptr = window_entry_ptr(mem, va);
    let mut entry = PtEntry::new().with_frame(pfn.0);
    entry.apply_flags(MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::GLOBAL);
    // SAFETY: window entries live in the window table frame.
    unsafe {
        *entry_ptr = entry;
    }
    mem.get_page(pfn);
    mem.flush_tlb(va);

    let result = f(mem.frame_ptr(pfn));

    // SAFETY: as above.
    unsafe {
        *entry_ptr = PtEntry::new();
    }
    mem.put_page(pfn);
    mem.flush_tlb(va);
    free_slots(mem, first, 1);
    Ok(result)
}
