//! Two-level page-table operations and the page-fault handler.
//!
//! This is the demand-paging core: page tables are allocated lazily while
//! walking, anonymous pages materialize on first touch, and fork shares
//! writable pages copy-on-write through the frame reference counts.
//!
//! All functions operate on an explicit [`PhysicalMemory`] and a page
//! directory frame; nothing here touches globals, which is what lets the
//! whole module run hosted under `cargo test`.

use super::frame::PhysicalMemory;
use super::vmem;
use super::{Gfp, PagingError};
use crate::arch::{TrapFrame, PF_ERR_PRESENT, PF_ERR_USER, PF_ERR_WRITE};
use crate::boot::BootInfo;
use crate::Kernel;
use osmium_abi::Signal;
use osmium_vmem::{
    EntryPayload, MappingFlags, PageDirectory, PageTable, PdIndex, Pfn, PtEntry, PtIndex,
    VirtAddr, VpnRange, PAGE_SIZE,
};

/// Raw pointer to a page-directory frame.
#[inline]
pub(super) fn pgd_ptr(mem: &PhysicalMemory, pgd: Pfn) -> *mut PageDirectory {
    mem.frame_ptr(pgd) as *mut PageDirectory
}

/// Raw pointer to a page-table frame.
#[inline]
pub(super) fn table_ptr(mem: &PhysicalMemory, table: Pfn) -> *mut PageTable {
    mem.frame_ptr(table) as *mut PageTable
}

/// Initialize paging: build the boot page directory, identity-map low
/// memory, install the alias-window region and the signal trampoline.
pub fn init(mem: &mut PhysicalMemory, info: &BootInfo) {
    let main_pgd = mem
        .alloc_table_frame()
        .expect("paging init: no frame for the boot page directory");
    mem.main_pgd = main_pgd;

    // Map the first MiB (BIOS data, VGA text buffer) and the managed RAM
    // window. Both are global so they survive address-space switches.
    let kernel_flags = MappingFlags::PRESENT
        | MappingFlags::RW
        | MappingFlags::GLOBAL
        | MappingFlags::UPDADDR;
    mem_upd_vm_area(mem, main_pgd, VirtAddr::new(0), 0, 0x10_0000, kernel_flags)
        .expect("paging init: failed to map the first MiB");
    mem_upd_vm_area(
        mem,
        main_pgd,
        VirtAddr::new(info.ram_phys_start),
        info.ram_phys_start,
        info.ram_phys_len,
        kernel_flags,
    )
    .expect("paging init: failed to map kernel low memory");

    vmem::init(mem);

    // One shared read-only page of user-visible code: `mov eax, NR_sigreturn;
    // int 0x80`. Every process maps it at SIGRET_TRAMPOLINE.
    let trampoline = mem
        .alloc_page(Gfp::Kernel)
        .expect("paging init: no frame for the signal trampoline");
    mem.zero_frame(trampoline);
    let code: [u8; 7] = {
        let nr = (osmium_abi::Sysno::Sigreturn as u32).to_le_bytes();
        [0xB8, nr[0], nr[1], nr[2], nr[3], 0xCD, 0x80]
    };
    // SAFETY: freshly allocated frame, fully owned.
    unsafe {
        core::ptr::copy_nonoverlapping(code.as_ptr(), mem.frame_ptr(trampoline), code.len());
    }
    mem.trampoline = trampoline;

    crate::arch::write_cr3(main_pgd.phys().as_u32());
    log::info!("paging: boot directory at {:#x}", main_pgd.phys().as_u32());
}

// ─── Directory-entry handling ────────────────────────────────────────────────

/// Resolve the page table behind `pgd[index]`, allocating and installing a
/// zeroed one if the slot is empty.
///
/// Dropping the GLOBAL bit from an existing global directory entry would
/// desynchronize the shared kernel mappings across address spaces, so it
/// panics.
fn ensure_directory(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    index: PdIndex,
    flags: MappingFlags,
) -> Result<Pfn, PagingError> {
    // SAFETY: pgd frames are only reached through the memory lock held by
    // our caller.
    let dir = unsafe { &mut *pgd_ptr(mem, pgd) };
    let entry = &mut dir[index];

    if !entry.present() {
        let table = mem.alloc_table_frame()?;
        // Re-borrow after the allocation touched `mem`.
        let dir = unsafe { &mut *pgd_ptr(mem, pgd) };
        let entry = &mut dir[index];
        entry.set_frame(table.0);
        entry.apply_flags(flags);
        entry.set_accessed(false);
        return Ok(table);
    }

    if entry.global() && !flags.contains(MappingFlags::GLOBAL) {
        panic!("attempted to remove the global flag from a page directory entry");
    }
    if flags.contains(MappingFlags::USER) {
        entry.set_user(true);
    }
    Ok(Pfn(entry.frame()))
}

/// One leaf position yielded by [`PageRangeWalker`].
pub(super) struct LeafRef {
    pub entry: *mut PtEntry,
    pub vpn: u32,
    pub table: Pfn,
    pub index: usize,
}

impl LeafRef {
    #[inline]
    pub fn va(&self) -> VirtAddr {
        VirtAddr::new(self.vpn << 12)
    }

    /// Identity-region address of the entry word itself; this is what an
    /// alias payload stores.
    #[inline]
    pub fn identity_va(&self) -> VirtAddr {
        VirtAddr::new(self.table.phys().as_u32() + (self.index as u32) * 4)
    }
}

/// Iterator over the leaf entries covering a contiguous virtual range,
/// allocating intermediate page tables on first touch. Tables are
/// allocated when the walk crosses into a new directory entry; entries are
/// never removed.
pub(super) struct PageRangeWalker {
    pgd: Pfn,
    range: VpnRange,
    vpn: u32,
    flags: MappingFlags,
    table: Option<Pfn>,
}

impl PageRangeWalker {
    pub fn new(pgd: Pfn, start: VirtAddr, size: u32, flags: MappingFlags) -> Self {
        let range = VpnRange::covering(start, size);
        PageRangeWalker {
            pgd,
            vpn: range.first,
            range,
            flags,
            table: None,
        }
    }

    pub fn next(&mut self, mem: &mut PhysicalMemory) -> Result<Option<LeafRef>, PagingError> {
        if self.vpn >= self.range.last {
            return Ok(None);
        }
        if self.table.is_none() || VpnRange::crosses_directory(self.vpn) {
            let table =
                ensure_directory(mem, self.pgd, PdIndex::from_vpn(self.vpn), self.flags)?;
            self.table = Some(table);
        }
        let table = self.table.unwrap();
        let index = PtIndex::from_vpn(self.vpn).as_usize();
        // SAFETY: the table frame stays allocated for the life of the
        // address space; the pointer targets the RAM window.
        let entry = unsafe {
            core::ptr::addr_of_mut!((*table_ptr(mem, table)).entries_mut()[index])
        };
        let leaf = LeafRef {
            entry,
            vpn: self.vpn,
            table,
            index,
        };
        self.vpn += 1;
        Ok(Some(leaf))
    }
}

// ─── Mapping primitives ──────────────────────────────────────────────────────

/// Establish or update the mapping of `[virt, virt + size)`.
///
/// With `UPDADDR` the leaf entries are pointed at sequential frames
/// starting at `phys`, flushing the TLB per page; without it only the flag
/// bits are rewritten.
pub fn mem_upd_vm_area(
    mem: &mut PhysicalMemory,
    pgd: Pfn,
    virt: VirtAddr,
    phys: u32,
    size: u32,
    flags: MappingFlags,
) -> Result<(), PagingError> {
    let update_addr = flags.contains(MappingFlags::UPDADDR);
    let mut frame = phys >> 12;

    let mut walker = PageRangeWalker::new(pgd, virt, size, flags);
    while let Some(leaf) = walker.next(mem)? {
        // SAFETY: leaf.entry points into a live table frame.
        let entry = unsafe { &mut *leaf.entry };
        if update_addr {
            entry.set_frame(frame);
            frame += 1;
            entry.apply_flags(flags);
            mem.flush_tlb(leaf.va());
        } else {
            entry.apply_flags(flags);
        }
    }
    Ok(())
}

/// Clone the mappings of `[src_va, src_va + size)` in `src_pgd` into
/// `[dst_va, ...)` of `dst_pgd`.
///
/// Two modes share this walk:
///
/// - **`MM_COW` set (fork).** Present writable pages are write-protected
///   on both sides, marked `kernel_cow` and shared with a raised frame
///   refcount; read-only and already-CoW pages are shared as they are;
///   lazy demand-zero entries are copied as independent demand-zero
///   entries (both sides materialize their own zero page, which preserves
///   write isolation).
/// - **`MM_COW` clear (kernel alias windows).** CoW/lazy source entries
///   are not resolved: the destination stores the identity address of the
///   source entry itself and is left non-present, to be chased by the
///   fault handler on first touch. Everything else maps the source frame
///   directly with the window flags.
pub fn mem_clone_vm_area(
    mem: &mut PhysicalMemory,
    src_pgd: Pfn,
    dst_pgd: Pfn,
    src_va: VirtAddr,
    dst_va: VirtAddr,
    size: u32,
    flags: MappingFlags,
) -> Result<(), PagingError> {
    let cow = flags.contains(MappingFlags::COW);
    // GLOBAL is an attribute of the destination mapping; it must not leak
    // into page tables allocated on the source side.
    let src_flags = flags & !MappingFlags::GLOBAL;
    let mut src_walker = PageRangeWalker::new(src_pgd, src_va, size, src_flags);
    let mut dst_walker = PageRangeWalker::new(dst_pgd, dst_va, size, flags);

    loop {
        let Some(src) = src_walker.next(mem)? else { break };
        let Some(dst) = dst_walker.next(mem)? else { break };

        // SAFETY: both entries point into live table frames.
        let src_entry = unsafe { *src.entry };
        match src_entry.decode() {
            EntryPayload::Empty => unsafe {
                *dst.entry = PtEntry::new();
            },
            EntryPayload::Lazy(lazy) => unsafe {
                if cow {
                    *dst.entry = lazy;
                } else {
                    *dst.entry = PtEntry::alias_to(src.identity_va());
                }
            },
            EntryPayload::Mapped { pfn, entry } => {
                if cow {
                    if entry.rw() {
                        let mut shared = entry;
                        shared.set_rw(false);
                        shared.set_kernel_cow(true);
                        // SAFETY: as above.
                        unsafe {
                            *src.entry = shared;
                            *dst.entry = shared;
                        }
                        mem.get_page(pfn);
                        mem.flush_tlb(src.va());
                    } else {
                        // SAFETY: as above.
                        unsafe {
                            *dst.entry = entry;
                        }
                        mem.get_page(pfn);
                    }
                } else if entry.kernel_cow() {
                    // A CoW page must be resolved through its owner's
                    // entry, not mapped around it.
                    // SAFETY: as above.
                    unsafe {
                        *dst.entry = PtEntry::alias_to(src.identity_va());
                    }
                } else {
                    let mut window = PtEntry::new().with_frame(pfn.0);
                    window.apply_flags(flags);
                    // SAFETY: as above.
                    unsafe {
                        *dst.entry = window;
                    }
                    mem.get_page(pfn);
                }
            }
            EntryPayload::AliasOf(_) => return Err(PagingError::CorruptEntry),
        }

        mem.flush_tlb(dst.va());
    }
    Ok(())
}

/// Resolve a virtual address to the descriptor of its backing frame.
///
/// When `size` is given it is clamped to the remaining span of the
/// containing allocation, honoring the buddy order of the head frame.
pub fn mem_virtual_to_page(
    mem: &PhysicalMemory,
    pgd: Pfn,
    va: VirtAddr,
    size: Option<&mut usize>,
) -> Option<Pfn> {
    let entry = leaf_entry(mem, pgd, va)?;
    if !entry.present() {
        return None;
    }
    let pfn = Pfn(entry.frame());
    if !mem.manages(pfn) {
        return None;
    }
    if let Some(size) = size {
        let order = mem.page(pfn).order;
        let span = (1usize << order) * PAGE_SIZE as usize;
        *size = (*size).min(span);
    }
    Some(pfn)
}

/// Read the leaf entry covering `va`, without allocating anything.
pub(super) fn leaf_entry(mem: &PhysicalMemory, pgd: Pfn, va: VirtAddr) -> Option<PtEntry> {
    // SAFETY: directory frames are kept alive by their address space.
    let dir = unsafe { &*pgd_ptr(mem, pgd) };
    let pde = dir[PdIndex::from_va(va)];
    if !pde.present() {
        return None;
    }
    let table = Pfn(pde.frame());
    // SAFETY: as above.
    let table = unsafe { &*table_ptr(mem, table) };
    Some(table[PtIndex::from_va(va)])
}

/// Mutable pointer to the leaf entry covering `va`, without allocating.
pub(super) fn leaf_entry_ptr(
    mem: &PhysicalMemory,
    pgd: Pfn,
    va: VirtAddr,
) -> Option<*mut PtEntry> {
    // SAFETY: as in `leaf_entry`.
    let dir = unsafe { &*pgd_ptr(mem, pgd) };
    let pde = dir[PdIndex::from_va(va)];
    if !pde.present() {
        return None;
    }
    let table = Pfn(pde.frame());
    let index = PtIndex::from_va(va).as_usize();
    // SAFETY: as above.
    Some(unsafe {
        core::ptr::addr_of_mut!((*table_ptr(mem, table)).entries_mut()[index])
    })
}

// ─── Demand-zero and CoW resolution ──────────────────────────────────────────

/// Bring the leaf entry at `entry_ptr` to a state that satisfies the given
/// access, following the fault decision table:
///
/// - lazy entry → allocate a fresh frame, zero it, install it, clear the
///   CoW marker, set present;
/// - present CoW entry, write access → sole owner: clear CoW and restore
///   the write bit (the page is already private); shared: copy into a
///   fresh frame for the writer and drop one reference from the old one;
/// - anything else that cannot satisfy the access → error.
///
/// Returns the frame now backing the page.
pub(super) fn resolve_process_entry(
    mem: &mut PhysicalMemory,
    entry_ptr: *mut PtEntry,
    write: bool,
) -> Result<Pfn, PagingError> {
    // SAFETY: callers hand us a pointer obtained from a live table frame.
    let entry = unsafe { *entry_ptr };
    match entry.decode() {
        EntryPayload::Lazy(lazy) => {
            let pfn = mem.alloc_page(Gfp::HighUser)?;
            vmem::with_frame_window(mem, pfn, |ptr| {
                // SAFETY: the window covers exactly one fresh frame.
                unsafe {
                    core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize);
                }
            })?;
            let mut resolved = lazy;
            resolved.set_frame(pfn.0);
            resolved.set_present(true);
            resolved.set_kernel_cow(false);
            // SAFETY: as above.
            unsafe {
                *entry_ptr = resolved;
            }
            Ok(pfn)
        }
        EntryPayload::Mapped { pfn, entry } => {
            if !write {
                return Ok(pfn);
            }
            if entry.kernel_cow() {
                if mem.refcount(pfn) == 1 {
                    // Already private: no copy needed.
                    let mut private = entry;
                    private.set_kernel_cow(false);
                    private.set_rw(true);
                    // SAFETY: as above.
                    unsafe {
                        *entry_ptr = private;
                    }
                    Ok(pfn)
                } else {
                    let fresh = mem.alloc_page(Gfp::HighUser)?;
                    // SAFETY: distinct frames; both inside the RAM window.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            mem.frame_ptr(pfn),
                            mem.frame_ptr(fresh),
                            PAGE_SIZE as usize,
                        );
                    }
                    let mut private = entry;
                    private.set_frame(fresh.0);
                    private.set_kernel_cow(false);
                    private.set_rw(true);
                    // SAFETY: as above.
                    unsafe {
                        *entry_ptr = private;
                    }
                    mem.put_page(pfn);
                    Ok(fresh)
                }
            } else {
                // Write-protection of user mappings is enforced at the VMA
                // layer (and by the MMU for user-mode stores); a kernel
                // write that lands here is an image load, which is
                // legitimate on pages user mode cannot write.
                Ok(pfn)
            }
        }
        EntryPayload::Empty => Err(PagingError::NotMapped),
        EntryPayload::AliasOf(_) => Err(PagingError::CorruptEntry),
    }
}

// ─── The page-fault handler ──────────────────────────────────────────────────

/// What the fault handler decided to do; returned so tests can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping was repaired; the faulting instruction will retry.
    Resolved,
    /// SIGSEGV was queued on the current task and the scheduler re-entered.
    SegfaultDelivered,
}

/// The page-fault entry point (exception vector 0x0E).
///
/// `fault_va` is the CR2 value read by the arch stub. The error code's low
/// bits encode `{present, write, user}`.
///
/// User faults that cannot be repaired queue SIGSEGV on the current task
/// and re-enter the scheduler; the faulting instruction is not retried in
/// that case. Unrepairable kernel faults panic.
pub fn page_fault_handler(kernel: &Kernel, frame: &mut TrapFrame, fault_va: u32) -> FaultOutcome {
    let err_user = frame.err_code & PF_ERR_USER != 0;
    let err_write = frame.err_code & PF_ERR_WRITE != 0;
    let err_present = frame.err_code & PF_ERR_PRESENT != 0;
    let va = VirtAddr::new(fault_va);

    // Faults inside the alias-window region are kernel-side pointer
    // chases; resolve them against the aliased process entry.
    if vmem::contains(fault_va) {
        let mut mem = kernel.memory.lock();
        return match vmem::resolve_window_fault(&mut mem, va, err_write) {
            Ok(()) => FaultOutcome::Resolved,
            Err(err) => panic!(
                "unresolvable alias-window fault at {:#010x} ({:?})\n{:#x?}",
                fault_va, err, frame
            ),
        };
    }

    if !err_user {
        panic!(
            "kernel page fault at {:#010x} (write={}, present={})\n{:#x?}",
            fault_va, err_write, err_present, frame
        );
    }

    // Decide against the current task's VMA list.
    let verdict = {
        let sched = kernel.sched.lock();
        match sched.current_task() {
            Some(task) => match &task.mm {
                Some(mm) => match mm.vma_containing(va) {
                    Some(vma) if err_write && !vma.flags.contains(MappingFlags::RW) => {
                        Verdict::Segv
                    }
                    Some(_) => Verdict::Resolve { pgd: mm.pgd },
                    None => Verdict::Segv,
                },
                None => Verdict::Segv,
            },
            None => panic!(
                "user page fault with no current task at {:#010x}",
                fault_va
            ),
        }
    };

    if let Verdict::Resolve { pgd } = verdict {
        let mut mem = kernel.memory.lock();
        let repaired = match leaf_entry_ptr(&mem, pgd, va) {
            Some(entry_ptr) => match resolve_process_entry(&mut mem, entry_ptr, err_write) {
                Ok(_) => {
                    mem.flush_tlb(va);
                    true
                }
                Err(PagingError::OutOfMemory) => {
                    // Out of frames on a demand fault: the task dies the
                    // same way an unmapped access would.
                    log::error!("page fault at {:#010x}: out of memory", fault_va);
                    false
                }
                Err(_) => false,
            },
            // Directory entry not present: VMA creation populates the
            // tables eagerly, so this address was never mapped.
            None => false,
        };
        if repaired {
            return FaultOutcome::Resolved;
        }
    }

    log::debug!(
        "SIGSEGV: pid fault at {:#010x} (user={}, write={}, present={})",
        fault_va,
        err_user,
        err_write,
        err_present
    );
    {
        let mut sched = kernel.sched.lock();
        let pid = sched.current_pid().expect("checked above");
        let _ = crate::process::signal::send_signal(&mut sched, pid, Signal::SIGSEGV);
    }
    kernel.schedule(frame);
    FaultOutcome::SegfaultDelivered
}

enum Verdict {
    Segv,
    Resolve { pgd: Pfn },
}
