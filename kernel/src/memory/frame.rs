//! Per-frame descriptors and the physical-memory manager.
//!
//! One [`Page`] descriptor exists per frame of the managed RAM window,
//! built once from the bootloader memory map. The descriptors carry the
//! reference counts the CoW machinery lives on; the zoned buddy allocator
//! in [`buddy`](super::buddy) hands frames out.

use super::zone::{Zone, ZoneKind, MAX_ORDER};
use super::{AllocError, Gfp};
use crate::boot::{BootInfo, MemoryKind};
use alloc::vec::Vec;
use osmium_vmem::{PhysAddr, Pfn, VirtAddr, PAGE_SIZE};

/// Physical boundary between the normal (kernel) and high-user pools.
const NORMAL_ZONE_LIMIT: u32 = 0x0080_0000; // 8 MiB

/// Descriptor of one physical frame.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Users of this frame. A freshly allocated frame starts at 1.
    pub refcount: u32,
    /// Buddy order of the allocation this frame heads (head frame only).
    pub order: u8,
    /// Whether the frame currently belongs to the buddy free lists.
    pub free: bool,
}

/// State of the kernel alias-window region; see [`super::vmem`].
pub(super) struct VmemRegion {
    /// The single page table backing the window region, shared globally.
    pub table: Pfn,
    /// One bit per window slot.
    pub bitmap: [u32; 32],
}

/// The physical-memory manager: frame descriptors, buddy zones, and the
/// boot-provided RAM window through which frame contents are reached.
pub struct PhysicalMemory {
    ram_base: *mut u8,
    ram_phys_start: u32,
    ram_phys_len: u32,

    pages: Vec<Page>,
    pub(super) zones: [Zone; 2],

    /// The boot page directory; every process directory shares its global
    /// entries.
    pub main_pgd: Pfn,
    /// Frame holding the signal-return trampoline code.
    pub trampoline: Pfn,
    pub(super) vmem: Option<VmemRegion>,

    /// Single-page TLB invalidations issued through this manager.
    pub tlb_flushes: u64,
}

// SAFETY: the RAM window is owned exclusively by this manager, which is
// itself used behind a SpinLock.
unsafe impl Send for PhysicalMemory {}

impl PhysicalMemory {
    /// Build descriptors and buddy zones from the boot memory map.
    ///
    /// Frames overlapping the kernel image or a reserved region are born
    /// allocated with refcount 1 and never enter the free lists.
    pub fn new(info: &BootInfo) -> Self {
        assert!(
            info.ram_phys_start + info.ram_phys_len <= super::USER_SPACE_START,
            "managed RAM must fit below the user address space"
        );

        let frame_count = (info.ram_phys_len / PAGE_SIZE) as usize;
        let mut pages = Vec::new();
        pages.resize(
            frame_count,
            Page {
                refcount: 1,
                order: 0,
                free: false,
            },
        );

        let mut zones = [Zone::new(ZoneKind::Normal), Zone::new(ZoneKind::HighUser)];

        let mut memory = PhysicalMemory {
            ram_base: info.ram_base,
            ram_phys_start: info.ram_phys_start,
            ram_phys_len: info.ram_phys_len,
            pages: Vec::new(),
            zones: [Zone::new(ZoneKind::Normal), Zone::new(ZoneKind::HighUser)],
            main_pgd: Pfn(0),
            trampoline: Pfn(0),
            vmem: None,
            tlb_flushes: 0,
        };

        // Feed every free frame that is not part of the kernel image into
        // its zone.
        for region in info.regions {
            if region.kind != MemoryKind::Free {
                continue;
            }
            let first = region.start.max(info.ram_phys_start);
            let last = (region.start.saturating_add(region.len))
                .min(info.ram_phys_start + info.ram_phys_len);
            let mut phys = (first + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            while phys + PAGE_SIZE <= last {
                let overlaps_kernel =
                    phys + PAGE_SIZE > info.kernel_phys_start && phys < info.kernel_phys_end;
                if !overlaps_kernel {
                    let pfn = PhysAddr::new(phys).pfn();
                    let idx = memory.page_index_for(pfn);
                    pages[idx].refcount = 0;
                    pages[idx].free = true;
                    let zone = &mut zones[Self::zone_index_for_phys(phys)];
                    zone.account_page(pfn);
                }
                phys += PAGE_SIZE;
            }
        }

        memory.pages = pages;
        memory.zones = zones;
        memory.rebuild_free_lists();

        log::info!(
            "physical memory: {} frames managed ({} KiB), normal/high split at {:#x}",
            frame_count,
            info.ram_phys_len / 1024,
            NORMAL_ZONE_LIMIT
        );

        memory
    }

    /// Re-derive the buddy free lists from the descriptor `free` flags,
    /// coalescing adjacent frames into the largest aligned blocks.
    fn rebuild_free_lists(&mut self) {
        let start_pfn = PhysAddr::new(self.ram_phys_start).pfn().0;
        let end_pfn = start_pfn + self.pages.len() as u32;

        let mut pfn = start_pfn;
        while pfn < end_pfn {
            if !self.page(Pfn(pfn)).free {
                pfn += 1;
                continue;
            }
            // Grow the block while alignment holds and pages stay free.
            let mut order = 0u8;
            loop {
                let next = order + 1;
                let span = 1u32 << next;
                if next as usize > MAX_ORDER || pfn % span != 0 || pfn + span > end_pfn {
                    break;
                }
                let all_free =
                    (pfn..pfn + span).all(|p| self.page(Pfn(p)).free);
                if !all_free {
                    break;
                }
                order = next;
            }
            let head = Pfn(pfn);
            self.page_mut(head).order = order;
            let zone = &mut self.zones[Self::zone_index_for_phys(head.phys().as_u32())];
            zone.free_lists[order as usize].push(head);
            pfn += 1 << order;
        }
    }

    #[inline]
    pub(super) fn zone_index_for_phys(phys: u32) -> usize {
        if phys < NORMAL_ZONE_LIMIT {
            ZoneKind::Normal as usize
        } else {
            ZoneKind::HighUser as usize
        }
    }

    #[inline]
    fn page_index_for(&self, pfn: Pfn) -> usize {
        (pfn.0 - PhysAddr::new(self.ram_phys_start).pfn().0) as usize
    }

    /// True when `pfn` lies inside the managed window.
    pub fn manages(&self, pfn: Pfn) -> bool {
        let phys = pfn.phys().as_u32();
        phys >= self.ram_phys_start && phys < self.ram_phys_start + self.ram_phys_len
    }

    /// Descriptor of a managed frame.
    pub fn page(&self, pfn: Pfn) -> &Page {
        let idx = self.page_index_for(pfn);
        &self.pages[idx]
    }

    /// Descriptor lookup by physical address.
    pub fn page_of_phys(&self, phys: PhysAddr) -> Option<&Page> {
        let pfn = phys.pfn();
        if self.manages(pfn) {
            Some(self.page(pfn))
        } else {
            None
        }
    }

    pub fn page_mut(&mut self, pfn: Pfn) -> &mut Page {
        let idx = self.page_index_for(pfn);
        &mut self.pages[idx]
    }

    /// Raise the reference count of a frame.
    pub fn get_page(&mut self, pfn: Pfn) {
        let page = self.page_mut(pfn);
        debug_assert!(!page.free, "get_page on a free frame");
        page.refcount += 1;
    }

    /// Drop one reference; the frame returns to the buddy lists at zero.
    /// Returns the remaining count.
    pub fn put_page(&mut self, pfn: Pfn) -> u32 {
        let page = self.page_mut(pfn);
        debug_assert!(page.refcount > 0, "put_page on an unreferenced frame");
        page.refcount -= 1;
        let remaining = page.refcount;
        if remaining == 0 {
            self.release_block(pfn);
        }
        remaining
    }

    pub fn refcount(&self, pfn: Pfn) -> u32 {
        self.page(pfn).refcount
    }

    /// Kernel-accessible pointer to the frame contents.
    ///
    /// The window covers all managed RAM: on hardware it is the
    /// identity-mapped low region, in the hosted machine a heap arena.
    #[inline]
    pub fn frame_ptr(&self, pfn: Pfn) -> *mut u8 {
        debug_assert!(self.manages(pfn));
        let offset = pfn.phys().as_u32() - self.ram_phys_start;
        // SAFETY: bounds asserted above; the window is exclusively ours.
        unsafe { self.ram_base.add(offset as usize) }
    }

    /// Kernel-virtual address of a frame in the identity-mapped region
    /// (the `virt_of` contract of the allocator).
    #[inline]
    pub fn virt_of(&self, pfn: Pfn) -> VirtAddr {
        VirtAddr::new(pfn.phys().as_u32())
    }

    /// Translate an identity-region virtual address back into a window
    /// pointer. Alias payloads are stored in this form.
    #[inline]
    pub fn identity_ptr(&self, va: VirtAddr) -> *mut u8 {
        let phys = va.as_u32();
        debug_assert!(
            phys >= self.ram_phys_start && phys < self.ram_phys_start + self.ram_phys_len
        );
        let offset = phys - self.ram_phys_start;
        // SAFETY: bounds asserted above.
        unsafe { self.ram_base.add(offset as usize) }
    }

    /// Fill a frame with zeroes.
    pub fn zero_frame(&mut self, pfn: Pfn) {
        // SAFETY: frame_ptr covers exactly one frame.
        unsafe {
            core::ptr::write_bytes(self.frame_ptr(pfn), 0, PAGE_SIZE as usize);
        }
    }

    /// Invalidate the TLB entry for one virtual address.
    #[inline]
    pub fn flush_tlb(&mut self, va: VirtAddr) {
        crate::arch::flush_tlb_single(va.as_u32());
        self.tlb_flushes += 1;
    }

    /// Total free frames across zones.
    pub fn free_frames(&self) -> usize {
        self.zones.iter().map(|z| z.available_pages()).sum()
    }

    /// Allocate one frame, zeroed, from the kernel pool. Used for page
    /// directories and tables.
    pub fn alloc_table_frame(&mut self) -> Result<Pfn, AllocError> {
        let pfn = self.alloc_pages(Gfp::Kernel, 0)?;
        self.zero_frame(pfn);
        Ok(pfn)
    }
}
