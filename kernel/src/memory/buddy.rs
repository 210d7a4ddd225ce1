//! Buddy allocation over the memory zones.
//!
//! Blocks are powers of two frames. Allocation splits the smallest
//! sufficient block; freeing coalesces with the buddy while possible. The
//! buddy of a block is found by XOR on the frame number, which is valid
//! because `rebuild_free_lists` only forms blocks aligned to their size.

use super::frame::PhysicalMemory;
use super::zone::{ZoneKind, MAX_ORDER};
use super::{AllocError, Gfp};
use osmium_vmem::Pfn;

impl PhysicalMemory {
    /// Allocate `2^order` contiguous frames.
    ///
    /// The head frame's descriptor records the order and starts with
    /// refcount 1.
    pub fn alloc_pages(&mut self, gfp: Gfp, order: u8) -> Result<Pfn, AllocError> {
        if order as usize > MAX_ORDER {
            return Err(AllocError::InvalidOrder);
        }

        let preference: &[usize] = match gfp {
            Gfp::Kernel => &[ZoneKind::Normal as usize],
            Gfp::HighUser => &[ZoneKind::HighUser as usize, ZoneKind::Normal as usize],
        };

        for &zi in preference {
            if let Some(head) = self.alloc_from_zone(zi, order) {
                let frames = 1u32 << order;
                for i in 0..frames {
                    let page = self.page_mut(Pfn(head.0 + i));
                    page.free = false;
                    page.refcount = 0;
                    page.order = 0;
                }
                let head_page = self.page_mut(head);
                head_page.refcount = 1;
                head_page.order = order;
                return Ok(head);
            }
        }

        log::error!("alloc_pages: out of memory (order {order})");
        Err(AllocError::OutOfMemory)
    }

    /// Convenience: one frame.
    pub fn alloc_page(&mut self, gfp: Gfp) -> Result<Pfn, AllocError> {
        self.alloc_pages(gfp, 0)
    }

    fn alloc_from_zone(&mut self, zone_idx: usize, order: u8) -> Option<Pfn> {
        let mut found: Option<(u8, Pfn)> = None;
        {
            let zone = &mut self.zones[zone_idx];
            for current in order as usize..=MAX_ORDER {
                if let Some(head) = zone.free_lists[current].pop() {
                    found = Some((current as u8, head));
                    break;
                }
            }
        }

        let (mut current, head) = found?;
        // Split until the block matches the request, returning the upper
        // buddy of every split to its free list.
        while current > order {
            current -= 1;
            let buddy = Pfn(head.0 + (1u32 << current));
            self.page_mut(buddy).order = current;
            self.zones[zone_idx].free_lists[current as usize].push(buddy);
        }
        self.zones[zone_idx].allocated += 1usize << order;
        Some(head)
    }

    /// Return a zero-referenced block to the free lists, coalescing with
    /// its buddy while possible. Called by `put_page` when the refcount
    /// hits zero.
    pub(super) fn release_block(&mut self, head: Pfn) {
        let order = self.page(head).order;
        let zone_idx = Self::zone_index_for_phys(head.phys().as_u32());

        let frames = 1u32 << order;
        for i in 0..frames {
            self.page_mut(Pfn(head.0 + i)).free = true;
        }

        let mut block = head;
        let mut current = order;
        while (current as usize) < MAX_ORDER {
            let buddy = Pfn(block.0 ^ (1u32 << current));
            if !self.manages(buddy)
                || Self::zone_index_for_phys(buddy.phys().as_u32()) != zone_idx
            {
                break;
            }
            let list = &mut self.zones[zone_idx].free_lists[current as usize];
            let Some(pos) = list.iter().position(|&p| p == buddy) else {
                break;
            };
            list.swap_remove(pos);
            if buddy < block {
                block = buddy;
            }
            current += 1;
        }

        self.page_mut(block).order = current;
        self.zones[zone_idx].free_lists[current as usize].push(block);
        self.zones[zone_idx].allocated = self.zones[zone_idx]
            .allocated
            .saturating_sub(1usize << order);
    }

    /// Free an allocated block outright (drops the final reference).
    pub fn free_pages(&mut self, head: Pfn) {
        let remaining = self.put_page(head);
        debug_assert_eq!(remaining, 0, "free_pages with outstanding references");
    }
}
