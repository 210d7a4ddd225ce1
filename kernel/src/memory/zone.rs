// Memory zone bookkeeping for the buddy allocator.

use alloc::vec::Vec;
use osmium_vmem::Pfn;

/// Maximum buddy order (0-10 for 4 KiB to 4 MiB blocks).
pub const MAX_ORDER: usize = 10;

/// Frame pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneKind {
    /// Low physical memory reserved for kernel structures.
    Normal = 0,
    /// Everything above the normal limit, preferred for user pages.
    HighUser = 1,
}

/// One memory zone with per-order free lists.
pub struct Zone {
    pub kind: ZoneKind,
    /// First managed frame of this zone.
    pub base: Option<Pfn>,
    /// Frames accounted to this zone.
    pub page_count: usize,
    /// Currently allocated frames.
    pub allocated: usize,
    /// Free block heads for each order.
    pub free_lists: [Vec<Pfn>; MAX_ORDER + 1],
}

impl Zone {
    pub fn new(kind: ZoneKind) -> Self {
        Zone {
            kind,
            base: None,
            page_count: 0,
            allocated: 0,
            free_lists: Default::default(),
        }
    }

    /// Account one usable frame to this zone during boot scan.
    pub fn account_page(&mut self, pfn: Pfn) {
        match self.base {
            Some(base) if base <= pfn => {}
            _ => self.base = Some(pfn),
        }
        self.page_count += 1;
    }

    /// Frames not currently allocated.
    pub fn available_pages(&self) -> usize {
        self.page_count.saturating_sub(self.allocated)
    }
}
