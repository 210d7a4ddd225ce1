//! Page-directory and page-table entry bitfields.

use crate::addr::{Pfn, VirtAddr};
use bitfield_struct::bitfield;
use bitflags::bitflags;

bitflags! {
    /// Flags accepted by the kernel mapping operations
    /// (`mem_upd_vm_area`, `mem_clone_vm_area`, VMA creation).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        /// Entry is present in hardware.
        const PRESENT = 1 << 0;
        /// Writable.
        const RW      = 1 << 1;
        /// Accessible from ring 3.
        const USER    = 1 << 2;
        /// Survives CR3 reloads (kernel mappings).
        const GLOBAL  = 1 << 3;
        /// Copy-on-write / demand-allocated page.
        const COW     = 1 << 4;
        /// `mem_upd_vm_area` only: also assign sequential frame numbers.
        const UPDADDR = 1 << 5;
    }
}

/// A leaf page-table entry (PTE).
///
/// Bits 0-8 are the architectural x86 bits; the three available bits hold
/// the kernel's copy-on-write marker and are otherwise unused.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PtEntry {
    pub present: bool,
    pub rw: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat: bool,
    pub global: bool,
    /// Available bit 9: copy-on-write / demand-zero marker.
    pub kernel_cow: bool,
    #[bits(2)]
    pub available: u8,
    /// Page frame number of the mapped 4 KiB frame.
    #[bits(20)]
    pub frame: u32,
}

/// A page-directory entry (PDE).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PdEntry {
    pub present: bool,
    pub rw: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub reserved: bool,
    /// 4 MiB page when set; always clear in this kernel.
    pub page_size: bool,
    pub global: bool,
    #[bits(3)]
    pub available: u8,
    /// Page frame number of the page table.
    #[bits(20)]
    pub frame: u32,
}

/// Logical content of a leaf entry. See the crate docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPayload {
    /// All-zero entry: the page has never been mapped.
    Empty,
    /// Demand-zero page: no frame yet, materialized on first touch.
    Lazy(PtEntry),
    /// A mapped frame.
    Mapped { pfn: Pfn, entry: PtEntry },
    /// The raw word is the virtual address of another leaf entry.
    AliasOf(VirtAddr),
}

impl PtEntry {
    /// Rewrite the protection bits from `flags`, leaving the frame number
    /// untouched.
    ///
    /// This is the single place mapping flags are translated to hardware
    /// bits, so every mapping path agrees on the encoding.
    pub fn apply_flags(&mut self, flags: MappingFlags) {
        self.set_present(flags.contains(MappingFlags::PRESENT));
        self.set_rw(flags.contains(MappingFlags::RW));
        self.set_user(flags.contains(MappingFlags::USER));
        self.set_global(flags.contains(MappingFlags::GLOBAL));
        self.set_kernel_cow(flags.contains(MappingFlags::COW));
    }

    /// Protection bits of this entry as mapping flags.
    pub fn flags(self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        if self.present() {
            flags |= MappingFlags::PRESENT;
        }
        if self.rw() {
            flags |= MappingFlags::RW;
        }
        if self.user() {
            flags |= MappingFlags::USER;
        }
        if self.global() {
            flags |= MappingFlags::GLOBAL;
        }
        if self.kernel_cow() {
            flags |= MappingFlags::COW;
        }
        flags
    }

    /// Build an alias entry whose payload is the address of `target`,
    /// another leaf entry. Entry addresses are 4-byte aligned, so the
    /// resulting word has present and rw clear; they point into page-table
    /// frames, which live above the first page, so the frame bits of the
    /// word are never all zero. Both facts keep alias words disjoint from
    /// every other payload.
    pub fn alias_to(target: VirtAddr) -> Self {
        debug_assert!(target.as_u32() % 4 == 0);
        debug_assert!(target.as_u32() >= crate::addr::PAGE_SIZE);
        PtEntry::from_bits(target.as_u32())
    }

    /// Decode the logical payload.
    ///
    /// A non-present word with non-zero frame bits can only be an alias
    /// pointer (lazy markers carry no frame; entry addresses always do).
    pub fn decode(self) -> EntryPayload {
        let raw = self.into_bits();
        if raw == 0 {
            return EntryPayload::Empty;
        }
        if !self.present() {
            if self.frame() != 0 {
                return EntryPayload::AliasOf(VirtAddr::new(raw));
            }
            if self.kernel_cow() {
                return EntryPayload::Lazy(self);
            }
            return EntryPayload::Empty;
        }
        EntryPayload::Mapped {
            pfn: Pfn(self.frame()),
            entry: self,
        }
    }
}

impl PdEntry {
    /// Rewrite the flag bits of a directory entry. Directory entries are
    /// always writable so that the leaf bits alone decide protection.
    pub fn apply_flags(&mut self, flags: MappingFlags) {
        self.set_present(true);
        self.set_rw(true);
        self.set_user(flags.contains(MappingFlags::USER));
        self.set_global(flags.contains(MappingFlags::GLOBAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_bit_layout_matches_hardware() {
        let e = PtEntry::new()
            .with_present(true)
            .with_rw(true)
            .with_user(true)
            .with_frame(0xABCDE);
        let raw = e.into_bits();
        assert_eq!(raw & 0x7, 0b111);
        assert_eq!(raw >> 12, 0xABCDE);

        let cow = PtEntry::new().with_kernel_cow(true);
        assert_eq!(cow.into_bits(), 1 << 9);
    }

    #[test]
    fn apply_flags_round_trips() {
        let mut e = PtEntry::new().with_frame(0x42);
        e.apply_flags(MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::USER);
        assert!(e.present() && e.rw() && e.user());
        assert!(!e.global() && !e.kernel_cow());
        assert_eq!(e.frame(), 0x42);
        assert_eq!(
            e.flags(),
            MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::USER
        );

        // Dropping RW keeps the frame but clears the bit.
        e.apply_flags(MappingFlags::PRESENT | MappingFlags::USER | MappingFlags::COW);
        assert!(!e.rw() && e.kernel_cow());
        assert_eq!(e.frame(), 0x42);
    }

    #[test]
    fn payload_decoding() {
        assert_eq!(PtEntry::new().decode(), EntryPayload::Empty);

        let lazy = PtEntry::new().with_kernel_cow(true).with_user(true);
        assert!(matches!(lazy.decode(), EntryPayload::Lazy(_)));

        let mapped = PtEntry::new().with_present(true).with_frame(7);
        assert!(matches!(
            mapped.decode(),
            EntryPayload::Mapped { pfn: Pfn(7), .. }
        ));

        // An alias word is the 4-aligned address of another entry; present
        // and rw fall out as zero, and the frame bits carry the page part
        // of the pointer.
        let alias = PtEntry::alias_to(VirtAddr::new(0x00C0_3F04));
        assert!(!alias.present());
        assert_eq!(
            alias.decode(),
            EntryPayload::AliasOf(VirtAddr::new(0x00C0_3F04))
        );
    }
}
