//! # x86 (32-bit, protected mode) paging structures
//!
//! This crate models the two-level x86 page translation scheme used by the
//! Osmium kernel: 1024 page-directory entries, each covering a 1024-entry
//! page table of 4 KiB pages.
//!
//! It contains no allocation and no privileged instructions — only the
//! typed addresses, the entry bitfields, and the index math — so the whole
//! model is unit-tested on the build host. The kernel supplies the frames
//! the tables live in and performs the actual TLB maintenance.
//!
//! ## Entry payloads
//!
//! A hardware entry is always a plain `u32`. The *logical* content of a leaf
//! entry is one of:
//!
//! - nothing (cleared),
//! - a lazy, demand-zero page (`kernel_cow` set, not present),
//! - a mapped frame with its protection bits,
//! - the virtual address of *another* leaf entry (an alias, used by the
//!   kernel's virtual-alias window region).
//!
//! [`PtEntry::decode`] makes that sum type explicit instead of leaving it
//! implied by bit patterns. Alias payloads exploit the fact that entry
//! addresses are 4-byte aligned, so the present and rw bits of an alias
//! word are naturally zero.

#![no_std]

mod addr;
mod entry;
mod table;

pub use addr::{PhysAddr, Pfn, VirtAddr, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
pub use entry::{EntryPayload, MappingFlags, PdEntry, PtEntry};
pub use table::{PageDirectory, PageTable, PdIndex, PtIndex, VpnRange, ENTRIES_PER_TABLE};
