//! Hosted tests for the paging primitives: mapping, CoW cloning, demand
//! paging, alias windows, and the fault decision table.

use super::frame::PhysicalMemory;
use super::paging::{
    leaf_entry, mem_clone_vm_area, mem_upd_vm_area, mem_virtual_to_page, resolve_process_entry,
};
use super::userslice::{copy_from_user, copy_to_user};
use super::vma::MemoryDescriptor;
use super::{vmem, Gfp, PagingError};
use crate::selftest;
use osmium_vmem::{EntryPayload, MappingFlags, Pfn, VirtAddr, PAGE_SIZE};

fn machine() -> PhysicalMemory {
    let mut mem = PhysicalMemory::new(selftest::boot_info());
    super::paging::init(&mut mem, selftest::boot_info());
    mem
}

fn blank_mm(mem: &mut PhysicalMemory) -> MemoryDescriptor {
    MemoryDescriptor::create_blank(mem, super::DEFAULT_STACK_SIZE).unwrap()
}

const USER_VA: u32 = 0x0804_8000;

#[test]
fn upd_vm_area_assigns_sequential_frames() {
    let mut mem = machine();
    let mm = blank_mm(&mut mem);
    let phys = mem.alloc_pages(Gfp::HighUser, 2).unwrap().phys();

    mem_upd_vm_area(
        &mut mem,
        mm.pgd,
        VirtAddr::new(USER_VA),
        phys.as_u32(),
        4 * PAGE_SIZE,
        MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::USER | MappingFlags::UPDADDR,
    )
    .unwrap();

    for i in 0..4 {
        let entry = leaf_entry(&mem, mm.pgd, VirtAddr::new(USER_VA + i * PAGE_SIZE)).unwrap();
        assert!(entry.present() && entry.rw() && entry.user());
        assert_eq!(entry.frame(), phys.pfn().0 + i);
    }
    mm.release(&mut mem);
}

#[test]
fn upd_without_updaddr_rewrites_flags_only() {
    let mut mem = machine();
    let mm = blank_mm(&mut mem);
    let frame = mem.alloc_page(Gfp::HighUser).unwrap();

    mem_upd_vm_area(
        &mut mem,
        mm.pgd,
        VirtAddr::new(USER_VA),
        frame.phys().as_u32(),
        PAGE_SIZE,
        MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::USER | MappingFlags::UPDADDR,
    )
    .unwrap();

    // Drop the write bit without touching the frame.
    mem_upd_vm_area(
        &mut mem,
        mm.pgd,
        VirtAddr::new(USER_VA),
        0,
        PAGE_SIZE,
        MappingFlags::PRESENT | MappingFlags::USER,
    )
    .unwrap();

    let entry = leaf_entry(&mem, mm.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert!(entry.present() && !entry.rw());
    assert_eq!(entry.frame(), frame.0);
    mm.release(&mut mem);
}

#[test]
#[should_panic(expected = "global flag")]
fn dropping_global_from_directory_entry_panics() {
    let mut mem = machine();
    let main = mem.main_pgd;
    // The identity region's directory entries are global; re-walking them
    // without GLOBAL must panic.
    let _ = mem_upd_vm_area(
        &mut mem,
        main,
        VirtAddr::new(0),
        0,
        PAGE_SIZE,
        MappingFlags::PRESENT | MappingFlags::RW,
    );
}

#[test]
fn demand_zero_materializes_on_touch() {
    let mut mem = machine();
    let mut mm = blank_mm(&mut mem);
    mm.create_vma(
        &mut mem,
        VirtAddr::new(USER_VA),
        PAGE_SIZE,
        MappingFlags::RW | MappingFlags::USER,
    )
    .unwrap();

    let entry = leaf_entry(&mem, mm.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert!(matches!(entry.decode(), EntryPayload::Lazy(_)));

    let ptr = super::paging::leaf_entry_ptr(&mem, mm.pgd, VirtAddr::new(USER_VA)).unwrap();
    let pfn = resolve_process_entry(&mut mem, ptr, true).unwrap();
    assert_eq!(mem.refcount(pfn), 1);

    let entry = leaf_entry(&mem, mm.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert!(entry.present());
    assert!(!entry.kernel_cow(), "CoW marker cleared after materialize");

    // The fresh frame is zeroed.
    let mut buf = [0xAAu8; 8];
    copy_from_user(&mut mem, mm.pgd, VirtAddr::new(USER_VA), &mut buf).unwrap();
    assert_eq!(buf, [0u8; 8]);
    mm.release(&mut mem);
}

#[test]
fn cow_clone_write_isolation() {
    let mut mem = machine();
    let mut parent = blank_mm(&mut mem);
    parent
        .create_vma(
            &mut mem,
            VirtAddr::new(USER_VA),
            PAGE_SIZE,
            MappingFlags::RW | MappingFlags::USER,
        )
        .unwrap();

    copy_to_user(&mut mem, parent.pgd, VirtAddr::new(USER_VA), b"original").unwrap();
    let child = parent.clone_cow(&mut mem).unwrap();

    // Shared and write-protected on both sides.
    let p = leaf_entry(&mem, parent.pgd, VirtAddr::new(USER_VA)).unwrap();
    let c = leaf_entry(&mem, child.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert_eq!(p.frame(), c.frame());
    assert!(p.kernel_cow() && c.kernel_cow());
    assert!(!p.rw() && !c.rw());
    assert_eq!(mem.refcount(Pfn(p.frame())), 2);

    // Parent writes: it gets a fresh frame, the child's mapping and bytes
    // are untouched.
    copy_to_user(&mut mem, parent.pgd, VirtAddr::new(USER_VA), b"X").unwrap();

    let p_after = leaf_entry(&mem, parent.pgd, VirtAddr::new(USER_VA)).unwrap();
    let c_after = leaf_entry(&mem, child.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert_ne!(p_after.frame(), c_after.frame());
    assert_eq!(c_after.frame(), c.frame());

    let mut parent_buf = [0u8; 8];
    let mut child_buf = [0u8; 8];
    copy_from_user(&mut mem, parent.pgd, VirtAddr::new(USER_VA), &mut parent_buf).unwrap();
    copy_from_user(&mut mem, child.pgd, VirtAddr::new(USER_VA), &mut child_buf).unwrap();
    assert_eq!(&parent_buf[..1], b"X");
    assert_eq!(&child_buf[..8], b"original");

    // The child is now the sole owner; its next write just flips the
    // bits, no copy.
    copy_to_user(&mut mem, child.pgd, VirtAddr::new(USER_VA), b"Y").unwrap();
    let c_final = leaf_entry(&mem, child.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert_eq!(c_final.frame(), c.frame());
    assert!(c_final.rw() && !c_final.kernel_cow());

    parent.release(&mut mem);
    child.release(&mut mem);
}

#[test]
fn lazy_pages_clone_as_independent_demand_zero() {
    let mut mem = machine();
    let mut parent = blank_mm(&mut mem);
    parent
        .create_vma(
            &mut mem,
            VirtAddr::new(USER_VA),
            PAGE_SIZE,
            MappingFlags::RW | MappingFlags::USER,
        )
        .unwrap();

    // Never touched before the clone: both sides stay lazy.
    let child = parent.clone_cow(&mut mem).unwrap();
    let c = leaf_entry(&mem, child.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert!(matches!(c.decode(), EntryPayload::Lazy(_)));

    // Parent writes after the fork; the child still reads zeroes.
    copy_to_user(&mut mem, parent.pgd, VirtAddr::new(USER_VA), b"post-fork").unwrap();
    let mut buf = [0xAAu8; 4];
    copy_from_user(&mut mem, child.pgd, VirtAddr::new(USER_VA), &mut buf).unwrap();
    assert_eq!(buf, [0u8; 4]);

    parent.release(&mut mem);
    child.release(&mut mem);
}

#[test]
fn alias_window_chases_into_the_source_entry() {
    let mut mem = machine();
    let mut mm = blank_mm(&mut mem);
    mm.create_vma(
        &mut mem,
        VirtAddr::new(USER_VA),
        PAGE_SIZE,
        MappingFlags::RW | MappingFlags::USER,
    )
    .unwrap();

    // A window over a lazy page stores the address of the process entry.
    let window = vmem::map_user_window(&mut mem, mm.pgd, VirtAddr::new(USER_VA), 1).unwrap();
    let window_entry = {
        let ptr = super::paging::leaf_entry_ptr(&mem, mem.main_pgd, window).unwrap();
        // SAFETY: window entries live in the shared vmem table.
        unsafe { *ptr }
    };
    let source_ptr = super::paging::leaf_entry_ptr(&mem, mm.pgd, VirtAddr::new(USER_VA)).unwrap();
    match window_entry.decode() {
        EntryPayload::AliasOf(target) => {
            assert_eq!(mem.identity_ptr(target) as *const _, source_ptr as *const _);
        }
        other => panic!("expected an alias payload, got {:?}", other),
    }

    // Chasing the alias materializes the source entry and copies the
    // frame back into the window.
    vmem::resolve_window_fault(&mut mem, window, true).unwrap();
    let source = leaf_entry(&mem, mm.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert!(source.present());
    let resolved = {
        let ptr = super::paging::leaf_entry_ptr(&mem, mem.main_pgd, window).unwrap();
        unsafe { *ptr }
    };
    assert!(resolved.present());
    assert_eq!(resolved.frame(), source.frame());
    // Window and process each hold a reference.
    assert_eq!(mem.refcount(Pfn(source.frame())), 2);

    vmem::unmap_window(&mut mem, window, 1);
    assert_eq!(mem.refcount(Pfn(source.frame())), 1);
    mm.release(&mut mem);
}

#[test]
fn virtual_to_page_clamps_to_allocation_span() {
    let mut mem = machine();
    let mm = blank_mm(&mut mem);
    let block = mem.alloc_pages(Gfp::HighUser, 1).unwrap(); // 2 frames

    mem_upd_vm_area(
        &mut mem,
        mm.pgd,
        VirtAddr::new(USER_VA),
        block.phys().as_u32(),
        2 * PAGE_SIZE,
        MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::USER | MappingFlags::UPDADDR,
    )
    .unwrap();

    let mut size = usize::MAX;
    let pfn = mem_virtual_to_page(&mem, mm.pgd, VirtAddr::new(USER_VA), Some(&mut size)).unwrap();
    assert_eq!(pfn, block);
    assert_eq!(size, 2 * PAGE_SIZE as usize);

    let mut small = 100usize;
    mem_virtual_to_page(&mem, mm.pgd, VirtAddr::new(USER_VA), Some(&mut small)).unwrap();
    assert_eq!(small, 100);

    assert!(mem_virtual_to_page(&mem, mm.pgd, VirtAddr::new(0x7000_0000), None).is_none());
    mm.release(&mut mem);
}

#[test]
fn clone_between_descriptors_shares_read_only_text() {
    let mut mem = machine();
    let mut parent = blank_mm(&mut mem);
    parent
        .create_vma(
            &mut mem,
            VirtAddr::new(USER_VA),
            PAGE_SIZE,
            MappingFlags::USER,
        )
        .unwrap();
    // Materialize the read-only page through the kernel load path.
    copy_to_user(&mut mem, parent.pgd, VirtAddr::new(USER_VA), b"text").unwrap();
    // Kernel loads leave the page without the write bit.
    let before = leaf_entry(&mem, parent.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert!(!before.rw());

    let child = parent.clone_cow(&mut mem).unwrap();
    let c = leaf_entry(&mem, child.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert_eq!(c.frame(), before.frame());
    assert_eq!(mem.refcount(Pfn(c.frame())), 2);

    parent.release(&mut mem);
    child.release(&mut mem);
}

#[test]
fn release_returns_every_frame() {
    let mut mem = machine();
    let free_before = mem.free_frames();

    let mut mm = blank_mm(&mut mem);
    mm.create_vma(
        &mut mem,
        VirtAddr::new(USER_VA),
        4 * PAGE_SIZE,
        MappingFlags::RW | MappingFlags::USER,
    )
    .unwrap();
    copy_to_user(&mut mem, mm.pgd, VirtAddr::new(USER_VA), &[1u8; 4096 * 3]).unwrap();
    assert!(mem.free_frames() < free_before);

    mm.release(&mut mem);
    assert_eq!(mem.free_frames(), free_before);
}

#[test]
fn union_of_vmas_equals_mapped_pages() {
    let mut mem = machine();
    let mut mm = blank_mm(&mut mem);
    mm.create_vma(
        &mut mem,
        VirtAddr::new(USER_VA),
        2 * PAGE_SIZE,
        MappingFlags::RW | MappingFlags::USER,
    )
    .unwrap();

    // Nothing materialized yet.
    assert_eq!(mm.mapped_page_count(&mem), 1); // the trampoline page

    copy_to_user(&mut mem, mm.pgd, VirtAddr::new(USER_VA), b"a").unwrap();
    copy_to_user(
        &mut mem,
        mm.pgd,
        VirtAddr::new(USER_VA + PAGE_SIZE),
        b"b",
    )
    .unwrap();
    assert_eq!(mm.mapped_page_count(&mem), 3);

    // Nothing outside the VMAs is reachable.
    let mut buf = [0u8; 1];
    assert!(copy_from_user(&mut mem, mm.pgd, VirtAddr::new(0x5000_0000), &mut buf).is_err());
    mm.release(&mut mem);
}

#[test]
fn uaccess_out_of_range_is_a_fault() {
    let mut mem = machine();
    let mm = blank_mm(&mut mem);
    let mut buf = [0u8; 4];
    // Kernel addresses are rejected outright.
    assert!(copy_from_user(&mut mem, mm.pgd, VirtAddr::new(0x1000), &mut buf).is_err());
    assert!(copy_to_user(&mut mem, mm.pgd, VirtAddr::new(0xF000_0000), &buf).is_err());
    mm.release(&mut mem);
}

#[test]
fn oom_during_demand_fault_reports_out_of_memory() {
    let mut mem = machine();
    let mut mm = blank_mm(&mut mem);
    mm.create_vma(
        &mut mem,
        VirtAddr::new(USER_VA),
        PAGE_SIZE,
        MappingFlags::RW | MappingFlags::USER,
    )
    .unwrap();

    // Exhaust physical memory.
    let mut held = alloc::vec::Vec::new();
    while let Ok(pfn) = mem.alloc_page(Gfp::HighUser) {
        held.push(pfn);
    }

    let ptr = super::paging::leaf_entry_ptr(&mem, mm.pgd, VirtAddr::new(USER_VA)).unwrap();
    assert_eq!(
        resolve_process_entry(&mut mem, ptr, true),
        Err(PagingError::OutOfMemory)
    );

    for pfn in held {
        mem.free_pages(pfn);
    }
    mm.release(&mut mem);
}

#[test]
fn tlb_is_invalidated_per_updated_page() {
    let mut mem = machine();
    let mm = blank_mm(&mut mem);
    let frames = mem.alloc_pages(Gfp::HighUser, 2).unwrap();
    let before = mem.tlb_flushes;

    mem_upd_vm_area(
        &mut mem,
        mm.pgd,
        VirtAddr::new(USER_VA),
        frames.phys().as_u32(),
        4 * PAGE_SIZE,
        MappingFlags::PRESENT | MappingFlags::RW | MappingFlags::USER | MappingFlags::UPDADDR,
    )
    .unwrap();
    assert_eq!(mem.tlb_flushes, before + 4);
    mm.release(&mut mem);
}

#[test]
fn clone_vm_area_rejects_alias_sources() {
    let mut mem = machine();
    let mut mm = blank_mm(&mut mem);
    mm.create_vma(
        &mut mem,
        VirtAddr::new(USER_VA),
        PAGE_SIZE,
        MappingFlags::RW | MappingFlags::USER,
    )
    .unwrap();
    let window = vmem::map_user_window(&mut mem, mm.pgd, VirtAddr::new(USER_VA), 1).unwrap();

    // Cloning out of the window region would chase an alias as if it were
    // data; that is a corrupt-entry error, not silent nonsense.
    let other = blank_mm(&mut mem);
    let main = mem.main_pgd;
    assert_eq!(
        mem_clone_vm_area(
            &mut mem,
            main,
            other.pgd,
            window,
            VirtAddr::new(USER_VA),
            PAGE_SIZE,
            MappingFlags::empty(),
        ),
        Err(PagingError::CorruptEntry)
    );

    vmem::unmap_window(&mut mem, window, 1);
    other.release(&mut mem);
    mm.release(&mut mem);
}
