//! ELF32 loader.
//!
//! Parses ELF32 headers and loads PT_LOAD segments into a user address
//! space. Only static `ET_EXEC` x86 binaries are accepted; file bytes are
//! copied through the user-access layer (materializing demand pages as it
//! goes) and BSS tails stay demand-zero.

use crate::memory::userslice::copy_to_user;
use crate::memory::{MemoryDescriptor, PhysicalMemory};
use crate::sync::SpinLock;
use crate::vfs::OpenFile;
use alloc::vec;
use osmium_abi::Errno;
use osmium_vmem::{MappingFlags, VirtAddr, PAGE_SIZE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 2;

/// ELF32 file header (52 bytes).
#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 program header (32 bytes).
#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl Elf32Header {
    fn validate(&self) -> Result<(), Errno> {
        if self.e_ident[0..4] != ELF_MAGIC
            || self.e_ident[4] != ELFCLASS32
            || self.e_ident[5] != ELFDATA2LSB
            || self.e_version != EV_CURRENT
            || self.e_machine != EM_386
        {
            return Err(Errno::ExecFormatError);
        }
        if self.e_type != ET_EXEC {
            return Err(Errno::ExecFormatError);
        }
        if self.e_phentsize as usize != core::mem::size_of::<Elf32Phdr>() || self.e_phnum == 0 {
            return Err(Errno::ExecFormatError);
        }
        Ok(())
    }
}

/// Read and validate the file header; `Ok` means the file is a loadable
/// executable. Used by exec to vet the image *before* tearing down the old
/// address space.
pub fn read_header(file: &OpenFile) -> Result<Elf32Header, Errno> {
    let mut buf = [0u8; core::mem::size_of::<Elf32Header>()];
    let n = file.read_at(0, &mut buf)?;
    if n < buf.len() {
        return Err(Errno::ExecFormatError);
    }
    let header = Elf32Header::read_from_bytes(&buf).map_err(|_| Errno::ExecFormatError)?;
    header.validate()?;
    Ok(header)
}

/// Load every PT_LOAD segment of `file` into `mm`.
///
/// Each segment gets an anonymous VMA covering its page-aligned span;
/// file bytes are written through the user-access layer and the
/// `memsz > filesz` tail stays demand-zero. Returns the entry point.
pub fn load_image(
    memory: &SpinLock<PhysicalMemory>,
    file: &OpenFile,
    mm: &mut MemoryDescriptor,
) -> Result<u32, Errno> {
    let header = read_header(file)?;

    let mut image_end = 0u32;
    for index in 0..header.e_phnum {
        let phdr = read_phdr(file, &header, index)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(Errno::ExecFormatError);
        }

        let seg_start = VirtAddr::new(phdr.p_vaddr).align_down();
        let seg_end = VirtAddr::new(
            phdr.p_vaddr
                .checked_add(phdr.p_memsz)
                .ok_or(Errno::ExecFormatError)?,
        )
        .align_up();
        let span = seg_end - seg_start;

        let mut prot = MappingFlags::USER;
        if phdr.p_flags & PF_W != 0 {
            prot |= MappingFlags::RW;
        }

        {
            let mut mem = memory.lock();
            mm.create_vma(&mut mem, seg_start, span, prot)
                .map_err(|_| Errno::ExecFormatError)?;
        }

        copy_segment(memory, file, mm, &phdr)?;
        image_end = image_end.max(seg_end.as_u32());
    }

    if image_end == 0 {
        return Err(Errno::ExecFormatError);
    }

    // The heap starts just past the image.
    mm.brk_start = image_end;
    mm.brk = image_end;

    log::debug!(
        "elf: loaded image, entry {:#010x}, brk base {:#010x}",
        header.e_entry,
        image_end
    );
    Ok(header.e_entry)
}

fn read_phdr(file: &OpenFile, header: &Elf32Header, index: u16) -> Result<Elf32Phdr, Errno> {
    let mut buf = [0u8; core::mem::size_of::<Elf32Phdr>()];
    let offset = header.e_phoff + (index as u32) * (header.e_phentsize as u32);
    let n = file.read_at(offset, &mut buf)?;
    if n < buf.len() {
        return Err(Errno::ExecFormatError);
    }
    Elf32Phdr::read_from_bytes(&buf).map_err(|_| Errno::ExecFormatError)
}

/// Copy the file-backed part of one segment, page-sized chunks at a time.
///
/// Segments may be writable or not; loading happens through the kernel's
/// user-write path either way, which the page protection does not bind
/// (text pages become read-only to the process but were never writable
/// from user mode in the first place).
fn copy_segment(
    memory: &SpinLock<PhysicalMemory>,
    file: &OpenFile,
    mm: &MemoryDescriptor,
    phdr: &Elf32Phdr,
) -> Result<(), Errno> {
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let mut copied = 0u32;
    while copied < phdr.p_filesz {
        let chunk = (phdr.p_filesz - copied).min(PAGE_SIZE) as usize;
        let n = file.read_at(phdr.p_offset + copied, &mut buf[..chunk])?;
        if n == 0 {
            return Err(Errno::ExecFormatError);
        }
        let mut mem = memory.lock();
        copy_to_user(
            &mut mem,
            mm.pgd,
            VirtAddr::new(phdr.p_vaddr + copied),
            &buf[..n],
        )?;
        copied += n as u32;
    }
    Ok(())
}
