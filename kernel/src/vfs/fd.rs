//! Per-task file-descriptor tables.

use super::file::OpenFile;
use alloc::sync::Arc;
use alloc::vec::Vec;
use osmium_abi::limits::{FD_TABLE_INITIAL, FD_TABLE_MAX};
use osmium_abi::Errno;

/// Standard file descriptor numbers.
pub const STDIN: u32 = 0;
pub const STDOUT: u32 = 1;
pub const STDERR: u32 = 2;

/// One slot: the open file plus FD-level flags.
#[derive(Clone)]
pub struct FileDescriptor {
    pub file: Arc<OpenFile>,
    /// Close on exec.
    pub cloexec: bool,
}

/// Lowest-free, extensible descriptor table.
///
/// The table starts small and grows on demand up to a hard cap, past
/// which `EMFILE` is returned. Cloning (fork) shares the open files.
#[derive(Clone)]
pub struct FdTable {
    fds: Vec<Option<FileDescriptor>>,
}

impl FdTable {
    pub fn new() -> Self {
        let mut fds = Vec::with_capacity(FD_TABLE_INITIAL);
        fds.resize(3, None);
        FdTable { fds }
    }

    /// Insert at the lowest free slot.
    pub fn insert(&mut self, file: Arc<OpenFile>) -> Result<u32, Errno> {
        self.insert_with_flags(file, false)
    }

    pub fn insert_with_flags(&mut self, file: Arc<OpenFile>, cloexec: bool) -> Result<u32, Errno> {
        let fd = match self.fds.iter().position(|slot| slot.is_none()) {
            Some(free) => free,
            None => {
                if self.fds.len() >= FD_TABLE_MAX {
                    return Err(Errno::TooManyFiles);
                }
                self.fds.push(None);
                self.fds.len() - 1
            }
        };
        self.fds[fd] = Some(FileDescriptor { file, cloexec });
        Ok(fd as u32)
    }

    /// Install a file at a specific descriptor (wiring stdio).
    pub fn insert_at(&mut self, fd: u32, file: Arc<OpenFile>) {
        let fd = fd as usize;
        if fd >= self.fds.len() {
            self.fds.resize(fd + 1, None);
        }
        self.fds[fd] = Some(FileDescriptor {
            file,
            cloexec: false,
        });
    }

    pub fn get(&self, fd: u32) -> Result<&Arc<OpenFile>, Errno> {
        self.fds
            .get(fd as usize)
            .and_then(|slot| slot.as_ref())
            .map(|desc| &desc.file)
            .ok_or(Errno::BadHandle)
    }

    pub fn close(&mut self, fd: u32) -> Result<(), Errno> {
        let slot = self
            .fds
            .get_mut(fd as usize)
            .ok_or(Errno::BadHandle)?;
        if slot.is_none() {
            return Err(Errno::BadHandle);
        }
        *slot = None;
        Ok(())
    }

    /// Drop every descriptor (exit).
    pub fn clear(&mut self) {
        for slot in self.fds.iter_mut() {
            *slot = None;
        }
    }

    /// Close the descriptors marked close-on-exec.
    pub fn close_cloexec(&mut self) {
        for slot in self.fds.iter_mut() {
            if slot.as_ref().map(|d| d.cloexec).unwrap_or(false) {
                *slot = None;
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.fds.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
