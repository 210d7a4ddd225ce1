//! Reference-counted open files.

use super::{FileId, Filesystem, Stat};
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use osmium_abi::Errno;

/// One open file: the backend, its file id, and the shared read/write
/// offset. File descriptors hold `Arc<OpenFile>`, so `dup`/`fork` sharing
/// and the VFS-level reference count come from `Arc` itself; dropping the
/// last clone closes the backend file.
pub struct OpenFile {
    fs: Arc<dyn Filesystem>,
    id: FileId,
    pub path: String,
    pub flags: u32,
    offset: AtomicU32,
}

impl OpenFile {
    pub fn new(fs: Arc<dyn Filesystem>, id: FileId, path: String, flags: u32) -> Self {
        OpenFile {
            fs,
            id,
            path,
            flags,
            offset: AtomicU32::new(0),
        }
    }

    /// Read at the shared offset, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let offset = self.offset.load(Ordering::Relaxed);
        let n = self.fs.read(self.id, offset, buf)?;
        self.offset.fetch_add(n as u32, Ordering::Relaxed);
        Ok(n)
    }

    /// Positioned read; does not move the offset.
    pub fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<usize, Errno> {
        self.fs.read(self.id, offset, buf)
    }

    /// Write at the shared offset, advancing it.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        let offset = self.offset.load(Ordering::Relaxed);
        let n = self.fs.write(self.id, offset, buf)?;
        self.offset.fetch_add(n as u32, Ordering::Relaxed);
        Ok(n)
    }

    pub fn stat(&self) -> Result<Stat, Errno> {
        self.fs.stat(self.id)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.fs.close(self.id);
    }
}
