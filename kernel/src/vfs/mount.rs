//! The mount table and the top-level VFS API.

use super::file::OpenFile;
use super::{Filesystem, Stat};
use crate::sync::SpinLock;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use osmium_abi::Errno;

struct Mount {
    prefix: String,
    fs: Arc<dyn Filesystem>,
}

/// The virtual file system: a longest-prefix mount table.
pub struct Vfs {
    mounts: SpinLock<Vec<Mount>>,
    /// Typed handle to the boot ramfs, kept so boot (and tests) can seed
    /// executables into it.
    ramfs: Option<Arc<super::ramfs::RamFs>>,
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            mounts: SpinLock::new(Vec::new()),
            ramfs: None,
        }
    }

    /// The standard boot namespace: ramfs at `/`, procfs at `/proc`.
    pub fn with_builtin_mounts() -> Self {
        let mut vfs = Vfs::new();
        let ramfs = Arc::new(super::ramfs::RamFs::new());
        vfs.ramfs = Some(ramfs.clone());
        vfs.mount("/", ramfs);
        vfs.mount("/proc", Arc::new(super::procfs::ProcFs::new()));
        vfs
    }

    /// The boot ramfs, when mounted.
    pub fn ramfs(&self) -> Option<&Arc<super::ramfs::RamFs>> {
        self.ramfs.as_ref()
    }

    /// Mount a backend at `prefix` (an absolute path).
    pub fn mount(&self, prefix: &str, fs: Arc<dyn Filesystem>) {
        let mut mounts = self.mounts.lock();
        mounts.push(Mount {
            prefix: String::from(prefix),
            fs,
        });
        // Longest prefix first, so resolution can take the first match.
        mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        log::info!("vfs: mounted at {}", prefix);
    }

    /// Resolve an absolute path to its backend and backend-relative path.
    pub fn resolve(&self, path: &str) -> Result<(Arc<dyn Filesystem>, String), Errno> {
        if !path.starts_with('/') {
            return Err(Errno::InvalidArgument);
        }
        let mounts = self.mounts.lock();
        for mount in mounts.iter() {
            let rest = match mount.prefix.as_str() {
                "/" => Some(path.trim_start_matches('/')),
                prefix => path
                    .strip_prefix(prefix)
                    .map(|rest| rest.trim_start_matches('/')),
            };
            if let Some(rest) = rest {
                return Ok((mount.fs.clone(), String::from(rest)));
            }
        }
        Err(Errno::NotFound)
    }

    /// Open an absolute path.
    pub fn open(&self, path: &str, flags: u32, mode: u16) -> Result<Arc<OpenFile>, Errno> {
        let (fs, rest) = self.resolve(path)?;
        let id = fs.open(&rest, flags, mode)?;
        Ok(Arc::new(OpenFile::new(fs, id, String::from(path), flags)))
    }

    /// Stat an absolute path without keeping it open.
    pub fn stat(&self, path: &str) -> Result<Stat, Errno> {
        let file = self.open(path, osmium_abi::O_RDONLY, 0)?;
        file.stat()
    }

    /// Backend of the root mount; boot uses this to seed the ramfs.
    pub fn root_fs(&self) -> Option<Arc<dyn Filesystem>> {
        let mounts = self.mounts.lock();
        mounts
            .iter()
            .find(|m| m.prefix == "/")
            .map(|m| m.fs.clone())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
