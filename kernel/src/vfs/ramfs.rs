//! Boot-seeded in-memory file system.
//!
//! Holds the executables the kernel is booted with. Files are flat
//! path-keyed byte vectors; directories exist implicitly as path
//! prefixes.

use super::{FileId, Filesystem, Stat};
use crate::sync::SpinLock;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use osmium_abi::{Errno, O_CREAT, S_IFDIR, S_IFREG};

struct RamNode {
    data: Vec<u8>,
    mode: u16,
    uid: u32,
    gid: u32,
}

struct RamState {
    nodes: Vec<RamNode>,
    by_path: BTreeMap<String, FileId>,
}

pub struct RamFs {
    state: SpinLock<RamState>,
}

impl RamFs {
    pub fn new() -> Self {
        RamFs {
            state: SpinLock::new(RamState {
                nodes: Vec::new(),
                by_path: BTreeMap::new(),
            }),
        }
    }

    /// Seed a file (boot images, test fixtures). Replaces any existing
    /// node at `path`.
    pub fn register(&self, path: &str, data: &[u8], mode: u16, uid: u32, gid: u32) {
        let mut state = self.state.lock();
        let node = RamNode {
            data: Vec::from(data),
            mode: S_IFREG | (mode & 0o7777),
            uid,
            gid,
        };
        let existing = state.by_path.get(path).copied();
        match existing {
            Some(id) => state.nodes[id] = node,
            None => {
                let id = state.nodes.len();
                state.nodes.push(node);
                state.by_path.insert(String::from(path), id);
            }
        }
    }

    fn is_dir_prefix(state: &RamState, path: &str) -> bool {
        let mut prefix = String::from(path);
        prefix.push('/');
        state.by_path.keys().any(|k| k.starts_with(prefix.as_str()))
    }
}

impl Filesystem for RamFs {
    fn open(&self, path: &str, flags: u32, mode: u16) -> Result<FileId, Errno> {
        let mut state = self.state.lock();
        if let Some(&id) = state.by_path.get(path) {
            return Ok(id);
        }
        if path.is_empty() || Self::is_dir_prefix(&state, path) {
            // Directories have no own node; give them a synthetic id past
            // the node table and answer stat from the id.
            return Ok(usize::MAX);
        }
        if flags & O_CREAT != 0 {
            let id = state.nodes.len();
            state.nodes.push(RamNode {
                data: Vec::new(),
                mode: S_IFREG | (mode & 0o7777),
                uid: 0,
                gid: 0,
            });
            state.by_path.insert(String::from(path), id);
            return Ok(id);
        }
        Err(Errno::NotFound)
    }

    fn read(&self, file: FileId, offset: u32, buf: &mut [u8]) -> Result<usize, Errno> {
        let state = self.state.lock();
        let node = state.nodes.get(file).ok_or(Errno::IsADirectory)?;
        let offset = offset as usize;
        if offset >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - offset);
        buf[..n].copy_from_slice(&node.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, file: FileId, offset: u32, buf: &[u8]) -> Result<usize, Errno> {
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(file).ok_or(Errno::IsADirectory)?;
        let end = offset as usize + buf.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn stat(&self, file: FileId) -> Result<Stat, Errno> {
        let state = self.state.lock();
        match state.nodes.get(file) {
            Some(node) => Ok(Stat {
                size: node.data.len() as u32,
                mode: node.mode,
                uid: node.uid,
                gid: node.gid,
            }),
            None => Ok(Stat {
                size: 0,
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
            }),
        }
    }

    fn close(&self, _file: FileId) {}

    fn name(&self) -> &'static str {
        "ramfs"
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_open_read() {
        let fs = RamFs::new();
        fs.register("bin/echo", b"payload", 0o755, 0, 0);
        let id = fs.open("bin/echo", 0, 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(id, 0, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
        assert_eq!(fs.read(id, 4, &mut buf).unwrap(), 3);
        assert_eq!(fs.open("bin/none", 0, 0).unwrap_err(), Errno::NotFound);
    }

    #[test]
    fn implicit_directories_stat_as_dirs() {
        let fs = RamFs::new();
        fs.register("bin/echo", b"x", 0o755, 0, 0);
        let id = fs.open("bin", 0, 0).unwrap();
        assert!(fs.stat(id).unwrap().is_dir());
    }
}
