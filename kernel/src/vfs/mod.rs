//! Virtual file system.
//!
//! A compact prefix-mount VFS: backends implement [`Filesystem`], the
//! mount table maps path prefixes to them, open files are reference
//! counted behind `Arc`, and every task owns an [`FdTable`]. The two
//! built-in backends are a boot-seeded [`ramfs`] at `/` (where the
//! executables live) and [`procfs`] at `/proc` (exposing the console as
//! `/proc/video` for init's standard streams).

pub mod fd;
pub mod file;
pub mod mount;
pub mod procfs;
pub mod ramfs;

pub use fd::{FdTable, FileDescriptor, STDERR, STDIN, STDOUT};
pub use file::OpenFile;
pub use mount::Vfs;
pub use ramfs::RamFs;

use crate::process::Credentials;
use alloc::string::String;
use osmium_abi::{Errno, S_IFDIR, S_IFMT, S_ISGID, S_ISUID, S_IXGRP, S_IXOTH, S_IXUSR};

/// Backend-local file identifier.
pub type FileId = usize;

/// File metadata as `fstat` reports it.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub size: u32,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
}

impl Stat {
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[inline]
    pub fn is_setuid(&self) -> bool {
        self.mode & S_ISUID != 0
    }

    #[inline]
    pub fn is_setgid(&self) -> bool {
        self.mode & S_ISGID != 0
    }
}

/// One mounted backend.
///
/// Paths handed to a backend are relative to its mount point, with no
/// leading slash. Backends keep their own state behind interior locks and
/// may be called from any task context.
pub trait Filesystem: Send + Sync {
    fn open(&self, path: &str, flags: u32, mode: u16) -> Result<FileId, Errno>;
    fn read(&self, file: FileId, offset: u32, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&self, file: FileId, offset: u32, buf: &[u8]) -> Result<usize, Errno>;
    fn stat(&self, file: FileId) -> Result<Stat, Errno>;
    fn close(&self, file: FileId);
    fn name(&self) -> &'static str;
}

/// Whether `creds` may execute a file with metadata `stat`.
///
/// Root executes anything with at least one x bit; owners and group
/// members check their own bit; everyone else the world bit.
pub fn valid_exec_permission(creds: &Credentials, stat: &Stat) -> bool {
    let any_x = stat.mode & (S_IXUSR | S_IXGRP | S_IXOTH) != 0;
    if creds.uid == 0 {
        return any_x;
    }
    if creds.uid == stat.uid {
        return stat.mode & S_IXUSR != 0;
    }
    if creds.gid == stat.gid {
        return stat.mode & S_IXGRP != 0;
    }
    stat.mode & S_IXOTH != 0
}

/// Resolve a possibly-relative path against a working directory into a
/// normalized absolute path.
pub fn absolute_path(cwd: &str, path: &str) -> String {
    let mut out: alloc::vec::Vec<&str> = alloc::vec::Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for part in base.split('/').chain(path.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let mut s = String::from("/");
    s.push_str(&out.join("/"));
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_normalization() {
        assert_eq!(absolute_path("/home", "file"), "/home/file");
        assert_eq!(absolute_path("/home", "/bin/sh"), "/bin/sh");
        assert_eq!(absolute_path("/a/b", "../c/./d"), "/a/c/d");
        assert_eq!(absolute_path("/", ".."), "/");
    }

    #[test]
    fn exec_permission_matrix() {
        let stat = Stat {
            size: 0,
            mode: 0o100750,
            uid: 10,
            gid: 20,
        };
        let owner = Credentials {
            uid: 10,
            gid: 99,
            ruid: 10,
            rgid: 99,
            sid: 0,
            pgid: 0,
        };
        let group = Credentials {
            uid: 11,
            gid: 20,
            ruid: 11,
            rgid: 20,
            sid: 0,
            pgid: 0,
        };
        let other = Credentials {
            uid: 12,
            gid: 30,
            ruid: 12,
            rgid: 30,
            sid: 0,
            pgid: 0,
        };
        let root = Credentials::root();
        assert!(valid_exec_permission(&owner, &stat));
        assert!(valid_exec_permission(&group, &stat));
        assert!(!valid_exec_permission(&other, &stat));
        assert!(valid_exec_permission(&root, &stat));
    }
}
