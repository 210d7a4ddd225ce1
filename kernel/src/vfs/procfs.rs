//! Process information file system, mounted at `/proc`.
//!
//! Only the entries the rest of the kernel consumes exist: `video`, the
//! console character device the init process wires to fds 0/1/2, and
//! `uptime`.

use super::{FileId, Filesystem, Stat};
use alloc::format;
use osmium_abi::{Errno, S_IFCHR, S_IFREG};

const VIDEO: FileId = 0;
const UPTIME: FileId = 1;

pub struct ProcFs;

impl ProcFs {
    pub fn new() -> Self {
        ProcFs
    }
}

impl Filesystem for ProcFs {
    fn open(&self, path: &str, _flags: u32, _mode: u16) -> Result<FileId, Errno> {
        match path {
            "video" => Ok(VIDEO),
            "uptime" => Ok(UPTIME),
            _ => Err(Errno::NotFound),
        }
    }

    fn read(&self, file: FileId, _offset: u32, buf: &mut [u8]) -> Result<usize, Errno> {
        match file {
            VIDEO => {
                // Drain console input; non-blocking, 0 means no data yet.
                let mut console = crate::drivers::video::console().lock();
                Ok(console.read_input(buf))
            }
            UPTIME => {
                let ticks = crate::kernel().ticks();
                let text = format!("{}.{:02}\n", ticks / 100, ticks % 100);
                let bytes = text.as_bytes();
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            _ => Err(Errno::BadHandle),
        }
    }

    fn write(&self, file: FileId, _offset: u32, buf: &[u8]) -> Result<usize, Errno> {
        match file {
            VIDEO => {
                let mut console = crate::drivers::video::console().lock();
                console.write_bytes(buf);
                Ok(buf.len())
            }
            _ => Err(Errno::AccessDenied),
        }
    }

    fn stat(&self, file: FileId) -> Result<Stat, Errno> {
        match file {
            VIDEO => Ok(Stat {
                size: 0,
                mode: S_IFCHR | 0o666,
                uid: 0,
                gid: 0,
            }),
            UPTIME => Ok(Stat {
                size: 0,
                mode: S_IFREG | 0o444,
                uid: 0,
                gid: 0,
            }),
            _ => Err(Errno::BadHandle),
        }
    }

    fn close(&self, _file: FileId) {}

    fn name(&self) -> &'static str {
        "procfs"
    }
}
