//! Boot-time plumbing: the bootloader handoff structure and the kernel
//! logger.

mod info;
pub mod logger;

pub use info::{BootInfo, MemoryKind, MemoryRegion};
