//! Kernel heap for the bare-metal target.
//!
//! A `linked_list_allocator` over a fixed early region; the hosted build
//! uses the host allocator instead.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap over `[start, start + size)`.
///
/// # Safety
/// The region must be mapped, unused, and never handed to the frame
/// allocator.
pub unsafe fn init(start: *mut u8, size: usize) {
    HEAP.lock().init(start, size);
}
