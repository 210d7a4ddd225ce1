//! Small freestanding utility types.

mod ringbuf;

pub use ringbuf::RingBuffer;
