//! Fence-guarded ring allocation of buffer atoms.
//!
//! A [`RingAllocator`] streams per-draw data (uniforms, instance records) into
//! one [`DeviceBuffer`](crate::buffer::DeviceBuffer) without stalling on data
//! the device is still reading, as long as the ring is large enough to cover
//! the frames in flight.

mod allocator;
mod writer;

pub use allocator::{RingAllocator, RingConfig, RingStats};
pub use writer::AtomWriter;
