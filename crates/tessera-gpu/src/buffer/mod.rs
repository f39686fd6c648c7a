//! Device-resident buffers addressed in atoms.
//!
//! A `DeviceBuffer` owns one allocation and hands out raw CPU pointers into it
//! using one of two storage strategies (orphaning or persistent mapping).

mod device_buffer;
mod storage;

pub use device_buffer::DeviceBuffer;
pub use storage::StorageMode;
