//! Device layer interface.
//!
//! This module is responsible for:
//! - the `GpuBackend` contract the buffer and sync layers call into
//!   (fences, allocation, mapping, binding)
//! - device limits relevant to buffer layout
//! - `SoftDevice`, a deterministic simulated device used by tests and tools

mod backend;
mod error;
mod limits;
pub mod soft;

pub use backend::{BufferRequest, FenceStatus, GpuBackend, MapMode};
pub use error::DeviceError;
pub use limits::{align_up, DeviceLimits};
pub use soft::SoftDevice;
