//! Tessera GPU buffer layer.
//!
//! Fence-guarded streaming of small, frequently updated data into device
//! buffers: per-range fence bookkeeping (`sync`), atom-addressed device
//! buffers (`buffer`), the ring allocator built on both (`ring`) and device
//! copies of CPU-side buffers (`mirror`). The device itself sits behind the
//! `GpuBackend` trait (`device`).

pub mod buffer;
pub mod device;
pub mod mirror;
pub mod ring;
pub mod sync;

pub mod error;
pub mod logging;

pub use error::{Error, ErrorAction, Result};
