//! CPU/GPU synchronization of buffer ranges.
//!
//! Instead of stalling on the whole buffer, each range handed to the device is
//! protected by its own fence, and a CPU write only waits for the fences of the
//! ranges it actually touches.

mod lock_manager;
mod range;

pub use lock_manager::{Lock, LockConfig, LockManager, WaitStrategy, MIN_LONG_TIMEOUT};
pub use range::ByteRange;
