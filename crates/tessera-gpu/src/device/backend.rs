use std::ptr::NonNull;
use std::time::Duration;

use crate::buffer::StorageMode;

use super::{DeviceError, DeviceLimits};

/// Result of a CPU-side fence wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FenceStatus {
    /// The device has executed past the fence.
    Signaled,
    /// The timeout elapsed before the fence signaled.
    TimedOut,
}

/// How a byte range is mapped for CPU writes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapMode {
    /// Write-only, invalidate the range, unsynchronized.
    ///
    /// The driver may hand back fresh backing memory and does not wait for
    /// pending device work; old contents of the range are undefined.
    Orphan,
    /// Write-only, persistent and coherent.
    ///
    /// The pointer stays valid until the buffer is unmapped at teardown. The
    /// driver provides no protection against in-flight reads.
    Persistent,
}

impl From<StorageMode> for MapMode {
    fn from(storage: StorageMode) -> Self {
        match storage {
            StorageMode::Orphaning => MapMode::Orphan,
            StorageMode::PersistentMapped => MapMode::Persistent,
        }
    }
}

/// Parameters of a device allocation.
#[derive(Debug, Clone)]
pub struct BufferRequest<'a> {
    /// Size in bytes.
    pub size: u64,

    /// Storage strategy; `PersistentMapped` asks for memory that can stay
    /// mapped for the buffer's whole lifetime.
    pub storage: StorageMode,

    /// How the device will consume the buffer.
    pub usage: wgpu::BufferUsages,

    /// Debug label.
    pub label: Option<&'a str>,
}

/// The device layer consumed by the synchronization and ring code.
///
/// Implementations wrap a driver (or simulate one). All calls are synchronous
/// from the CPU's point of view; the only asynchrony is the device's own
/// command-stream execution, observed exclusively through fences.
///
/// Methods take `&self` so that several buffers can share one device through
/// an `Arc`. Implementations are expected to be driven from a single thread.
pub trait GpuBackend {
    /// Opaque marker of a point in the device command stream.
    type Fence;

    /// Opaque device buffer handle.
    type Buffer;

    /// Inserts a fence after all commands recorded so far.
    fn insert_fence(&self) -> Result<Self::Fence, DeviceError>;

    /// Waits on the CPU for `fence` for at most `timeout`.
    ///
    /// `Duration::ZERO` is a pure poll. `flush` asks the device to flush pending
    /// commands first so that the fence can make progress at all.
    fn client_wait(
        &self,
        fence: &Self::Fence,
        flush: bool,
        timeout: Duration,
    ) -> Result<FenceStatus, DeviceError>;

    /// Makes the device queue wait for `fence` without blocking the CPU.
    fn block_device_on(&self, fence: &Self::Fence) -> Result<(), DeviceError>;

    /// Releases a fence.
    fn destroy_fence(&self, fence: Self::Fence);

    /// Allocates device memory.
    fn allocate(&self, request: &BufferRequest<'_>) -> Result<Self::Buffer, DeviceError>;

    /// Maps `len` bytes of `buffer` starting at `offset` for CPU writes.
    fn map(
        &self,
        buffer: &Self::Buffer,
        offset: u64,
        len: u64,
        mode: MapMode,
    ) -> Result<NonNull<u8>, DeviceError>;

    /// Ends the current mapping of `buffer`.
    fn unmap(&self, buffer: &Self::Buffer) -> Result<(), DeviceError>;

    /// Releases a device allocation.
    fn free(&self, buffer: Self::Buffer);

    /// Limits of the device.
    fn limits(&self) -> DeviceLimits;

    /// Binds `size` bytes of `buffer` at `offset` to binding `slot` for the
    /// commands recorded next.
    fn bind_range(
        &self,
        buffer: &Self::Buffer,
        usage: wgpu::BufferUsages,
        slot: u32,
        offset: u64,
        size: u64,
    );
}
