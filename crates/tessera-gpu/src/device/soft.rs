//! Deterministic software implementation of [`GpuBackend`].
//!
//! The "device" is host memory plus a simulated command-stream timeline:
//! every fence gets the next sequence number, and the GPU has a `completed`
//! sequence that only advances when the [`Progress`] policy or an explicit
//! `retire_*` call says so. This makes fence timing fully controllable, which
//! is what the hazard and wrap tests need.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::buffer::StorageMode;
use crate::sync::ByteRange;

use super::{BufferRequest, DeviceError, DeviceLimits, FenceStatus, GpuBackend, MapMode};

/// Byte pattern written into a range when it is orphan-mapped.
///
/// Old contents of an invalidated range are undefined on a real driver; filling
/// them makes any accidental dependency on them visible.
pub const INVALIDATED_BYTE: u8 = 0xCD;

/// Fence handle of a [`SoftDevice`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SoftFence {
    seq: u64,
}

impl SoftFence {
    /// Position of the fence in the simulated command stream.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Buffer handle of a [`SoftDevice`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SoftBuffer {
    id: u64,
}

impl SoftBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// How the simulated GPU advances through the command stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Progress {
    /// A blocking (non-zero timeout) wait lets the GPU catch up to that fence.
    OnBlockingWait,
    /// The first `n` blocking waits on each fence time out, then it signals.
    AfterTimeouts(u32),
    /// The GPU never advances on its own; only `retire_*` moves it.
    Stalled,
}

/// Outcome recorded for a CPU-side fence wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    Failed,
}

/// One call observed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    FenceInserted {
        seq: u64,
    },
    FenceWaited {
        seq: u64,
        flush: bool,
        timeout: Duration,
        outcome: WaitOutcome,
    },
    DeviceBlocked {
        seq: u64,
    },
    FenceDestroyed {
        seq: u64,
    },
    Allocated {
        buffer: u64,
        size: u64,
        storage: StorageMode,
    },
    Mapped {
        buffer: u64,
        offset: u64,
        len: u64,
        mode: MapMode,
    },
    Unmapped {
        buffer: u64,
    },
    Freed {
        buffer: u64,
    },
    Bound {
        buffer: u64,
        slot: u32,
        offset: u64,
        size: u64,
    },
}

struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
    storage: StorageMode,
    mapped: bool,
}

// The allocation is only touched through the device mutex or through pointers
// handed out by `map`, whose use is governed by the caller's fencing.
unsafe impl Send for Allocation {}

impl Allocation {
    fn new(len: usize, storage: StorageMode) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        Self {
            ptr: NonNull::new(raw.cast::<u8>()).unwrap_or(NonNull::dangling()),
            len,
            storage,
            mapped: false,
        }
    }

    fn bytes(&self) -> &[u8] {
        // Safety: `ptr` owns `len` initialized bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // Safety: reconstructs exactly the boxed slice leaked in `new`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

struct PendingRead {
    buffer: u64,
    range: ByteRange,
    // Retired once the GPU completes this sequence number.
    seq: u64,
}

struct State {
    limits: DeviceLimits,
    progress: Progress,
    next_buffer: u64,
    allocations: HashMap<u64, Allocation>,
    last_seq: u64,
    completed: u64,
    // seq -> blocking waits that timed out so far
    fences: HashMap<u64, u32>,
    reads: Vec<PendingRead>,
    lost: bool,
    fail_next_allocation: bool,
    fail_next_map: bool,
    fail_next_fence: bool,
    events: Vec<DeviceEvent>,
}

impl State {
    fn retire_through(&mut self, seq: u64) {
        self.completed = self.completed.max(seq.min(self.last_seq));
        let completed = self.completed;
        self.reads.retain(|r| r.seq > completed);
    }
}

/// Simulated GPU device.
pub struct SoftDevice {
    state: Mutex<State>,
}

impl SoftDevice {
    pub fn new(limits: DeviceLimits) -> Self {
        Self {
            state: Mutex::new(State {
                limits,
                progress: Progress::OnBlockingWait,
                next_buffer: 1,
                allocations: HashMap::new(),
                last_seq: 0,
                completed: 0,
                fences: HashMap::new(),
                reads: Vec::new(),
                lost: false,
                fail_next_allocation: false,
                fail_next_map: false,
                fail_next_fence: false,
                events: Vec::new(),
            }),
        }
    }

    /// Device whose uniform and storage offset alignment is `alignment`.
    pub fn with_alignment(alignment: u64) -> Self {
        Self::new(DeviceLimits::with_alignment(alignment))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── timeline control ──────────────────────────────────────────────────

    pub fn set_progress(&self, progress: Progress) {
        self.state().progress = progress;
    }

    /// Lets the GPU finish every command recorded so far.
    pub fn retire_all(&self) {
        let mut state = self.state();
        state.completed = state.last_seq;
        state.reads.clear();
    }

    /// Lets the GPU execute up to and including fence `seq`.
    pub fn retire_through(&self, seq: u64) {
        self.state().retire_through(seq);
    }

    /// Sequence number of the most recently inserted fence (0 if none).
    pub fn last_fence_seq(&self) -> u64 {
        self.state().last_seq
    }

    /// Sequence number the GPU has executed through.
    pub fn completed_seq(&self) -> u64 {
        self.state().completed
    }

    // ── fault injection ───────────────────────────────────────────────────

    /// Marks the device as lost; fence waits and maps fail from now on.
    pub fn lose_device(&self) {
        self.state().lost = true;
    }

    pub fn fail_next_allocation(&self) {
        self.state().fail_next_allocation = true;
    }

    pub fn fail_next_map(&self) {
        self.state().fail_next_map = true;
    }

    /// The next fence insertion runs out of memory.
    pub fn fail_next_fence(&self) {
        self.state().fail_next_fence = true;
    }

    // ── inspection ────────────────────────────────────────────────────────

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state().events.clone()
    }

    pub fn take_events(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.state().events)
    }

    /// Number of CPU or device waits issued on fence `seq`.
    pub fn waits_on(&self, seq: u64) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| match e {
                DeviceEvent::FenceWaited { seq: s, .. } | DeviceEvent::DeviceBlocked { seq: s } => {
                    *s == seq
                }
                _ => false,
            })
            .count()
    }

    pub fn live_allocations(&self) -> usize {
        self.state().allocations.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state().fences.len()
    }

    pub fn is_mapped(&self, buffer: &SoftBuffer) -> bool {
        self.state()
            .allocations
            .get(&buffer.id)
            .is_some_and(|a| a.mapped)
    }

    /// Copy of the whole backing store of `buffer`.
    pub fn contents(&self, buffer: &SoftBuffer) -> Option<Vec<u8>> {
        self.state()
            .allocations
            .get(&buffer.id)
            .map(|a| a.bytes().to_vec())
    }

    /// GPU reads of `buffer` overlapping `range` that have not completed yet.
    ///
    /// A CPU write into any of these would race with the device.
    pub fn unretired_reads(&self, buffer: &SoftBuffer, range: ByteRange) -> Vec<ByteRange> {
        let state = self.state();
        state
            .reads
            .iter()
            .filter(|r| r.buffer == buffer.id && r.seq > state.completed && r.range.overlaps(&range))
            .map(|r| r.range)
            .collect()
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new(DeviceLimits::default())
    }
}

impl GpuBackend for SoftDevice {
    type Fence = SoftFence;
    type Buffer = SoftBuffer;

    fn insert_fence(&self) -> Result<SoftFence, DeviceError> {
        let mut state = self.state();
        if state.lost {
            return Err(DeviceError::Lost);
        }
        if std::mem::take(&mut state.fail_next_fence) {
            return Err(DeviceError::OutOfMemory { requested: 0 });
        }
        state.last_seq += 1;
        let seq = state.last_seq;
        state.fences.insert(seq, 0);
        state.events.push(DeviceEvent::FenceInserted { seq });
        Ok(SoftFence { seq })
    }

    fn client_wait(
        &self,
        fence: &SoftFence,
        flush: bool,
        timeout: Duration,
    ) -> Result<FenceStatus, DeviceError> {
        let mut state = self.state();
        let seq = fence.seq;

        let result = if state.lost {
            Err(DeviceError::Lost)
        } else if !state.fences.contains_key(&seq) {
            Err(DeviceError::InvalidHandle { kind: "fence", id: seq })
        } else if state.completed >= seq {
            Ok(FenceStatus::Signaled)
        } else if timeout.is_zero() {
            Ok(FenceStatus::TimedOut)
        } else {
            let progress = state.progress;
            match progress {
                Progress::OnBlockingWait => {
                    state.retire_through(seq);
                    Ok(FenceStatus::Signaled)
                }
                Progress::AfterTimeouts(limit) => {
                    let timeouts = state.fences.get(&seq).copied().unwrap_or(0);
                    if timeouts < limit {
                        state.fences.insert(seq, timeouts + 1);
                        Ok(FenceStatus::TimedOut)
                    } else {
                        state.retire_through(seq);
                        Ok(FenceStatus::Signaled)
                    }
                }
                Progress::Stalled => Ok(FenceStatus::TimedOut),
            }
        };

        let outcome = match result {
            Ok(FenceStatus::Signaled) => WaitOutcome::Signaled,
            Ok(FenceStatus::TimedOut) => WaitOutcome::TimedOut,
            Err(_) => WaitOutcome::Failed,
        };
        state.events.push(DeviceEvent::FenceWaited {
            seq,
            flush,
            timeout,
            outcome,
        });
        result
    }

    fn block_device_on(&self, fence: &SoftFence) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.lost {
            return Err(DeviceError::Lost);
        }
        state.events.push(DeviceEvent::DeviceBlocked { seq: fence.seq });
        Ok(())
    }

    fn destroy_fence(&self, fence: SoftFence) {
        let mut state = self.state();
        if state.fences.remove(&fence.seq).is_none() {
            log::error!("SoftDevice: destroy of unknown fence {}", fence.seq);
            return;
        }
        state.events.push(DeviceEvent::FenceDestroyed { seq: fence.seq });
    }

    fn allocate(&self, request: &BufferRequest<'_>) -> Result<SoftBuffer, DeviceError> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_allocation) {
            return Err(DeviceError::OutOfMemory {
                requested: request.size,
            });
        }
        let len = usize::try_from(request.size).map_err(|_| DeviceError::OutOfMemory {
            requested: request.size,
        })?;

        let id = state.next_buffer;
        state.next_buffer += 1;
        state
            .allocations
            .insert(id, Allocation::new(len, request.storage));
        state.events.push(DeviceEvent::Allocated {
            buffer: id,
            size: request.size,
            storage: request.storage,
        });
        log::debug!(
            "SoftDevice: allocated buffer {id} ({} bytes, {:?}, label {:?})",
            request.size,
            request.storage,
            request.label
        );
        Ok(SoftBuffer { id })
    }

    fn map(
        &self,
        buffer: &SoftBuffer,
        offset: u64,
        len: u64,
        mode: MapMode,
    ) -> Result<NonNull<u8>, DeviceError> {
        let mut state = self.state();
        if state.lost {
            return Err(DeviceError::Lost);
        }
        let map_failed = |reason: &str| DeviceError::MapFailed {
            offset,
            len,
            reason: reason.to_owned(),
        };
        if std::mem::take(&mut state.fail_next_map) {
            return Err(map_failed("injected failure"));
        }

        let allocation = state
            .allocations
            .get_mut(&buffer.id)
            .ok_or(DeviceError::InvalidHandle {
                kind: "buffer",
                id: buffer.id,
            })?;
        if allocation.mapped {
            return Err(map_failed("buffer is already mapped"));
        }
        if mode == MapMode::Persistent && allocation.storage != StorageMode::PersistentMapped {
            return Err(map_failed("buffer was not allocated for persistent mapping"));
        }
        let end = offset.checked_add(len).ok_or_else(|| map_failed("range overflows"))?;
        if end > allocation.len as u64 {
            return Err(map_failed("range exceeds buffer size"));
        }

        // Offsets fit in usize: they are bounded by the allocation length.
        let start = offset as usize;
        let ptr = unsafe { allocation.ptr.add(start) };
        if mode == MapMode::Orphan {
            // Safety: [start, start + len) lies inside the allocation.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), INVALIDATED_BYTE, len as usize) };
        }
        allocation.mapped = true;

        state.events.push(DeviceEvent::Mapped {
            buffer: buffer.id,
            offset,
            len,
            mode,
        });
        Ok(ptr)
    }

    fn unmap(&self, buffer: &SoftBuffer) -> Result<(), DeviceError> {
        let mut state = self.state();
        let allocation = state
            .allocations
            .get_mut(&buffer.id)
            .ok_or(DeviceError::InvalidHandle {
                kind: "buffer",
                id: buffer.id,
            })?;
        if !allocation.mapped {
            return Err(DeviceError::Other(format!("buffer {} is not mapped", buffer.id)));
        }
        allocation.mapped = false;
        state.events.push(DeviceEvent::Unmapped { buffer: buffer.id });
        Ok(())
    }

    fn free(&self, buffer: SoftBuffer) {
        let mut state = self.state();
        if state.allocations.remove(&buffer.id).is_none() {
            log::error!("SoftDevice: free of unknown buffer {}", buffer.id);
            return;
        }
        state.reads.retain(|r| r.buffer != buffer.id);
        state.events.push(DeviceEvent::Freed { buffer: buffer.id });
    }

    fn limits(&self) -> DeviceLimits {
        self.state().limits
    }

    fn bind_range(
        &self,
        buffer: &SoftBuffer,
        _usage: wgpu::BufferUsages,
        slot: u32,
        offset: u64,
        size: u64,
    ) {
        let mut state = self.state();
        // The read belongs to the commands recorded next, so the next fence covers it.
        let seq = state.last_seq + 1;
        state.reads.push(PendingRead {
            buffer: buffer.id,
            range: ByteRange::new(offset, size),
            seq,
        });
        state.events.push(DeviceEvent::Bound {
            buffer: buffer.id,
            slot,
            offset,
            size,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(size: u64, storage: StorageMode) -> BufferRequest<'static> {
        BufferRequest {
            size,
            storage,
            usage: wgpu::BufferUsages::UNIFORM,
            label: Some("soft test"),
        }
    }

    // ── fences ────────────────────────────────────────────────────────────

    #[test]
    fn poll_reports_timeout_until_retired() {
        let device = SoftDevice::with_alignment(256);
        let fence = device.insert_fence().unwrap();

        let status = device.client_wait(&fence, false, Duration::ZERO).unwrap();
        assert_eq!(status, FenceStatus::TimedOut);

        device.retire_all();
        let status = device.client_wait(&fence, false, Duration::ZERO).unwrap();
        assert_eq!(status, FenceStatus::Signaled);
    }

    #[test]
    fn blocking_wait_catches_up_by_default() {
        let device = SoftDevice::with_alignment(256);
        let first = device.insert_fence().unwrap();
        let second = device.insert_fence().unwrap();

        let status = device
            .client_wait(&first, true, Duration::from_secs(1))
            .unwrap();
        assert_eq!(status, FenceStatus::Signaled);
        assert_eq!(device.completed_seq(), first.seq());

        // The GPU only executed through `first`.
        let status = device.client_wait(&second, false, Duration::ZERO).unwrap();
        assert_eq!(status, FenceStatus::TimedOut);
    }

    #[test]
    fn after_timeouts_signals_eventually() {
        let device = SoftDevice::with_alignment(256);
        device.set_progress(Progress::AfterTimeouts(2));
        let fence = device.insert_fence().unwrap();
        let long = Duration::from_millis(5);

        assert_eq!(device.client_wait(&fence, true, long).unwrap(), FenceStatus::TimedOut);
        assert_eq!(device.client_wait(&fence, true, long).unwrap(), FenceStatus::TimedOut);
        assert_eq!(device.client_wait(&fence, true, long).unwrap(), FenceStatus::Signaled);
    }

    #[test]
    fn stalled_device_never_signals() {
        let device = SoftDevice::with_alignment(256);
        device.set_progress(Progress::Stalled);
        let fence = device.insert_fence().unwrap();
        for _ in 0..5 {
            let status = device
                .client_wait(&fence, true, Duration::from_secs(1))
                .unwrap();
            assert_eq!(status, FenceStatus::TimedOut);
        }
        assert_eq!(device.waits_on(fence.seq()), 5);
    }

    #[test]
    fn lost_device_fails_waits() {
        let device = SoftDevice::with_alignment(256);
        let fence = device.insert_fence().unwrap();
        device.lose_device();
        let err = device.client_wait(&fence, false, Duration::ZERO).unwrap_err();
        assert_eq!(err, DeviceError::Lost);
        assert!(device.insert_fence().is_err());
    }

    #[test]
    fn destroyed_fences_are_released() {
        let device = SoftDevice::with_alignment(256);
        let fence = device.insert_fence().unwrap();
        assert_eq!(device.live_fences(), 1);
        device.destroy_fence(fence);
        assert_eq!(device.live_fences(), 0);
    }

    // ── memory ────────────────────────────────────────────────────────────

    #[test]
    fn orphan_map_invalidates_range() {
        let device = SoftDevice::with_alignment(256);
        let buffer = device.allocate(&request(512, StorageMode::Orphaning)).unwrap();

        let ptr = device.map(&buffer, 256, 256, MapMode::Orphan).unwrap();
        unsafe { ptr.as_ptr().write(7) };
        device.unmap(&buffer).unwrap();

        let bytes = device.contents(&buffer).unwrap();
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[256], 7);
        assert_eq!(bytes[257], INVALIDATED_BYTE);
    }

    #[test]
    fn persistent_map_requires_persistent_storage() {
        let device = SoftDevice::with_alignment(256);
        let buffer = device.allocate(&request(256, StorageMode::Orphaning)).unwrap();
        assert!(device.map(&buffer, 0, 256, MapMode::Persistent).is_err());
    }

    #[test]
    fn double_map_is_rejected() {
        let device = SoftDevice::with_alignment(256);
        let buffer = device.allocate(&request(256, StorageMode::Orphaning)).unwrap();
        device.map(&buffer, 0, 16, MapMode::Orphan).unwrap();
        assert!(device.map(&buffer, 16, 16, MapMode::Orphan).is_err());
        assert!(device.is_mapped(&buffer));
    }

    #[test]
    fn out_of_range_map_is_rejected() {
        let device = SoftDevice::with_alignment(256);
        let buffer = device.allocate(&request(256, StorageMode::Orphaning)).unwrap();
        assert!(device.map(&buffer, 200, 100, MapMode::Orphan).is_err());
    }

    #[test]
    fn injected_allocation_failure_is_one_shot() {
        let device = SoftDevice::with_alignment(256);
        device.fail_next_allocation();
        let err = device
            .allocate(&request(256, StorageMode::Orphaning))
            .unwrap_err();
        assert_eq!(err, DeviceError::OutOfMemory { requested: 256 });
        assert!(device.allocate(&request(256, StorageMode::Orphaning)).is_ok());
    }

    #[test]
    fn free_releases_allocation() {
        let device = SoftDevice::with_alignment(256);
        let buffer = device.allocate(&request(256, StorageMode::Orphaning)).unwrap();
        assert_eq!(device.live_allocations(), 1);
        device.free(buffer);
        assert_eq!(device.live_allocations(), 0);
    }

    // ── read tracking ─────────────────────────────────────────────────────

    #[test]
    fn bound_reads_retire_with_next_fence() {
        let device = SoftDevice::with_alignment(256);
        let buffer = device.allocate(&request(1024, StorageMode::Orphaning)).unwrap();

        device.bind_range(&buffer, wgpu::BufferUsages::UNIFORM, 0, 256, 256);
        let fence = device.insert_fence().unwrap();

        let hit = device.unretired_reads(&buffer, ByteRange::new(300, 10));
        assert_eq!(hit, vec![ByteRange::new(256, 256)]);
        assert!(device.unretired_reads(&buffer, ByteRange::new(0, 256)).is_empty());

        device.retire_through(fence.seq());
        assert!(device.unretired_reads(&buffer, ByteRange::new(300, 10)).is_empty());
    }
}
