use std::sync::Arc;

use bytemuck::Pod;

use crate::buffer::{DeviceBuffer, StorageMode};
use crate::device::GpuBackend;
use crate::error::{Error, Result};
use crate::sync::{ByteRange, LockConfig, LockManager};

use super::AtomWriter;

/// Ring creation parameters.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// CPU update strategy of the backing buffer.
    pub storage: StorageMode,

    /// How the device consumes the ring.
    ///
    /// Uniform and storage usages pad atoms to the device's binding alignment.
    pub usage: wgpu::BufferUsages,

    /// Capacity in atoms.
    pub num_atoms: u32,

    /// Meaningful bytes per atom.
    pub atom_size: u64,

    /// Fence wait policy.
    pub lock: LockConfig,

    /// Debug label of the backing buffer.
    pub label: Option<String>,
}

impl RingConfig {
    /// Persistently mapped uniform ring of `num_atoms` atoms of `atom_size` bytes.
    pub fn new(num_atoms: u32, atom_size: u64) -> Self {
        Self {
            storage: StorageMode::PersistentMapped,
            usage: wgpu::BufferUsages::UNIFORM,
            num_atoms,
            atom_size,
            lock: LockConfig::default(),
            label: None,
        }
    }
}

/// Allocation counters of a ring.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct RingStats {
    /// Successful non-empty maps.
    pub allocations: u64,
    /// Maps that restarted at atom 0.
    pub wraps: u64,
    /// Tail atoms skipped by wraps.
    pub wasted_atoms: u64,
}

/// Circular staging area for small, frequent buffer updates.
///
/// Allocations are contiguous atom ranges handed out in order; an allocation
/// that does not fit before the end of the buffer restarts at atom 0 and the
/// tail is skipped, so one allocation is always one bindable range. Before a
/// range is handed out, every fence still protecting it is waited on.
///
/// Per allocation: [`map`](Self::map) → write → unmap → record the commands
/// that read the atoms (binding them with [`bind_current`](Self::bind_current))
/// → [`on_usage_complete`](Self::on_usage_complete).
pub struct RingAllocator<D: GpuBackend> {
    // Dropped before `buffer`: outstanding fences are waited on while the
    // memory they protect is still allocated.
    locks: LockManager<D>,
    buffer: DeviceBuffer<D>,
    head: u32,
    pending: u32,
    stats: RingStats,
}

impl<D: GpuBackend> RingAllocator<D> {
    /// Creates a ring without device memory; call [`create`](Self::create) next.
    pub fn new(device: Arc<D>, usage: wgpu::BufferUsages, lock: LockConfig) -> Self {
        Self {
            locks: LockManager::new(device.clone(), lock),
            buffer: DeviceBuffer::new(device, usage),
            head: 0,
            pending: 0,
            stats: RingStats::default(),
        }
    }

    /// Creates and allocates a ring in one step.
    pub fn with_config(device: Arc<D>, config: RingConfig) -> Result<Self> {
        let RingConfig {
            storage,
            usage,
            num_atoms,
            atom_size,
            lock,
            label,
        } = config;

        let mut buffer = DeviceBuffer::new(device.clone(), usage);
        if let Some(label) = label {
            buffer = buffer.with_label(label);
        }
        let mut ring = Self {
            locks: LockManager::new(device, lock),
            buffer,
            head: 0,
            pending: 0,
            stats: RingStats::default(),
        };
        ring.create(storage, num_atoms, atom_size)?;
        Ok(ring)
    }

    /// Allocates the backing buffer and resets the head.
    pub fn create(&mut self, storage: StorageMode, num_atoms: u32, atom_size: u64) -> Result<()> {
        self.buffer.create(storage, num_atoms, atom_size)?;
        self.head = 0;
        self.pending = 0;
        Ok(())
    }

    /// Waits for every outstanding fence, then releases the backing buffer.
    ///
    /// The buffer is released even if a wait fails; the first error is returned.
    pub fn destroy(&mut self) -> Result<()> {
        let waited = self.locks.wait_all();
        let destroyed = self.buffer.destroy();
        self.head = 0;
        self.pending = 0;
        waited.and(destroyed)
    }

    /// Maps the next `atom_count` atoms for writing.
    ///
    /// Blocks (CPU-driven waits only) until the device has finished with any
    /// earlier data stored in those atoms.
    pub fn map(&mut self, atom_count: u32) -> Result<AtomWriter<'_, D>> {
        self.check_usable()?;
        if !self.buffer.is_created() {
            return Err(Error::NotCreated);
        }

        let capacity = self.buffer.num_atoms();
        if atom_count > capacity {
            return Err(Error::CapacityExceeded {
                requested: atom_count,
                capacity,
            });
        }
        if atom_count == 0 {
            return Ok(AtomWriter::new(self, std::ptr::NonNull::dangling(), 0));
        }

        let mut lock_start = self.head;
        if u64::from(lock_start) + u64::from(atom_count) > u64::from(capacity) {
            let wasted = capacity - lock_start;
            log::debug!(
                "RingAllocator: wrapping for {atom_count} atoms, skipping {wasted} tail atoms"
            );
            self.stats.wraps += 1;
            self.stats.wasted_atoms += u64::from(wasted);
            lock_start = 0;
            self.head = 0;
        }

        let range = ByteRange::atoms(lock_start, atom_count, self.buffer.atom_stride());
        self.locks.wait_for_range(range)?;

        let ptr = self.buffer.map_range(lock_start, atom_count)?;
        self.pending = atom_count;
        self.stats.allocations += 1;
        Ok(AtomWriter::new(self, ptr, atom_count))
    }

    /// Ends the current mapping.
    ///
    /// [`AtomWriter`] calls this itself; calling it with nothing mapped is a no-op.
    pub fn unmap(&mut self) -> Result<()> {
        self.buffer.unmap()
    }

    /// Fences the atoms of the last map and advances the head past them.
    ///
    /// Call after the commands reading those atoms have been recorded, so the
    /// fence lands after them in the command stream.
    pub fn on_usage_complete(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.pending > 0 {
            let range = ByteRange::atoms(self.head, self.pending, self.buffer.atom_stride());
            self.locks.lock_range(range)?;
            let next = (u64::from(self.head) + u64::from(self.pending))
                % u64::from(self.buffer.num_atoms());
            // Less than num_atoms, so it fits.
            self.head = next as u32;
        }
        self.pending = 0;
        Ok(())
    }

    /// Fences atoms the device reads again without them being rewritten.
    ///
    /// The head does not move.
    pub fn lock_atoms(&mut self, first: u32, atom_count: u32) -> Result<()> {
        self.check_usable()?;
        let num_atoms = self.buffer.num_atoms();
        if u64::from(first) + u64::from(atom_count) > u64::from(num_atoms) {
            return Err(Error::OutOfBounds {
                offset: first,
                len: atom_count,
                num_atoms,
            });
        }
        let range = ByteRange::atoms(first, atom_count, self.buffer.atom_stride());
        self.locks.lock_range(range)
    }

    /// Closes any pending allocation, then writes `atom_count` atoms from `data`.
    ///
    /// `data` holds the atoms tightly packed (`atom_size` bytes each); they are
    /// spread out to the ring's stride.
    pub fn upload(&mut self, data: &[u8], atom_count: u32) -> Result<()> {
        let atom_size = self.buffer.atom_size() as usize;
        let needed = atom_size * atom_count as usize;
        if data.len() < needed {
            return Err(Error::ShortUpload {
                atoms: atom_count,
                needed,
                provided: data.len(),
            });
        }

        self.on_usage_complete()?;
        let mut writer = self.map(atom_count)?;
        for index in 0..atom_count {
            let start = index as usize * atom_size;
            writer.write_atom(index, &data[start..start + atom_size])?;
        }
        writer.unmap()
    }

    /// Uploads one `T` per atom; `T` must be exactly one atom large.
    pub fn upload_pod<T: Pod>(&mut self, items: &[T]) -> Result<()> {
        let element = std::mem::size_of::<T>();
        if element as u64 != self.buffer.atom_size() {
            return Err(Error::AtomSizeMismatch {
                element,
                atom: self.buffer.atom_size(),
            });
        }
        let count = u32::try_from(items.len()).map_err(|_| Error::CapacityExceeded {
            requested: u32::MAX,
            capacity: self.buffer.num_atoms(),
        })?;
        self.upload(bytemuck::cast_slice(items), count)
    }

    /// Binds `atom_count` atoms starting `atom_offset` atoms past the head.
    pub fn bind_range(&self, slot: u32, atom_offset: u32, atom_count: u32) -> Result<()> {
        let first = self
            .head
            .checked_add(atom_offset)
            .ok_or(Error::OutOfBounds {
                offset: atom_offset,
                len: atom_count,
                num_atoms: self.buffer.num_atoms(),
            })?;
        self.buffer.bind_range(slot, first, atom_count)
    }

    /// Binds the most recently written atoms (at the head, before it advances).
    pub fn bind_current(&self, slot: u32, atom_count: u32) -> Result<()> {
        self.bind_range(slot, 0, atom_count)
    }

    /// Binds the whole backing buffer.
    pub fn bind_whole(&self, slot: u32) -> Result<()> {
        self.buffer.bind_whole(slot)
    }

    fn check_usable(&self) -> Result<()> {
        if self.locks.is_poisoned() {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    /// Next atom to allocate.
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Byte offset of the head.
    pub fn head_offset(&self) -> u64 {
        u64::from(self.head) * self.buffer.atom_stride()
    }

    /// Size of the backing buffer in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.buffer.size_bytes()
    }

    /// Atoms mapped but not fenced yet.
    pub fn pending_atoms(&self) -> u32 {
        self.pending
    }

    pub fn buffer(&self) -> &DeviceBuffer<D> {
        &self.buffer
    }

    pub fn locks(&self) -> &LockManager<D> {
        &self.locks
    }

    pub fn is_poisoned(&self) -> bool {
        self.locks.is_poisoned()
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }
}
