use std::sync::Arc;

use crate::buffer::{DeviceBuffer, StorageMode};
use crate::device::GpuBackend;
use crate::error::{Error, Result};
use crate::ring::{RingAllocator, RingConfig};
use crate::sync::{ByteRange, LockConfig};

use super::SysmemBuffer;

/// How a [`BufferMirror`] backs its device copy.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Ring depth for dynamic buffers, in copies of the whole buffer.
    pub dynamic_atoms: u32,

    /// Storage of the ring backing dynamic buffers.
    pub dynamic_storage: StorageMode,

    pub usage: wgpu::BufferUsages,

    /// Fence wait policy of the dynamic ring.
    pub lock: LockConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            dynamic_atoms: 3,
            dynamic_storage: StorageMode::PersistentMapped,
            usage: wgpu::BufferUsages::UNIFORM,
            lock: LockConfig::default(),
        }
    }
}

enum Backing<D: GpuBackend> {
    Empty,
    /// Rarely changing data: one orphaned allocation, rewritten in place.
    Static(DeviceBuffer<D>),
    /// Per-frame data: a ring of whole-buffer copies.
    Dynamic {
        ring: RingAllocator<D>,
        // Atom holding the latest copy.
        current: u32,
        // The current atom was bound since it was last fenced.
        bound: bool,
        // The whole ring was bound since it was last fenced.
        bound_whole: bool,
    },
}

/// Device copy of a [`SysmemBuffer`], refreshed whenever the CPU copy changes.
///
/// Dynamic buffers stream each new version into a fresh ring atom so the
/// device can keep reading older versions; static buffers are overwritten
/// through an orphaning map.
pub struct BufferMirror<D: GpuBackend> {
    device: Arc<D>,
    config: MirrorConfig,
    backing: Backing<D>,
    stamp: Option<u64>,
    size: u64,
    synced_at_batch: Option<u64>,
    warned_partial_bind: bool,
}

impl<D: GpuBackend> BufferMirror<D> {
    pub fn new(device: Arc<D>, config: MirrorConfig) -> Self {
        Self {
            device,
            config,
            backing: Backing::Empty,
            stamp: None,
            size: 0,
            synced_at_batch: None,
            warned_partial_bind: false,
        }
    }

    /// Brings the device copy up to date with `sysmem`.
    ///
    /// Does nothing when `sysmem` has not changed since the last sync.
    pub fn sync(&mut self, sysmem: &SysmemBuffer, batch: u64) -> Result<()> {
        if self.is_synced(sysmem) {
            return Ok(());
        }

        if sysmem.size() == 0 {
            self.release()?;
        } else if sysmem.is_dynamic() {
            self.sync_dynamic(sysmem)?;
        } else {
            self.sync_static(sysmem)?;
        }

        self.stamp = Some(sysmem.stamp());
        self.size = sysmem.size();
        self.synced_at_batch = Some(batch);
        Ok(())
    }

    fn sync_dynamic(&mut self, sysmem: &SysmemBuffer) -> Result<()> {
        let size = sysmem.size();
        let fits = matches!(
            &self.backing,
            Backing::Dynamic { ring, .. } if ring.buffer().atom_size() >= size
        );
        if !fits {
            self.release()?;
            let config = RingConfig {
                storage: self.config.dynamic_storage,
                usage: self.config.usage,
                lock: self.config.lock.clone(),
                ..RingConfig::new(self.config.dynamic_atoms, size)
            };
            let ring = RingAllocator::with_config(self.device.clone(), config)?;
            log::debug!(
                "BufferMirror: dynamic ring of {} x {size} bytes",
                self.config.dynamic_atoms
            );
            self.backing = Backing::Dynamic {
                ring,
                current: 0,
                bound: false,
                bound_whole: false,
            };
        }

        self.close_usage()?;
        if let Backing::Dynamic { ring, current, .. } = &mut self.backing {
            let mut writer = ring.map(1)?;
            writer.write_atom(0, sysmem.as_bytes())?;
            writer.unmap()?;
            *current = ring.head();
        }
        Ok(())
    }

    fn sync_static(&mut self, sysmem: &SysmemBuffer) -> Result<()> {
        let size = sysmem.size();
        let fits = matches!(&self.backing, Backing::Static(buffer) if buffer.atom_size() == size);
        if !fits {
            self.release()?;
            let mut buffer = DeviceBuffer::new(self.device.clone(), self.config.usage);
            buffer.create(StorageMode::Orphaning, 1, size)?;
            self.backing = Backing::Static(buffer);
        }

        if let Backing::Static(buffer) = &mut self.backing {
            let bytes = sysmem.as_bytes();
            let ptr = buffer.map_range(0, 1)?;
            // Safety: one mapped atom holds at least `size` writable bytes.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
            buffer.unmap()?;
        }
        Ok(())
    }

    /// Byte offset of the latest copy inside the device buffer.
    pub fn head_offset(&self) -> u64 {
        match &self.backing {
            Backing::Dynamic { ring, current, .. } => {
                u64::from(*current) * ring.buffer().atom_stride()
            }
            Backing::Empty | Backing::Static(_) => 0,
        }
    }

    /// Binds `len` bytes at `offset` of the mirrored data to `slot`.
    ///
    /// A dynamic buffer can only be bound whole; any other range is ignored.
    pub fn bind_range(&mut self, slot: u32, offset: u64, len: u64) -> Result<()> {
        match &mut self.backing {
            Backing::Empty => Err(Error::NotCreated),
            Backing::Static(buffer) => {
                let range = ByteRange::new(offset, len);
                if offset.checked_add(len).is_none_or(|end| end > self.size) {
                    return Err(Error::RangeOutOfBounds {
                        range,
                        size: self.size,
                    });
                }
                let handle = buffer.handle().ok_or(Error::NotCreated)?;
                buffer
                    .device()
                    .bind_range(handle, buffer.usage(), slot, offset, len);
                Ok(())
            }
            Backing::Dynamic {
                ring,
                current,
                bound,
                ..
            } => {
                if offset == 0 && len == self.size {
                    ring.buffer().bind_range(slot, *current, 1)?;
                    *bound = true;
                } else if !self.warned_partial_bind {
                    self.warned_partial_bind = true;
                    log::warn!(
                        "BufferMirror: partial bind ({offset}, {len}) of a {} byte dynamic buffer is not supported",
                        self.size
                    );
                }
                Ok(())
            }
        }
    }

    /// Binds the whole device buffer to `slot`.
    ///
    /// For dynamic data that is every copy in the ring; shaders locate the
    /// latest one with [`head_offset`](Self::head_offset).
    pub fn bind_whole(&mut self, slot: u32) -> Result<()> {
        match &mut self.backing {
            Backing::Empty => Err(Error::NotCreated),
            Backing::Static(buffer) => buffer.bind_whole(slot),
            Backing::Dynamic {
                ring, bound_whole, ..
            } => {
                ring.bind_whole(slot)?;
                *bound_whole = true;
                Ok(())
            }
        }
    }

    /// Fences the reads recorded since the last sync.
    pub fn on_usage_complete(&mut self) -> Result<()> {
        self.close_usage()
    }

    fn close_usage(&mut self) -> Result<()> {
        if let Backing::Dynamic {
            ring,
            current,
            bound,
            bound_whole,
        } = &mut self.backing
        {
            let had_pending = ring.pending_atoms() > 0;
            if had_pending {
                ring.on_usage_complete()?;
            }
            if *bound_whole {
                let num_atoms = ring.buffer().num_atoms();
                ring.lock_atoms(0, num_atoms)?;
            } else if *bound && !had_pending {
                ring.lock_atoms(*current, 1)?;
            }
            *bound = false;
            *bound_whole = false;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.backing, Backing::Empty) {
            Backing::Empty => Ok(()),
            Backing::Static(mut buffer) => buffer.destroy(),
            Backing::Dynamic { mut ring, .. } => ring.destroy(),
        }
    }

    /// Releases the device copy; the next sync starts from scratch.
    pub fn destroy(&mut self) -> Result<()> {
        self.stamp = None;
        self.size = 0;
        self.release()
    }

    /// True when the device copy reflects the current contents of `sysmem`.
    pub fn is_synced(&self, sysmem: &SysmemBuffer) -> bool {
        self.stamp == Some(sysmem.stamp())
    }

    /// Batch number passed to the last sync that did work.
    pub fn synced_at_batch(&self) -> Option<u64> {
        self.synced_at_batch
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.backing, Backing::Dynamic { .. })
    }

    /// Size in bytes of the mirrored data.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device buffer holding the copy.
    pub fn buffer(&self) -> Option<&DeviceBuffer<D>> {
        match &self.backing {
            Backing::Empty => None,
            Backing::Static(buffer) => Some(buffer),
            Backing::Dynamic { ring, .. } => Some(ring.buffer()),
        }
    }
}
