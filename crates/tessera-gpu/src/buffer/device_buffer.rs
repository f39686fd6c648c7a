use std::ptr::NonNull;
use std::sync::Arc;

use crate::device::{align_up, BufferRequest, DeviceError, GpuBackend};
use crate::error::{Error, Result};
use crate::sync::ByteRange;

use super::StorageMode;

/// One fixed-size device allocation divided into equally sized atoms.
///
/// Atoms are `atom_size` meaningful bytes padded to `atom_stride`, the smallest
/// multiple of the device offset alignment that holds one atom, so that every
/// atom can be bound on its own. All addressing is in atoms.
///
/// The buffer does no synchronization of its own; see
/// [`LockManager`](crate::sync::LockManager).
pub struct DeviceBuffer<D: GpuBackend> {
    device: Arc<D>,
    usage: wgpu::BufferUsages,
    label: Option<String>,

    storage: StorageMode,
    handle: Option<D::Buffer>,

    /// Base pointer of a persistently mapped buffer.
    persistent: Option<NonNull<u8>>,

    /// An orphaning map is outstanding.
    mapping_active: bool,

    num_atoms: u32,
    atom_size: u64,
    atom_stride: u64,
}

impl<D: GpuBackend> DeviceBuffer<D> {
    /// Creates an empty buffer; no device memory is allocated until [`create`](Self::create).
    pub fn new(device: Arc<D>, usage: wgpu::BufferUsages) -> Self {
        Self {
            device,
            usage,
            label: None,
            storage: StorageMode::default(),
            handle: None,
            persistent: None,
            mapping_active: false,
            num_atoms: 0,
            atom_size: 0,
            atom_stride: 0,
        }
    }

    /// Sets the debug label used for the next allocation.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Allocates `num_atoms` atoms of `atom_size` bytes.
    ///
    /// On failure nothing stays allocated and the buffer remains empty.
    pub fn create(&mut self, storage: StorageMode, num_atoms: u32, atom_size: u64) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::AlreadyCreated);
        }
        if num_atoms == 0 || atom_size == 0 {
            return Err(Error::InvalidLayout {
                num_atoms,
                atom_size,
            });
        }

        let alignment = self.device.limits().offset_alignment(self.usage);
        let atom_stride = align_up(atom_size, alignment);
        let size = atom_stride
            .checked_mul(u64::from(num_atoms))
            .ok_or(DeviceError::OutOfMemory {
                requested: u64::MAX,
            })?;

        let handle = self.device.allocate(&BufferRequest {
            size,
            storage,
            usage: self.usage,
            label: self.label.as_deref(),
        })?;

        let persistent = match storage {
            StorageMode::Orphaning => None,
            StorageMode::PersistentMapped => {
                match self.device.map(&handle, 0, size, storage.into()) {
                    Ok(ptr) => Some(ptr),
                    Err(err) => {
                        self.device.free(handle);
                        return Err(err.into());
                    }
                }
            }
        };

        log::debug!(
            "DeviceBuffer {:?}: created {num_atoms} atoms of {atom_size} bytes (stride {atom_stride}, {storage:?})",
            self.label
        );

        self.storage = storage;
        self.handle = Some(handle);
        self.persistent = persistent;
        self.mapping_active = false;
        self.num_atoms = num_atoms;
        self.atom_size = atom_size;
        self.atom_stride = atom_stride;
        Ok(())
    }

    /// Unmaps (if mapped) and releases the device allocation.
    ///
    /// Calling this on an empty buffer is a no-op. The allocation is released
    /// even when the unmap fails; the unmap error is still returned.
    pub fn destroy(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let was_mapped = self.persistent.take().is_some() || self.mapping_active;
        let unmapped = if was_mapped {
            self.device.unmap(&handle)
        } else {
            Ok(())
        };
        self.device.free(handle);

        log::debug!("DeviceBuffer {:?}: destroyed", self.label);

        self.mapping_active = false;
        self.num_atoms = 0;
        self.atom_size = 0;
        self.atom_stride = 0;
        unmapped.map_err(Error::from)
    }

    /// Returns a CPU pointer to `atom_len` atoms starting at `atom_offset`.
    ///
    /// The pointer addresses `atom_len * atom_stride` writable bytes and must not
    /// be used after [`unmap`](Self::unmap). A zero-length request returns a
    /// dangling pointer without touching the device.
    pub fn map_range(&mut self, atom_offset: u32, atom_len: u32) -> Result<NonNull<u8>> {
        let range = self.atom_range(atom_offset, atom_len)?;
        if range.is_empty() {
            return Ok(NonNull::dangling());
        }

        match self.storage {
            StorageMode::Orphaning => {
                let handle = self.handle.as_ref().ok_or(Error::NotCreated)?;
                let ptr = self
                    .device
                    .map(handle, range.start, range.size, self.storage.into())?;
                self.mapping_active = true;
                Ok(ptr)
            }
            StorageMode::PersistentMapped => {
                let base = self.persistent.ok_or(Error::NotCreated)?;
                // Safety: `atom_range` checked the range lies inside the mapping.
                Ok(unsafe { base.add(range.start as usize) })
            }
        }
    }

    /// Ends the mapping started by [`map_range`](Self::map_range).
    ///
    /// No-op for persistently mapped buffers and when nothing is mapped.
    pub fn unmap(&mut self) -> Result<()> {
        if self.storage == StorageMode::PersistentMapped || !self.mapping_active {
            return Ok(());
        }
        let handle = self.handle.as_ref().ok_or(Error::NotCreated)?;
        self.mapping_active = false;
        self.device.unmap(handle)?;
        Ok(())
    }

    /// Binds `atom_len` atoms starting at `atom_offset` to `slot`.
    pub fn bind_range(&self, slot: u32, atom_offset: u32, atom_len: u32) -> Result<()> {
        let range = self.atom_range(atom_offset, atom_len)?;
        let handle = self.handle.as_ref().ok_or(Error::NotCreated)?;
        self.device
            .bind_range(handle, self.usage, slot, range.start, range.size);
        Ok(())
    }

    /// Binds the whole buffer to `slot`.
    pub fn bind_whole(&self, slot: u32) -> Result<()> {
        self.bind_range(slot, 0, self.num_atoms)
    }

    fn atom_range(&self, atom_offset: u32, atom_len: u32) -> Result<ByteRange> {
        if self.handle.is_none() {
            return Err(Error::NotCreated);
        }
        if u64::from(atom_offset) + u64::from(atom_len) > u64::from(self.num_atoms) {
            return Err(Error::OutOfBounds {
                offset: atom_offset,
                len: atom_len,
                num_atoms: self.num_atoms,
            });
        }
        Ok(ByteRange::atoms(atom_offset, atom_len, self.atom_stride))
    }

    pub fn is_created(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&D::Buffer> {
        self.handle.as_ref()
    }

    pub fn storage(&self) -> StorageMode {
        self.storage
    }

    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }

    pub fn num_atoms(&self) -> u32 {
        self.num_atoms
    }

    /// Meaningful bytes per atom.
    pub fn atom_size(&self) -> u64 {
        self.atom_size
    }

    /// Distance in bytes between consecutive atoms.
    pub fn atom_stride(&self) -> u64 {
        self.atom_stride
    }

    /// Total allocation size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.atom_stride * u64::from(self.num_atoms)
    }

    /// Base pointer of a persistently mapped buffer.
    pub fn mapped_pointer(&self) -> Option<NonNull<u8>> {
        self.persistent
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuBackend> Drop for DeviceBuffer<D> {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::error!("DeviceBuffer {:?}: destroy failed: {err}", self.label);
        }
    }
}
