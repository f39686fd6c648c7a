use std::ptr::NonNull;

use crate::device::GpuBackend;
use crate::error::{Error, Result};

use super::RingAllocator;

/// Write access to atoms mapped by [`RingAllocator::map`].
///
/// The writer mutably borrows the ring, so the mapped pointer cannot outlive the
/// unmap. Dropping the writer unmaps; [`unmap`](Self::unmap) does the same but
/// reports device errors. The range still has to be fenced with
/// [`RingAllocator::on_usage_complete`] once the commands reading it are recorded.
pub struct AtomWriter<'a, D: GpuBackend> {
    ring: &'a mut RingAllocator<D>,
    ptr: NonNull<u8>,
    atoms: u32,
    atom_size: usize,
    atom_stride: usize,
    unmapped: bool,
}

impl<'a, D: GpuBackend> AtomWriter<'a, D> {
    pub(super) fn new(ring: &'a mut RingAllocator<D>, ptr: NonNull<u8>, atoms: u32) -> Self {
        let atom_size = ring.buffer().atom_size() as usize;
        let atom_stride = ring.buffer().atom_stride() as usize;
        Self {
            ring,
            ptr,
            atoms,
            atom_size,
            atom_stride,
            unmapped: false,
        }
    }

    /// Number of atoms mapped.
    pub fn atom_count(&self) -> u32 {
        self.atoms
    }

    pub fn atom_size(&self) -> usize {
        self.atom_size
    }

    pub fn atom_stride(&self) -> usize {
        self.atom_stride
    }

    /// The whole mapped region, stride padding included.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.atoms as usize * self.atom_stride;
        // Safety: the ring mapped `atoms * stride` writable bytes at `ptr` and
        // keeps them mapped while this writer borrows it. A zero-length mapping
        // uses a dangling pointer, which is valid for an empty slice.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), len) }
    }

    /// The `atom_size` meaningful bytes of atom `index`.
    pub fn atom_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        if index >= self.atoms {
            return None;
        }
        let start = index as usize * self.atom_stride;
        let end = start + self.atom_size;
        Some(&mut self.as_bytes_mut()[start..end])
    }

    /// Copies `bytes` to the start of atom `index`.
    pub fn write_atom(&mut self, index: u32, bytes: &[u8]) -> Result<()> {
        let atom_size = self.atom_size;
        if bytes.len() > atom_size {
            return Err(Error::AtomSizeMismatch {
                element: bytes.len(),
                atom: atom_size as u64,
            });
        }
        let atoms = self.atoms;
        let atom = self.atom_mut(index).ok_or(Error::OutOfBounds {
            offset: index,
            len: 1,
            num_atoms: atoms,
        })?;
        atom[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Ends the mapping.
    pub fn unmap(mut self) -> Result<()> {
        self.unmapped = true;
        self.ring.unmap()
    }
}

impl<D: GpuBackend> Drop for AtomWriter<'_, D> {
    fn drop(&mut self) {
        if self.unmapped {
            return;
        }
        if let Err(err) = self.ring.unmap() {
            log::error!("AtomWriter: unmap failed: {err}");
        }
    }
}
