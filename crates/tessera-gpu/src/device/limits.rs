/// Device limits consumed by the buffer layer.
///
/// Only the offset alignments matter here: every atom of a
/// [`DeviceBuffer`](crate::buffer::DeviceBuffer) must start on a boundary the
/// device accepts as a binding offset.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceLimits {
    /// Required alignment of uniform buffer binding offsets, in bytes.
    pub min_uniform_offset_alignment: u64,

    /// Required alignment of storage buffer binding offsets, in bytes.
    pub min_storage_offset_alignment: u64,
}

impl DeviceLimits {
    /// Limits with the same alignment for uniform and storage bindings.
    pub fn with_alignment(alignment: u64) -> Self {
        Self {
            min_uniform_offset_alignment: alignment,
            min_storage_offset_alignment: alignment,
        }
    }

    /// Returns the offset alignment that applies to a buffer with `usage`.
    ///
    /// When a buffer is bound both ways the stricter requirement wins. Buffers
    /// that are never bound as uniform or storage only need copy alignment.
    pub fn offset_alignment(&self, usage: wgpu::BufferUsages) -> u64 {
        let mut alignment = wgpu::COPY_BUFFER_ALIGNMENT;
        if usage.contains(wgpu::BufferUsages::UNIFORM) {
            alignment = alignment.max(self.min_uniform_offset_alignment);
        }
        if usage.contains(wgpu::BufferUsages::STORAGE) {
            alignment = alignment.max(self.min_storage_offset_alignment);
        }
        alignment.max(1)
    }
}

impl From<&wgpu::Limits> for DeviceLimits {
    fn from(limits: &wgpu::Limits) -> Self {
        Self {
            min_uniform_offset_alignment: u64::from(limits.min_uniform_buffer_offset_alignment),
            min_storage_offset_alignment: u64::from(limits.min_storage_buffer_offset_alignment),
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::from(&wgpu::Limits::default())
    }
}

/// Rounds `size` up to the next multiple of `alignment`.
///
/// `alignment` does not need to be a power of two; some drivers report odd
/// values for vertex-only buffers.
pub fn align_up(size: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    size.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(64, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(0, 256), 0);
    }

    #[test]
    fn align_up_handles_non_power_of_two() {
        assert_eq!(align_up(10, 12), 12);
        assert_eq!(align_up(25, 12), 36);
    }

    #[test]
    fn uniform_usage_uses_uniform_alignment() {
        let limits = DeviceLimits {
            min_uniform_offset_alignment: 256,
            min_storage_offset_alignment: 64,
        };
        assert_eq!(limits.offset_alignment(wgpu::BufferUsages::UNIFORM), 256);
        assert_eq!(limits.offset_alignment(wgpu::BufferUsages::STORAGE), 64);
        assert_eq!(
            limits.offset_alignment(wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::STORAGE),
            256
        );
    }

    #[test]
    fn vertex_usage_only_needs_copy_alignment() {
        let limits = DeviceLimits::with_alignment(256);
        assert_eq!(
            limits.offset_alignment(wgpu::BufferUsages::VERTEX),
            wgpu::COPY_BUFFER_ALIGNMENT
        );
    }

    #[test]
    fn default_matches_wgpu_defaults() {
        let wgpu_limits = wgpu::Limits::default();
        let limits = DeviceLimits::default();
        assert_eq!(
            limits.min_uniform_offset_alignment,
            u64::from(wgpu_limits.min_uniform_buffer_offset_alignment)
        );
    }
}
