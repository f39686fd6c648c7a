/// CPU-side copy of a buffer's contents.
///
/// Every modification bumps the stamp; a [`BufferMirror`](super::BufferMirror)
/// compares stamps to decide whether its device copy is stale.
#[derive(Debug, Clone, Default)]
pub struct SysmemBuffer {
    data: Vec<u8>,
    stamp: u64,
    dynamic: bool,
}

impl SysmemBuffer {
    /// Empty buffer. `dynamic` marks contents expected to change every frame.
    pub fn new(dynamic: bool) -> Self {
        Self {
            data: Vec::new(),
            stamp: 0,
            dynamic,
        }
    }

    pub fn with_data(dynamic: bool, bytes: &[u8]) -> Self {
        let mut buffer = Self::new(dynamic);
        buffer.set_data(bytes);
        buffer
    }

    /// Replaces the whole contents.
    pub fn set_data(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.stamp += 1;
    }

    /// Overwrites `bytes.len()` bytes at `offset`, growing the buffer with zeros if needed.
    pub fn update(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
        self.stamp += 1;
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Modification counter; 0 for a buffer that was never written.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
