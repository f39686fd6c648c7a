use std::fmt;

/// Half-open byte interval `[start, start + size)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub size: u64,
}

impl ByteRange {
    #[inline]
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Range covering `count` atoms starting at atom `first`, for atoms laid out
    /// every `stride` bytes.
    #[inline]
    pub fn atoms(first: u32, count: u32, stride: u64) -> Self {
        Self {
            start: u64::from(first) * stride,
            size: u64::from(count) * stride,
        }
    }

    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns true if the two ranges share at least one byte.
    ///
    /// Touching ranges (`a.end() == b.start`) do not overlap.
    #[inline]
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end())
    }
}
