//! Error types for tessera.

use thiserror::Error;

use crate::device::DeviceError;
use crate::sync::ByteRange;

/// Result type alias using tessera's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the buffer, sync and ring layers.
#[derive(Error, Debug)]
pub enum Error {
    /// A map request can never fit, even into an empty ring.
    #[error("requested {requested} atoms but the ring only holds {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },

    /// `create` was called on a buffer that is already live.
    #[error("buffer already created; destroy it first")]
    AlreadyCreated,

    /// The buffer was used before `create` (or after `destroy`).
    #[error("buffer has not been created")]
    NotCreated,

    /// Atom count or atom size is zero.
    #[error("invalid buffer layout: {num_atoms} atoms of {atom_size} bytes")]
    InvalidLayout { num_atoms: u32, atom_size: u64 },

    /// An atom range reaches past the end of the buffer.
    #[error("{len} atoms at offset {offset} exceed a buffer of {num_atoms} atoms")]
    OutOfBounds { offset: u32, len: u32, num_atoms: u32 },

    /// A byte range reaches past the end of a mirrored buffer.
    #[error("bytes {range} exceed a buffer of {size} bytes")]
    RangeOutOfBounds { range: ByteRange, size: u64 },

    /// Upload source is smaller than the atoms it claims to fill.
    #[error("upload of {atoms} atoms needs {needed} bytes, got {provided}")]
    ShortUpload {
        atoms: u32,
        needed: usize,
        provided: usize,
    },

    /// Typed upload element does not match the ring's atom size.
    #[error("element size {element} does not match atom size {atom}")]
    AtomSizeMismatch { element: usize, atom: u64 },

    /// The device failed to wait on a fence; the protected memory may still be in use.
    #[error("fence wait failed for bytes {range}")]
    FenceWait {
        range: ByteRange,
        #[source]
        source: DeviceError,
    },

    /// The device could not fence a range it is about to read.
    #[error("fence insertion failed for bytes {range}")]
    FenceInsert {
        range: ByteRange,
        #[source]
        source: DeviceError,
    },

    /// The watchdog gave up on a fence that never signaled.
    #[error("fence for bytes {range} did not signal after {timeouts} long waits")]
    FenceTimeout { range: ByteRange, timeouts: u32 },

    /// An earlier fence failure left the resource unusable.
    #[error("resource is unusable after a fence failure")]
    Poisoned,

    /// Device call failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// High-level response to an [`Error`] for the code driving a frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorAction {
    /// Transient failure; drop this frame's update and try again later.
    SkipFrame,
    /// The resource (or the rendering context) cannot be used anymore.
    Fatal,
}

impl Error {
    /// Classifies the error for the caller.
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Device(DeviceError::OutOfMemory { .. } | DeviceError::MapFailed { .. }) => {
                ErrorAction::SkipFrame
            }
            Error::Device(_)
            | Error::FenceWait { .. }
            | Error::FenceInsert { .. }
            | Error::FenceTimeout { .. }
            | Error::Poisoned
            | Error::CapacityExceeded { .. }
            | Error::AlreadyCreated
            | Error::NotCreated
            | Error::InvalidLayout { .. }
            | Error::OutOfBounds { .. }
            | Error::RangeOutOfBounds { .. }
            | Error::ShortUpload { .. }
            | Error::AtomSizeMismatch { .. } => ErrorAction::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failures_skip_the_frame() {
        let err = Error::from(DeviceError::OutOfMemory { requested: 1024 });
        assert_eq!(err.action(), ErrorAction::SkipFrame);
    }

    #[test]
    fn fence_failures_are_fatal() {
        let err = Error::FenceWait {
            range: ByteRange::new(0, 256),
            source: DeviceError::Lost,
        };
        assert_eq!(err.action(), ErrorAction::Fatal);
        assert_eq!(Error::Poisoned.action(), ErrorAction::Fatal);
    }

    #[test]
    fn fence_insert_failure_is_fatal_even_when_out_of_memory() {
        let err = Error::FenceInsert {
            range: ByteRange::new(0, 256),
            source: DeviceError::OutOfMemory { requested: 0 },
        };
        assert_eq!(err.action(), ErrorAction::Fatal);
        assert_eq!(err.to_string(), "fence insertion failed for bytes 0..256");
    }

    #[test]
    fn capacity_error_message_names_both_sizes() {
        let err = Error::CapacityExceeded {
            requested: 12,
            capacity: 10,
        };
        assert_eq!(
            err.to_string(),
            "requested 12 atoms but the ring only holds 10"
        );
    }

    #[test]
    fn out_of_bounds_message_shows_range() {
        let err = Error::OutOfBounds {
            offset: 8,
            len: 3,
            num_atoms: 10,
        };
        assert_eq!(err.to_string(), "3 atoms at offset 8 exceed a buffer of 10 atoms");
    }
}
