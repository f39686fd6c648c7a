use thiserror::Error;

/// Failure reported by a [`GpuBackend`](super::GpuBackend).
///
/// Backends never retry internally; whatever the driver reports is surfaced here
/// and the layers above decide whether the resource is still usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device refused to allocate the requested number of bytes.
    #[error("device out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    /// The device refused to map a range of a buffer.
    #[error("failed to map {len} bytes at offset {offset}: {reason}")]
    MapFailed {
        offset: u64,
        len: u64,
        reason: String,
    },

    /// A handle did not name a live object on this device.
    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    /// The device (or its context) was lost; nothing on it can be trusted anymore.
    #[error("device lost")]
    Lost,

    /// Backend-specific failure that fits no other variant.
    #[error("{0}")]
    Other(String),
}
