//! Device copies of CPU-side buffers.
//!
//! A `SysmemBuffer` is the authoritative CPU copy; a `BufferMirror` keeps a
//! device copy of it, re-uploading only when the CPU copy's stamp changed.
//! Dynamic buffers are streamed through a small ring so the device can still
//! read last frame's version while this frame's is written.

mod buffer_mirror;
mod sysmem;

pub use buffer_mirror::{BufferMirror, MirrorConfig};
pub use sysmem::SysmemBuffer;
