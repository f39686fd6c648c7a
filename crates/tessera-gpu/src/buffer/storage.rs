/// CPU update strategy of a [`DeviceBuffer`](super::DeviceBuffer).
///
/// Both modes expose the same map/unmap contract; they differ in who keeps the
/// CPU from overwriting memory the device is still reading.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum StorageMode {
    /// Every write maps its sub-range with invalidate + unsynchronized, writes,
    /// then unmaps. The driver may hand out fresh backing memory per map.
    #[default]
    Orphaning,

    /// The buffer is mapped once at creation and stays mapped. Map/unmap are
    /// pointer arithmetic only; correctness relies entirely on fences.
    PersistentMapped,
}
