use crate::error::StorageError;
use core::fmt::{Debug, Display};

/// Address of a device memory location.
///
/// The allocators only ever do byte arithmetic on it; it is never dereferenced.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null device pointer.
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Wraps a raw device address.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The raw device address.
    pub const fn addr(&self) -> u64 {
        self.0
    }

    /// Whether this is the null pointer.
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The pointer `bytes` past this one, or `None` if the address space would overflow.
    pub fn offset(&self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl Display for DevicePtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kind of memory a backend hands out.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum MemoryKind {
    /// High bandwidth memory attached to the device.
    #[default]
    #[serde(rename = "device")]
    Device,
    /// Device memory registered for peer-to-peer / RDMA transfers.
    #[serde(rename = "p2p")]
    P2p,
    /// Page-locked host memory visible to the device.
    #[serde(rename = "host")]
    Host,
}

/// The DeviceMemoryBackend trait is the raw allocator the caching allocators sit in front of.
///
/// Allocations made through it are expected to be large and expensive. The allocators only
/// ever return whole extents they obtained from the same backend, and never free twice.
pub trait DeviceMemoryBackend: Send + Debug {
    /// Allocates `size` bytes on the given device.
    ///
    /// `purpose` is a free-form tag describing the caller, forwarded to driver diagnostics.
    fn allocate(
        &mut self,
        purpose: &str,
        size: u64,
        device_id: u32,
    ) -> Result<DevicePtr, StorageError>;

    /// Frees an extent previously returned by [allocate](DeviceMemoryBackend::allocate).
    fn free(&mut self, ptr: DevicePtr, device_id: u32) -> Result<(), StorageError>;

    /// Whether this backend can serve the given kind of memory.
    fn supports(&self, _kind: MemoryKind) -> bool {
        true
    }

    /// Makes `device_id` the current device of the calling thread.
    ///
    /// Drivers that keep a per-thread current device require this before allocating.
    fn bind_device(&mut self, _device_id: u32) -> Result<(), StorageError> {
        Ok(())
    }
}
