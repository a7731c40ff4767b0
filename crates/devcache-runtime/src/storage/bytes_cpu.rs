use super::{DeviceMemoryBackend, DevicePtr, MemoryKind};
use crate::error::StorageError;
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::format;
use alloc::vec::Vec;
use hashbrown::HashMap;

/// Alignment of every extent handed out by [BytesBackend].
pub const BYTES_BACKEND_ALIGNMENT: u64 = 512;

/// The bytes backend hands out host heap memory as if it were device memory.
///
/// It is the reference backend for tests and benchmarks: it can be capped to a capacity,
/// forced to fail, and counts every call it receives.
pub struct BytesBackend {
    memory: HashMap<DevicePtr, BytesAllocation>,
    kinds: Vec<MemoryKind>,
    capacity: Option<u64>,
    bytes_allocated: u64,
    alloc_calls: u64,
    free_calls: u64,
    failures_pending: u32,
    bound_device: Option<u32>,
}

struct BytesAllocation {
    ptr: *mut u8,
    layout: Layout,
}

// The raw pointers are only used to release the memory, and the backend is never shared.
unsafe impl Send for BytesBackend {}

impl core::fmt::Debug for BytesBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BytesBackend")
            .field("live_allocations", &self.memory.len())
            .field("bytes_allocated", &self.bytes_allocated)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for BytesBackend {
    fn default() -> Self {
        Self {
            memory: HashMap::new(),
            kinds: alloc::vec![MemoryKind::Device, MemoryKind::P2p, MemoryKind::Host],
            capacity: None,
            bytes_allocated: 0,
            alloc_calls: 0,
            free_calls: 0,
            failures_pending: 0,
            bound_device: None,
        }
    }
}

impl BytesBackend {
    /// Creates a backend that never runs out of memory until the host does.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that refuses allocations once `capacity` bytes are live.
    pub fn with_capacity(capacity: u64) -> Self {
        let mut backend = Self::default();
        backend.capacity = Some(capacity);
        backend
    }

    /// Only serve the given memory kinds.
    pub fn with_kinds(mut self, kinds: &[MemoryKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// Makes the next `count` allocations fail with [StorageError::OutOfMemory].
    pub fn fail_next(&mut self, count: u32) {
        self.failures_pending = count;
    }

    /// Number of calls to [allocate](DeviceMemoryBackend::allocate), failed ones included.
    pub fn alloc_calls(&self) -> u64 {
        self.alloc_calls
    }

    /// Number of successful calls to [free](DeviceMemoryBackend::free).
    pub fn free_calls(&self) -> u64 {
        self.free_calls
    }

    /// Bytes currently held by live allocations.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.memory.len()
    }

    /// The device selected by the last [bind_device](DeviceMemoryBackend::bind_device) call.
    pub fn bound_device(&self) -> Option<u32> {
        self.bound_device
    }
}

impl DeviceMemoryBackend for BytesBackend {
    fn allocate(
        &mut self,
        purpose: &str,
        size: u64,
        device_id: u32,
    ) -> Result<DevicePtr, StorageError> {
        self.alloc_calls += 1;

        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(StorageError::OutOfMemory { size });
        }

        if size == 0 {
            return Err(StorageError::Unknown(format!(
                "zero-sized allocation requested by {purpose}"
            )));
        }

        if let Some(capacity) = self.capacity
            && self.bytes_allocated.saturating_add(size) > capacity
        {
            log::debug!(
                "Bytes backend refused {size} bytes for {purpose} on device {device_id}: {} of {capacity} in use",
                self.bytes_allocated
            );
            return Err(StorageError::OutOfMemory { size });
        }

        let layout = usize::try_from(size)
            .ok()
            .and_then(|size| Layout::from_size_align(size, BYTES_BACKEND_ALIGNMENT as usize).ok())
            .ok_or(StorageError::OutOfMemory { size })?;

        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(StorageError::OutOfMemory { size });
        }

        let device_ptr = DevicePtr::new(ptr as u64);
        self.memory.insert(device_ptr, BytesAllocation { ptr, layout });
        self.bytes_allocated += size;

        Ok(device_ptr)
    }

    fn free(&mut self, ptr: DevicePtr, _device_id: u32) -> Result<(), StorageError> {
        let allocation = self
            .memory
            .remove(&ptr)
            .ok_or(StorageError::InvalidPointer { ptr })?;

        self.bytes_allocated -= allocation.layout.size() as u64;
        self.free_calls += 1;

        // SAFETY: the pointer was allocated with this exact layout and removed from the map.
        unsafe { dealloc(allocation.ptr, allocation.layout) };

        Ok(())
    }

    fn supports(&self, kind: MemoryKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn bind_device(&mut self, device_id: u32) -> Result<(), StorageError> {
        self.bound_device = Some(device_id);
        Ok(())
    }
}

impl Drop for BytesBackend {
    fn drop(&mut self) {
        for (_, allocation) in self.memory.drain() {
            // SAFETY: every entry still owns its allocation.
            unsafe { dealloc(allocation.ptr, allocation.layout) };
        }
    }
}
