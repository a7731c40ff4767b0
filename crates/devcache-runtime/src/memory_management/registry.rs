use super::CachingAllocator;
use crate::{error::AllocError, storage::DeviceMemoryBackend};
use alloc::{sync::Arc, vec::Vec};
use hashbrown::HashMap;

/// Identifies the allocator serving a device, optionally dedicated to one stream.
#[derive(new, Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct AllocatorKey {
    /// The device served by the allocator.
    pub device_id: u32,
    /// The stream the allocator is dedicated to, if any.
    pub stream: Option<u64>,
}

impl AllocatorKey {
    /// Key of the allocator shared by every stream of a device.
    pub fn device(device_id: u32) -> Self {
        Self::new(device_id, None)
    }
}

/// Keeps one [CachingAllocator] per device and stream.
///
/// The registry is an ordinary value: independent registries never share allocators.
pub struct AllocatorRegistry<B: DeviceMemoryBackend> {
    allocators: spin::Mutex<HashMap<AllocatorKey, Arc<CachingAllocator<B>>>>,
}

impl<B: DeviceMemoryBackend> Default for AllocatorRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: DeviceMemoryBackend> core::fmt::Debug for AllocatorRegistry<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let keys: Vec<AllocatorKey> = self.allocators.lock().keys().copied().collect();
        f.debug_struct("AllocatorRegistry").field("keys", &keys).finish()
    }
}

impl<B: DeviceMemoryBackend> AllocatorRegistry<B> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            allocators: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the allocator registered for `key`, creating it with `init` if there is none.
    ///
    /// A new allocator is initialized for the key's device before it is registered; nothing is
    /// registered when that fails.
    pub fn get_or_init<F>(
        &self,
        key: AllocatorKey,
        init: F,
    ) -> Result<Arc<CachingAllocator<B>>, AllocError>
    where
        F: FnOnce() -> Result<CachingAllocator<B>, AllocError>,
    {
        let mut allocators = self.allocators.lock();

        if let Some(allocator) = allocators.get(&key) {
            return Ok(allocator.clone());
        }

        let allocator = init()?;
        allocator.initialize(key.device_id)?;

        let allocator = Arc::new(allocator);
        allocators.insert(key, allocator.clone());

        Ok(allocator)
    }

    /// The allocator registered for `key`.
    pub fn get(&self, key: &AllocatorKey) -> Option<Arc<CachingAllocator<B>>> {
        self.allocators.lock().get(key).cloned()
    }

    /// Unregisters the allocator of `key`. It's finalized once the last reference is dropped.
    pub fn remove(&self, key: &AllocatorKey) -> Option<Arc<CachingAllocator<B>>> {
        self.allocators.lock().remove(key)
    }

    /// Number of registered allocators.
    pub fn len(&self) -> usize {
        self.allocators.lock().len()
    }

    /// Whether no allocator is registered.
    pub fn is_empty(&self) -> bool {
        self.allocators.lock().is_empty()
    }

    /// Finalizes every registered allocator and empties the registry.
    pub fn finalize_all(&self) {
        let allocators: Vec<_> = self.allocators.lock().drain().collect();

        for (key, allocator) in allocators {
            log::trace!("Finalizing allocator of {key:?}");
            allocator.finalize();
        }
    }
}
