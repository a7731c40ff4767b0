use super::{
    PoolStatistics,
    bin::{BlockBin, BlockKey},
    block::{Block, BlockArena, BlockId},
    size_class::should_split,
};
use crate::{
    config::allocator::RdmaConfig,
    error::AllocError,
    storage::{DeviceMemoryBackend, DevicePtr},
};
use alloc::format;
use hashbrown::HashMap;

/// Tag forwarded to the backend when the pool is registered.
pub const RDMA_POOL_PURPOSE: &str = "devcache rdma pool";

/// Options of a [RdmaPoolAllocator].
#[derive(Clone, Debug)]
pub struct RdmaPoolOptions {
    /// Every request is rounded up to a multiple of this many bytes.
    pub alignment: u64,
    /// A free block is split when the request is at most this fraction of its size.
    pub split_threshold: f64,
}

impl Default for RdmaPoolOptions {
    fn default() -> Self {
        let config = RdmaConfig::default();
        Self {
            alignment: config.alignment,
            split_threshold: config.split_threshold,
        }
    }
}

impl RdmaPoolOptions {
    /// Builds the options from the pool configuration.
    pub fn from_config(config: &RdmaConfig) -> Result<Self, AllocError> {
        if config.alignment == 0 {
            return Err(AllocError::invalid_parameter("pool alignment must not be zero"));
        }

        if !(config.split_threshold > 0.0 && config.split_threshold <= 1.0) {
            return Err(AllocError::invalid_parameter(format!(
                "split threshold {} is not in (0, 1]",
                config.split_threshold
            )));
        }

        Ok(Self {
            alignment: config.alignment,
            split_threshold: config.split_threshold,
        })
    }
}

/// Serves allocations out of a single pre-registered device memory pool.
///
/// The pool is obtained from the backend once, on [init_memory](Self::init_memory), and never
/// grows: a request no free block can hold fails. Blocks are split and coalesced the same way
/// the [CachingAllocator](super::CachingAllocator) does, but all of them share one free set.
pub struct RdmaPoolAllocator<B: DeviceMemoryBackend> {
    state: spin::Mutex<RdmaState<B>>,
}

struct RdmaState<B> {
    backend: B,
    options: RdmaPoolOptions,
    pool: Option<Pool>,
    arena: BlockArena,
    free: BlockBin,
    allocated: HashMap<DevicePtr, BlockId>,
}

#[derive(Clone, Copy, Debug)]
struct Pool {
    ptr: DevicePtr,
    size: u64,
    device_id: u32,
}

impl<B: DeviceMemoryBackend> core::fmt::Debug for RdmaPoolAllocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RdmaPoolAllocator")
            .field("backend", &state.backend)
            .field("pool", &state.pool)
            .field("allocated", &state.allocated.len())
            .finish()
    }
}

impl<B: DeviceMemoryBackend> RdmaPoolAllocator<B> {
    /// Creates an allocator without a pool.
    pub fn new(backend: B, options: RdmaPoolOptions) -> Self {
        Self {
            state: spin::Mutex::new(RdmaState {
                backend,
                options,
                pool: None,
                arena: BlockArena::default(),
                free: BlockBin::default(),
                allocated: HashMap::new(),
            }),
        }
    }

    /// Registers a pool of `size` bytes on `device_id`.
    pub fn init_memory(&self, size: u64, device_id: u32) -> Result<(), AllocError> {
        self.state.lock().init_memory(size, device_id)
    }

    /// Allocates at least `size` bytes from the pool.
    pub fn malloc(&self, size: u64, device_id: u32) -> Result<DevicePtr, AllocError> {
        self.state.lock().malloc(size, device_id)
    }

    /// Returns a pointer obtained from [malloc](Self::malloc) to the pool.
    pub fn free(&self, ptr: DevicePtr, device_id: u32) -> Result<(), AllocError> {
        self.state.lock().free(ptr, device_id)
    }

    /// Base address and size of the pool.
    pub fn base_addr(&self) -> Result<(DevicePtr, u64), AllocError> {
        match self.state.lock().pool {
            Some(pool) => Ok((pool.ptr, pool.size)),
            None => Err(AllocError::invalid_parameter("the pool is not initialized")),
        }
    }

    /// Returns the pool to the backend. Outstanding allocations are released with it.
    pub fn finalize(&self) {
        self.state.lock().finalize()
    }

    /// Snapshot of the pool usage.
    pub fn statistics(&self) -> PoolStatistics {
        self.state.lock().statistics()
    }

    /// Runs `func` with exclusive access to the backend.
    pub fn with_backend<R>(&self, func: impl FnOnce(&mut B) -> R) -> R {
        func(&mut self.state.lock().backend)
    }

    /// Checks that the blocks tile the pool and that each is either free or handed out.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        self.state.lock().check_invariants()
    }
}

impl<B: DeviceMemoryBackend> Drop for RdmaPoolAllocator<B> {
    fn drop(&mut self) {
        self.state.get_mut().finalize();
    }
}

impl<B: DeviceMemoryBackend> RdmaState<B> {
    fn init_memory(&mut self, size: u64, device_id: u32) -> Result<(), AllocError> {
        if self.pool.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }

        if size == 0 {
            return Err(AllocError::invalid_parameter("pool size must not be zero"));
        }

        self.backend.bind_device(device_id)?;

        let ptr = match self.backend.allocate(RDMA_POOL_PURPOSE, size, device_id) {
            Ok(ptr) if !ptr.is_null() => ptr,
            Ok(_) => {
                log::error!("Backend returned a null pool of {size} bytes on device {device_id}");
                return Err(AllocError::ResourceExhausted { size, device_id });
            }
            Err(err) => {
                log::error!("Can't register a pool of {size} bytes on device {device_id}: {err}");
                return Err(AllocError::ResourceExhausted { size, device_id });
            }
        };

        let block = Block::new(device_id, size, None, ptr);
        let key = block.key();
        let id = self.arena.insert(block);
        self.free.insert(key, id);
        self.pool = Some(Pool {
            ptr,
            size,
            device_id,
        });

        log::trace!("Registered pool of {size} bytes at {ptr} on device {device_id}");

        Ok(())
    }

    fn malloc(&mut self, size: u64, device_id: u32) -> Result<DevicePtr, AllocError> {
        if self.pool.is_none() {
            return Err(AllocError::NotInitialized);
        }

        let size = match size {
            0 => self.options.alignment,
            size => size
                .checked_next_multiple_of(self.options.alignment)
                .ok_or_else(|| AllocError::accounting("requested size overflows"))?,
        };

        let Some((key, id)) = self.free.lower_bound(&BlockKey::new(size, DevicePtr::NULL)) else {
            log::warn!(
                "Pool on device {device_id} has no free block of {size} bytes (largest {})",
                self.free.largest().unwrap_or(0)
            );
            return Err(AllocError::ResourceExhausted { size, device_id });
        };

        self.free.remove(&key);

        let id = if should_split(key.size, size, self.options.split_threshold) {
            match self.arena.split(id, size) {
                Ok(front) => {
                    if let Some(remainder) = self.arena.get(id) {
                        self.free.insert(remainder.key(), id);
                    }
                    front
                }
                Err(err) => {
                    self.free.insert(key, id);
                    log::error!("Can't split pool block at {}: {err}", key.ptr);
                    return Err(err);
                }
            }
        } else {
            id
        };

        let block = self
            .arena
            .get_mut(id)
            .ok_or_else(|| AllocError::accounting(format!("pool block {id:?} is missing")))?;
        block.allocated = true;
        let ptr = block.ptr;
        self.allocated.insert(ptr, id);

        Ok(ptr)
    }

    fn free(&mut self, ptr: DevicePtr, device_id: u32) -> Result<(), AllocError> {
        if ptr.is_null() {
            log::warn!("Freeing a null pointer to the pool on device {device_id}");
            return Err(AllocError::invalid_parameter("can't free a null pointer"));
        }

        let Some(id) = self.allocated.remove(&ptr) else {
            log::warn!("Freeing unknown pointer {ptr} to the pool on device {device_id}");
            return Err(AllocError::invalid_parameter(format!(
                "pointer {ptr} is not allocated from the pool"
            )));
        };

        let Some(block) = self.arena.get_mut(id) else {
            return Err(AllocError::accounting(format!(
                "allocated block at {ptr} is missing"
            )));
        };
        block.allocated = false;

        let free = &mut self.free;
        self.arena.merge_free_neighbours(id, |neighbour| {
            free.remove(&neighbour.key());
        });

        if let Some(block) = self.arena.get(id) {
            self.free.insert(block.key(), id);
        }

        Ok(())
    }

    fn finalize(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };

        if !self.allocated.is_empty() {
            log::warn!(
                "Releasing the pool on device {} with {} blocks still allocated",
                pool.device_id,
                self.allocated.len()
            );
        }

        if let Err(err) = self.backend.free(pool.ptr, pool.device_id) {
            log::error!(
                "Can't return the pool at {} to device {}: {err}",
                pool.ptr,
                pool.device_id
            );
        }

        self.arena.clear();
        self.free = BlockBin::default();
        self.allocated.clear();
    }

    fn statistics(&self) -> PoolStatistics {
        let in_use_bytes: u64 = self
            .allocated
            .values()
            .filter_map(|id| self.arena.get(*id))
            .map(|block| block.size)
            .sum();

        PoolStatistics {
            pool_size: self.pool.map(|pool| pool.size).unwrap_or(0),
            in_use_count: self.allocated.len() as u64,
            in_use_bytes,
            free_count: self.free.len() as u64,
            free_bytes: self.free.bytes(),
            largest_free: self.free.largest().unwrap_or(0),
        }
    }

    fn check_invariants(&self) -> Result<(), AllocError> {
        if self.free.len() + self.allocated.len() != self.arena.len() {
            return Err(AllocError::accounting(format!(
                "{} blocks live but {} free and {} allocated",
                self.arena.len(),
                self.free.len(),
                self.allocated.len()
            )));
        }

        for (key, id) in self.free.iter() {
            match self.arena.get(*id) {
                Some(block) if !block.allocated && block.key() == *key => {}
                _ => {
                    return Err(AllocError::accounting(format!(
                        "free block at {} doesn't match its key",
                        key.ptr
                    )));
                }
            }
        }

        let block_bytes: u64 = self.arena.iter().map(|(_, block)| block.size).sum();
        let pool_bytes = self.pool.map(|pool| pool.size).unwrap_or(0);
        if block_bytes != pool_bytes {
            return Err(AllocError::accounting(format!(
                "blocks cover {block_bytes} bytes of a {pool_bytes} bytes pool"
            )));
        }

        self.arena.check_links()
    }
}
