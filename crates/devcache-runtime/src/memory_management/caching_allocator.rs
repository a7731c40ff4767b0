use super::{
    BinStatistics, MemoryStatistics, StatisticsLevel,
    bin::{BlockBin, BlockKey},
    block::{Block, BlockArena, BlockId},
    size_class::{BinIndex, SIZE_SATURATED, SizeClassTable, should_split},
};
use crate::{
    config::{
        GlobalConfig, Logger,
        allocator::{AllocatorConfig, AllocatorLogLevel},
    },
    error::{AllocError, StorageError},
    storage::{DeviceMemoryBackend, DevicePtr, MemoryKind},
};
use alloc::{
    collections::BTreeMap,
    format,
    string::ToString,
    sync::Arc,
    vec::Vec,
};
use hashbrown::HashMap;

/// Tag forwarded to the backend with every extent request.
pub const CACHING_ALLOCATOR_PURPOSE: &str = "devcache caching allocator";

/// Options of a [CachingAllocator].
#[derive(Clone, Debug)]
pub struct CachingAllocatorOptions {
    /// The kind of memory requested from the backend.
    pub memory_kind: MemoryKind,
    /// Size-class policy.
    pub size_classes: SizeClassTable,
    /// A free block is split when the request is at most this fraction of its size.
    pub split_threshold: f64,
    /// Disables evicting the cache when the backend runs out of memory.
    pub bind_stream: bool,
}

impl Default for CachingAllocatorOptions {
    fn default() -> Self {
        let config = AllocatorConfig::default();
        Self {
            memory_kind: config.memory_kind,
            size_classes: SizeClassTable::default(),
            split_threshold: config.split_threshold,
            bind_stream: config.bind_stream,
        }
    }
}

impl CachingAllocatorOptions {
    /// Builds the options from the allocator configuration, validating the size classes.
    pub fn from_config(config: &AllocatorConfig) -> Result<Self, AllocError> {
        if !(config.split_threshold > 0.0 && config.split_threshold <= 1.0) {
            return Err(AllocError::invalid_parameter(format!(
                "split threshold {} is not in (0, 1]",
                config.split_threshold
            )));
        }

        Ok(Self {
            memory_kind: config.memory_kind,
            size_classes: SizeClassTable::new(config.round_unit, config.bin_sizes.clone())?,
            split_threshold: config.split_threshold,
            bind_stream: config.bind_stream,
        })
    }
}

/// A segregated free-list allocator caching device memory extents.
///
/// Extents obtained from the backend are kept in size-class bins once freed. Requests are
/// served from the best fitting cached block, which is split when it is much larger than the
/// request. Freed fragments are coalesced with their free neighbours, and whole extents are
/// only returned to the backend when the cache is evicted or the allocator is finalized.
pub struct CachingAllocator<B: DeviceMemoryBackend> {
    state: spin::Mutex<CachingState<B>>,
}

struct CachingState<B> {
    backend: B,
    options: CachingAllocatorOptions,
    initialized: bool,
    device_id: u32,
    arena: BlockArena,
    bins: Vec<BlockBin>,
    allocated: HashMap<DevicePtr, BlockId>,
    // Extent size -> number of live extents of that size.
    accounting: BTreeMap<u64, u64>,
    malloc_calls: u64,
    free_calls: u64,
    logger: Logger,
    log_level: AllocatorLogLevel,
}

impl<B: DeviceMemoryBackend> core::fmt::Debug for CachingAllocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CachingAllocator")
            .field("backend", &state.backend)
            .field("initialized", &state.initialized)
            .field("device_id", &state.device_id)
            .field("blocks", &state.arena.len())
            .field("allocated", &state.allocated.len())
            .finish()
    }
}

impl<B: DeviceMemoryBackend> CachingAllocator<B> {
    /// Creates an uninitialized allocator, logging through the global configuration.
    pub fn new(backend: B, options: CachingAllocatorOptions) -> Self {
        Self::with_logger(backend, options, Logger::new())
    }

    /// Creates an uninitialized allocator from the given configuration.
    pub fn from_config(backend: B, config: Arc<GlobalConfig>) -> Result<Self, AllocError> {
        let options = CachingAllocatorOptions::from_config(&config.allocator)?;
        Ok(Self::with_logger(
            backend,
            options,
            Logger::from_config(config),
        ))
    }

    fn with_logger(backend: B, options: CachingAllocatorOptions, logger: Logger) -> Self {
        let log_level = logger.log_level_allocator();
        Self {
            state: spin::Mutex::new(CachingState {
                backend,
                options,
                initialized: false,
                device_id: 0,
                arena: BlockArena::default(),
                bins: Vec::new(),
                allocated: HashMap::new(),
                accounting: BTreeMap::new(),
                malloc_calls: 0,
                free_calls: 0,
                logger,
                log_level,
            }),
        }
    }

    /// Prepares the allocator to serve `device_id`.
    ///
    /// Memory left from a previous initialization is released first.
    pub fn initialize(&self, device_id: u32) -> Result<(), AllocError> {
        self.state.lock().initialize(device_id)
    }

    /// Frees every block and returns all cached extents to the backend.
    ///
    /// Pointers handed out before are invalid afterwards. Does nothing when uninitialized.
    pub fn finalize(&self) {
        self.state.lock().finalize()
    }

    /// Allocates at least `size` bytes on `device_id`.
    ///
    /// Among equally sized free blocks, the first one at or above `hint` is preferred.
    pub fn malloc(
        &self,
        size: u64,
        hint: Option<DevicePtr>,
        device_id: u32,
    ) -> Result<DevicePtr, AllocError> {
        self.state.lock().malloc(size, hint, device_id)
    }

    /// Releases a pointer returned by [malloc](Self::malloc) back into the cache.
    pub fn free(&self, ptr: DevicePtr, device_id: u32) -> Result<(), AllocError> {
        self.state.lock().free(ptr, device_id)
    }

    /// Returns every whole cached extent to the backend. Returns the number of bytes reclaimed.
    pub fn try_free_blocks(&self) -> u64 {
        self.state.lock().free_cached_blocks()
    }

    /// When set, running out of backend memory fails instead of evicting the cache.
    pub fn set_bind_stream(&self, bind_stream: bool) {
        self.state.lock().options.bind_stream = bind_stream;
    }

    /// Whether cache eviction is disabled.
    pub fn bind_stream(&self) -> bool {
        self.state.lock().options.bind_stream
    }

    /// Whether [initialize](Self::initialize) was called since creation or the last finalize.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// The device the allocator is initialized for.
    pub fn device_id(&self) -> Option<u32> {
        let state = self.state.lock();
        state.initialized.then_some(state.device_id)
    }

    /// Snapshot of the memory held by the allocator.
    pub fn statistics(&self) -> MemoryStatistics {
        self.state.lock().statistics()
    }

    /// Writes the current statistics to the allocator logger and the `log` crate.
    pub fn print_statistics(&self, level: StatisticsLevel) {
        let mut state = self.state.lock();
        let report = state.statistics().report(level);
        state.logger.log_allocator(&report);
        log::info!("{report}");
    }

    /// Runs `func` with exclusive access to the backend.
    pub fn with_backend<R>(&self, func: impl FnOnce(&mut B) -> R) -> R {
        func(&mut self.state.lock().backend)
    }

    /// Checks the internal bookkeeping: every block is either cached or handed out, the block
    /// sizes add up to the live backend extents, and no two blocks overlap.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        self.state.lock().check_invariants()
    }
}

impl<B: DeviceMemoryBackend> Drop for CachingAllocator<B> {
    fn drop(&mut self) {
        self.state.get_mut().finalize();
    }
}

impl<B: DeviceMemoryBackend> CachingState<B> {
    fn initialize(&mut self, device_id: u32) -> Result<(), AllocError> {
        self.finalize();

        let kind = self.options.memory_kind;
        if !self.backend.supports(kind) {
            log::error!("No backend for {kind:?} memory on device {device_id}");
            return Err(AllocError::BackendUnavailable { kind });
        }

        if let Err(err) = self.backend.bind_device(device_id) {
            log::error!("Can't bind device {device_id}: {err}");
            return Err(AllocError::BackendUnavailable { kind });
        }

        self.bins = (0..self.options.size_classes.num_bins())
            .map(|_| BlockBin::default())
            .collect();
        self.device_id = device_id;
        self.malloc_calls = 0;
        self.free_calls = 0;
        self.initialized = true;

        Ok(())
    }

    fn finalize(&mut self) {
        if !self.initialized {
            return;
        }

        self.free_blocks();
        self.free_cached_blocks();

        if !self.arena.is_empty() {
            let bytes: u64 = self.arena.iter().map(|(_, block)| block.size).sum();
            log::warn!(
                "Device {}: {} blocks ({bytes} bytes) couldn't be returned to the backend",
                self.device_id,
                self.arena.len()
            );
        }

        self.arena.clear();
        self.bins.clear();
        self.accounting.clear();
        self.initialized = false;
    }

    fn malloc(
        &mut self,
        size: u64,
        hint: Option<DevicePtr>,
        device_id: u32,
    ) -> Result<DevicePtr, AllocError> {
        if !self.initialized {
            return Err(AllocError::NotInitialized);
        }

        self.malloc_calls += 1;

        if device_id != self.device_id {
            log::warn!(
                "Allocation for device {device_id} on an allocator initialized for device {}",
                self.device_id
            );
        }

        let size = self.options.size_classes.block_size(size);
        if size == SIZE_SATURATED {
            log::error!("Allocation size overflows on device {device_id}");
            return Err(AllocError::accounting("requested size overflows"));
        }

        let bin = self.options.size_classes.bin_index(size);

        let id = match self.find_free_block(bin, size, hint) {
            Some(id) => id,
            None => {
                self.try_extend_cache(size, device_id)?;
                self.find_free_block(bin, size, hint).ok_or_else(|| {
                    AllocError::accounting(format!(
                        "no block of {size} bytes after growing bin {bin}"
                    ))
                })?
            }
        };

        self.allocate_block(id, bin, size)
    }

    fn free(&mut self, ptr: DevicePtr, device_id: u32) -> Result<(), AllocError> {
        if ptr.is_null() {
            log::warn!("Freeing a null pointer on device {device_id}");
            return Err(AllocError::invalid_parameter("can't free a null pointer"));
        }

        let Some(id) = self.allocated.remove(&ptr) else {
            log::warn!("Freeing unknown pointer {ptr} on device {device_id}");
            return Err(AllocError::invalid_parameter(format!(
                "pointer {ptr} is not allocated"
            )));
        };

        self.free_calls += 1;

        if let Some(block) = self.arena.get(id)
            && block.device_id != device_id
        {
            log::warn!(
                "Pointer {ptr} of device {} freed for device {device_id}",
                block.device_id
            );
        }

        self.free_block(id);

        Ok(())
    }

    fn find_free_block(
        &self,
        bin: BinIndex,
        size: u64,
        hint: Option<DevicePtr>,
    ) -> Option<BlockId> {
        let bin = self.bins.get(bin)?;
        let (best, id) = bin.lower_bound(&BlockKey::new(size, DevicePtr::NULL))?;

        // The hint only picks among blocks of the best-fit size.
        let hinted = hint
            .and_then(|ptr| bin.lower_bound(&BlockKey::new(best.size, ptr)))
            .filter(|(key, _)| key.size == best.size);

        Some(hinted.map_or(id, |(_, id)| id))
    }

    fn allocate_block(
        &mut self,
        id: BlockId,
        bin: BinIndex,
        size: u64,
    ) -> Result<DevicePtr, AllocError> {
        let block = self
            .arena
            .get(id)
            .ok_or_else(|| AllocError::accounting(format!("free block {id:?} is missing")))?;
        let key = block.key();
        let block_size = block.size;

        let free_bin = self
            .bins
            .get_mut(bin)
            .ok_or_else(|| AllocError::accounting(format!("bin {bin} doesn't exist")))?;
        free_bin.remove(&key);

        let id = if should_split(block_size, size, self.options.split_threshold) {
            match self.arena.split(id, size) {
                Ok(front) => {
                    if let Some(remainder) = self.arena.get(id) {
                        free_bin.insert(remainder.key(), id);
                    }
                    if self.log_level == AllocatorLogLevel::Full {
                        self.logger.log_allocator(&format!(
                            "[Allocator] Split {block_size} bytes at {} for {size} bytes",
                            key.ptr
                        ));
                    }
                    front
                }
                Err(err) => {
                    free_bin.insert(key, id);
                    log::error!("Can't split block at {}: {err}", key.ptr);
                    return Err(err);
                }
            }
        } else {
            id
        };

        let block = self
            .arena
            .get_mut(id)
            .ok_or_else(|| AllocError::accounting(format!("split block {id:?} is missing")))?;
        block.allocated = true;
        let ptr = block.ptr;
        self.allocated.insert(ptr, id);

        Ok(ptr)
    }

    fn free_block(&mut self, id: BlockId) {
        let Some(block) = self.arena.get_mut(id) else {
            log::error!("Freeing missing block {id:?}");
            return;
        };
        block.allocated = false;

        let bins = &mut self.bins;
        let merged = self.arena.merge_free_neighbours(id, |neighbour| {
            if let Some(bin) = neighbour.bin.and_then(|bin| bins.get_mut(bin)) {
                bin.remove(&neighbour.key());
            }
        });

        let Some(block) = self.arena.get(id) else {
            return;
        };

        if merged > 0 && self.log_level == AllocatorLogLevel::Full {
            self.logger.log_allocator(&format!(
                "[Allocator] Merged {merged} neighbours into {} bytes at {}",
                block.size, block.ptr
            ));
        }

        match block.bin.and_then(|bin| self.bins.get_mut(bin)) {
            Some(bin) => {
                if !bin.insert(block.key(), id) {
                    log::error!("Block at {} is already cached", block.ptr);
                }
            }
            None => log::error!("Block at {} has no bin", block.ptr),
        }
    }

    // Frees every allocated block as if the caller had.
    fn free_blocks(&mut self) {
        let ids: Vec<BlockId> = self.allocated.drain().map(|(_, id)| id).collect();
        for id in ids {
            self.free_block(id);
        }
    }

    fn try_extend_cache(&mut self, size: u64, device_id: u32) -> Result<(), AllocError> {
        let alloc_size = self.options.size_classes.allocation_size(size);
        if alloc_size == SIZE_SATURATED {
            log::error!("Extent size for {size} bytes overflows on device {device_id}");
            return Err(AllocError::accounting(format!(
                "extent size for {size} bytes overflows"
            )));
        }

        let ptr = match self.allocate_extent(alloc_size, device_id) {
            Ok(ptr) => ptr,
            Err(err) if !self.options.bind_stream => {
                log::warn!(
                    "Can't allocate {alloc_size} bytes on device {device_id} ({err}), evicting the cache"
                );
                let freed = self.free_cached_blocks();
                if self.log_level != AllocatorLogLevel::Disabled {
                    self.logger.log_allocator(&format!(
                        "[Allocator] Evicted {freed} bytes to allocate {alloc_size} bytes"
                    ));
                }

                match self.allocate_extent(alloc_size, device_id) {
                    Ok(ptr) => ptr,
                    Err(err) => return Err(self.exhausted(size, alloc_size, device_id, err)),
                }
            }
            Err(err) => return Err(self.exhausted(size, alloc_size, device_id, err)),
        };

        let bin = self.options.size_classes.bin_index(alloc_size);
        let block = Block::new(device_id, alloc_size, Some(bin), ptr);
        let key = block.key();
        let id = self.arena.insert(block);

        let inserted = self
            .bins
            .get_mut(bin)
            .map(|free_bin| free_bin.insert(key, id))
            .unwrap_or(false);

        if !inserted {
            self.arena.remove(id);
            if let Err(err) = self.backend.free(ptr, device_id) {
                log::error!("Can't return extent {ptr} to the backend: {err}");
            }
            return Err(AllocError::accounting(format!(
                "extent {ptr} can't be cached in bin {bin}"
            )));
        }

        *self.accounting.entry(alloc_size).or_insert(0) += 1;

        log::trace!("Allocated extent of {alloc_size} bytes at {ptr} on device {device_id}");
        if self.log_level != AllocatorLogLevel::Disabled {
            self.logger.log_allocator(&format!(
                "[Allocator] Extended bin {bin} with {alloc_size} bytes at {ptr}"
            ));
        }

        Ok(())
    }

    fn allocate_extent(&mut self, size: u64, device_id: u32) -> Result<DevicePtr, StorageError> {
        let ptr = self
            .backend
            .allocate(CACHING_ALLOCATOR_PURPOSE, size, device_id)?;

        if ptr.is_null() {
            return Err(StorageError::Unknown("backend returned a null pointer".to_string()));
        }

        Ok(ptr)
    }

    fn exhausted(
        &mut self,
        size: u64,
        alloc_size: u64,
        device_id: u32,
        err: StorageError,
    ) -> AllocError {
        let report = self.statistics().report(StatisticsLevel::Detailed);
        log::error!(
            "Can't allocate {alloc_size} bytes for a request of {size} bytes on device {device_id}: {err}\n{report}"
        );
        if self.log_level != AllocatorLogLevel::Disabled {
            self.logger.log_allocator(&report);
        }

        AllocError::ResourceExhausted { size, device_id }
    }

    // Returns every whole free block to the backend.
    fn free_cached_blocks(&mut self) -> u64 {
        let whole: Vec<(BinIndex, BlockId)> = self
            .bins
            .iter()
            .enumerate()
            .flat_map(|(index, bin)| bin.iter().map(move |(_, id)| (index, *id)))
            .filter(|(_, id)| {
                self.arena
                    .get(*id)
                    .map(|block| !block.is_split())
                    .unwrap_or(false)
            })
            .collect();

        let mut freed = 0;
        for (bin, id) in whole {
            let Some(block) = self.arena.get(id) else {
                continue;
            };
            let (ptr, size, device_id, key) = (block.ptr, block.size, block.device_id, block.key());

            if let Err(err) = self.backend.free(ptr, device_id) {
                log::warn!("Can't return extent {ptr} of {size} bytes to device {device_id}: {err}");
                continue;
            }

            self.bins[bin].remove(&key);
            self.arena.remove(id);
            self.release_extent(size);
            freed += size;

            log::trace!("Returned extent of {size} bytes at {ptr} to device {device_id}");
        }

        freed
    }

    fn release_extent(&mut self, size: u64) {
        match self.accounting.get_mut(&size) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.accounting.remove(&size);
            }
            None => log::error!("Returned an extent of {size} bytes that was never accounted"),
        }
    }

    fn statistics(&self) -> MemoryStatistics {
        let size_classes = &self.options.size_classes;
        let mut bins: Vec<BinStatistics> = size_classes
            .boundaries()
            .iter()
            .map(|boundary| BinStatistics {
                boundary: *boundary,
                ..Default::default()
            })
            .collect();

        for (index, bin) in self.bins.iter().enumerate() {
            if let Some(stats) = bins.get_mut(index) {
                stats.free_count = bin.len() as u64;
                stats.free_bytes = bin.bytes();
            }
        }

        for id in self.allocated.values() {
            let Some(block) = self.arena.get(*id) else {
                continue;
            };
            if let Some(stats) = block.bin.and_then(|bin| bins.get_mut(bin)) {
                stats.in_use_count += 1;
                stats.in_use_bytes += block.size;
            }
        }

        for (size, count) in self.accounting.iter() {
            if let Some(stats) = bins.get_mut(size_classes.bin_index(*size)) {
                stats.backend_count += count;
                stats.backend_bytes += size * count;
            }
        }

        MemoryStatistics {
            bins,
            malloc_calls: self.malloc_calls,
            free_calls: self.free_calls,
        }
    }

    fn check_invariants(&self) -> Result<(), AllocError> {
        let cached: usize = self.bins.iter().map(|bin| bin.len()).sum();
        if cached + self.allocated.len() != self.arena.len() {
            return Err(AllocError::accounting(format!(
                "{} blocks live but {cached} cached and {} allocated",
                self.arena.len(),
                self.allocated.len()
            )));
        }

        for (ptr, id) in self.allocated.iter() {
            match self.arena.get(*id) {
                Some(block) if block.allocated && block.ptr == *ptr => {}
                _ => {
                    return Err(AllocError::accounting(format!(
                        "allocated pointer {ptr} doesn't match its block"
                    )));
                }
            }
        }

        for (index, bin) in self.bins.iter().enumerate() {
            for (key, id) in bin.iter() {
                match self.arena.get(*id) {
                    Some(block)
                        if !block.allocated && block.key() == *key && block.bin == Some(index) => {}
                    _ => {
                        return Err(AllocError::accounting(format!(
                            "cached block at {} in bin {index} doesn't match its key",
                            key.ptr
                        )));
                    }
                }
            }
        }

        let block_bytes: u64 = self.arena.iter().map(|(_, block)| block.size).sum();
        let extent_bytes: u64 = self.accounting.iter().map(|(size, count)| size * count).sum();
        if block_bytes != extent_bytes {
            return Err(AllocError::accounting(format!(
                "blocks cover {block_bytes} bytes but extents {extent_bytes} bytes"
            )));
        }

        self.arena.check_links()
    }
}
