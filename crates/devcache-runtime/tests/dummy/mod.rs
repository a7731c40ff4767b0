#![allow(dead_code)]

mod backend;

pub use backend::*;

use devcache_runtime::memory_management::{
    CachingAllocator, CachingAllocatorOptions, SizeClassTable,
};

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

/// An initialized allocator on device 0 using the given size classes.
pub fn caching_allocator(
    boundaries: &[u64],
    backend: RecordingBackend,
) -> CachingAllocator<RecordingBackend> {
    let options = CachingAllocatorOptions {
        size_classes: SizeClassTable::new(512, boundaries.to_vec()).unwrap(),
        ..Default::default()
    };
    let allocator = CachingAllocator::new(backend, options);
    allocator.initialize(0).unwrap();
    allocator
}
