use std::{sync::Arc, thread};

use devcache_runtime::{
    AllocError,
    config::GlobalConfig,
    memory_management::{
        CACHING_ALLOCATOR_PURPOSE, CachingAllocator, CachingAllocatorOptions, StatisticsLevel,
    },
};

use crate::dummy::*;

#[test_log::test]
fn first_allocation_grows_the_smallest_class() {
    let (backend, events) = RecordingBackend::unbounded();
    let allocator = caching_allocator(&[8 * KB, 8 * MB], backend);

    let ptr = allocator.malloc(1000, None, 0).unwrap();

    assert_eq!(
        events.snapshot(),
        [
            BackendEvent::BindDevice(0),
            BackendEvent::Allocate {
                purpose: CACHING_ALLOCATOR_PURPOSE.to_string(),
                size: 8 * KB,
                device_id: 0,
            },
        ]
    );

    let stats = allocator.statistics();
    assert_eq!(stats.number_extents(), 1);
    assert_eq!(stats.bytes_in_use(), 1024);
    assert_eq!(stats.bytes_free(), 7 * KB);
    assert_eq!(stats.bins[0].free_count, 1);
    allocator.print_statistics(StatisticsLevel::Detailed);

    allocator.free(ptr, 0).unwrap();
    assert_eq!(allocator.statistics().bytes_free(), 8 * KB);
}

#[test_log::test]
fn halves_coalesce_into_the_original_extent() {
    let (backend, events) = RecordingBackend::unbounded();
    let allocator = caching_allocator(&[8 * KB, 8 * MB], backend);

    let first = allocator.malloc(100, None, 0).unwrap();
    let second = allocator.malloc(100, None, 0).unwrap();
    allocator.free(first, 0).unwrap();
    allocator.free(second, 0).unwrap();

    let stats = allocator.statistics();
    assert_eq!(stats.number_free(), 1);
    assert_eq!(stats.bytes_free(), 8 * KB);
    assert_eq!(stats.number_allocs(), 0);
    assert_eq!(stats.malloc_calls, 2);
    assert_eq!(stats.free_calls, 2);
    assert_eq!(events.allocations(), [8 * KB]);
    allocator.check_invariants().unwrap();
}

#[test_log::test]
fn default_classes_round_to_the_next_boundary() {
    let (backend, events) = RecordingBackend::unbounded();
    let allocator = CachingAllocator::new(backend, CachingAllocatorOptions::default());
    allocator.initialize(0).unwrap();

    allocator.malloc(20 * MB, None, 0).unwrap();

    assert_eq!(events.allocations(), [32 * MB]);
    assert_eq!(allocator.statistics().bins[2].in_use_bytes, 20 * MB);
}

#[test_log::test]
fn eviction_returns_whole_extents_then_retries() {
    let (backend, events) = RecordingBackend::with_capacity(72 * KB);
    let allocator = caching_allocator(&[8 * KB, 64 * KB], backend);

    allocator.malloc(1000, None, 0).unwrap();
    let big = allocator.malloc(32 * KB, None, 0).unwrap();
    allocator.free(big, 0).unwrap();

    allocator.malloc(8 * KB, None, 0).unwrap();

    assert_eq!(events.allocations(), [8 * KB, 64 * KB, 8 * KB, 8 * KB]);
    assert_eq!(events.frees(), 1);
    assert_eq!(allocator.statistics().bytes_reserved(), 16 * KB);
    allocator.check_invariants().unwrap();
}

#[test_log::test]
fn exhausted_backend_fails_without_side_effects() {
    let (backend, _events) = RecordingBackend::with_capacity(8 * KB);
    let allocator = caching_allocator(&[8 * KB, 64 * KB], backend);
    let ptr = allocator.malloc(1000, None, 0).unwrap();
    let before = allocator.statistics();

    let result = allocator.malloc(16 * KB, None, 0);

    assert_eq!(
        result,
        Err(AllocError::ResourceExhausted {
            size: 16 * KB,
            device_id: 0
        })
    );
    assert_eq!(allocator.statistics().bins, before.bins);
    allocator.free(ptr, 0).unwrap();
    allocator.check_invariants().unwrap();
}

#[test_log::test]
fn null_free_is_rejected() {
    let (backend, _events) = RecordingBackend::unbounded();
    let allocator = caching_allocator(&[8 * KB, 8 * MB], backend);
    allocator.malloc(1000, None, 0).unwrap();
    let before = allocator.statistics();

    let result = allocator.free(devcache_runtime::storage::DevicePtr::NULL, 0);

    assert!(matches!(result, Err(AllocError::InvalidParameter { .. })));
    assert_eq!(allocator.statistics(), before);
}

#[test_log::test]
fn dropping_the_allocator_returns_every_extent() {
    let (backend, events) = RecordingBackend::unbounded();

    {
        let allocator = caching_allocator(&[8 * KB, 8 * MB], backend);
        allocator.malloc(1000, None, 0).unwrap();
        allocator.malloc(2 * MB, None, 0).unwrap();
        allocator.malloc(9 * MB, None, 0).unwrap();
    }

    assert_eq!(events.allocations().len(), 3);
    assert_eq!(events.frees(), 3);
}

#[test_log::test]
fn reinitializing_releases_the_previous_device() {
    let (backend, events) = RecordingBackend::unbounded();
    let allocator = caching_allocator(&[8 * KB, 8 * MB], backend);
    allocator.malloc(1000, None, 0).unwrap();

    allocator.initialize(1).unwrap();

    assert_eq!(events.frees(), 1);
    assert_eq!(events.snapshot().last(), Some(&BackendEvent::BindDevice(1)));
    assert_eq!(allocator.device_id(), Some(1));
    assert_eq!(allocator.statistics().number_extents(), 0);
}

#[test_log::test]
fn options_follow_the_configuration() {
    let mut config = GlobalConfig::default();
    config.allocator.bin_sizes = vec![8 * KB, MB];
    config.allocator.split_threshold = 0.5;
    config.allocator.bind_stream = true;

    let (backend, events) = RecordingBackend::unbounded();
    let allocator = CachingAllocator::from_config(backend, Arc::new(config)).unwrap();
    allocator.initialize(0).unwrap();
    assert!(allocator.bind_stream());

    // 4 KiB is half of the extent: split.
    allocator.malloc(4 * KB, None, 0).unwrap();
    // 5 KiB doesn't fit the remainder, and is more than half of a new extent: used whole.
    allocator.malloc(5 * KB, None, 0).unwrap();

    let stats = allocator.statistics();
    assert_eq!(events.allocations(), [8 * KB, 8 * KB]);
    assert_eq!(stats.bytes_in_use(), 12 * KB);
    assert_eq!(stats.bytes_free(), 4 * KB);
}

#[test_log::test]
fn invalid_configuration_is_rejected() {
    let mut config = GlobalConfig::default();
    config.allocator.bin_sizes = vec![1000];

    let (backend, _events) = RecordingBackend::unbounded();
    let result = CachingAllocator::from_config(backend, Arc::new(config));

    assert!(matches!(result, Err(AllocError::InvalidParameter { .. })));
}

#[test_log::test]
fn allocator_is_shared_between_threads() {
    let (backend, events) = RecordingBackend::unbounded();
    let allocator = Arc::new(caching_allocator(&[64 * KB, 8 * MB], backend));

    let handles: Vec<_> = (0..4)
        .map(|thread_id| {
            let allocator = allocator.clone();
            thread::spawn(move || {
                for round in 0..200u64 {
                    let size = 512 * (1 + (round + thread_id) % 16);
                    let ptr = allocator.malloc(size, None, 0).unwrap();
                    allocator.free(ptr, 0).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = allocator.statistics();
    assert_eq!(stats.number_allocs(), 0);
    assert_eq!(stats.malloc_calls, 800);
    assert_eq!(stats.free_calls, 800);
    allocator.check_invariants().unwrap();

    allocator.try_free_blocks();
    assert_eq!(events.frees(), events.allocations().len());
}
