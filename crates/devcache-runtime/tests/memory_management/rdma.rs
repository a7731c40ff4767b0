use devcache_runtime::{
    AllocError,
    config::allocator::RdmaConfig,
    memory_management::{RDMA_POOL_PURPOSE, RdmaPoolAllocator, RdmaPoolOptions},
};

use crate::dummy::*;

fn pool(size: u64) -> (RdmaPoolAllocator<RecordingBackend>, BackendEvents) {
    let (backend, events) = RecordingBackend::unbounded();
    let allocator = RdmaPoolAllocator::new(backend, RdmaPoolOptions::default());
    allocator.init_memory(size, 0).unwrap();
    (allocator, events)
}

#[test_log::test]
fn freed_block_waits_for_its_allocated_neighbour() {
    let (allocator, events) = pool(2 * KB);
    let base = allocator.base_addr().unwrap();

    let first = allocator.malloc(100, 0).unwrap();
    let second = allocator.malloc(100, 0).unwrap();
    allocator.free(first, 0).unwrap();

    let stats = allocator.statistics();
    assert_eq!(stats.free_count, 2);
    assert_eq!(stats.in_use_count, 1);
    assert_eq!(allocator.base_addr().unwrap(), base);

    allocator.free(second, 0).unwrap();

    let stats = allocator.statistics();
    assert_eq!(stats.free_count, 1);
    assert_eq!(stats.largest_free, 2 * KB);
    assert_eq!(allocator.base_addr().unwrap(), base);
    assert_eq!(
        events.snapshot(),
        [
            BackendEvent::BindDevice(0),
            BackendEvent::Allocate {
                purpose: RDMA_POOL_PURPOSE.to_string(),
                size: 2 * KB,
                device_id: 0,
            },
        ]
    );
}

#[test_log::test]
fn pool_is_returned_on_drop() {
    let (allocator, events) = pool(64 * KB);
    allocator.malloc(KB, 0).unwrap();

    drop(allocator);

    assert_eq!(events.frees(), 1);
}

#[test_log::test]
fn configured_alignment_rounds_requests() {
    let config = RdmaConfig {
        alignment: 4 * KB,
        split_threshold: 0.5,
    };
    let (backend, _events) = RecordingBackend::unbounded();
    let allocator = RdmaPoolAllocator::new(backend, RdmaPoolOptions::from_config(&config).unwrap());
    allocator.init_memory(16 * KB, 0).unwrap();

    let first = allocator.malloc(1, 0).unwrap();
    let second = allocator.malloc(1, 0).unwrap();

    assert_eq!(second.addr() - first.addr(), 4 * KB);
    assert_eq!(allocator.statistics().in_use_bytes, 8 * KB);
    allocator.check_invariants().unwrap();
}

#[test_log::test]
fn zero_alignment_is_rejected() {
    let config = RdmaConfig {
        alignment: 0,
        split_threshold: 0.5,
    };

    assert!(matches!(
        RdmaPoolOptions::from_config(&config),
        Err(AllocError::InvalidParameter { .. })
    ));
}

#[test_log::test]
fn oversized_request_is_exhausted() {
    let (allocator, events) = pool(4 * KB);

    assert_eq!(
        allocator.malloc(8 * KB, 0),
        Err(AllocError::ResourceExhausted {
            size: 8 * KB,
            device_id: 0
        })
    );
    assert_eq!(events.allocations(), [4 * KB]);
}
