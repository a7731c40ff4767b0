use std::sync::Arc;

use devcache_runtime::{
    config::GlobalConfig,
    memory_management::{AllocatorKey, AllocatorRegistry, CachingAllocator},
};

use crate::dummy::*;

#[test_log::test]
fn each_stream_gets_its_own_allocator() {
    let registry = AllocatorRegistry::new();
    let config = Arc::new(GlobalConfig::default());
    let mut recorded = Vec::new();

    for stream in [None, Some(1), Some(2), None] {
        let allocator = registry
            .get_or_init(AllocatorKey::new(3, stream), || {
                let (backend, events) = RecordingBackend::unbounded();
                recorded.push(events);
                CachingAllocator::from_config(backend, config.clone())
            })
            .unwrap();
        allocator.malloc(KB, None, 3).unwrap();
    }

    assert_eq!(registry.len(), 3);
    assert_eq!(recorded.len(), 3);
    assert!(
        recorded
            .iter()
            .all(|events| events.snapshot().first() == Some(&BackendEvent::BindDevice(3)))
    );

    registry.finalize_all();

    assert!(registry.is_empty());
    assert!(
        recorded
            .iter()
            .all(|events| events.frees() == events.allocations().len())
    );
}
