use std::sync::{Arc, Mutex};

use derive_new::new;
use devcache_runtime::{
    StorageError,
    storage::{BytesBackend, DeviceMemoryBackend, DevicePtr, MemoryKind},
};

/// A call received by a [RecordingBackend].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Allocate {
        purpose: String,
        size: u64,
        device_id: u32,
    },
    Free {
        ptr: DevicePtr,
        device_id: u32,
    },
    BindDevice(u32),
}

/// Events shared between a backend and the test observing it.
#[derive(Clone, Debug, Default)]
pub struct BackendEvents {
    events: Arc<Mutex<Vec<BackendEvent>>>,
}

impl BackendEvents {
    pub fn snapshot(&self) -> Vec<BackendEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn allocations(&self) -> Vec<u64> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                BackendEvent::Allocate { size, .. } => Some(size),
                _ => None,
            })
            .collect()
    }

    pub fn frees(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|event| matches!(event, BackendEvent::Free { .. }))
            .count()
    }

    fn push(&self, event: BackendEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// The recording backend forwards to a [BytesBackend] and remembers every call, so tests can
/// still inspect them once the allocator owning the backend is dropped.
#[derive(new, Debug)]
pub struct RecordingBackend {
    inner: BytesBackend,
    events: BackendEvents,
}

impl RecordingBackend {
    /// A backend without capacity limit, and the handle to its events.
    pub fn unbounded() -> (Self, BackendEvents) {
        let events = BackendEvents::default();
        (Self::new(BytesBackend::new(), events.clone()), events)
    }

    /// A backend refusing to hold more than `capacity` bytes, and the handle to its events.
    pub fn with_capacity(capacity: u64) -> (Self, BackendEvents) {
        let events = BackendEvents::default();
        (
            Self::new(BytesBackend::with_capacity(capacity), events.clone()),
            events,
        )
    }

    pub fn inner(&mut self) -> &mut BytesBackend {
        &mut self.inner
    }
}

impl DeviceMemoryBackend for RecordingBackend {
    fn allocate(
        &mut self,
        purpose: &str,
        size: u64,
        device_id: u32,
    ) -> Result<DevicePtr, StorageError> {
        self.events.push(BackendEvent::Allocate {
            purpose: purpose.to_string(),
            size,
            device_id,
        });
        self.inner.allocate(purpose, size, device_id)
    }

    fn free(&mut self, ptr: DevicePtr, device_id: u32) -> Result<(), StorageError> {
        self.events.push(BackendEvent::Free { ptr, device_id });
        self.inner.free(ptr, device_id)
    }

    fn supports(&self, kind: MemoryKind) -> bool {
        self.inner.supports(kind)
    }

    fn bind_device(&mut self, device_id: u32) -> Result<(), StorageError> {
        self.events.push(BackendEvent::BindDevice(device_id));
        self.inner.bind_device(device_id)
    }
}
