use alloc::string::String;
use thiserror::Error;

use crate::storage::{DevicePtr, MemoryKind};

/// Error returned by a [device memory backend](crate::storage::DeviceMemoryBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The device doesn't have enough memory left for the request.
    #[error("out of device memory while allocating {size} bytes")]
    OutOfMemory {
        /// The requested size in bytes.
        size: u64,
    },
    /// The pointer wasn't handed out by this backend, or was already freed.
    #[error("pointer {ptr} is not owned by the backend")]
    InvalidPointer {
        /// The rejected pointer.
        ptr: DevicePtr,
    },
    /// The backend can't serve this kind of memory.
    #[error("memory kind {kind:?} is not supported by the backend")]
    Unsupported {
        /// The requested memory kind.
        kind: MemoryKind,
    },
    /// Unknown error reported by the driver.
    #[error("unknown backend error: {0}")]
    Unknown(String),
}

/// Error returned by the allocators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocError {
    /// A caller passed an argument the allocator can't accept, such as a null or unknown pointer.
    #[error("invalid parameter: {reason}")]
    InvalidParameter {
        /// Why the parameter was rejected.
        reason: String,
    },
    /// The backend couldn't provide more memory, even after the cache was evicted.
    #[error("can't allocate {size} bytes on device {device_id}")]
    ResourceExhausted {
        /// The requested size in bytes, after rounding.
        size: u64,
        /// The device the request was made for.
        device_id: u32,
    },
    /// Size bookkeeping would have overflowed or a size class couldn't be resolved.
    #[error("internal accounting error: {reason}")]
    InternalAccounting {
        /// Details of the accounting failure.
        reason: String,
    },
    /// The pool was initialized twice without being finalized in between.
    #[error("memory is already initialized")]
    AlreadyInitialized,
    /// The allocator was used before being initialized.
    #[error("allocator is not initialized")]
    NotInitialized,
    /// No backend is able to serve the configured memory kind.
    #[error("no backend available for memory kind {kind:?}")]
    BackendUnavailable {
        /// The memory kind the allocator is configured for.
        kind: MemoryKind,
    },
    /// Error forwarded from the backend.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AllocError {
    pub(crate) fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    pub(crate) fn accounting(reason: impl Into<String>) -> Self {
        Self::InternalAccounting {
            reason: reason.into(),
        }
    }
}
