pub(crate) mod bin;
pub(crate) mod block;

mod base;
mod size_class;

pub use base::*;
pub use size_class::*;

/// Size-class caching allocator.
mod caching_allocator;
pub use caching_allocator::*;

/// Single pool allocator for pre-registered memory.
mod rdma_pool;
pub use rdma_pool::*;

mod registry;
pub use registry::*;
