#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

//! Caching allocator for coarse-grained device memory.
//!
//! Large extents obtained from a [device memory backend](storage::DeviceMemoryBackend) are cached
//! in size-class bins, split to serve smaller requests and coalesced again when their fragments
//! are freed.

extern crate alloc;

#[macro_use]
extern crate derive_new;

/// Configuration module.
pub mod config;
/// Error types.
pub mod error;
/// Memory management module.
pub mod memory_management;
/// Device memory storage module.
pub mod storage;

pub use error::*;
