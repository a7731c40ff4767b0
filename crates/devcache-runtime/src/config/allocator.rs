use super::logger::{LogLevel, LoggerConfig};
use crate::storage::MemoryKind;
use alloc::vec::Vec;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Configuration for the caching allocators.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct AllocatorConfig {
    /// The kind of memory the caching allocator requests from its backend.
    #[serde(default)]
    pub memory_kind: MemoryKind,

    /// Every request is rounded up to a multiple of this many bytes.
    #[serde(default = "default_round_unit")]
    pub round_unit: u64,

    /// Upper bound of every size class, ascending. The last one is also the unit that larger
    /// extents are rounded to.
    #[serde(default = "default_bin_sizes")]
    pub bin_sizes: Vec<u64>,

    /// A free block is split when the request is at most this fraction of its size.
    #[serde(default = "default_split_threshold")]
    pub split_threshold: f64,

    /// Disables evicting the cache when the backend runs out of memory.
    #[serde(default)]
    pub bind_stream: bool,

    /// Configuration of the RDMA pool allocator.
    #[serde(default)]
    pub rdma: RdmaConfig,

    /// Logger configuration for allocator logs.
    #[serde(default)]
    pub logger: LoggerConfig<AllocatorLogLevel>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            memory_kind: MemoryKind::default(),
            round_unit: default_round_unit(),
            bin_sizes: default_bin_sizes(),
            split_threshold: default_split_threshold(),
            bind_stream: false,
            rdma: RdmaConfig::default(),
            logger: Default::default(),
        }
    }
}

/// Configuration of the RDMA pool allocator.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RdmaConfig {
    /// Every request is rounded up to a multiple of this many bytes.
    #[serde(default = "default_round_unit")]
    pub alignment: u64,

    /// A free block is split when the request is at most this fraction of its size.
    #[serde(default = "default_rdma_split_threshold")]
    pub split_threshold: f64,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            alignment: default_round_unit(),
            split_threshold: default_rdma_split_threshold(),
        }
    }
}

fn default_round_unit() -> u64 {
    512
}

fn default_bin_sizes() -> Vec<u64> {
    alloc::vec![
        512 * KB,
        8 * MB,
        32 * MB,
        128 * MB,
        256 * MB,
        512 * MB,
        GB
    ]
}

fn default_split_threshold() -> f64 {
    0.75
}

fn default_rdma_split_threshold() -> f64 {
    0.5
}

/// Log levels for the allocators.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AllocatorLogLevel {
    /// Allocator logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Cache growth, eviction and allocation failures are logged.
    #[serde(rename = "basic")]
    Basic,

    /// Every split and merge is logged as well.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for AllocatorLogLevel {}
