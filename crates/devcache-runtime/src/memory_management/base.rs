use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Display;

/// How much detail [print_statistics](super::CachingAllocator::print_statistics) reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatisticsLevel {
    /// Only the totals.
    #[default]
    Summary,
    /// The totals followed by one line per non-empty size class.
    Detailed,
}

/// Usage of a single size class of a [CachingAllocator](super::CachingAllocator).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinStatistics {
    /// Upper bound of the size class in bytes.
    pub boundary: u64,
    /// Number of blocks handed out to callers.
    pub in_use_count: u64,
    /// Bytes of the blocks handed out to callers.
    pub in_use_bytes: u64,
    /// Number of cached free blocks.
    pub free_count: u64,
    /// Bytes of the cached free blocks.
    pub free_bytes: u64,
    /// Number of live extents obtained from the backend for this size class.
    pub backend_count: u64,
    /// Bytes of the live extents obtained from the backend for this size class.
    pub backend_bytes: u64,
}

impl BinStatistics {
    /// Whether nothing at all lives in this size class.
    pub fn is_empty(&self) -> bool {
        self.in_use_count == 0 && self.free_count == 0 && self.backend_count == 0
    }
}

/// Snapshot of the memory held by a [CachingAllocator](super::CachingAllocator).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStatistics {
    /// Per size class usage, in ascending size order.
    pub bins: Vec<BinStatistics>,
    /// Calls to `malloc` since the allocator was initialized.
    pub malloc_calls: u64,
    /// Calls to `free` since the allocator was initialized.
    pub free_calls: u64,
}

impl MemoryStatistics {
    /// Number of blocks currently handed out.
    pub fn number_allocs(&self) -> u64 {
        self.bins.iter().map(|bin| bin.in_use_count).sum()
    }

    /// Bytes currently handed out.
    pub fn bytes_in_use(&self) -> u64 {
        self.bins.iter().map(|bin| bin.in_use_bytes).sum()
    }

    /// Number of cached free blocks.
    pub fn number_free(&self) -> u64 {
        self.bins.iter().map(|bin| bin.free_count).sum()
    }

    /// Bytes cached in free blocks.
    pub fn bytes_free(&self) -> u64 {
        self.bins.iter().map(|bin| bin.free_bytes).sum()
    }

    /// Number of live backend extents.
    pub fn number_extents(&self) -> u64 {
        self.bins.iter().map(|bin| bin.backend_count).sum()
    }

    /// Bytes obtained from the backend and not yet returned.
    pub fn bytes_reserved(&self) -> u64 {
        self.bins.iter().map(|bin| bin.backend_bytes).sum()
    }

    /// Formats the statistics at the given level of detail.
    pub fn report(&self, level: StatisticsLevel) -> String {
        let mut report = format!("{self}");

        if level == StatisticsLevel::Detailed {
            for bin in self.bins.iter().filter(|bin| !bin.is_empty()) {
                report += &format!(
                    "\n  bin <= {}: in use {} ({}), free {} ({}), backend {} ({})",
                    BytesFormat::new(bin.boundary),
                    bin.in_use_count,
                    BytesFormat::new(bin.in_use_bytes),
                    bin.free_count,
                    BytesFormat::new(bin.free_bytes),
                    bin.backend_count,
                    BytesFormat::new(bin.backend_bytes),
                );
            }
        }

        report
    }
}

impl Display for MemoryStatistics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let reserved = self.bytes_reserved();
        let usage_percentage = if reserved == 0 {
            0.0
        } else {
            self.bytes_in_use() as f64 / reserved as f64 * 100.0
        };

        write!(
            f,
            "Memory Statistics:\n  Reserved: {} in {} extents\n  In use: {} in {} blocks ({:.2}%)\n  Free: {} in {} blocks\n  Calls: {} malloc, {} free",
            BytesFormat::new(reserved),
            self.number_extents(),
            BytesFormat::new(self.bytes_in_use()),
            self.number_allocs(),
            usage_percentage,
            BytesFormat::new(self.bytes_free()),
            self.number_free(),
            self.malloc_calls,
            self.free_calls,
        )
    }
}

/// Snapshot of the memory held by a [RdmaPoolAllocator](super::RdmaPoolAllocator).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    /// Size of the registered pool, zero when not initialized.
    pub pool_size: u64,
    /// Number of blocks handed out to callers.
    pub in_use_count: u64,
    /// Bytes of the blocks handed out to callers.
    pub in_use_bytes: u64,
    /// Number of free blocks.
    pub free_count: u64,
    /// Bytes of the free blocks.
    pub free_bytes: u64,
    /// Size of the largest free block.
    pub largest_free: u64,
}

impl Display for PoolStatistics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Pool Statistics:\n  Pool: {}\n  In use: {} in {} blocks\n  Free: {} in {} blocks (largest {})",
            BytesFormat::new(self.pool_size),
            BytesFormat::new(self.in_use_bytes),
            self.in_use_count,
            BytesFormat::new(self.free_bytes),
            self.free_count,
            BytesFormat::new(self.largest_free),
        )
    }
}

/// Displays a byte count with a binary unit.
#[derive(new, Clone, Copy, Debug)]
pub struct BytesFormat {
    bytes: u64,
}

impl Display for BytesFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

        let mut unit = 0;
        let mut value = self.bytes as f64;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            write!(f, "{} B", self.bytes)
        } else {
            write!(f, "{value:.2} {}", UNITS[unit])
        }
    }
}
