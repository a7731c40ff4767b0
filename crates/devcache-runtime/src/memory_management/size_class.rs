use crate::error::AllocError;
use alloc::format;
use alloc::vec::Vec;

/// Index of a size class in a [SizeClassTable].
pub type BinIndex = usize;

/// Size returned by the rounding helpers when a size can't be represented.
pub const SIZE_SATURATED: u64 = u64::MAX;

/// The size-class policy of a [CachingAllocator](super::CachingAllocator).
///
/// Requests are rounded up to a multiple of `round_unit`. A size belongs to the first class whose
/// boundary is at least that size; anything above the last boundary belongs to the last class.
/// New backend extents are sized to the boundary of their class, or to a whole multiple of the
/// last boundary when they are larger than it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeClassTable {
    round_unit: u64,
    boundaries: Vec<u64>,
}

impl SizeClassTable {
    /// Creates a table, checking that the boundaries are ascending multiples of the round unit.
    pub fn new(round_unit: u64, boundaries: Vec<u64>) -> Result<Self, AllocError> {
        if round_unit == 0 {
            return Err(AllocError::invalid_parameter("round unit must not be zero"));
        }

        if boundaries.is_empty() {
            return Err(AllocError::invalid_parameter(
                "at least one size class is required",
            ));
        }

        if let Some(boundary) = boundaries.iter().find(|b| **b % round_unit != 0) {
            return Err(AllocError::invalid_parameter(format!(
                "size class {boundary} is not a multiple of the round unit {round_unit}"
            )));
        }

        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(AllocError::invalid_parameter(
                "size classes must be strictly ascending",
            ));
        }

        Ok(Self {
            round_unit,
            boundaries,
        })
    }

    /// Every request is rounded to a multiple of this many bytes.
    pub fn round_unit(&self) -> u64 {
        self.round_unit
    }

    /// The upper bound of every size class.
    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    /// Number of size classes.
    pub fn num_bins(&self) -> usize {
        self.boundaries.len()
    }

    /// The unit extents beyond the last size class are rounded to.
    pub fn big_chunk_unit(&self) -> u64 {
        // Non-empty by construction.
        self.boundaries[self.boundaries.len() - 1]
    }

    /// Rounds a request up to the round unit. Zero becomes one unit, overflow saturates.
    pub fn block_size(&self, size: u64) -> u64 {
        if size == 0 {
            return self.round_unit;
        }

        size.checked_next_multiple_of(self.round_unit).unwrap_or(SIZE_SATURATED)
    }

    /// The size class of the given size.
    pub fn bin_index(&self, size: u64) -> BinIndex {
        let index = self.boundaries.partition_point(|boundary| *boundary < size);
        index.min(self.boundaries.len() - 1)
    }

    /// Size of the backend extent allocated to serve a request of `size` bytes.
    pub fn allocation_size(&self, size: u64) -> u64 {
        let index = self.boundaries.partition_point(|boundary| *boundary < size);

        match self.boundaries.get(index) {
            Some(boundary) => *boundary,
            None => size
                .checked_next_multiple_of(self.big_chunk_unit())
                .unwrap_or(SIZE_SATURATED),
        }
    }
}

impl Default for SizeClassTable {
    fn default() -> Self {
        let config = crate::config::allocator::AllocatorConfig::default();
        Self {
            round_unit: config.round_unit,
            boundaries: config.bin_sizes,
        }
    }
}

/// Whether a free block of `block_size` bytes should be split to serve `request` bytes.
///
/// True when the request is at most `threshold` times the block size.
pub fn should_split(block_size: u64, request: u64, threshold: f64) -> bool {
    request < block_size && request as f64 <= block_size as f64 * threshold
}
