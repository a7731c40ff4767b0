use super::block::BlockId;
use crate::storage::DevicePtr;
use alloc::collections::BTreeMap;

/// Ordering key of a free block: size first, address as a tie-break.
#[derive(new, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct BlockKey {
    pub size: u64,
    pub ptr: DevicePtr,
}

/// A set of free blocks ordered by [BlockKey], used for best-fit lookups.
#[derive(Default, Debug)]
pub(crate) struct BlockBin {
    blocks: BTreeMap<BlockKey, BlockId>,
    bytes: u64,
}

impl BlockBin {
    /// Adds a free block. Returns false if a block with the same key is already present.
    pub fn insert(&mut self, key: BlockKey, id: BlockId) -> bool {
        if self.blocks.contains_key(&key) {
            return false;
        }
        self.blocks.insert(key, id);
        self.bytes += key.size;
        true
    }

    pub fn remove(&mut self, key: &BlockKey) -> Option<BlockId> {
        let id = self.blocks.remove(key)?;
        self.bytes -= key.size;
        Some(id)
    }

    /// The smallest block that is not ordered before `key`.
    pub fn lower_bound(&self, key: &BlockKey) -> Option<(BlockKey, BlockId)> {
        self.blocks
            .range(key..)
            .next()
            .map(|(key, id)| (*key, *id))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes of the blocks in the bin.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn largest(&self) -> Option<u64> {
        self.blocks.last_key_value().map(|(key, _)| key.size)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockKey, &BlockId)> {
        self.blocks.iter()
    }
}
