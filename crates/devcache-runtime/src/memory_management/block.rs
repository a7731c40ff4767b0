use super::bin::BlockKey;
use super::size_class::BinIndex;
use crate::error::AllocError;
use crate::storage::DevicePtr;
use alloc::format;
use alloc::vec::Vec;
use hashbrown::HashMap;

/// Stable identifier of a [Block] in a [BlockArena].
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct BlockId(u64);

/// A contiguous extent of device memory, free or handed out.
///
/// `prev` and `next` link the fragments that were split from the same backend extent, in
/// address order. A block without neighbours spans a whole extent.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Block {
    pub device_id: u32,
    pub size: u64,
    /// Size class owning the block, `None` for blocks of a single-pool allocator.
    pub bin: Option<BinIndex>,
    pub ptr: DevicePtr,
    #[new(default)]
    pub allocated: bool,
    #[new(default)]
    pub prev: Option<BlockId>,
    #[new(default)]
    pub next: Option<BlockId>,
}

impl Block {
    /// Whether the block is a fragment of a larger extent.
    pub fn is_split(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }

    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.size, self.ptr)
    }

    /// Address one past the end of the block.
    pub fn end(&self) -> u64 {
        self.ptr.addr().saturating_add(self.size)
    }
}

/// Owns every live block of an allocator.
///
/// Bins and allocation maps only hold [BlockId]s; a block lives here until it is absorbed by a
/// merge or its extent is returned to the backend.
#[derive(Default, Debug)]
pub(crate) struct BlockArena {
    blocks: HashMap<BlockId, Block>,
    next_id: u64,
}

impl BlockArena {
    pub fn insert(&mut self, block: Block) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.blocks.insert(id, block);
        id
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id)
    }

    pub fn remove(&mut self, id: BlockId) -> Option<Block> {
        self.blocks.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, &Block)> {
        self.blocks.iter()
    }

    /// Checks that linked blocks are contiguous and that no two blocks overlap.
    pub fn check_links(&self) -> Result<(), AllocError> {
        for (id, block) in self.blocks.iter() {
            let Some(next) = block.next else {
                continue;
            };

            match self.blocks.get(&next) {
                Some(next) if next.prev == Some(*id) && next.ptr.addr() == block.end() => {}
                _ => {
                    return Err(AllocError::accounting(format!(
                        "block at {} isn't linked to its successor",
                        block.ptr
                    )));
                }
            }
        }

        let mut ranges: Vec<(u64, u64)> = self
            .blocks
            .values()
            .map(|block| (block.ptr.addr(), block.end()))
            .collect();
        ranges.sort_unstable();

        match ranges.windows(2).find(|w| w[0].1 > w[1].0) {
            Some(w) => Err(AllocError::accounting(format!(
                "blocks at {:#x} and {:#x} overlap",
                w[0].0, w[1].0
            ))),
            None => Ok(()),
        }
    }

    /// Carves the first `size` bytes out of a free block.
    ///
    /// The new front fragment is linked in before the block, which keeps the remainder.
    /// Returns the id of the front fragment. The block is left untouched when this fails.
    pub fn split(&mut self, id: BlockId, size: u64) -> Result<BlockId, AllocError> {
        let block = self
            .blocks
            .get(&id)
            .ok_or_else(|| AllocError::accounting(format!("splitting unknown block {id:?}")))?;

        if block.allocated {
            return Err(AllocError::accounting(format!(
                "splitting allocated block at {}",
                block.ptr
            )));
        }

        if size == 0 || size >= block.size {
            return Err(AllocError::accounting(format!(
                "can't split {size} bytes out of a block of {} bytes",
                block.size
            )));
        }

        let remainder_ptr = block.ptr.offset(size).ok_or_else(|| {
            AllocError::accounting(format!("block at {} overflows the address space", block.ptr))
        })?;

        let mut front = Block::new(block.device_id, size, block.bin, block.ptr);
        front.prev = block.prev;
        front.next = Some(id);
        let prev = block.prev;
        let remainder_size = block.size - size;

        let front_id = self.insert(front);

        if let Some(prev) = prev.and_then(|prev| self.blocks.get_mut(&prev)) {
            prev.next = Some(front_id);
        }

        if let Some(block) = self.blocks.get_mut(&id) {
            block.prev = Some(front_id);
            block.ptr = remainder_ptr;
            block.size = remainder_size;
        }

        Ok(front_id)
    }

    /// Absorbs the free neighbours of a block into it.
    ///
    /// `unlink` is called with every neighbour before it is absorbed, so the caller can take it
    /// out of its free set. Returns the number of absorbed neighbours.
    pub fn merge_free_neighbours<F>(&mut self, id: BlockId, mut unlink: F) -> usize
    where
        F: FnMut(&Block),
    {
        let Some(block) = self.blocks.get(&id) else {
            return 0;
        };
        let (prev, next) = (block.prev, block.next);

        let mut merged = 0;
        for neighbour in [prev, next].into_iter().flatten() {
            if self.merge(id, neighbour, &mut unlink) {
                merged += 1;
            }
        }

        merged
    }

    fn merge<F>(&mut self, dst: BlockId, src: BlockId, unlink: &mut F) -> bool
    where
        F: FnMut(&Block),
    {
        match self.blocks.get(&src) {
            Some(block) if !block.allocated => unlink(block),
            _ => return false,
        }

        let Some(src_block) = self.blocks.remove(&src) else {
            return false;
        };
        let Some(block) = self.blocks.get_mut(&dst) else {
            self.blocks.insert(src, src_block);
            return false;
        };

        block.size = match block.size.checked_add(src_block.size) {
            Some(size) => size,
            None => {
                log::error!(
                    "Merging blocks at {} and {} overflows the block size",
                    block.ptr,
                    src_block.ptr
                );
                u64::MAX
            }
        };

        let relink = if block.prev == Some(src) {
            block.ptr = src_block.ptr;
            block.prev = src_block.prev;
            src_block.prev.map(|prev| (prev, true))
        } else {
            block.next = src_block.next;
            src_block.next.map(|next| (next, false))
        };

        match relink {
            Some((prev, true)) => {
                if let Some(prev) = self.blocks.get_mut(&prev) {
                    prev.next = Some(dst);
                }
            }
            Some((next, false)) => {
                if let Some(next) = self.blocks.get_mut(&next) {
                    next.prev = Some(dst);
                }
            }
            None => {}
        }

        true
    }
}
