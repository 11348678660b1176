// SPDX-License-Identifier: MPL-2.0

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    bitmap::{Bitmap, bit_position},
    prelude::*,
    super_block::SuperBlock,
};

/// Blocks are clustered into block groups in order to reduce fragmentation and minimise
/// the amount of head seeking when reading a large amount of consecutive data.
///
/// The bitmaps are read on first use. Every change to a bitmap or to the descriptor
/// is written through the block cache before the call returns.
pub(crate) struct BlockGroup {
    idx: u32,
    descriptor: RawGroupDescriptor,
    /// Where the descriptor lives inside the descriptor table.
    descriptor_pos: (BlockId, usize),
    first_block: BlockId,
    blocks_in_group: u32,
    inodes_in_group: u32,
    block_bitmap: Option<Bitmap>,
    inode_bitmap: Option<Bitmap>,
}

impl BlockGroup {
    /// Loads the descriptor of the block group `idx`.
    pub fn load(cache: &BlockCache, super_block: &SuperBlock, idx: u32) -> Result<Self> {
        let block_size = cache.block_size();
        let offset = idx as usize * DESCRIPTOR_SIZE;
        let gdt_start = super_block.group_descriptors_bid().to_raw();
        let descriptor_pos = (
            BlockId::new(gdt_start + (offset / block_size) as u32),
            offset % block_size,
        );

        let descriptor = {
            let mut buf = [0u8; DESCRIPTOR_SIZE];
            cache.read_at(descriptor_pos.0, descriptor_pos.1, &mut buf)?;
            RawGroupDescriptor::read_from_bytes(&buf)
                .map_err(|_| Error::with_msg(CorruptEntry, "short group descriptor"))?
        };

        let total_blocks = super_block.total_blocks();
        let inode_table_blocks = (super_block.inodes_per_group() as usize
            * super_block.inode_size())
        .div_ceil(block_size) as u32;
        if descriptor.block_bitmap >= total_blocks
            || descriptor.inode_bitmap >= total_blocks
            || descriptor.inode_table.saturating_add(inode_table_blocks) > total_blocks
        {
            return_errno_with_msg!(CorruptEntry, "group metadata lies outside the device");
        }

        Ok(Self {
            idx,
            descriptor,
            descriptor_pos,
            first_block: super_block.group_first_block(idx),
            blocks_in_group: super_block.blocks_in_group(idx),
            inodes_in_group: super_block.inodes_per_group(),
            block_bitmap: None,
            inode_bitmap: None,
        })
    }

    /// Returns the first block of the inode table.
    pub fn inode_table_bid(&self) -> BlockId {
        BlockId::new(self.descriptor.inode_table)
    }

    pub fn block_bitmap_bid(&self) -> BlockId {
        BlockId::new(self.descriptor.block_bitmap)
    }

    pub fn inode_bitmap_bid(&self) -> BlockId {
        BlockId::new(self.descriptor.inode_bitmap)
    }

    /// Allocates a block of this group.
    ///
    /// Returns `None` if the group is full.
    pub fn alloc_block(&mut self, cache: &BlockCache) -> Result<Option<BlockId>> {
        // The fast path
        if self.descriptor.free_blocks_count == 0 {
            return Ok(None);
        }

        let bitmap_bid = self.block_bitmap_bid();
        let capacity = self.blocks_in_group as usize;
        let bitmap = load_bitmap(&mut self.block_bitmap, cache, bitmap_bid, capacity)?;
        let Some(block_idx) = bitmap.alloc() else {
            warn!(
                "ext2: group {} claims {} free blocks but its bitmap is full",
                self.idx, self.descriptor.free_blocks_count
            );
            return Ok(None);
        };

        set_bit(cache, bitmap_bid, block_idx, true)?;
        self.descriptor.free_blocks_count -= 1;
        self.write_descriptor(cache)?;
        Ok(Some(BlockId::new(
            self.first_block.to_raw() + block_idx as u32,
        )))
    }

    /// Frees the block `bid` of this group.
    ///
    /// Returns `false` if the block was already free.
    pub fn free_block(&mut self, cache: &BlockCache, bid: BlockId) -> Result<bool> {
        let block_idx = self.block_idx(bid)?;
        let bitmap_bid = self.block_bitmap_bid();
        let capacity = self.blocks_in_group as usize;
        let bitmap = load_bitmap(&mut self.block_bitmap, cache, bitmap_bid, capacity)?;
        if !bitmap.free(block_idx) {
            warn!("ext2: double release of block {}", bid.to_raw());
            return Ok(false);
        }

        set_bit(cache, bitmap_bid, block_idx, false)?;
        self.descriptor.free_blocks_count += 1;
        self.write_descriptor(cache)?;
        Ok(true)
    }

    /// Allocates an inode of this group and returns its index inside the group.
    ///
    /// Returns `None` if the group is full.
    pub fn alloc_inode(&mut self, cache: &BlockCache, is_dir: bool) -> Result<Option<u32>> {
        // The fast path
        if self.descriptor.free_inodes_count == 0 {
            return Ok(None);
        }

        let bitmap_bid = self.inode_bitmap_bid();
        let capacity = self.inodes_in_group as usize;
        let bitmap = load_bitmap(&mut self.inode_bitmap, cache, bitmap_bid, capacity)?;
        let Some(inode_idx) = bitmap.alloc() else {
            warn!(
                "ext2: group {} claims {} free inodes but its bitmap is full",
                self.idx, self.descriptor.free_inodes_count
            );
            return Ok(None);
        };

        set_bit(cache, bitmap_bid, inode_idx, true)?;
        self.descriptor.free_inodes_count -= 1;
        if is_dir {
            self.descriptor.dirs_count += 1;
        }
        self.write_descriptor(cache)?;
        Ok(Some(inode_idx as u32))
    }

    /// Frees the inode with index `inode_idx` inside this group.
    ///
    /// Returns `false` if the inode was already free.
    pub fn free_inode(&mut self, cache: &BlockCache, inode_idx: u32, is_dir: bool) -> Result<bool> {
        if inode_idx >= self.inodes_in_group {
            return Err(Error::algorithmic("inode index beyond its group"));
        }
        let bitmap_bid = self.inode_bitmap_bid();
        let capacity = self.inodes_in_group as usize;
        let bitmap = load_bitmap(&mut self.inode_bitmap, cache, bitmap_bid, capacity)?;
        if !bitmap.free(inode_idx as usize) {
            warn!(
                "ext2: double release of inode {}",
                self.idx * self.inodes_in_group + inode_idx + 1
            );
            return Ok(false);
        }

        set_bit(cache, bitmap_bid, inode_idx as usize, false)?;
        self.descriptor.free_inodes_count += 1;
        if is_dir {
            debug_assert!(self.descriptor.dirs_count > 0);
            self.descriptor.dirs_count = self.descriptor.dirs_count.saturating_sub(1);
        }
        self.write_descriptor(cache)?;
        Ok(true)
    }

    /// Returns whether the inode with index `inode_idx` is marked in use.
    pub fn is_inode_allocated(&mut self, cache: &BlockCache, inode_idx: u32) -> Result<bool> {
        if inode_idx >= self.inodes_in_group {
            return Err(Error::algorithmic("inode index beyond its group"));
        }
        let bitmap_bid = self.inode_bitmap_bid();
        let capacity = self.inodes_in_group as usize;
        let bitmap = load_bitmap(&mut self.inode_bitmap, cache, bitmap_bid, capacity)?;
        Ok(bitmap.is_allocated(inode_idx as usize))
    }

    fn block_idx(&self, bid: BlockId) -> Result<usize> {
        match bid.to_raw().checked_sub(self.first_block.to_raw()) {
            Some(idx) if idx < self.blocks_in_group => Ok(idx as usize),
            _ => Err(Error::algorithmic("block does not belong to the group")),
        }
    }

    fn write_descriptor(&self, cache: &BlockCache) -> Result<()> {
        cache.write_at(
            self.descriptor_pos.0,
            self.descriptor_pos.1,
            self.descriptor.as_bytes(),
        )
    }
}

#[cfg(test)]
impl BlockGroup {
    /// Returns whether the block `bid` of this group is marked in use.
    pub fn is_block_allocated(&mut self, cache: &BlockCache, bid: BlockId) -> Result<bool> {
        let block_idx = self.block_idx(bid)?;
        let bitmap_bid = self.block_bitmap_bid();
        let capacity = self.blocks_in_group as usize;
        let bitmap = load_bitmap(&mut self.block_bitmap, cache, bitmap_bid, capacity)?;
        Ok(bitmap.is_allocated(block_idx))
    }

    pub fn first_block(&self) -> BlockId {
        self.first_block
    }

    pub fn free_blocks_count(&self) -> u16 {
        self.descriptor.free_blocks_count
    }

    pub fn free_inodes_count(&self) -> u16 {
        self.descriptor.free_inodes_count
    }

    pub fn dirs_count(&self) -> u16 {
        self.descriptor.dirs_count
    }
}

impl Debug for BlockGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockGroup")
            .field("idx", &self.idx)
            .field("descriptor", &self.descriptor)
            .field("block_bitmap", &self.block_bitmap)
            .field("inode_bitmap", &self.inode_bitmap)
            .finish()
    }
}

fn load_bitmap<'a>(
    slot: &'a mut Option<Bitmap>,
    cache: &BlockCache,
    bid: BlockId,
    capacity: usize,
) -> Result<&'a mut Bitmap> {
    if slot.is_none() {
        let mut buf = vec![0u8; cache.block_size()];
        cache.read_block(bid, &mut buf)?;
        *slot = Some(Bitmap::from_bytes_with_capacity(&buf, capacity));
    }
    slot.as_mut()
        .ok_or_else(|| Error::algorithmic("bitmap is not loaded"))
}

/// Updates the single bit `id` of the on-disk bitmap at `bid`.
fn set_bit(cache: &BlockCache, bid: BlockId, id: usize, used: bool) -> Result<()> {
    let (byte, mask) = bit_position(id);
    cache.update(bid, |data| {
        if used {
            data[byte] |= mask;
        } else {
            data[byte] &= !mask;
        }
    })
}

/// The size of one entry of the group descriptor table.
pub(crate) const DESCRIPTOR_SIZE: usize = core::mem::size_of::<RawGroupDescriptor>();

const_assert_eq!(DESCRIPTOR_SIZE, 32);

/// The raw block group descriptor.
///
/// The table starts on the first block following the superblock.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct RawGroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub dirs_count: u16,
    pad: u16,
    reserved: [u32; 3],
}

impl RawGroupDescriptor {
    pub fn new(block_bitmap: BlockId, inode_bitmap: BlockId, inode_table: BlockId) -> Self {
        Self {
            block_bitmap: block_bitmap.to_raw(),
            inode_bitmap: inode_bitmap.to_raw(),
            inode_table: inode_table.to_raw(),
            ..Default::default()
        }
    }
}
