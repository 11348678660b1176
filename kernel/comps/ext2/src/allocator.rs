// SPDX-License-Identifier: MPL-2.0

use crate::{block_group::BlockGroup, prelude::*, super_block::SuperBlock};

/// The free-space and inode allocator of the whole filesystem.
///
/// Searches are first-fit, starting at the block group of a hint inode so that an
/// object's blocks and inodes stay close to their parent, then wrapping around the
/// remaining groups. The superblock counters are written through on every change.
#[derive(Debug)]
pub(crate) struct BitmapAllocator {
    super_block: SuperBlock,
    groups: Vec<BlockGroup>,
}

impl BitmapAllocator {
    /// Loads the descriptors of every block group.
    pub fn load(cache: &BlockCache, super_block: SuperBlock) -> Result<Self> {
        let groups = (0..super_block.groups_count())
            .map(|idx| BlockGroup::load(cache, &super_block, idx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            super_block,
            groups,
        })
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn groups(&self) -> &[BlockGroup] {
        &self.groups
    }

    /// Records a mount in the superblock.
    pub fn record_mount(&mut self, cache: &BlockCache, now: u32) -> Result<()> {
        self.super_block.record_mount(now);
        self.super_block.write_through(cache)
    }

    /// Allocates one block, preferring the block group of `hint_ino`.
    pub fn find_free_block(&mut self, cache: &BlockCache, hint_ino: u32) -> Result<BlockId> {
        let groups_count = self.groups.len();
        let mut group_idx = self.hint_group(hint_ino);
        for _ in 0..groups_count {
            if group_idx >= groups_count {
                group_idx = 0;
            }
            if let Some(bid) = self.groups[group_idx].alloc_block(cache)? {
                self.super_block.dec_free_blocks();
                self.super_block.write_through(cache)?;
                trace!("ext2: allocated block {}", bid.to_raw());
                return Ok(bid);
            }
            group_idx += 1;
        }

        return_errno_with_msg!(NoSpaceLeftOnDevice, "no free block on device");
    }

    /// Allocates `count` blocks, preferring the block group of `hint_ino`.
    ///
    /// Either every block is allocated or none is.
    pub fn find_free_blocks(
        &mut self,
        cache: &BlockCache,
        hint_ino: u32,
        count: usize,
    ) -> Result<Vec<BlockId>> {
        if count > self.super_block.free_blocks_count() as usize {
            return_errno_with_msg!(NoSpaceLeftOnDevice, "not enough free blocks on device");
        }

        let mut bids = Vec::with_capacity(count);
        for _ in 0..count {
            match self.find_free_block(cache, hint_ino) {
                Ok(bid) => bids.push(bid),
                Err(err) => {
                    for bid in bids {
                        self.release_block(cache, bid)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(bids)
    }

    /// Allocates an inode number, preferring the block group of `hint_ino`.
    pub fn find_free_inode(
        &mut self,
        cache: &BlockCache,
        hint_ino: u32,
        is_dir: bool,
    ) -> Result<u32> {
        let groups_count = self.groups.len();
        let inodes_per_group = self.super_block.inodes_per_group();
        let mut group_idx = self.hint_group(hint_ino);
        for _ in 0..groups_count {
            if group_idx >= groups_count {
                group_idx = 0;
            }
            if let Some(inode_idx) = self.groups[group_idx].alloc_inode(cache, is_dir)? {
                let ino = group_idx as u32 * inodes_per_group + inode_idx + 1;
                if ino < self.super_block.first_ino() || ino > self.super_block.total_inodes() {
                    // Reserved inodes must never be handed out, not even on a damaged bitmap.
                    self.groups[group_idx].free_inode(cache, inode_idx, is_dir)?;
                    return_errno_with_msg!(CorruptEntry, "a reserved inode is marked free");
                }
                self.super_block.dec_free_inodes();
                self.super_block.write_through(cache)?;
                trace!("ext2: allocated inode {}", ino);
                return Ok(ino);
            }
            group_idx += 1;
        }

        return_errno_with_msg!(NoSpaceLeftOnDevice, "no free inode on device");
    }

    /// Returns the block `bid` to the free pool.
    pub fn release_block(&mut self, cache: &BlockCache, bid: BlockId) -> Result<()> {
        let group_idx = self.group_of_bid(bid)?;
        if self.groups[group_idx].free_block(cache, bid)? {
            self.super_block.inc_free_blocks();
            self.super_block.write_through(cache)?;
            trace!("ext2: released block {}", bid.to_raw());
        }
        Ok(())
    }

    /// Returns the inode `ino` to the free pool.
    pub fn release_inode(&mut self, cache: &BlockCache, ino: u32, is_dir: bool) -> Result<()> {
        if ino < self.super_block.first_ino() || ino > self.super_block.total_inodes() {
            return Err(Error::algorithmic("releasing a reserved or unknown inode"));
        }
        let inodes_per_group = self.super_block.inodes_per_group();
        let group_idx = ((ino - 1) / inodes_per_group) as usize;
        let inode_idx = (ino - 1) % inodes_per_group;
        if self.groups[group_idx].free_inode(cache, inode_idx, is_dir)? {
            self.super_block.inc_free_inodes();
            self.super_block.write_through(cache)?;
            trace!("ext2: released inode {}", ino);
        }
        Ok(())
    }

    /// Returns whether the inode `ino` is marked in use.
    pub fn is_inode_allocated(&mut self, cache: &BlockCache, ino: u32) -> Result<bool> {
        if ino == 0 || ino > self.super_block.total_inodes() {
            return_errno_with_msg!(DoesNotExist, "inode number out of range");
        }
        let inodes_per_group = self.super_block.inodes_per_group();
        let group_idx = ((ino - 1) / inodes_per_group) as usize;
        self.groups[group_idx].is_inode_allocated(cache, (ino - 1) % inodes_per_group)
    }

    fn hint_group(&self, hint_ino: u32) -> usize {
        match hint_ino.checked_sub(1) {
            Some(idx) => (idx / self.super_block.inodes_per_group()) as usize % self.groups.len(),
            None => 0,
        }
    }

    fn group_of_bid(&self, bid: BlockId) -> Result<usize> {
        let first_data_block = self.super_block.first_data_block();
        if bid.is_null()
            || bid.to_raw() < first_data_block
            || bid.to_raw() >= self.super_block.total_blocks()
        {
            return Err(Error::algorithmic("block number outside the data area"));
        }
        Ok(((bid.to_raw() - first_data_block) / self.super_block.blocks_per_group()) as usize)
    }
}

#[cfg(test)]
impl BitmapAllocator {
    /// Returns whether the block `bid` is marked in use.
    ///
    /// With blocks larger than 1 KiB, block 0 holds the superblock and belongs to
    /// group 0.
    pub fn is_block_allocated(&mut self, cache: &BlockCache, bid: BlockId) -> Result<bool> {
        let group_idx = if bid.is_null() && self.super_block.first_data_block() == 0 {
            0
        } else {
            self.group_of_bid(bid)?
        };
        self.groups[group_idx].is_block_allocated(cache, bid)
    }
}
