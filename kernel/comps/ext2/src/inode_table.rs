// SPDX-License-Identifier: MPL-2.0

use zerocopy::{FromBytes, IntoBytes};

use crate::{
    inode::{RAW_INODE_SIZE, RawInode},
    prelude::*,
    super_block::SuperBlock,
};

/// Reads and writes the on-disk inode records of every block group.
///
/// Only the first 128 bytes of each record are interpreted; the tail of larger records
/// is left untouched.
#[derive(Debug)]
pub(crate) struct InodeTable {
    /// The first block of the inode table of each group.
    tables: Vec<BlockId>,
    inodes_per_group: u32,
    inodes_count: u32,
    inode_size: usize,
    block_size: usize,
}

impl InodeTable {
    pub fn new(super_block: &SuperBlock, tables: Vec<BlockId>) -> Self {
        Self {
            tables,
            inodes_per_group: super_block.inodes_per_group(),
            inodes_count: super_block.total_inodes(),
            inode_size: super_block.inode_size(),
            block_size: super_block.block_size(),
        }
    }

    /// Reads the record of the inode `ino`.
    pub fn read(&self, cache: &BlockCache, ino: u32) -> Result<RawInode> {
        let (bid, offset) = self.locate(ino)?;
        let mut buf = [0u8; RAW_INODE_SIZE];
        cache.read_at(bid, offset, &mut buf)?;
        RawInode::read_from_bytes(&buf)
            .map_err(|_| Error::with_msg(CorruptEntry, "short inode record"))
    }

    /// Writes the record of the inode `ino`.
    pub fn write(&self, cache: &BlockCache, ino: u32, raw_inode: &RawInode) -> Result<()> {
        let (bid, offset) = self.locate(ino)?;
        cache.write_at(bid, offset, raw_inode.as_bytes())
    }

    /// Returns the block holding the record of `ino` and the offset inside it.
    fn locate(&self, ino: u32) -> Result<(BlockId, usize)> {
        if ino == 0 || ino > self.inodes_count {
            return_errno_with_msg!(DoesNotExist, "inode number out of range");
        }
        let group_idx = ((ino - 1) / self.inodes_per_group) as usize;
        let inode_idx = ((ino - 1) % self.inodes_per_group) as usize;
        let table = self
            .tables
            .get(group_idx)
            .ok_or(Error::with_msg(DoesNotExist, "inode lies beyond the last group"))?;

        let byte_offset = inode_idx * self.inode_size;
        let bid = BlockId::new(table.to_raw() + (byte_offset / self.block_size) as u32);
        Ok((bid, byte_offset % self.block_size))
    }
}
