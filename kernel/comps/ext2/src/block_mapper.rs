// SPDX-License-Identifier: MPL-2.0

use crate::{
    block_ptr::{BID_SIZE, BidPath, BlockPtrs, DIRECT_CNT, data_blocks_of, growable_blocks},
    fs::FsCtx,
    inode::{FileType, InodeDesc, RawInode},
    prelude::*,
};

/// Translates the logical blocks of one inode into physical blocks.
///
/// The first 12 blocks are pointed to directly by the inode. The following blocks are
/// reached through the single, double and treble indirect pointer tables, each table
/// holding `block_size / 4` entries. Resolved block numbers are remembered, so a table
/// is walked at most once per span it covers. Every change to the chain is written
/// through before the call returns.
#[derive(Debug)]
pub(crate) struct BlockMapper {
    ino: u32,
    ptrs: BlockPtrs,
    /// The physical block of each logical block, `None` until resolved.
    /// A resolved null block is a hole.
    blocks: Vec<Option<BlockId>>,
    /// The blocks charged to the inode, pointer tables included.
    charged_blocks: u32,
    per_table: u32,
    block_size: usize,
}

impl BlockMapper {
    /// Builds the mapper of the inode `ino` from its on-disk record.
    pub fn load(ino: u32, raw: &RawInode, desc: &InodeDesc, block_size: usize) -> Result<Self> {
        let per_table = (block_size / BID_SIZE) as u32;
        let sectors_per_block = (block_size / 512) as u32;
        let charged_blocks = raw.blocks_count / sectors_per_block;

        // An extended attribute block is charged to the inode but is not part of the chain.
        let chained = charged_blocks.saturating_sub((raw.file_acl != 0) as u32);
        let span = if desc.type_ == FileType::Symlink && chained == 0 {
            // Fast symlink: the pointers hold the target itself.
            0
        } else {
            let by_size = desc.size.div_ceil(block_size) as u64;
            by_size.max(data_blocks_of(chained, per_table) as u64)
        };

        let n = per_table as u64;
        if span > DIRECT_CNT as u64 + n + n * n + n * n * n {
            return_errno_with_msg!(CorruptEntry, "file size beyond the addressable range");
        }

        let mut blocks = vec![None; span as usize];
        for (idx, slot) in blocks.iter_mut().take(DIRECT_CNT as usize).enumerate() {
            *slot = Some(raw.block_ptrs.direct(idx));
        }

        Ok(Self {
            ino,
            ptrs: raw.block_ptrs,
            blocks,
            charged_blocks,
            per_table,
            block_size,
        })
    }

    /// Creates the mapper of a new, empty inode.
    pub fn new(ino: u32, block_size: usize) -> Self {
        Self {
            ino,
            ptrs: BlockPtrs::default(),
            blocks: Vec::new(),
            charged_blocks: 0,
            per_table: (block_size / BID_SIZE) as u32,
            block_size,
        }
    }

    /// Returns the number of logical blocks tracked.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the number of blocks charged to the inode, pointer tables included.
    pub fn charged_blocks(&self) -> u32 {
        self.charged_blocks
    }

    /// Returns the bytes kept inline in the block pointers.
    pub fn inline_data(&self) -> &[u8] {
        self.ptrs.as_bytes()
    }

    /// Stores `data` inline in the block pointers.
    pub fn set_inline_data(&mut self, data: &[u8]) -> Result<()> {
        if !self.blocks.is_empty() {
            return Err(Error::algorithmic("inline data over a block chain"));
        }
        let bytes = self.ptrs.as_bytes_mut();
        if data.len() > bytes.len() {
            return_errno_with_msg!(InvalidArgs, "inline data too long");
        }
        bytes.fill(0);
        bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Returns the physical block of the logical block `idx`.
    ///
    /// A null block is a hole.
    pub fn resolve(&mut self, cache: &BlockCache, idx: usize) -> Result<BlockId> {
        if idx >= self.blocks.len() {
            return Err(Error::algorithmic(
                "logical block beyond the tracked block count",
            ));
        }
        if let Some(bid) = self.blocks[idx] {
            return Ok(bid);
        }

        let n = self.per_table;
        match BidPath::locate(idx as u32, n)? {
            BidPath::Direct(i) => self.blocks[idx] = Some(self.ptrs.direct(i)),
            BidPath::Indirect(_) => {
                self.fill_from_table(cache, self.ptrs.indirect(), DIRECT_CNT)?;
            }
            BidPath::DbIndirect(lvl1_idx, _) => {
                let table = child_table(cache, self.ptrs.db_indirect(), lvl1_idx)?;
                self.fill_from_table(cache, table, DIRECT_CNT + n + lvl1_idx * n)?;
            }
            BidPath::TbIndirect(lvl1_idx, lvl2_idx, _) => {
                let lvl2_table = child_table(cache, self.ptrs.tb_indirect(), lvl1_idx)?;
                let table = child_table(cache, lvl2_table, lvl2_idx)?;
                let base = DIRECT_CNT + n + n * n + lvl1_idx * n * n + lvl2_idx * n;
                self.fill_from_table(cache, table, base)?;
            }
        }

        self.blocks[idx].ok_or_else(|| Error::algorithmic("pointer table left a block unresolved"))
    }

    /// Appends the block `bid` to the end of the chain and persists the inode.
    pub fn add_block(&mut self, desc: &InodeDesc, ctx: &mut FsCtx<'_>, bid: BlockId) -> Result<()> {
        let idx = self.blocks.len() as u32;
        let linked = self.link_block(ctx, idx, bid);
        if linked.is_ok() {
            self.blocks.push(Some(bid));
            self.charged_blocks += 1;
        }
        let persisted = self.persist(desc, ctx);
        linked?;
        persisted
    }

    /// Makes sure the chain covers `size` bytes, allocating zeroed blocks as needed.
    ///
    /// The size recorded in `desc` grows to `size` unless `only_blocks` is set.
    /// Blocks appended before a failure stay in the chain.
    pub fn ensure_size(
        &mut self,
        desc: &mut InodeDesc,
        ctx: &mut FsCtx<'_>,
        size: usize,
        only_blocks: bool,
    ) -> Result<()> {
        let needed = size.div_ceil(self.block_size);
        if needed > self.blocks.len() {
            if needed as u64 > growable_blocks(self.per_table) {
                error!(
                    "ext2: inode {} cannot grow to {} blocks without treble indirection",
                    self.ino, needed
                );
                return_errno_with_msg!(FileTooBig, "treble indirect blocks are not supported");
            }

            let new_blocks = needed - self.blocks.len();
            let bids = ctx.alloc.find_free_blocks(ctx.cache, self.ino, new_blocks)?;
            let mut bids = bids.into_iter();
            while let Some(bid) = bids.next() {
                let len_before = self.blocks.len();
                let res = ctx
                    .cache
                    .zero_block(bid)
                    .and_then(|_| self.add_block(desc, ctx, bid));
                if let Err(err) = res {
                    if self.blocks.len() == len_before {
                        ctx.alloc.release_block(ctx.cache, bid)?;
                    }
                    for unused in bids {
                        ctx.alloc.release_block(ctx.cache, unused)?;
                    }
                    return Err(err);
                }
            }
        }

        if !only_blocks && size > desc.size {
            desc.size = size;
        }
        self.persist(desc, ctx)
    }

    /// Releases every block of the chain, pointer tables included, and persists the
    /// emptied inode.
    pub fn wipe(&mut self, desc: &mut InodeDesc, ctx: &mut FsCtx<'_>) -> Result<()> {
        let len = self.blocks.len();
        for idx in 0..len {
            let bid = self.resolve(ctx.cache, idx)?;
            if !bid.is_null() {
                ctx.alloc.release_block(ctx.cache, bid)?;
                self.charged_blocks = self.charged_blocks.saturating_sub(1);
            }
        }

        for table in self.table_blocks(ctx.cache)? {
            self.release_table(ctx, table)?;
        }

        self.ptrs = BlockPtrs::default();
        self.blocks.clear();
        desc.size = 0;
        self.persist(desc, ctx)
    }

    /// Writes the inode record with the current chain.
    pub fn persist(&self, desc: &InodeDesc, ctx: &FsCtx<'_>) -> Result<()> {
        let sectors = self.charged_blocks * (self.block_size / 512) as u32;
        let raw = RawInode::new(desc, self.ptrs, sectors);
        ctx.table.write(ctx.cache, self.ino, &raw)
    }

    fn link_block(&mut self, ctx: &mut FsCtx<'_>, idx: u32, bid: BlockId) -> Result<()> {
        match BidPath::locate(idx, self.per_table)? {
            BidPath::Direct(i) => self.ptrs.set_direct(i, bid),
            BidPath::Indirect(i) => {
                if self.ptrs.indirect().is_null() {
                    let table = self.alloc_table(ctx)?;
                    self.ptrs.set_indirect(table);
                }
                write_bid(ctx.cache, self.ptrs.indirect(), i, bid)?;
            }
            BidPath::DbIndirect(lvl1_idx, lvl2_idx) => {
                let new_lvl1 = self.ptrs.db_indirect().is_null();
                if new_lvl1 {
                    let table = self.alloc_table(ctx)?;
                    self.ptrs.set_db_indirect(table);
                }
                let lvl1_table = self.ptrs.db_indirect();
                let mut lvl2_table = read_bid(ctx.cache, lvl1_table, lvl1_idx)?;
                if lvl2_table.is_null() {
                    lvl2_table = match self.alloc_table(ctx) {
                        Ok(table) => table,
                        Err(err) => {
                            // An empty top table must not outlive the failed append.
                            if new_lvl1 {
                                self.ptrs.set_db_indirect(BlockId::NULL);
                                self.release_table(ctx, lvl1_table)?;
                            }
                            return Err(err);
                        }
                    };
                    write_bid(ctx.cache, lvl1_table, lvl1_idx, lvl2_table)?;
                }
                write_bid(ctx.cache, lvl2_table, lvl2_idx, bid)?;
            }
            BidPath::TbIndirect(..) => {
                error!(
                    "ext2: inode {} needs a treble indirect block at index {}",
                    self.ino, idx
                );
                return_errno_with_msg!(FileTooBig, "treble indirect blocks are not supported");
            }
        }
        Ok(())
    }

    /// Allocates a zeroed pointer table near the inode.
    fn alloc_table(&mut self, ctx: &mut FsCtx<'_>) -> Result<BlockId> {
        let table = ctx.alloc.find_free_block(ctx.cache, self.ino)?;
        if let Err(err) = ctx.cache.zero_block(table) {
            ctx.alloc.release_block(ctx.cache, table)?;
            return Err(err);
        }
        self.charged_blocks += 1;
        Ok(table)
    }

    fn release_table(&mut self, ctx: &mut FsCtx<'_>, table: BlockId) -> Result<()> {
        ctx.alloc.release_block(ctx.cache, table)?;
        self.charged_blocks = self.charged_blocks.saturating_sub(1);
        Ok(())
    }

    /// Returns every pointer table of the chain.
    fn table_blocks(&self, cache: &BlockCache) -> Result<Vec<BlockId>> {
        // Fast symlinks keep text in the pointers, so only walk the tiers in use.
        let len = self.blocks.len();
        let n = self.per_table as usize;
        let direct = DIRECT_CNT as usize;
        let mut tables = Vec::new();
        if len > direct {
            collect_tables(cache, self.ptrs.indirect(), 1, &mut tables)?;
        }
        if len > direct + n {
            collect_tables(cache, self.ptrs.db_indirect(), 2, &mut tables)?;
        }
        if len > direct + n + n * n {
            collect_tables(cache, self.ptrs.tb_indirect(), 3, &mut tables)?;
        }
        Ok(tables)
    }

    /// Records the entries of `table` as the blocks starting at logical block `base`.
    fn fill_from_table(&mut self, cache: &BlockCache, table: BlockId, base: u32) -> Result<()> {
        let base = base as usize;
        let entries = if table.is_null() {
            vec![BlockId::NULL; self.per_table as usize]
        } else {
            read_table(cache, table)?
        };
        for (slot, bid) in self.blocks.iter_mut().skip(base).zip(entries) {
            if slot.is_none() {
                *slot = Some(bid);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl BlockMapper {
    /// Returns the data blocks and the pointer tables of the chain.
    pub fn owned_blocks(&mut self, cache: &BlockCache) -> Result<(Vec<BlockId>, Vec<BlockId>)> {
        let mut data = Vec::new();
        for idx in 0..self.blocks.len() {
            let bid = self.resolve(cache, idx)?;
            if !bid.is_null() {
                data.push(bid);
            }
        }
        Ok((data, self.table_blocks(cache)?))
    }
}

/// Pushes `table` and, for `depth > 1`, the tables below it.
fn collect_tables(
    cache: &BlockCache,
    table: BlockId,
    depth: u32,
    out: &mut Vec<BlockId>,
) -> Result<()> {
    if table.is_null() {
        return Ok(());
    }
    if depth > 1 {
        for child in read_table(cache, table)? {
            collect_tables(cache, child, depth - 1, out)?;
        }
    }
    out.push(table);
    Ok(())
}

/// Returns the entry `idx` of `table`, or a null block if the table itself is null.
fn child_table(cache: &BlockCache, table: BlockId, idx: u32) -> Result<BlockId> {
    if table.is_null() {
        return Ok(BlockId::NULL);
    }
    read_bid(cache, table, idx)
}

fn read_bid(cache: &BlockCache, table: BlockId, idx: u32) -> Result<BlockId> {
    let mut buf = [0u8; BID_SIZE];
    cache.read_at(table, idx as usize * BID_SIZE, &mut buf)?;
    Ok(BlockId::new(u32::from_le_bytes(buf)))
}

fn write_bid(cache: &BlockCache, table: BlockId, idx: u32, bid: BlockId) -> Result<()> {
    cache.write_at(table, idx as usize * BID_SIZE, &bid.to_raw().to_le_bytes())
}

/// Reads every entry of the pointer table `table`.
fn read_table(cache: &BlockCache, table: BlockId) -> Result<Vec<BlockId>> {
    let pinned = cache.pin(table)?;
    let bytes = pinned.to_vec()?;
    Ok(bytes
        .chunks_exact(BID_SIZE)
        .map(|chunk| BlockId::new(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect())
}
