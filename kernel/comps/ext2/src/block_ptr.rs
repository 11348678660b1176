// SPDX-License-Identifier: MPL-2.0

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::prelude::*;

/// The number of a physical block on the device.
///
/// Block number zero never holds file data, so a zero pointer
/// inside a pointer table stands for a hole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl BlockId {
    /// The null pointer.
    pub const NULL: Self = Self(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the byte offset of the block on the device.
    pub fn to_offset(self, block_size: usize) -> usize {
        self.0 as usize * block_size
    }
}

/// The pointers to blocks for an inode.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct BlockPtrs {
    inner: [u32; BLOCK_PTR_CNT],
}

impl BlockPtrs {
    /// Returns the direct block ID.
    ///
    /// # Panics
    ///
    /// If the `idx` is out of bounds, this method will panic.
    pub fn direct(&self, idx: usize) -> BlockId {
        assert!(DIRECT_RANGE.contains(&idx));
        BlockId::new(self.inner[idx])
    }

    /// Sets the direct block ID.
    ///
    /// # Panics
    ///
    /// If the `idx` is out of bounds, this method will panic.
    pub fn set_direct(&mut self, idx: usize, bid: BlockId) {
        assert!(DIRECT_RANGE.contains(&idx));
        self.inner[idx] = bid.to_raw();
    }

    /// Returns the block ID of single indirect block pointer.
    pub fn indirect(&self) -> BlockId {
        BlockId::new(self.inner[INDIRECT])
    }

    /// Sets the block ID of single indirect block pointer.
    pub fn set_indirect(&mut self, bid: BlockId) {
        self.inner[INDIRECT] = bid.to_raw();
    }

    /// Returns the block ID of double indirect block pointer.
    pub fn db_indirect(&self) -> BlockId {
        BlockId::new(self.inner[DB_INDIRECT])
    }

    /// Sets the block ID of double indirect block pointer.
    pub fn set_db_indirect(&mut self, bid: BlockId) {
        self.inner[DB_INDIRECT] = bid.to_raw();
    }

    /// Returns the block ID of treble indirect block pointer.
    pub fn tb_indirect(&self) -> BlockId {
        BlockId::new(self.inner[TB_INDIRECT])
    }

    /// Views it as a slice of `u8` bytes.
    ///
    /// Fast symlinks keep their target here instead of block pointers.
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Views it as a mutable slice of `u8` bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.inner.as_mut_bytes()
    }
}

/// Represents the various ways in which a block ID can be located in Ext2.
/// It is an enum with different variants corresponding to the level of indirection
/// used to locate the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BidPath {
    /// Direct reference to a block. The block can be accessed directly through the given
    /// index with no levels of indirection.
    Direct(usize),
    /// Single level of indirection. The block ID can be found at the specified index
    /// within an indirect block.
    Indirect(u32),
    /// Double level of indirection. The first value is the index of the first-level
    /// indirect block, and the second value is the index within the second-level
    /// indirect block where the block ID can be found.
    DbIndirect(u32, u32),
    /// Treble level of indirection. The three values represent the index within
    /// the first-level, second-level, and third-level indirect blocks, respectively.
    TbIndirect(u32, u32, u32),
}

impl BidPath {
    /// Locates the logical block `idx` of a file whose pointer tables
    /// hold `per_table` entries each.
    pub fn locate(idx: u32, per_table: u32) -> Result<Self> {
        let n = per_table as u64;
        let mut idx = idx as u64;
        if idx < DIRECT_CNT as u64 {
            return Ok(Self::Direct(idx as usize));
        }
        idx -= DIRECT_CNT as u64;

        if idx < n {
            return Ok(Self::Indirect(idx as u32));
        }
        idx -= n;

        if idx < n * n {
            return Ok(Self::DbIndirect((idx / n) as u32, (idx % n) as u32));
        }
        idx -= n * n;

        if idx < n * n * n {
            let lvl1_idx = idx / (n * n);
            let lvl2_idx = (idx / n) % n;
            let lvl3_idx = idx % n;
            return Ok(Self::TbIndirect(
                lvl1_idx as u32,
                lvl2_idx as u32,
                lvl3_idx as u32,
            ));
        }

        return_errno_with_msg!(FileTooBig, "the logical block is beyond every tier")
    }
}

/// Returns the number of data blocks reachable without the treble indirect tier.
pub(crate) fn growable_blocks(per_table: u32) -> u64 {
    let n = per_table as u64;
    DIRECT_CNT as u64 + n + n * n
}

/// Returns how many pointer-table blocks are needed to map `data_blocks` blocks.
pub(crate) fn meta_blocks_for(data_blocks: u32, per_table: u32) -> u32 {
    let n = per_table as u64;
    let mut rest = data_blocks as u64;
    if rest <= DIRECT_CNT as u64 {
        return 0;
    }
    rest -= DIRECT_CNT as u64;

    let mut meta: u64 = 1;
    if rest <= n {
        return meta as u32;
    }
    rest -= n;

    meta += 1 + rest.min(n * n).div_ceil(n);
    if rest <= n * n {
        return meta as u32;
    }
    rest -= n * n;

    meta += 1 + rest.div_ceil(n * n) + rest.div_ceil(n);
    meta as u32
}

/// Splits the `total` blocks charged to an inode into its data blocks,
/// assuming the rest are the pointer tables mapping them.
pub(crate) fn data_blocks_of(total: u32, per_table: u32) -> u32 {
    let mut data = total;
    while data > 0 && data as u64 + meta_blocks_for(data, per_table) as u64 > total as u64 {
        data -= 1;
    }
    data
}

/// Direct pointers to blocks.
pub const DIRECT_RANGE: core::ops::Range<usize> = 0..12;
/// The number of direct blocks.
pub const DIRECT_CNT: u32 = DIRECT_RANGE.end as u32;

/// Indirect pointer to blocks.
pub const INDIRECT: usize = DIRECT_RANGE.end;

/// Doubly indirect pointer to blocks.
pub const DB_INDIRECT: usize = INDIRECT + 1;

/// Treble indirect pointer to blocks.
pub const TB_INDIRECT: usize = DB_INDIRECT + 1;

/// The number of block pointers.
pub const BLOCK_PTR_CNT: usize = TB_INDIRECT + 1;

/// The size of of the block id.
pub const BID_SIZE: usize = core::mem::size_of::<u32>();

#[cfg(test)]
mod tests {
    use super::*;

    const N: u32 = 1024 / BID_SIZE as u32;

    #[test]
    fn locate_tier_boundaries() {
        assert_eq!(BidPath::locate(11, N).unwrap(), BidPath::Direct(11));
        assert_eq!(BidPath::locate(12, N).unwrap(), BidPath::Indirect(0));
        assert_eq!(BidPath::locate(12 + N - 1, N).unwrap(), BidPath::Indirect(N - 1));
        assert_eq!(BidPath::locate(12 + N, N).unwrap(), BidPath::DbIndirect(0, 0));
        assert_eq!(
            BidPath::locate(12 + N + N + 3, N).unwrap(),
            BidPath::DbIndirect(1, 3)
        );
        assert_eq!(
            BidPath::locate(12 + N + N * N, N).unwrap(),
            BidPath::TbIndirect(0, 0, 0)
        );
    }

    #[test]
    fn locate_past_treble_tier_fails() {
        // With 4-entry tables the treble tier ends at 12 + 4 + 16 + 64.
        let err = BidPath::locate(96, 4).unwrap_err();
        assert_eq!(err.errno(), FileTooBig);
        assert_eq!(BidPath::locate(95, 4).unwrap(), BidPath::TbIndirect(3, 3, 3));
    }

    #[test]
    fn metadata_blocks_follow_tiers() {
        assert_eq!(meta_blocks_for(12, N), 0);
        assert_eq!(meta_blocks_for(13, N), 1);
        assert_eq!(meta_blocks_for(12 + N, N), 1);
        // The first double-indirect block needs the top table and one second-level table.
        assert_eq!(meta_blocks_for(12 + N + 1, N), 3);
        assert_eq!(meta_blocks_for(12 + N + N, N), 3);
        assert_eq!(meta_blocks_for(12 + N + N + 1, N), 4);
        // A full double tier, then the treble top, one middle and one leaf table.
        assert_eq!(meta_blocks_for(12 + N + N * N, N), N + 2);
        assert_eq!(meta_blocks_for(12 + N + N * N + 1, N), N + 5);
    }

    #[test]
    fn data_blocks_recovered_from_total() {
        for data in [0, 5, 12, 13, 12 + N, 12 + N + 1, 12 + 3 * N + 7] {
            let total = data + meta_blocks_for(data, N);
            assert_eq!(data_blocks_of(total, N), data);
        }
    }
}
