// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::prelude::*;

/// The magic number of Ext2.
pub const MAGIC_NUM: u16 = 0xef53;

/// The main superblock is located at byte 1024 from the beginning of the device.
pub const SUPER_BLOCK_OFFSET: usize = 1024;

const SUPER_BLOCK_SIZE: usize = 1024;

/// The smallest and largest supported block sizes.
pub const MIN_BLOCK_SIZE: usize = 1024;
pub const MAX_BLOCK_SIZE: usize = 32 * 1024;

/// The size of an inode record on revision 0 filesystems.
pub const GOOD_OLD_INODE_SIZE: usize = 128;
/// The first non-reserved inode on revision 0 filesystems.
pub const GOOD_OLD_FIRST_INO: u32 = 11;

/// The revision levels.
pub const GOOD_OLD_REV: u32 = 0;
pub const DYNAMIC_REV: u32 = 1;

/// The in-memory superblock.
///
/// It contains all information about the layout of the Ext2. Derived values are
/// computed and checked once at mount time; the raw record is kept so that fields
/// the driver does not interpret are written back untouched.
#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    raw: RawSuperBlock,
    block_size: usize,
    inode_size: usize,
    first_ino: u32,
    groups_count: u32,
}

impl TryFrom<RawSuperBlock> for SuperBlock {
    type Error = Error;

    fn try_from(sb: RawSuperBlock) -> Result<Self> {
        if sb.magic != MAGIC_NUM {
            return_errno_with_msg!(BadMagic, "bad ext2 magic number");
        }
        if sb.rev_level > DYNAMIC_REV {
            return_errno_with_msg!(BadRevision, "unknown ext2 revision");
        }

        let block_size = match 1024usize.checked_shl(sb.log_block_size) {
            Some(size) if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) => size,
            _ => return_errno_with_msg!(Unsupported, "unsupported block size"),
        };

        let (inode_size, first_ino) = if sb.rev_level == GOOD_OLD_REV {
            (GOOD_OLD_INODE_SIZE, GOOD_OLD_FIRST_INO)
        } else {
            (sb.inode_size as usize, sb.first_ino)
        };
        if inode_size < GOOD_OLD_INODE_SIZE || inode_size > block_size {
            return_errno_with_msg!(CorruptEntry, "invalid inode size");
        }

        let bits_per_block = (block_size * 8) as u32;
        if sb.blocks_per_group == 0 || sb.blocks_per_group > bits_per_block {
            return_errno_with_msg!(CorruptEntry, "invalid blocks per group");
        }
        if sb.inodes_per_group == 0 || sb.inodes_per_group > bits_per_block {
            return_errno_with_msg!(CorruptEntry, "invalid inodes per group");
        }
        if sb.first_data_block >= sb.blocks_count {
            return_errno_with_msg!(CorruptEntry, "invalid first data block");
        }

        if sb.rev_level >= DYNAMIC_REV {
            let unknown = sb.feature_incompat & !FeatureInCompatSet::SUPPORTED.bits();
            if unknown != 0 {
                return_errno_with_msg!(Unsupported, "unsupported incompatible features");
            }
        }

        if sb.state != FsState::Valid as u16 {
            warn!("ext2: the filesystem was not cleanly unmounted");
        }

        let groups_count = (sb.blocks_count - sb.first_data_block).div_ceil(sb.blocks_per_group);
        Ok(Self {
            raw: sb,
            block_size,
            inode_size,
            first_ino,
            groups_count,
        })
    }
}

impl SuperBlock {
    /// Returns the raw record holding the current counters.
    pub fn to_raw(&self) -> RawSuperBlock {
        self.raw
    }

    /// Returns the size of block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the size of inode.
    pub fn inode_size(&self) -> usize {
        self.inode_size
    }

    /// Returns the number of the first non-reserved inode.
    pub fn first_ino(&self) -> u32 {
        self.first_ino
    }

    /// Returns the revision level.
    pub fn rev_level(&self) -> u32 {
        self.raw.rev_level
    }

    /// Returns the total number of blocks.
    pub fn total_blocks(&self) -> u32 {
        self.raw.blocks_count
    }

    /// Returns the total number of inodes.
    pub fn total_inodes(&self) -> u32 {
        self.raw.inodes_count
    }

    /// Returns the number of free blocks.
    pub fn free_blocks_count(&self) -> u32 {
        self.raw.free_blocks_count
    }

    /// Returns the number of free inodes.
    pub fn free_inodes_count(&self) -> u32 {
        self.raw.free_inodes_count
    }

    /// Returns the first block containing data, which is 1 for 1 KiB blocks and 0 otherwise.
    pub fn first_data_block(&self) -> u32 {
        self.raw.first_data_block
    }

    /// Returns the number of blocks in each block group.
    pub fn blocks_per_group(&self) -> u32 {
        self.raw.blocks_per_group
    }

    /// Returns the number of inodes in each block group.
    pub fn inodes_per_group(&self) -> u32 {
        self.raw.inodes_per_group
    }

    /// Returns the number of block groups.
    pub fn groups_count(&self) -> u32 {
        self.groups_count
    }

    /// Returns the number of blocks that belong to the block group `idx`.
    ///
    /// Only the last group may be shorter than `blocks_per_group`.
    pub fn blocks_in_group(&self, idx: u32) -> u32 {
        let start = self.first_data_block() + idx * self.blocks_per_group();
        (self.total_blocks() - start).min(self.blocks_per_group())
    }

    /// Returns the first block of the block group `idx`.
    pub fn group_first_block(&self, idx: u32) -> BlockId {
        BlockId::new(self.first_data_block() + idx * self.blocks_per_group())
    }

    /// Returns the starting block id of the group descriptor table.
    pub fn group_descriptors_bid(&self) -> BlockId {
        BlockId::new(self.first_data_block() + 1)
    }

    /// Returns the required features.
    pub fn feature_incompat(&self) -> FeatureInCompatSet {
        FeatureInCompatSet::from_bits_truncate(self.raw.feature_incompat)
    }

    /// Returns whether directory records carry a file type tag.
    pub fn has_filetype(&self) -> bool {
        self.rev_level() >= DYNAMIC_REV
            && self
                .feature_incompat()
                .contains(FeatureInCompatSet::FILETYPE)
    }

    /// Returns the 128-bit uuid of the volume.
    pub fn uuid(&self) -> [u8; 16] {
        self.raw.uuid
    }

    /// Returns the volume name, or a name derived from the uuid if the volume has none.
    pub fn volume_label(&self) -> String {
        let name = &self.raw.volume_name;
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        if self.rev_level() >= DYNAMIC_REV && len > 0 {
            return String::from_utf8_lossy(&name[..len]).into_owned();
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&self.raw.uuid[..8]);
        format!("no-volume-label@{:x}", u64::from_le_bytes(id))
    }

    pub fn inc_free_blocks(&mut self) {
        self.raw.free_blocks_count += 1;
    }

    pub fn dec_free_blocks(&mut self) {
        debug_assert!(self.raw.free_blocks_count > 0);
        self.raw.free_blocks_count = self.raw.free_blocks_count.saturating_sub(1);
    }

    pub fn inc_free_inodes(&mut self) {
        self.raw.free_inodes_count += 1;
    }

    pub fn dec_free_inodes(&mut self) {
        debug_assert!(self.raw.free_inodes_count > 0);
        self.raw.free_inodes_count = self.raw.free_inodes_count.saturating_sub(1);
    }

    /// Stamps the mount time and counts one more mount.
    pub fn record_mount(&mut self, now: u32) {
        self.raw.mtime = now;
        self.raw.mnt_count = self.raw.mnt_count.wrapping_add(1);
    }

    /// Writes the main superblock through the cache.
    pub fn write_through(&self, cache: &BlockCache) -> Result<()> {
        let bs = cache.block_size();
        let bid = BlockId::new((SUPER_BLOCK_OFFSET / bs) as u32);
        cache.write_at(bid, SUPER_BLOCK_OFFSET % bs, self.raw.as_bytes())
    }
}

/// Reads the raw superblock from the device behind `cache`'s back.
///
/// The block size is unknown until the superblock is parsed, so this read does not go
/// through the block cache.
pub(crate) fn read_raw_super_block(
    device: &dyn crate::block_device::BlockDevice,
) -> Result<RawSuperBlock> {
    let mut buf = [0u8; SUPER_BLOCK_SIZE];
    device.read_at(SUPER_BLOCK_OFFSET, &mut buf)?;
    RawSuperBlock::read_from_bytes(&buf)
        .map_err(|_| Error::with_msg(CorruptEntry, "short superblock"))
}

bitflags! {
    /// Optional features which do not affect the on-disk layout.
    pub struct FeatureCompatSet: u32 {
        /// Preallocate some number of blocks to a directory when creating a new one.
        const DIR_PREALLOC = 1 << 0;
        /// AFS server inodes exist.
        const IMAGIC_INODES = 1 << 1;
        /// File system has a journal.
        const HAS_JOURNAL = 1 << 2;
        /// Inodes have extended attributes.
        const EXT_ATTR = 1 << 3;
        /// File system can resize itself for larger partitions.
        const RESIZE_INO = 1 << 4;
        /// Directories use hash index.
        const DIR_INDEX = 1 << 5;
    }
}

bitflags! {
    /// Required features. A driver must refuse to mount if it does not know one of them.
    pub struct FeatureInCompatSet: u32 {
        /// Compression is used.
        const COMPRESSION = 1 << 0;
        /// Directory entries contain a type field.
        const FILETYPE = 1 << 1;
        /// File system needs to replay its journal.
        const RECOVER = 1 << 2;
        /// File system uses a journal device.
        const JOURNAL_DEV = 1 << 3;
        /// Metablock block group.
        const META_BG = 1 << 4;

        /// The features this driver understands.
        const SUPPORTED = Self::FILETYPE.bits;
    }
}

bitflags! {
    /// Features that, when unknown, only allow the volume to be mounted read-only.
    pub struct FeatureRoCompatSet: u32 {
        /// Sparse superblocks and group descriptor tables.
        const SPARSE_SUPER = 1 << 0;
        /// File system uses a 64-bit file size.
        const LARGE_FILE = 1 << 1;
        /// Directory contents are stored in the form of a Binary Tree.
        const BTREE_DIR = 1 << 2;
    }
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsState {
    /// Unmounted cleanly
    Valid = 1,
    /// Errors detected
    Err = 2,
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorsBehaviour {
    /// Continue execution
    Continue = 1,
    /// Remount fs read-only
    RemountReadonly = 2,
    /// Should panic
    Panic = 3,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OsId {
    Linux = 0,
    Hurd = 1,
    Masix = 2,
    FreeBSD = 3,
    Lites = 4,
}

const_assert_eq!(core::mem::size_of::<RawSuperBlock>(), SUPER_BLOCK_SIZE);

/// The raw superblock, it must be exactly 1024 bytes in length.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawSuperBlock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    /// The number to left-shift 1024 to obtain the block size.
    pub log_block_size: u32,
    /// The number to left-shift 1024 to obtain the fragment size.
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    /// Mount time.
    pub mtime: u32,
    /// Write time.
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors_behaviour: u16,
    pub min_rev_level: u16,
    /// Time of last check.
    pub last_check_time: u32,
    pub check_interval: u32,
    pub os_id: u32,
    pub rev_level: u32,
    /// Default user id for reserved blocks.
    pub def_resuid: u16,
    /// Default group id for reserved blocks.
    pub def_resgid: u16,
    //
    // These fields are valid for DYNAMIC_REV superblocks only.
    //
    pub first_ino: u32,
    pub inode_size: u16,
    /// Block group that this superblock is part of.
    pub block_group_idx: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted_dir: [u8; 64],
    pub algorithm_usage_bitmap: u32,
    pub prealloc_file_blocks: u8,
    pub prealloc_dir_blocks: u8,
    padding1: u16,
    reserved: [u8; 816],
}

impl RawSuperBlock {
    /// Returns an all-zero record.
    pub fn zeroed() -> Self {
        <Self as zerocopy::FromZeros>::new_zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_super_block() -> RawSuperBlock {
        let mut sb = RawSuperBlock::zeroed();
        sb.magic = MAGIC_NUM;
        sb.rev_level = DYNAMIC_REV;
        sb.state = FsState::Valid as u16;
        sb.blocks_count = 8193;
        sb.inodes_count = 2048;
        sb.first_data_block = 1;
        sb.blocks_per_group = 8192;
        sb.inodes_per_group = 1024;
        sb.first_ino = 11;
        sb.inode_size = 128;
        sb.feature_incompat = FeatureInCompatSet::FILETYPE.bits();
        sb
    }

    #[test]
    fn geometry_is_derived() {
        let sb = SuperBlock::try_from(raw_super_block()).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.groups_count(), 1);
        assert_eq!(sb.blocks_in_group(0), 8192);
        assert_eq!(sb.group_descriptors_bid(), BlockId::new(2));
        assert!(sb.has_filetype());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut raw = raw_super_block();
        raw.magic = 0x1234;
        assert_eq!(SuperBlock::try_from(raw).unwrap_err().errno(), BadMagic);

        let mut raw = raw_super_block();
        raw.rev_level = 2;
        assert_eq!(SuperBlock::try_from(raw).unwrap_err().errno(), BadRevision);
    }

    #[test]
    fn compression_is_unsupported() {
        let mut raw = raw_super_block();
        raw.feature_incompat |= FeatureInCompatSet::COMPRESSION.bits();
        assert_eq!(SuperBlock::try_from(raw).unwrap_err().errno(), Unsupported);
    }

    #[test]
    fn old_revision_uses_fixed_inode_layout() {
        let mut raw = raw_super_block();
        raw.rev_level = GOOD_OLD_REV;
        raw.inode_size = 0;
        raw.first_ino = 0;
        let sb = SuperBlock::try_from(raw).unwrap();
        assert_eq!(sb.inode_size(), GOOD_OLD_INODE_SIZE);
        assert_eq!(sb.first_ino(), GOOD_OLD_FIRST_INO);
        assert!(!sb.has_filetype());
    }

    #[test]
    fn volume_label_falls_back_to_uuid() {
        let mut raw = raw_super_block();
        raw.volume_name[..4].copy_from_slice(b"data");
        assert_eq!(SuperBlock::try_from(raw).unwrap().volume_label(), "data");

        raw.volume_name = [0; 16];
        raw.uuid[0] = 0xab;
        assert_eq!(
            SuperBlock::try_from(raw).unwrap().volume_label(),
            "no-volume-label@ab"
        );
    }
}
