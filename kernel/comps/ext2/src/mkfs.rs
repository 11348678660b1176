// SPDX-License-Identifier: MPL-2.0

use core::ops::Range;

use zerocopy::IntoBytes;

use crate::{
    bitmap::bit_position,
    block_device::BlockDevice,
    block_group::{DESCRIPTOR_SIZE, RawGroupDescriptor},
    block_ptr::BlockPtrs,
    dir::{DirEntryFileType, put_record, record_len},
    inode::{FilePerm, FileType, InodeDesc, ROOT_INO, RawInode},
    prelude::*,
    super_block::{
        DYNAMIC_REV, ErrorsBehaviour, FeatureCompatSet, FeatureInCompatSet, FeatureRoCompatSet,
        FsState, GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE, MAGIC_NUM, MAX_BLOCK_SIZE,
        MIN_BLOCK_SIZE, OsId, RawSuperBlock, SUPER_BLOCK_OFFSET,
    },
};

/// The largest group whose free counters fit in a descriptor.
const MAX_BLOCKS_PER_GROUP: u32 = (1 << 16) - 8;

/// One inode for this many bytes of group space, unless told otherwise.
const BYTES_PER_INODE: usize = 8192;

const MIN_INODES_PER_GROUP: usize = 16;

/// The options to format a device as Ext2.
#[derive(Clone, Debug)]
pub struct FormatOptions {
    block_size: usize,
    blocks_per_group: Option<u32>,
    inodes_per_group: Option<u32>,
    inode_size: u16,
    volume_label: String,
    uuid: [u8; 16],
    time: u32,
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the number of blocks in each group. It must be a multiple of 8.
    pub fn blocks_per_group(mut self, blocks_per_group: u32) -> Self {
        self.blocks_per_group = Some(blocks_per_group);
        self
    }

    /// Sets the number of inodes in each group.
    ///
    /// It is rounded up so that the inode table fills whole blocks.
    pub fn inodes_per_group(mut self, inodes_per_group: u32) -> Self {
        self.inodes_per_group = Some(inodes_per_group);
        self
    }

    pub fn inode_size(mut self, inode_size: u16) -> Self {
        self.inode_size = inode_size;
        self
    }

    /// Sets the volume name, at most 16 bytes.
    pub fn volume_label(mut self, label: &str) -> Self {
        self.volume_label = String::from(label);
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    /// Sets the time stamped on the new volume and its root directory.
    pub fn time(mut self, time: u32) -> Self {
        self.time = time;
        self
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: MIN_BLOCK_SIZE,
            blocks_per_group: None,
            inodes_per_group: None,
            inode_size: GOOD_OLD_INODE_SIZE as u16,
            volume_label: String::new(),
            uuid: [0; 16],
            time: 0,
        }
    }
}

/// The layout of a volume about to be formatted.
#[derive(Debug)]
struct Geometry {
    block_size: usize,
    inode_size: usize,
    total_blocks: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    groups_count: u32,
    gdt_blocks: u32,
    inode_table_blocks: u32,
}

impl Geometry {
    fn new(device_size: usize, options: &FormatOptions) -> Result<Self> {
        let block_size = options.block_size;
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return_errno_with_msg!(InvalidArgs, "unsupported block size");
        }
        let inode_size = options.inode_size as usize;
        if !inode_size.is_power_of_two()
            || inode_size < GOOD_OLD_INODE_SIZE
            || inode_size > block_size
        {
            return_errno_with_msg!(InvalidArgs, "unsupported inode size");
        }

        let bits_per_block = (block_size * 8) as u32;
        let first_data_block = (SUPER_BLOCK_OFFSET / block_size) as u32;
        let mut total_blocks = (device_size / block_size).min(u32::MAX as usize) as u32;
        if total_blocks <= first_data_block {
            return_errno_with_msg!(NoSpaceLeftOnDevice, "device too small");
        }

        let blocks_per_group = options
            .blocks_per_group
            .unwrap_or(bits_per_block.min(MAX_BLOCKS_PER_GROUP));
        if blocks_per_group == 0
            || blocks_per_group % 8 != 0
            || blocks_per_group > bits_per_block.min(MAX_BLOCKS_PER_GROUP)
        {
            return_errno_with_msg!(InvalidArgs, "invalid blocks per group");
        }

        let inodes_per_block = (block_size / inode_size) as u32;
        let inodes_per_group = match options.inodes_per_group {
            Some(inodes_per_group) => inodes_per_group,
            None => {
                let group_blocks = blocks_per_group.min(total_blocks - first_data_block) as usize;
                (group_blocks * block_size / BYTES_PER_INODE).max(MIN_INODES_PER_GROUP) as u32
            }
        }
        .next_multiple_of(inodes_per_block.max(8))
        .min(bits_per_block.min((1 << 16) - inodes_per_block));
        if inodes_per_group < GOOD_OLD_FIRST_INO {
            return_errno_with_msg!(InvalidArgs, "too few inodes per group");
        }
        let inode_table_blocks =
            (inodes_per_group as usize * inode_size).div_ceil(block_size) as u32;

        loop {
            let groups_count = (total_blocks - first_data_block).div_ceil(blocks_per_group);
            let gdt_blocks = (groups_count as usize * DESCRIPTOR_SIZE).div_ceil(block_size) as u32;
            let geometry = Self {
                block_size,
                inode_size,
                total_blocks,
                first_data_block,
                blocks_per_group,
                inodes_per_group,
                groups_count,
                gdt_blocks,
                inode_table_blocks,
            };

            // Every group needs room for its metadata and at least one data block,
            // which is the root directory in the first group.
            let last_group = groups_count - 1;
            if geometry.blocks_in_group(last_group) <= geometry.overhead() {
                if last_group == 0 {
                    return_errno_with_msg!(NoSpaceLeftOnDevice, "device too small");
                }
                total_blocks = geometry.group_first_block(last_group);
                continue;
            }

            if groups_count.checked_mul(inodes_per_group).is_none() {
                return_errno_with_msg!(InvalidArgs, "too many inodes");
            }
            return Ok(geometry);
        }
    }

    fn group_first_block(&self, idx: u32) -> u32 {
        self.first_data_block + idx * self.blocks_per_group
    }

    fn blocks_in_group(&self, idx: u32) -> u32 {
        (self.total_blocks - self.group_first_block(idx)).min(self.blocks_per_group)
    }

    /// Returns the blocks at the head of every group holding its metadata: the copy
    /// of the superblock, the copy of the descriptor table, the two bitmaps and the
    /// inode table.
    fn overhead(&self) -> u32 {
        1 + self.gdt_blocks + 2 + self.inode_table_blocks
    }

    fn offset_of(&self, bid: u32) -> usize {
        bid as usize * self.block_size
    }
}

/// Formats `device` as an empty Ext2 holding only the root directory.
///
/// The volume uses revision 1 with directory type tags. Every block group starts
/// with a copy of the superblock and of the descriptor table. A last group too small
/// to hold its own metadata is left out of the volume.
pub fn format(device: &dyn BlockDevice, options: &FormatOptions) -> Result<()> {
    let mut volume_name = [0u8; 16];
    let label = options.volume_label.as_bytes();
    if label.len() > volume_name.len() {
        return_errno_with_msg!(InvalidArgs, "volume label longer than 16 bytes");
    }
    volume_name[..label.len()].copy_from_slice(label);

    let geo = Geometry::new(device.size(), options)?;
    let block_size = geo.block_size;
    let bits_per_block = (block_size * 8) as u32;
    let overhead = geo.overhead();
    let root_block = geo.first_data_block + overhead;
    let reserved_inodes = GOOD_OLD_FIRST_INO - 1;

    let descriptors: Vec<RawGroupDescriptor> = (0..geo.groups_count)
        .map(|idx| {
            let block_bitmap = geo.group_first_block(idx) + 1 + geo.gdt_blocks;
            let mut descriptor = RawGroupDescriptor::new(
                BlockId::new(block_bitmap),
                BlockId::new(block_bitmap + 1),
                BlockId::new(block_bitmap + 2),
            );
            let mut free_blocks = geo.blocks_in_group(idx) - overhead;
            let mut free_inodes = geo.inodes_per_group;
            if idx == 0 {
                free_blocks -= 1;
                free_inodes -= reserved_inodes;
                descriptor.dirs_count = 1;
            }
            descriptor.free_blocks_count = free_blocks as u16;
            descriptor.free_inodes_count = free_inodes as u16;
            descriptor
        })
        .collect();

    let mut descriptor_table = vec![0u8; geo.gdt_blocks as usize * block_size];
    for (chunk, descriptor) in descriptor_table
        .chunks_exact_mut(DESCRIPTOR_SIZE)
        .zip(&descriptors)
    {
        chunk.copy_from_slice(descriptor.as_bytes());
    }

    let mut sb = RawSuperBlock::zeroed();
    sb.inodes_count = geo.groups_count * geo.inodes_per_group;
    sb.blocks_count = geo.total_blocks;
    sb.free_blocks_count = descriptors.iter().map(|d| d.free_blocks_count as u32).sum();
    sb.free_inodes_count = descriptors.iter().map(|d| d.free_inodes_count as u32).sum();
    sb.first_data_block = geo.first_data_block;
    sb.log_block_size = (block_size / MIN_BLOCK_SIZE).trailing_zeros();
    sb.log_frag_size = sb.log_block_size;
    sb.blocks_per_group = geo.blocks_per_group;
    sb.frags_per_group = geo.blocks_per_group;
    sb.inodes_per_group = geo.inodes_per_group;
    sb.wtime = options.time;
    sb.max_mnt_count = u16::MAX;
    sb.magic = MAGIC_NUM;
    sb.state = FsState::Valid as u16;
    sb.errors_behaviour = ErrorsBehaviour::Continue as u16;
    sb.last_check_time = options.time;
    sb.os_id = OsId::Linux as u32;
    sb.rev_level = DYNAMIC_REV;
    sb.first_ino = GOOD_OLD_FIRST_INO;
    sb.inode_size = options.inode_size;
    sb.feature_compat = FeatureCompatSet::empty().bits();
    sb.feature_incompat = FeatureInCompatSet::FILETYPE.bits();
    sb.feature_ro_compat = FeatureRoCompatSet::empty().bits();
    sb.uuid = options.uuid;
    sb.volume_name = volume_name;

    for idx in 0..geo.groups_count {
        let first = geo.group_first_block(idx);
        // The boot sector in front of the primary superblock is left alone.
        let (sb_offset, meta_start) = if idx == 0 {
            (SUPER_BLOCK_OFFSET, SUPER_BLOCK_OFFSET)
        } else {
            (geo.offset_of(first), geo.offset_of(first))
        };
        zero_range(device, meta_start..geo.offset_of(first + overhead))?;

        sb.block_group_idx = idx as u16;
        device.write_at(sb_offset, sb.as_bytes())?;
        device.write_at(geo.offset_of(first + 1), &descriptor_table)?;

        let descriptor = &descriptors[idx as usize];
        let mut block_bitmap = vec![0u8; block_size];
        let used_blocks = overhead + (idx == 0) as u32;
        mark_used(&mut block_bitmap, 0..used_blocks);
        mark_used(&mut block_bitmap, geo.blocks_in_group(idx)..bits_per_block);
        device.write_at(geo.offset_of(descriptor.block_bitmap), &block_bitmap)?;

        let mut inode_bitmap = vec![0u8; block_size];
        if idx == 0 {
            mark_used(&mut inode_bitmap, 0..reserved_inodes);
        }
        mark_used(&mut inode_bitmap, geo.inodes_per_group..bits_per_block);
        device.write_at(geo.offset_of(descriptor.inode_bitmap), &inode_bitmap)?;
    }

    let mut root_dir = vec![0u8; block_size];
    put_record(&mut root_dir, 0, record_len(1), ROOT_INO, b".", DirEntryFileType::Dir, true);
    put_record(
        &mut root_dir,
        record_len(1),
        block_size - record_len(1),
        ROOT_INO,
        b"..",
        DirEntryFileType::Dir,
        true,
    );
    device.write_at(geo.offset_of(root_block), &root_dir)?;

    let mut desc = InodeDesc::new(
        FileType::Dir,
        FilePerm::from_bits_truncate(0o755),
        0,
        0,
        options.time,
    );
    desc.hard_links = 2;
    desc.size = block_size;
    let mut ptrs = BlockPtrs::default();
    ptrs.set_direct(0, BlockId::new(root_block));
    let root = RawInode::new(&desc, ptrs, (block_size / 512) as u32);
    let root_offset =
        geo.offset_of(descriptors[0].inode_table) + (ROOT_INO as usize - 1) * geo.inode_size;
    device.write_at(root_offset, root.as_bytes())?;

    device.flush()?;
    info!(
        "ext2: formatted {} blocks of {} bytes in {} groups with {} inodes",
        geo.total_blocks,
        block_size,
        geo.groups_count,
        sb.inodes_count
    );
    Ok(())
}

fn mark_used(bitmap: &mut [u8], ids: Range<u32>) {
    for id in ids {
        let (byte, mask) = bit_position(id as usize);
        bitmap[byte] |= mask;
    }
}

fn zero_range(device: &dyn BlockDevice, range: Range<usize>) -> Result<()> {
    const CHUNK: usize = 64 * 1024;
    let zeros = vec![0u8; CHUNK.min(range.len())];
    let mut pos = range.start;
    while pos < range.end {
        let len = CHUNK.min(range.end - pos);
        device.write_at(pos, &zeros[..len])?;
        pos += len;
    }
    Ok(())
}
