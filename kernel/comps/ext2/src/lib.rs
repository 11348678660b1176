// SPDX-License-Identifier: MPL-2.0

//! A safe Rust Ext2 filesystem.
//!
//! The driver reads and writes revision 0 and revision 1 volumes through a
//! byte-addressable [`BlockDevice`]. Files, directories and symbolic links can be
//! created, read, written, linked and removed; block and inode allocation follow the
//! per-group bitmaps. [`format`] lays out a fresh volume.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[cfg(target_endian = "big")]
compile_error!("the on-disk structures are read in place and assume a little-endian target");

extern crate alloc;

pub use self::{
    block_cache::{BlockCache, PinnedBlock},
    block_device::{BlockDevice, MemDisk},
    block_ptr::BlockId,
    error::{Errno, Error},
    fs::Ext2,
    inode::{FilePerm, FileType, Permissions},
    mkfs::{FormatOptions, format},
    node::{Node, NodeKind},
    options::MountOptions,
    super_block::{
        ErrorsBehaviour, FeatureCompatSet, FeatureInCompatSet, FeatureRoCompatSet, FsState,
        MAGIC_NUM, OsId, RawSuperBlock, SuperBlock,
    },
};

mod allocator;
mod bitmap;
mod block_cache;
mod block_device;
mod block_group;
mod block_mapper;
mod block_ptr;
mod dir;
mod error;
mod fs;
mod inode;
mod inode_table;
mod mkfs;
mod node;
mod options;
mod prelude;
mod super_block;

#[cfg(test)]
mod test;
