// SPDX-License-Identifier: MPL-2.0

use crate::inode::FilePerm;

/// The options to mount an Ext2.
#[derive(Clone, Debug)]
pub struct MountOptions {
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) file_perm: FilePerm,
    pub(crate) dir_perm: FilePerm,
    pub(crate) symlink_perm: FilePerm,
    pub(crate) clock: fn() -> u32,
    pub(crate) cache_capacity: usize,
}

impl MountOptions {
    /// The number of unpinned blocks kept in memory by default.
    pub const DEFAULT_CACHE_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the owner of newly created nodes.
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Sets the group of newly created nodes.
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    /// Sets the permission of new files created without an explicit one.
    pub fn file_perm(mut self, perm: FilePerm) -> Self {
        self.file_perm = perm;
        self
    }

    /// Sets the permission of new directories created without an explicit one.
    pub fn dir_perm(mut self, perm: FilePerm) -> Self {
        self.dir_perm = perm;
        self
    }

    /// Sets the permission of new symbolic links.
    pub fn symlink_perm(mut self, perm: FilePerm) -> Self {
        self.symlink_perm = perm;
        self
    }

    /// Sets the clock stamping access, change, modification and deletion times.
    ///
    /// It returns seconds since the UNIX epoch.
    pub fn clock(mut self, clock: fn() -> u32) -> Self {
        self.clock = clock;
        self
    }

    /// Sets how many unpinned blocks the block cache keeps resident.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            file_perm: FilePerm::from_bits_truncate(0o644),
            dir_perm: FilePerm::from_bits_truncate(0o755),
            symlink_perm: FilePerm::from_bits_truncate(0o777),
            clock: || 0,
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
        }
    }
}
