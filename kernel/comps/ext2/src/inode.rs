// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{block_ptr::BlockPtrs, prelude::*};

/// The root inode number.
pub const ROOT_INO: u32 = 2;

/// Max length of file name.
pub const MAX_FNAME_LEN: usize = 255;

/// Symlink targets shorter than this are kept inside the block pointers.
pub const FAST_SYMLINK_MAX_LEN: usize = 60;

/// The in-memory metadata of an inode.
///
/// It represents a file, directory, symbolic link, etc. It contains all of the metadata
/// about an object except its name and its block pointers, which belong to the
/// `BlockMapper` of the object.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InodeDesc {
    /// Type.
    pub type_: FileType,
    /// Permission.
    pub perm: FilePerm,
    /// User Id.
    pub uid: u32,
    /// Group Id.
    pub gid: u32,
    /// Size in bytes.
    pub size: usize,
    /// Access time.
    pub atime: u32,
    /// Creation time.
    pub ctime: u32,
    /// Modification time.
    pub mtime: u32,
    /// Deletion time.
    pub dtime: u32,
    /// Hard links count.
    pub hard_links: u16,
    /// File flags.
    pub flags: FileFlags,
    /// File version (for NFS).
    pub generation: u32,
    /// File ACL block, kept as found.
    pub file_acl: u32,
}

impl TryFrom<&RawInode> for InodeDesc {
    type Error = Error;

    fn try_from(inode: &RawInode) -> Result<Self> {
        let file_type = FileType::from_raw_mode(inode.mode)?;
        Ok(Self {
            type_: file_type,
            perm: FilePerm::from_raw_mode(inode.mode),
            uid: ((inode.os_dependent_2.uid_high as u32) << 16) | inode.uid as u32,
            gid: ((inode.os_dependent_2.gid_high as u32) << 16) | inode.gid as u32,
            size: if file_type == FileType::File {
                ((inode.size_high as usize) << 32) | inode.size_low as usize
            } else {
                inode.size_low as usize
            },
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
            dtime: inode.dtime,
            hard_links: inode.hard_links,
            flags: FileFlags::from_bits(inode.flags)
                .ok_or(Error::with_msg(CorruptEntry, "invalid file flags"))?,
            generation: inode.generation,
            file_acl: inode.file_acl,
        })
    }
}

impl InodeDesc {
    /// Creates the metadata of a new inode stamped with `now`.
    pub fn new(type_: FileType, perm: FilePerm, uid: u32, gid: u32, now: u32) -> Self {
        Self {
            type_,
            perm,
            uid,
            gid,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: 0,
            hard_links: 0,
            flags: FileFlags::empty(),
            generation: 0,
            file_acl: 0,
        }
    }
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    /// FIFO special file
    Fifo = 0o010000,
    /// Character device
    Char = 0o020000,
    /// Directory
    Dir = 0o040000,
    /// Block device
    Block = 0o060000,
    /// Regular file
    File = 0o100000,
    /// Symbolic link
    Symlink = 0o120000,
    /// Socket
    Socket = 0o140000,
}

impl TryFrom<u16> for FileType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        let type_ = match value {
            0o010000 => Self::Fifo,
            0o020000 => Self::Char,
            0o040000 => Self::Dir,
            0o060000 => Self::Block,
            0o100000 => Self::File,
            0o120000 => Self::Symlink,
            0o140000 => Self::Socket,
            _ => return_errno_with_msg!(CorruptEntry, "invalid file type"),
        };
        Ok(type_)
    }
}

impl FileType {
    pub fn from_raw_mode(mode: u16) -> Result<Self> {
        const TYPE_MASK: u16 = 0o170000;
        Self::try_from(mode & TYPE_MASK)
    }
}

bitflags! {
    pub struct FilePerm: u16 {
        /// set-user-ID
        const S_ISUID = 0o4000;
        /// set-group-ID
        const S_ISGID = 0o2000;
        /// sticky bit
        const S_ISVTX = 0o1000;
        /// read by owner
        const S_IRUSR = 0o0400;
        /// write by owner
        const S_IWUSR = 0o0200;
        /// execute/search by owner
        const S_IXUSR = 0o0100;
        /// read by group
        const S_IRGRP = 0o0040;
        /// write by group
        const S_IWGRP = 0o0020;
        /// execute/search by group
        const S_IXGRP = 0o0010;
        /// read by others
        const S_IROTH = 0o0004;
        /// write by others
        const S_IWOTH = 0o0002;
        /// execute/search by others
        const S_IXOTH = 0o0001;
    }
}

impl FilePerm {
    /// Extracts the permission bits of a raw mode. The twelve low bits are all defined.
    pub fn from_raw_mode(mode: u16) -> Self {
        const PERM_MASK: u16 = 0o7777;
        Self::from_bits_truncate(mode & PERM_MASK)
    }
}

bitflags! {
    /// The permission bits in the representation of the generic filesystem layer.
    ///
    /// Owner bits come first, then group and other, each as read, write, execute.
    pub struct Permissions: u32 {
        const USER_READ = 0o001;
        const USER_WRITE = 0o002;
        const USER_EXEC = 0o004;
        const GROUP_READ = 0o010;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC = 0o040;
        const OTHER_READ = 0o100;
        const OTHER_WRITE = 0o200;
        const OTHER_EXEC = 0o400;
    }
}

/// The fixed mapping between on-disk mode bits and generic permissions.
const PERMISSION_TABLE: [(FilePerm, Permissions); 9] = [
    (FilePerm::S_IRUSR, Permissions::USER_READ),
    (FilePerm::S_IWUSR, Permissions::USER_WRITE),
    (FilePerm::S_IXUSR, Permissions::USER_EXEC),
    (FilePerm::S_IRGRP, Permissions::GROUP_READ),
    (FilePerm::S_IWGRP, Permissions::GROUP_WRITE),
    (FilePerm::S_IXGRP, Permissions::GROUP_EXEC),
    (FilePerm::S_IROTH, Permissions::OTHER_READ),
    (FilePerm::S_IWOTH, Permissions::OTHER_WRITE),
    (FilePerm::S_IXOTH, Permissions::OTHER_EXEC),
];

impl From<FilePerm> for Permissions {
    fn from(perm: FilePerm) -> Self {
        PERMISSION_TABLE
            .iter()
            .filter(|(mode_bit, _)| perm.contains(*mode_bit))
            .fold(Permissions::empty(), |acc, (_, bit)| acc | *bit)
    }
}

impl From<Permissions> for FilePerm {
    fn from(perms: Permissions) -> Self {
        PERMISSION_TABLE
            .iter()
            .filter(|(_, bit)| perms.contains(*bit))
            .fold(FilePerm::empty(), |acc, (mode_bit, _)| acc | *mode_bit)
    }
}

bitflags! {
    pub struct FileFlags: u32 {
        /// Secure deletion.
        const SECURE_DEL = 1 << 0;
        /// Undelete.
        const UNDELETE = 1 << 1;
        /// Compress file.
        const COMPRESS = 1 << 2;
        /// Synchronous updates.
        const SYNC_UPDATE = 1 << 3;
        /// Immutable file.
        const IMMUTABLE = 1 << 4;
        /// Append only.
        const APPEND_ONLY = 1 << 5;
        /// Do not dump file.
        const NO_DUMP = 1 << 6;
        /// Do not update atime.
        const NO_ATIME = 1 << 7;
        /// Dirty.
        const DIRTY = 1 << 8;
        /// One or more compressed clusters.
        const COMPRESS_BLK = 1 << 9;
        /// Do not compress.
        const NO_COMPRESS = 1 << 10;
        /// Encrypted file.
        const ENCRYPT = 1 << 11;
        /// Hash-indexed directory.
        const INDEX_DIR = 1 << 12;
        /// AFS directory.
        const IMAGIC = 1 << 13;
        /// Journal file data.
        const JOURNAL_DATA = 1 << 14;
        /// File tail should not be merged.
        const NO_TAIL = 1 << 15;
        /// Dirsync behaviour (directories only).
        const DIR_SYNC = 1 << 16;
        /// Top of directory hierarchies.
        const TOP_DIR = 1 << 17;
        /// Reserved for ext2 lib.
        const RESERVED = 1 << 31;
    }
}

pub(crate) const RAW_INODE_SIZE: usize = core::mem::size_of::<RawInode>();

const_assert_eq!(RAW_INODE_SIZE, 128);

/// The raw inode on device.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct RawInode {
    /// File mode (type and permissions).
    pub mode: u16,
    /// Low 16 bits of User Id.
    pub uid: u16,
    /// Lower 32 bits of size in bytes.
    pub size_low: u32,
    /// Access time.
    pub atime: u32,
    /// Creation time.
    pub ctime: u32,
    /// Modification time.
    pub mtime: u32,
    /// Deletion time.
    pub dtime: u32,
    /// Low 16 bits of Group Id.
    pub gid: u16,
    pub hard_links: u16,
    /// The number of 512-byte sectors charged to the inode, pointer tables included.
    pub blocks_count: u32,
    /// File flags.
    pub flags: u32,
    /// OS dependent Value 1.
    reserved1: u32,
    pub block_ptrs: BlockPtrs,
    /// File version (for NFS).
    pub generation: u32,
    /// In revision 0, this field is reserved.
    /// In revision 1, File ACL.
    pub file_acl: u32,
    /// In revision 0, this field is reserved.
    /// In revision 1, Upper 32 bits of file size (if feature bit set)
    /// if it's a file, Directory ACL if it's a directory.
    pub size_high: u32,
    /// Fragment address.
    pub frag_addr: u32,
    /// OS dependent 2.
    pub os_dependent_2: Osd2,
}

impl RawInode {
    /// Assembles the on-disk record from the metadata, the block pointers and the
    /// number of 512-byte sectors in use.
    pub fn new(desc: &InodeDesc, block_ptrs: BlockPtrs, sectors: u32) -> Self {
        Self {
            mode: desc.type_ as u16 | desc.perm.bits(),
            uid: desc.uid as u16,
            size_low: desc.size as u32,
            atime: desc.atime,
            ctime: desc.ctime,
            mtime: desc.mtime,
            dtime: desc.dtime,
            gid: desc.gid as u16,
            hard_links: desc.hard_links,
            blocks_count: sectors,
            flags: desc.flags.bits(),
            block_ptrs,
            generation: desc.generation,
            file_acl: desc.file_acl,
            size_high: if desc.type_ == FileType::File {
                ((desc.size as u64) >> 32) as u32
            } else {
                0
            },
            os_dependent_2: Osd2 {
                uid_high: (desc.uid >> 16) as u16,
                gid_high: (desc.gid >> 16) as u16,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Returns the record of a deleted inode: only the deletion time survives.
    pub fn deleted(dtime: u32) -> Self {
        Self {
            dtime,
            ..Default::default()
        }
    }
}

/// OS dependent Value 2
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct Osd2 {
    /// Fragment number.
    pub frag_num: u8,
    /// Fragment size.
    pub frag_size: u8,
    pad1: u16,
    /// High 16 bits of User Id.
    pub uid_high: u16,
    /// High 16 bits of Group Id.
    pub gid_high: u16,
    reserved2: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_inode_keeps_high_id_bits() {
        let perm = FilePerm::from_bits_truncate(0o644);
        let mut desc = InodeDesc::new(FileType::File, perm, 70000, 5, 9);
        desc.size = 4096;
        desc.hard_links = 1;
        let raw = RawInode::new(&desc, BlockPtrs::default(), 8);
        assert_eq!(raw.mode, 0o100644);
        assert_eq!(raw.uid, 70000u32 as u16);
        assert_eq!(raw.os_dependent_2.uid_high, 1);

        let parsed = InodeDesc::try_from(&raw).unwrap();
        assert_eq!(parsed.uid, 70000);
        assert_eq!(parsed.gid, 5);
        assert_eq!(parsed.size, 4096);
        assert_eq!(parsed.type_, FileType::File);
        assert_eq!(parsed.mtime, 9);
    }

    #[test]
    fn unknown_type_nibble_is_corrupt() {
        let raw = RawInode {
            mode: 0o030644,
            ..Default::default()
        };
        assert_eq!(InodeDesc::try_from(&raw).unwrap_err().errno(), CorruptEntry);
    }

    #[test]
    fn permissions_follow_translation_table() {
        let perm = FilePerm::from_bits_truncate(0o751);
        let generic = Permissions::from(perm);
        assert_eq!(
            generic,
            Permissions::USER_READ
                | Permissions::USER_WRITE
                | Permissions::USER_EXEC
                | Permissions::GROUP_READ
                | Permissions::GROUP_EXEC
                | Permissions::OTHER_EXEC
        );
        assert_eq!(generic.bits(), 0o457);
        assert_eq!(FilePerm::from(generic), perm);
    }

    #[test]
    fn special_bits_are_not_translated() {
        let perm = FilePerm::S_ISUID | FilePerm::S_IRUSR;
        assert_eq!(Permissions::from(perm), Permissions::USER_READ);
    }
}
