// SPDX-License-Identifier: MPL-2.0

use crate::{
    block_mapper::BlockMapper,
    dir::DirectoryEntryStore,
    fs::{Ext2, FsCtx},
    inode::{FilePerm, FileType, InodeDesc, Permissions},
    prelude::*,
};

/// The kinds of node the driver hands out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

impl TryFrom<FileType> for NodeKind {
    type Error = Error;

    fn try_from(file_type: FileType) -> Result<Self> {
        match file_type {
            FileType::File => Ok(Self::File),
            FileType::Dir => Ok(Self::Directory),
            FileType::Symlink => Ok(Self::Symlink),
            _ => return_errno_with_msg!(Unsupported, "special files are not supported"),
        }
    }
}

/// The in-memory state of one inode: its metadata, its block chain and, for a
/// directory, its entries.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub desc: InodeDesc,
    pub mapper: BlockMapper,
    pub entries: Option<DirectoryEntryStore>,
}

impl NodeState {
    /// Creates the state of a freshly allocated inode.
    pub fn new(ino: u32, desc: InodeDesc, block_size: usize, filetype: bool) -> Self {
        let entries = (desc.type_ == FileType::Dir).then(|| DirectoryEntryStore::new(filetype));
        Self {
            desc,
            mapper: BlockMapper::new(ino, block_size),
            entries,
        }
    }

    /// Loads the state of the inode `ino` from its on-disk record.
    pub fn load(ctx: &mut FsCtx<'_>, ino: u32, filetype: bool) -> Result<Self> {
        if !ctx.alloc.is_inode_allocated(ctx.cache, ino)? {
            return_errno_with_msg!(DoesNotExist, "the inode is not in use");
        }
        let raw = ctx.table.read(ctx.cache, ino)?;
        let desc = InodeDesc::try_from(&raw)?;
        let mapper = BlockMapper::load(ino, &raw, &desc, ctx.cache.block_size())?;
        let entries = (desc.type_ == FileType::Dir).then(|| DirectoryEntryStore::new(filetype));
        Ok(Self {
            desc,
            mapper,
            entries,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.desc.type_ == FileType::Dir
    }

    /// Returns whether this is a symlink keeping its target inside the block pointers.
    pub fn is_fast_symlink(&self) -> bool {
        self.desc.type_ == FileType::Symlink && self.mapper.len() == 0
    }

    /// Writes the inode record.
    pub fn persist(&self, ctx: &FsCtx<'_>) -> Result<()> {
        self.mapper.persist(&self.desc, ctx)
    }

    /// Returns the directory parts of the state.
    pub fn dir_parts(
        &mut self,
    ) -> Result<(&mut DirectoryEntryStore, &mut BlockMapper, &mut InodeDesc)> {
        match self.entries.as_mut() {
            Some(entries) => Ok((entries, &mut self.mapper, &mut self.desc)),
            None => return_errno!(NotDir),
        }
    }

    /// Reads at most `buf.len()` bytes at `offset`, stopping at the end of the file.
    ///
    /// Holes read back as zeros.
    pub fn read_at(&mut self, cache: &BlockCache, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let size = self.desc.size;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let end = size.min(offset.saturating_add(buf.len()));

        if self.is_fast_symlink() {
            let inline = self.mapper.inline_data();
            let end = end.min(inline.len());
            let len = end.saturating_sub(offset);
            buf[..len].copy_from_slice(&inline[offset..offset + len]);
            return Ok(len);
        }

        let block_size = cache.block_size();
        let mut pos = offset;
        while pos < end {
            let in_block = pos % block_size;
            let chunk = (block_size - in_block).min(end - pos);
            let dst = &mut buf[pos - offset..pos - offset + chunk];
            let bid = self.mapper.resolve(cache, pos / block_size)?;
            if bid.is_null() {
                dst.fill(0);
            } else {
                cache.read_at(bid, in_block, dst)?;
            }
            pos += chunk;
        }
        Ok(end - offset)
    }

    /// Writes `data` at `offset`, growing the file as needed.
    pub fn write_at(&mut self, ctx: &mut FsCtx<'_>, offset: usize, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len())
            .ok_or(Error::with_msg(InvalidArgs, "write range overflows"))?;
        self.mapper.ensure_size(&mut self.desc, ctx, end, false)?;

        let block_size = ctx.cache.block_size();
        let mut pos = offset;
        while pos < end {
            let in_block = pos % block_size;
            let chunk = (block_size - in_block).min(end - pos);
            let bid = self.mapper.resolve(ctx.cache, pos / block_size)?;
            if bid.is_null() {
                return_errno_with_msg!(Unsupported, "writing into a hole");
            }
            ctx.cache
                .write_at(bid, in_block, &data[pos - offset..pos - offset + chunk])?;
            pos += chunk;
        }

        self.desc.mtime = ctx.now;
        self.desc.ctime = ctx.now;
        self.persist(ctx)?;
        Ok(data.len())
    }
}

/// A handle to a file, directory or symbolic link of an `Ext2`.
///
/// Handles are cheap to clone. Every operation takes the filesystem lock, so the
/// metadata a handle reports is always the current one.
#[derive(Clone)]
pub struct Node {
    ino: u32,
    kind: NodeKind,
    fs: Arc<Ext2>,
}

impl Node {
    pub(crate) fn new(ino: u32, kind: NodeKind, fs: Arc<Ext2>) -> Self {
        Self { ino, kind, fs }
    }

    /// Returns the inode number.
    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Returns the filesystem holding this node.
    pub fn fs(&self) -> &Arc<Ext2> {
        &self.fs
    }

    /// Reads at most `buf.len()` bytes at `offset` and returns how many were read.
    ///
    /// A read at or beyond the end of the file returns zero bytes.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        if self.is_dir() {
            return_errno!(IsDir);
        }
        self.fs
            .with_node(self.ino, |state, ctx| state.read_at(ctx.cache, offset, buf))
    }

    /// Writes `data` at `offset`, growing the file if needed.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<usize> {
        self.check_regular_file()?;
        self.fs
            .with_node(self.ino, |state, ctx| state.write_at(ctx, offset, data))
    }

    /// Releases every block of the file and sets its size to zero.
    pub fn truncate(&self) -> Result<()> {
        self.check_regular_file()?;
        self.fs.with_node(self.ino, |state, ctx| {
            state.desc.mtime = ctx.now;
            state.desc.ctime = ctx.now;
            state.mapper.wipe(&mut state.desc, ctx)
        })
    }

    /// Grows the file to `new_size` bytes with zeros. A smaller size is a no-op.
    pub fn extend(&self, new_size: usize) -> Result<()> {
        self.check_regular_file()?;
        self.fs.with_node(self.ino, |state, ctx| {
            if new_size > state.desc.size {
                state.desc.mtime = ctx.now;
                state.desc.ctime = ctx.now;
            }
            state.mapper.ensure_size(&mut state.desc, ctx, new_size, false)
        })
    }

    /// Reserves blocks for the first `size` bytes without changing the file size.
    pub fn preallocate(&self, size: usize) -> Result<()> {
        self.check_regular_file()?;
        self.fs.with_node(self.ino, |state, ctx| {
            state.mapper.ensure_size(&mut state.desc, ctx, size, true)
        })
    }

    /// Returns the target of the symbolic link.
    pub fn read_link(&self) -> Result<String> {
        if self.kind != NodeKind::Symlink {
            return_errno!(NotSymlink);
        }
        let target = self.fs.with_node(self.ino, |state, ctx| {
            let mut buf = vec![0u8; state.desc.size];
            let len = state.read_at(ctx.cache, 0, &mut buf)?;
            buf.truncate(len);
            Ok(buf)
        })?;
        String::from_utf8(target)
            .map_err(|_| Error::with_msg(CorruptEntry, "symlink target is not UTF-8"))
    }

    /// Finds the node named `name` in this directory.
    pub fn lookup(&self, name: &str) -> Result<Node> {
        let (ino, kind) = self.fs.with_node(self.ino, |state, ctx| {
            let (entries, mapper, _) = state.dir_parts()?;
            let Some(entry) = entries.lookup(mapper, ctx.cache, name)? else {
                return_errno!(DoesNotExist);
            };
            let kind = entries.entry_kind(&entry, ctx)?;
            Ok((entry.ino, kind))
        })?;
        Ok(Node::new(ino, kind, self.fs.clone()))
    }

    /// Lists the names in this directory with their inode numbers, `.` and `..` included.
    pub fn entries(&self) -> Result<Vec<(String, u32)>> {
        self.fs.with_node(self.ino, |state, ctx| {
            let (entries, mapper, _) = state.dir_parts()?;
            Ok(entries
                .entries(mapper, ctx.cache)?
                .into_iter()
                .map(|(name, entry)| (name, entry.ino))
                .collect())
        })
    }

    /// Returns the size in bytes.
    pub fn size(&self) -> Result<usize> {
        self.with_desc(|desc| desc.size)
    }

    pub fn uid(&self) -> Result<u32> {
        self.with_desc(|desc| desc.uid)
    }

    pub fn gid(&self) -> Result<u32> {
        self.with_desc(|desc| desc.gid)
    }

    /// Returns the on-disk permission bits.
    pub fn perm(&self) -> Result<FilePerm> {
        self.with_desc(|desc| desc.perm)
    }

    /// Returns the permissions in the generic representation.
    pub fn permissions(&self) -> Result<Permissions> {
        self.with_desc(|desc| Permissions::from(desc.perm))
    }

    /// Returns the number of directory entries linking to this node.
    pub fn links(&self) -> Result<u16> {
        self.with_desc(|desc| desc.hard_links)
    }

    pub fn atime(&self) -> Result<u32> {
        self.with_desc(|desc| desc.atime)
    }

    pub fn mtime(&self) -> Result<u32> {
        self.with_desc(|desc| desc.mtime)
    }

    pub fn ctime(&self) -> Result<u32> {
        self.with_desc(|desc| desc.ctime)
    }

    /// Returns the number of blocks charged to the node, pointer tables included.
    pub fn blocks_count(&self) -> Result<u32> {
        self.fs
            .with_node(self.ino, |state, _| Ok(state.mapper.charged_blocks()))
    }

    /// Returns the number of logical blocks the node spans.
    pub fn data_blocks(&self) -> Result<usize> {
        self.fs.with_node(self.ino, |state, _| Ok(state.mapper.len()))
    }

    pub fn set_uid(&self, uid: u32) -> Result<()> {
        self.update_desc(|desc| desc.uid = uid)
    }

    pub fn set_gid(&self, gid: u32) -> Result<()> {
        self.update_desc(|desc| desc.gid = gid)
    }

    pub fn set_perm(&self, perm: FilePerm) -> Result<()> {
        self.update_desc(|desc| desc.perm = perm)
    }

    /// Sets the owner, group and other bits from the generic representation.
    ///
    /// The set-id and sticky bits are kept.
    pub fn set_permissions(&self, perms: Permissions) -> Result<()> {
        const SPECIAL: FilePerm = FilePerm::from_bits_truncate(0o7000);
        self.update_desc(|desc| desc.perm = (desc.perm & SPECIAL) | FilePerm::from(perms))
    }

    fn check_regular_file(&self) -> Result<()> {
        match self.kind {
            NodeKind::File => Ok(()),
            NodeKind::Directory => return_errno!(IsDir),
            NodeKind::Symlink => return_errno_with_msg!(Unsupported, "not a regular file"),
        }
    }

    fn with_desc<R>(&self, f: impl FnOnce(&InodeDesc) -> R) -> Result<R> {
        self.fs.with_node(self.ino, |state, _| Ok(f(&state.desc)))
    }

    fn update_desc(&self, f: impl FnOnce(&mut InodeDesc)) -> Result<()> {
        self.fs.with_node(self.ino, |state, ctx| {
            f(&mut state.desc);
            state.desc.ctime = ctx.now;
            state.persist(ctx)
        })
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .finish()
    }
}
