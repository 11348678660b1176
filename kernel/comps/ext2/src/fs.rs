// SPDX-License-Identifier: MPL-2.0

use alloc::collections::btree_map::Entry;

use spin::Mutex;

use crate::{
    allocator::BitmapAllocator,
    block_device::BlockDevice,
    dir::DirEntryFileType,
    inode::{
        FAST_SYMLINK_MAX_LEN, FilePerm, FileType, InodeDesc, MAX_FNAME_LEN, ROOT_INO, RawInode,
    },
    inode_table::InodeTable,
    node::{Node, NodeKind, NodeState},
    options::MountOptions,
    prelude::*,
    super_block::{SuperBlock, read_raw_super_block},
};

/// The Ext2 filesystem.
///
/// One lock serializes every structural change: allocation, inode updates and
/// directory updates. The block cache below it has its own lock, which is never held
/// while calling back into the filesystem.
pub struct Ext2 {
    cache: BlockCache,
    inode_table: InodeTable,
    inner: Mutex<Inner>,
    options: MountOptions,
    block_size: usize,
    filetype: bool,
    self_ref: Weak<Self>,
}

struct Inner {
    alloc: BitmapAllocator,
    /// The state of every inode touched since mount.
    nodes: BTreeMap<u32, NodeState>,
}

/// What an operation on one inode needs from the filesystem while the lock is held.
pub(crate) struct FsCtx<'a> {
    pub cache: &'a BlockCache,
    pub table: &'a InodeTable,
    pub alloc: &'a mut BitmapAllocator,
    /// The time stamped on changed inodes.
    pub now: u32,
}

impl Ext2 {
    /// Opens and loads an Ext2 from the `device`.
    pub fn open(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Self>> {
        let super_block = SuperBlock::try_from(read_raw_super_block(device.as_ref())?)?;
        let block_size = super_block.block_size();
        if (super_block.total_blocks() as usize).saturating_mul(block_size) > device.size() {
            return_errno_with_msg!(CorruptEntry, "the filesystem is larger than its device");
        }

        let cache = BlockCache::new(device, block_size, options.cache_capacity);
        let mut alloc = BitmapAllocator::load(&cache, super_block)?;
        let inode_table = {
            let tables = alloc
                .groups()
                .iter()
                .map(|group| group.inode_table_bid())
                .collect();
            InodeTable::new(&super_block, tables)
        };
        alloc.record_mount(&cache, (options.clock)())?;

        info!(
            "ext2: mounted '{}': {} blocks of {} bytes in {} groups, {} free",
            super_block.volume_label(),
            super_block.total_blocks(),
            block_size,
            super_block.groups_count(),
            alloc.super_block().free_blocks_count(),
        );

        let ext2 = Arc::new_cyclic(|weak_ref| Self {
            cache,
            inode_table,
            inner: Mutex::new(Inner {
                alloc,
                nodes: BTreeMap::new(),
            }),
            options,
            block_size,
            filetype: super_block.has_filetype(),
            self_ref: weak_ref.clone(),
        });
        ext2.root()?;
        Ok(ext2)
    }

    /// Returns the root directory.
    pub fn root(&self) -> Result<Node> {
        let kind = self.with_node(ROOT_INO, |state, _| NodeKind::try_from(state.desc.type_))?;
        if kind != NodeKind::Directory {
            return_errno_with_msg!(CorruptEntry, "the root inode is not a directory");
        }
        Ok(Node::new(ROOT_INO, kind, self.arc()?))
    }

    /// Returns the size of block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns a snapshot of the superblock.
    pub fn super_block(&self) -> SuperBlock {
        *self.inner.lock().alloc.super_block()
    }

    /// Returns the volume name.
    pub fn volume_label(&self) -> String {
        self.inner.lock().alloc.super_block().volume_label()
    }

    /// Returns the block cache.
    pub fn block_cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Waits until every change has reached the device.
    ///
    /// Metadata is written through on every change, so only the device is flushed.
    pub fn sync(&self) -> Result<()> {
        self.cache.flush()
    }

    /// Creates a regular file named `name` in `parent`.
    ///
    /// Without `perm`, the mount's default file permission applies.
    pub fn create_file(&self, parent: &Node, name: &str, perm: Option<FilePerm>) -> Result<Node> {
        let perm = perm.unwrap_or(self.options.file_perm);
        self.create_node(parent, name, FileType::File, perm, None)
    }

    /// Creates a directory named `name` in `parent`, holding `.` and `..`.
    ///
    /// Without `perm`, the mount's default directory permission applies.
    pub fn create_dir(&self, parent: &Node, name: &str, perm: Option<FilePerm>) -> Result<Node> {
        let perm = perm.unwrap_or(self.options.dir_perm);
        self.create_node(parent, name, FileType::Dir, perm, None)
    }

    /// Creates a symbolic link named `name` in `parent` pointing to `target`.
    pub fn create_symlink(&self, parent: &Node, name: &str, target: &str) -> Result<Node> {
        if target.is_empty() {
            return_errno_with_msg!(InvalidArgs, "empty symlink target");
        }
        if target.len() >= self.block_size {
            return_errno_with_msg!(NameTooLong, "symlink target longer than a block");
        }
        let perm = self.options.symlink_perm;
        self.create_node(parent, name, FileType::Symlink, perm, Some(target))
    }

    /// Adds the name `name` in `parent` for the existing node `target`.
    pub fn create_link(&self, parent: &Node, name: &str, target: &Node) -> Result<()> {
        self.check_node(parent)?;
        self.check_node(target)?;
        if target.is_dir() {
            return_errno_with_msg!(IsDir, "directories cannot be hard linked");
        }
        check_name(name)?;

        let mut inner = self.inner.lock();
        let Inner { alloc, nodes } = &mut *inner;
        let mut ctx = self.ctx(alloc);
        let filetype = self.filetype;

        let type_ = load_node(nodes, &mut ctx, target.ino(), filetype)?.desc.type_;
        link_into(nodes, &mut ctx, parent.ino(), name, target.ino(), type_, filetype)?;
        inc_link(nodes, &mut ctx, target.ino(), filetype)?;
        debug!(
            "ext2: linked inode {} as '{}' in directory {}",
            target.ino(),
            name,
            parent.ino()
        );
        Ok(())
    }

    /// Removes the name `name` from `parent`.
    ///
    /// When the last name of a node is gone, its blocks and its inode are released.
    /// A directory must hold nothing but `.` and `..`.
    pub fn remove(&self, parent: &Node, name: &str) -> Result<()> {
        self.check_node(parent)?;
        check_name(name)?;

        let mut inner = self.inner.lock();
        let Inner { alloc, nodes } = &mut *inner;
        let mut ctx = self.ctx(alloc);
        let filetype = self.filetype;
        let parent_ino = parent.ino();

        let target_ino = {
            let parent_state = load_node(nodes, &mut ctx, parent_ino, filetype)?;
            let (entries, mapper, _) = parent_state.dir_parts()?;
            match entries.lookup(mapper, ctx.cache, name)? {
                Some(entry) => entry.ino,
                None => return_errno!(DoesNotExist),
            }
        };

        let is_dir = {
            let target = load_node(nodes, &mut ctx, target_ino, filetype)?;
            if target.is_dir() {
                let (entries, mapper, _) = target.dir_parts()?;
                if !entries.is_empty_dir(mapper, ctx.cache)? {
                    return_errno!(DirNotEmpty);
                }
            }
            target.is_dir()
        };

        {
            let parent_state = load_node(nodes, &mut ctx, parent_ino, filetype)?;
            let (entries, mapper, desc) = parent_state.dir_parts()?;
            entries.remove_entry(mapper, ctx.cache, name, target_ino)?;
            desc.mtime = ctx.now;
            desc.ctime = ctx.now;
            parent_state.persist(&ctx)?;
        }
        debug!(
            "ext2: removed '{}' (inode {}) from directory {}",
            name, target_ino, parent_ino
        );

        let mut released = drop_link(nodes, &mut ctx, target_ino, filetype)?;
        if is_dir {
            // The `.` of the directory and the `..` pointing to the parent.
            released = drop_link(nodes, &mut ctx, target_ino, filetype)?;
            drop_link(nodes, &mut ctx, parent_ino, filetype)?;
        }
        if released {
            release_node(nodes, &mut ctx, target_ino)?;
        }
        Ok(())
    }

    fn create_node(
        &self,
        parent: &Node,
        name: &str,
        type_: FileType,
        perm: FilePerm,
        symlink_target: Option<&str>,
    ) -> Result<Node> {
        self.check_node(parent)?;
        check_name(name)?;

        let mut inner = self.inner.lock();
        let Inner { alloc, nodes } = &mut *inner;
        let mut ctx = self.ctx(alloc);
        let filetype = self.filetype;
        let parent_ino = parent.ino();

        {
            let parent_state = load_node(nodes, &mut ctx, parent_ino, filetype)?;
            let (entries, mapper, _) = parent_state.dir_parts()?;
            if entries.lookup(mapper, ctx.cache, name)?.is_some() {
                return_errno!(Exists);
            }
        }

        let is_dir = type_ == FileType::Dir;
        let ino = ctx.alloc.find_free_inode(ctx.cache, parent_ino, is_dir)?;
        let desc = InodeDesc::new(type_, perm, self.options.uid, self.options.gid, ctx.now);
        let mut state = NodeState::new(ino, desc, self.block_size, filetype);
        state.persist(&ctx)?;

        match symlink_target {
            Some(target) if target.len() < FAST_SYMLINK_MAX_LEN => {
                state.mapper.set_inline_data(target.as_bytes())?;
                state.desc.size = target.len();
                state.persist(&ctx)?;
            }
            Some(target) => {
                state.write_at(&mut ctx, 0, target.as_bytes())?;
            }
            None => {}
        }

        if is_dir {
            let (entries, mapper, desc) = state.dir_parts()?;
            entries.add_entry(mapper, desc, &mut ctx, ".", ino, DirEntryFileType::Dir)?;
            entries.add_entry(mapper, desc, &mut ctx, "..", parent_ino, DirEntryFileType::Dir)?;
            state.desc.hard_links += 1;
            state.persist(&ctx)?;
        }
        nodes.insert(ino, state);

        link_into(nodes, &mut ctx, parent_ino, name, ino, type_, filetype)?;
        inc_link(nodes, &mut ctx, ino, filetype)?;
        if is_dir {
            // The `..` of the new directory.
            inc_link(nodes, &mut ctx, parent_ino, filetype)?;
        }
        debug!(
            "ext2: created inode {} as '{}' in directory {}",
            ino, name, parent_ino
        );

        Ok(Node::new(ino, NodeKind::try_from(type_)?, self.arc()?))
    }

    /// Runs `f` on the state of the inode `ino` with the lock held.
    pub(crate) fn with_node<R>(
        &self,
        ino: u32,
        f: impl FnOnce(&mut NodeState, &mut FsCtx<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        let Inner { alloc, nodes } = &mut *inner;
        let mut ctx = self.ctx(alloc);
        let state = load_node(nodes, &mut ctx, ino, self.filetype)?;
        f(state, &mut ctx)
    }

    fn ctx<'a>(&'a self, alloc: &'a mut BitmapAllocator) -> FsCtx<'a> {
        FsCtx {
            cache: &self.cache,
            table: &self.inode_table,
            alloc,
            now: (self.options.clock)(),
        }
    }

    fn check_node(&self, node: &Node) -> Result<()> {
        if !core::ptr::eq(Arc::as_ptr(node.fs()), self) {
            return_errno_with_msg!(InvalidArgs, "the node belongs to another filesystem");
        }
        Ok(())
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| Error::algorithmic("the filesystem is already dropped"))
    }
}

impl Debug for Ext2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ext2")
            .field("cache", &self.cache)
            .field("block_size", &self.block_size)
            .field("filetype", &self.filetype)
            .finish()
    }
}

/// Checks that `name` can be a directory entry created or removed by a caller.
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return_errno_with_msg!(InvalidArgs, "reserved directory entry name");
    }
    if name.contains(['/', '\0']) {
        return_errno_with_msg!(InvalidArgs, "invalid character in name");
    }
    if name.len() > MAX_FNAME_LEN {
        return_errno!(NameTooLong);
    }
    Ok(())
}

/// Returns the state of the inode `ino`, loading it on first use.
fn load_node<'n>(
    nodes: &'n mut BTreeMap<u32, NodeState>,
    ctx: &mut FsCtx<'_>,
    ino: u32,
    filetype: bool,
) -> Result<&'n mut NodeState> {
    match nodes.entry(ino) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let state = NodeState::load(ctx, ino, filetype)?;
            Ok(entry.insert(state))
        }
    }
}

/// Adds the entry `name` for `ino` to the directory `dir_ino`.
fn link_into(
    nodes: &mut BTreeMap<u32, NodeState>,
    ctx: &mut FsCtx<'_>,
    dir_ino: u32,
    name: &str,
    ino: u32,
    type_: FileType,
    filetype: bool,
) -> Result<()> {
    let dir = load_node(nodes, ctx, dir_ino, filetype)?;
    let (entries, mapper, desc) = dir.dir_parts()?;
    if entries.lookup(mapper, ctx.cache, name)?.is_some() {
        return_errno!(Exists);
    }
    entries.add_entry(mapper, desc, ctx, name, ino, DirEntryFileType::from(type_))?;
    desc.mtime = ctx.now;
    desc.ctime = ctx.now;
    dir.persist(ctx)
}

fn inc_link(
    nodes: &mut BTreeMap<u32, NodeState>,
    ctx: &mut FsCtx<'_>,
    ino: u32,
    filetype: bool,
) -> Result<()> {
    let state = load_node(nodes, ctx, ino, filetype)?;
    state.desc.hard_links = state
        .desc
        .hard_links
        .checked_add(1)
        .ok_or(Error::with_msg(InvalidArgs, "too many links"))?;
    state.desc.ctime = ctx.now;
    state.persist(ctx)
}

/// Drops one link of the inode `ino`, returning whether none is left.
fn drop_link(
    nodes: &mut BTreeMap<u32, NodeState>,
    ctx: &mut FsCtx<'_>,
    ino: u32,
    filetype: bool,
) -> Result<bool> {
    let state = load_node(nodes, ctx, ino, filetype)?;
    state.desc.hard_links = state.desc.hard_links.saturating_sub(1);
    state.desc.ctime = ctx.now;
    state.persist(ctx)?;
    Ok(state.desc.hard_links == 0)
}

/// Releases the blocks and the inode number of the unlinked inode `ino`.
fn release_node(
    nodes: &mut BTreeMap<u32, NodeState>,
    ctx: &mut FsCtx<'_>,
    ino: u32,
) -> Result<()> {
    let Some(mut state) = nodes.remove(&ino) else {
        return Err(Error::algorithmic("releasing an inode that is not loaded"));
    };
    let is_dir = state.is_dir();
    state.mapper.wipe(&mut state.desc, ctx)?;
    ctx.table.write(ctx.cache, ino, &RawInode::deleted(ctx.now))?;
    ctx.alloc.release_inode(ctx.cache, ino, is_dir)?;
    debug!("ext2: released inode {}", ino);
    Ok(())
}

#[cfg(test)]
impl Ext2 {
    /// Rewrites the on-disk record of the inode `ino`, dropping its in-memory state.
    pub(crate) fn edit_raw_inode(&self, ino: u32, f: impl FnOnce(&mut RawInode)) {
        let mut inner = self.inner.lock();
        inner.nodes.remove(&ino);
        let mut raw = self.inode_table.read(&self.cache, ino).unwrap();
        f(&mut raw);
        self.inode_table.write(&self.cache, ino, &raw).unwrap();
    }

    /// Checks that the bitmaps, the free counters and the block chains of every
    /// inode in use agree: each block in use has exactly one owner, which is either
    /// the static metadata or one inode, and each free block has none.
    pub(crate) fn assert_consistent(&self) {
        use crate::{block_group::DESCRIPTOR_SIZE, block_mapper::BlockMapper};

        let mut inner = self.inner.lock();
        let Inner { alloc, .. } = &mut *inner;
        let sb = *alloc.super_block();
        let cache = &self.cache;
        let mut owners: BTreeMap<u32, u32> = BTreeMap::new();
        let mut claim = |bid: BlockId, owner: u32| {
            let previous = owners.insert(bid.to_raw(), owner);
            assert!(
                previous.is_none(),
                "block {} is owned by {:?} and {}",
                bid.to_raw(),
                previous,
                owner
            );
        };

        let gdt_blocks = (sb.groups_count() as usize * DESCRIPTOR_SIZE).div_ceil(self.block_size);
        let table_blocks =
            (sb.inodes_per_group() as usize * sb.inode_size()).div_ceil(self.block_size);
        for group in alloc.groups() {
            let first = group.first_block().to_raw();
            for bid in first..first + 1 + gdt_blocks as u32 {
                claim(BlockId::new(bid), 0);
            }
            claim(group.block_bitmap_bid(), 0);
            claim(group.inode_bitmap_bid(), 0);
            let start = group.inode_table_bid().to_raw();
            for bid in start..start + table_blocks as u32 {
                claim(BlockId::new(bid), 0);
            }
        }

        let groups_count = sb.groups_count() as usize;
        let mut used_inodes = vec![0u32; groups_count];
        let mut dirs = vec![0u16; groups_count];
        for ino in 1..=sb.total_inodes() {
            if !alloc.is_inode_allocated(cache, ino).unwrap() {
                continue;
            }
            let group_idx = ((ino - 1) / sb.inodes_per_group()) as usize;
            used_inodes[group_idx] += 1;
            if ino != ROOT_INO && ino < sb.first_ino() {
                continue;
            }
            let raw = self.inode_table.read(cache, ino).unwrap();
            let desc = InodeDesc::try_from(&raw).unwrap();
            assert!(desc.hard_links > 0, "inode {} is in use without links", ino);
            if desc.type_ == FileType::Dir {
                dirs[group_idx] += 1;
            }
            let mut mapper = BlockMapper::load(ino, &raw, &desc, self.block_size).unwrap();
            let (data, meta) = mapper.owned_blocks(cache).unwrap();
            assert_eq!(
                mapper.charged_blocks() as usize,
                data.len() + meta.len(),
                "inode {} charges the wrong number of blocks",
                ino
            );
            for bid in data.into_iter().chain(meta) {
                claim(bid, ino);
            }
        }

        let mut free_blocks = 0;
        for group_idx in 0..sb.groups_count() {
            let first = sb.group_first_block(group_idx).to_raw();
            let mut group_free = 0;
            for bid in first..first + sb.blocks_in_group(group_idx) {
                let used = alloc.is_block_allocated(cache, BlockId::new(bid)).unwrap();
                assert_eq!(
                    used,
                    owners.contains_key(&bid),
                    "block {} has a bitmap bit disagreeing with its owners",
                    bid
                );
                if !used {
                    group_free += 1;
                }
            }
            assert_eq!(
                alloc.groups()[group_idx as usize].free_blocks_count() as u32,
                group_free
            );
            free_blocks += group_free;
        }
        assert_eq!(sb.free_blocks_count(), free_blocks);

        for (group_idx, group) in alloc.groups().iter().enumerate() {
            assert_eq!(
                group.free_inodes_count() as u32,
                sb.inodes_per_group() - used_inodes[group_idx]
            );
            assert_eq!(group.dirs_count(), dirs[group_idx]);
        }
        let used_inodes: u32 = used_inodes.iter().sum();
        assert_eq!(sb.free_inodes_count(), sb.total_inodes() - used_inodes);
    }
}
