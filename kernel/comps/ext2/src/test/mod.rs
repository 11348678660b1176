// SPDX-License-Identifier: MPL-2.0

use zerocopy::IntoBytes;

use crate::{
    BlockDevice, Ext2, FeatureInCompatSet, FilePerm, FormatOptions, MemDisk, MountOptions, Node,
    NodeKind, Permissions,
    dir::DirEntryFileType,
    format,
    inode::{FAST_SYMLINK_MAX_LEN, MAX_FNAME_LEN, ROOT_INO},
    prelude::*,
    super_block::{SUPER_BLOCK_OFFSET, read_raw_super_block},
};

const NOW: u32 = 1_700_000_000;

const BLOCK_SIZE: usize = 1024;

fn clock() -> u32 {
    NOW
}

fn new_disk(size: usize, options: &FormatOptions) -> Arc<MemDisk> {
    let disk = Arc::new(MemDisk::new(size));
    let res = format(disk.as_ref(), options);
    assert!(res.is_ok(), "failed to format: {:?}", res.unwrap_err());
    disk
}

fn mount(disk: &Arc<MemDisk>) -> Arc<Ext2> {
    let res = Ext2::open(disk.clone(), MountOptions::new().clock(clock));
    assert!(res.is_ok(), "failed to mount: {:?}", res.unwrap_err());
    res.unwrap()
}

/// A 4 MiB volume of 1 KiB blocks spread over four block groups.
fn new_fs() -> Arc<Ext2> {
    let options = FormatOptions::new().blocks_per_group(1024);
    mount(&new_disk(4 * 1024 * 1024, &options))
}

fn create_file(fs: &Ext2, parent: &Node, name: &str) -> Node {
    let res = fs.create_file(parent, name, None);
    assert!(res.is_ok(), "failed to create {}: {:?}", name, res.unwrap_err());
    res.unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn free_blocks(fs: &Ext2) -> u32 {
    fs.super_block().free_blocks_count()
}

fn free_inodes(fs: &Ext2) -> u32 {
    fs.super_block().free_inodes_count()
}

/// Adds a record straight into the directory, without touching the target inode.
fn add_raw_entry(fs: &Ext2, dir: &Node, name: &str, ino: u32) {
    let res = fs.with_node(dir.ino(), |state, ctx| {
        let (entries, mapper, desc) = state.dir_parts()?;
        entries.add_entry(mapper, desc, ctx, name, ino, DirEntryFileType::File)
    });
    assert!(res.is_ok(), "failed to add {}: {:?}", name, res.unwrap_err());
}

fn raw_lookup(fs: &Ext2, dir: &Node, name: &str) -> Option<u32> {
    fs.with_node(dir.ino(), |state, ctx| {
        let (entries, mapper, _) = state.dir_parts()?;
        Ok(entries.lookup(mapper, ctx.cache, name)?.map(|entry| entry.ino))
    })
    .unwrap()
}

/// Returns the block and the offset inside it of the record of `name`.
fn record_location(fs: &Ext2, dir: &Node, name: &str) -> (BlockId, usize) {
    fs.with_node(dir.ino(), |state, ctx| {
        let (entries, mapper, _) = state.dir_parts()?;
        let entry = entries
            .lookup(mapper, ctx.cache, name)?
            .ok_or(Error::new(DoesNotExist))?;
        Ok((mapper.resolve(ctx.cache, entry.block_idx)?, entry.offset))
    })
    .unwrap()
}

fn first_block_of(fs: &Ext2, ino: u32) -> BlockId {
    fs.with_node(ino, |state, ctx| state.mapper.resolve(ctx.cache, 0)).unwrap()
}

#[test]
fn round_trip_across_addressing_tiers() {
    for (block_size, disk_size) in [(1024, 4 * 1024 * 1024), (4096, 8 * 1024 * 1024)] {
        let fs = mount(&new_disk(disk_size, &FormatOptions::new().block_size(block_size)));
        let root = fs.root().unwrap();
        let per_table = block_size / 4;

        for (i, first_block) in [0, 11, 12, 12 + per_table].into_iter().enumerate() {
            let file = create_file(&fs, &root, &format!("tier-{}", i));
            let offset = first_block * block_size;
            let data = pattern(2 * block_size + 17, i as u8);
            assert_eq!(file.write(offset, &data).unwrap(), data.len());
            assert_eq!(file.size().unwrap(), offset + data.len());

            let mut buf = vec![0u8; data.len()];
            assert_eq!(file.read(offset, &mut buf).unwrap(), data.len());
            assert_eq!(buf, data);

            let mut head = vec![0xffu8; offset];
            assert_eq!(file.read(0, &mut head).unwrap(), offset);
            assert!(head.iter().all(|&b| b == 0));
        }
        fs.assert_consistent();
    }
}

#[test]
fn reads_stop_at_end_of_file() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let file = create_file(&fs, &root, "eof");
    let mut buf = [0u8; 64];
    assert_eq!(file.read(0, &mut buf).unwrap(), 0);

    let data = pattern(100, 1);
    file.write(0, &data).unwrap();
    assert_eq!(file.read(100, &mut buf).unwrap(), 0);
    assert_eq!(file.read(5000, &mut buf).unwrap(), 0);
    assert_eq!(file.read(90, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], &data[90..]);

    file.extend(3000).unwrap();
    assert_eq!(file.size().unwrap(), 3000);
    let mut tail = vec![0xffu8; 4000];
    assert_eq!(file.read(100, &mut tail).unwrap(), 2900);
    assert!(tail[..2900].iter().all(|&b| b == 0));

    // Shrinking through `extend` is a no-op.
    file.extend(10).unwrap();
    assert_eq!(file.size().unwrap(), 3000);
}

#[test]
fn directory_churn_reuses_freed_slots() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let dir = fs.create_dir(&root, "churn", None).unwrap();
    let names: Vec<String> = (0..100).map(|i| format!("entry-{:03}", i)).collect();
    for name in &names {
        create_file(&fs, &dir, name);
    }
    let blocks = dir.data_blocks().unwrap();
    assert!(blocks > 1);

    for name in names.iter().step_by(2) {
        fs.remove(&dir, name).unwrap();
    }
    for (i, name) in names.iter().enumerate() {
        let res = dir.lookup(name);
        if i % 2 == 0 {
            assert_eq!(res.unwrap_err().errno(), DoesNotExist);
        } else {
            assert!(res.is_ok(), "lost {}: {:?}", name, res.unwrap_err());
        }
    }
    assert_eq!(dir.entries().unwrap().len(), 2 + names.len() / 2);

    for name in names.iter().step_by(2) {
        create_file(&fs, &dir, name);
    }
    assert_eq!(dir.data_blocks().unwrap(), blocks);
    assert_eq!(dir.entries().unwrap().len(), 2 + names.len());
    fs.assert_consistent();
}

#[test]
fn bitmaps_match_block_chains() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let (initial_blocks, initial_inodes) = (free_blocks(&fs), free_inodes(&fs));

    let docs = fs.create_dir(&root, "docs", None).unwrap();
    let sizes = [0, 1, 12, 13, 300, 12 + 256 + 5];
    let files: Vec<Node> = sizes
        .iter()
        .enumerate()
        .map(|(i, &blocks)| {
            let file = create_file(&fs, &docs, &format!("f{}", i));
            file.write(0, &pattern(blocks * BLOCK_SIZE + 3, i as u8)).unwrap();
            file
        })
        .collect();
    fs.assert_consistent();

    fs.remove(&docs, "f1").unwrap();
    fs.remove(&docs, "f4").unwrap();
    files[2].truncate().unwrap();
    files[3].preallocate(40 * BLOCK_SIZE).unwrap();
    assert_eq!(files[3].size().unwrap(), 13 * BLOCK_SIZE + 3);
    fs.create_symlink(&docs, "short", "f0").unwrap();
    fs.create_symlink(&docs, "long", &"l".repeat(300)).unwrap();
    let nested = fs.create_dir(&docs, "nested", None).unwrap();
    create_file(&fs, &nested, "leaf").write(0, b"leaf").unwrap();
    fs.assert_consistent();

    fs.remove(&nested, "leaf").unwrap();
    fs.remove(&docs, "nested").unwrap();
    for (name, _) in docs.entries().unwrap() {
        if name != "." && name != ".." {
            fs.remove(&docs, &name).unwrap();
        }
    }
    fs.remove(&root, "docs").unwrap();
    fs.assert_consistent();
    assert_eq!(free_blocks(&fs), initial_blocks);
    assert_eq!(free_inodes(&fs), initial_inodes);
}

#[test]
fn links_share_one_inode() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let a = fs.create_dir(&root, "a", None).unwrap();
    let b = fs.create_dir(&root, "b", None).unwrap();
    let file = create_file(&fs, &a, "data");
    let content = pattern(5000, 7);
    file.write(0, &content).unwrap();
    let before = free_blocks(&fs);

    fs.create_link(&b, "alias", &file).unwrap();
    assert_eq!(file.links().unwrap(), 2);
    assert_eq!(free_blocks(&fs), before);

    fs.remove(&a, "data").unwrap();
    let alias = b.lookup("alias").unwrap();
    assert_eq!(alias.ino(), file.ino());
    assert_eq!(alias.links().unwrap(), 1);
    let mut buf = vec![0u8; content.len()];
    assert_eq!(alias.read(0, &mut buf).unwrap(), content.len());
    assert_eq!(buf, content);
    fs.assert_consistent();

    fs.remove(&b, "alias").unwrap();
    assert_eq!(free_blocks(&fs), before + 5);
    assert_eq!(b.lookup("alias").unwrap_err().errno(), DoesNotExist);
    assert_eq!(file.size().unwrap_err().errno(), DoesNotExist);
    fs.assert_consistent();

    assert_eq!(fs.create_link(&b, "loop", &a).unwrap_err().errno(), IsDir);
}

#[test]
fn directory_grows_when_a_block_is_full() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let dir = fs.create_dir(&root, "scenario", None).unwrap();
    assert_eq!(dir.data_blocks().unwrap(), 1);

    add_raw_entry(&fs, &dir, "a.txt", 50);
    assert_eq!(dir.data_blocks().unwrap(), 1);
    assert_eq!(raw_lookup(&fs, &dir, "a.txt"), Some(50));

    // Three maximal names still fit in the slack of the first block, a fourth does not.
    let long_names: Vec<String> = ['b', 'c', 'd', 'e']
        .iter()
        .map(|c| c.to_string().repeat(255))
        .collect();
    for (i, name) in long_names[..3].iter().enumerate() {
        add_raw_entry(&fs, &dir, name, 51 + i as u32);
    }
    assert_eq!(dir.data_blocks().unwrap(), 1);
    add_raw_entry(&fs, &dir, &long_names[3], 54);
    assert_eq!(dir.data_blocks().unwrap(), 2);
    assert_eq!(dir.size().unwrap(), 2 * BLOCK_SIZE);

    assert_eq!(raw_lookup(&fs, &dir, "a.txt"), Some(50));
    for (i, name) in long_names.iter().enumerate() {
        assert_eq!(raw_lookup(&fs, &dir, name), Some(51 + i as u32));
    }
}

#[test]
fn pins_are_balanced() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let file = create_file(&fs, &root, "pinned");
    let data = pattern(300 * BLOCK_SIZE, 3);
    file.write(0, &data).unwrap();
    let mut buf = vec![0u8; data.len()];
    file.read(0, &mut buf).unwrap();
    let dir = fs.create_dir(&root, "dir", None).unwrap();
    create_file(&fs, &dir, "inner");
    dir.entries().unwrap();
    assert!(dir.lookup("missing").is_err());
    fs.remove(&dir, "inner").unwrap();
    file.truncate().unwrap();
    assert_eq!(fs.block_cache().total_pins(), 0);

    let bid = first_block_of(&fs, ROOT_INO);
    {
        let _pinned = fs.block_cache().pin(bid).unwrap();
        let _again = fs.block_cache().pin(bid).unwrap();
        assert_eq!(fs.block_cache().pin_count(bid), 2);
        create_file(&fs, &root, "while-pinned");
    }
    assert_eq!(fs.block_cache().pin_count(bid), 0);
    assert_eq!(fs.block_cache().total_pins(), 0);
}

#[test]
fn growth_past_double_indirect_fails_cleanly() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let file = create_file(&fs, &root, "huge");
    let free = free_blocks(&fs);
    let limit = (12 + 256 + 256 * 256) * BLOCK_SIZE;

    assert_eq!(file.extend(limit + 1).unwrap_err().errno(), FileTooBig);
    assert_eq!(file.write(limit, b"x").unwrap_err().errno(), FileTooBig);
    assert_eq!(file.preallocate(limit + 1).unwrap_err().errno(), FileTooBig);
    assert_eq!(free_blocks(&fs), free);
    assert_eq!(file.size().unwrap(), 0);
    fs.assert_consistent();
}

#[test]
fn exhausted_device_reports_no_space() {
    let disk = new_disk(256 * 1024, &FormatOptions::new().inodes_per_group(16));
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let file = create_file(&fs, &root, "big");
    let free = free_blocks(&fs) as usize;

    // More data blocks than free: refused before anything is allocated.
    let err = file.write(0, &vec![1u8; (free + 1) * BLOCK_SIZE]).unwrap_err();
    assert_eq!(err.errno(), NoSpaceLeftOnDevice);
    assert_eq!(free_blocks(&fs) as usize, free);
    assert_eq!(file.size().unwrap(), 0);

    // Exactly the free data blocks, but no room for the pointer table: the blocks
    // appended before the failure stay with the file.
    let err = file.write(0, &vec![1u8; free * BLOCK_SIZE]).unwrap_err();
    assert_eq!(err.errno(), NoSpaceLeftOnDevice);
    assert_eq!(file.data_blocks().unwrap(), 12);
    fs.assert_consistent();
    file.truncate().unwrap();
    assert_eq!(free_blocks(&fs) as usize, free);

    // Sixteen inodes per group, ten of them reserved, one taken by "big".
    for i in 0..5 {
        create_file(&fs, &root, &format!("n{}", i));
    }
    let err = fs.create_file(&root, "one-too-many", None).unwrap_err();
    assert_eq!(err.errno(), NoSpaceLeftOnDevice);
    fs.assert_consistent();
}

#[test]
fn symlinks_inline_and_in_blocks() {
    let fs = new_fs();
    let root = fs.root().unwrap();

    let short = fs.create_symlink(&root, "short", "docs/readme.txt").unwrap();
    assert_eq!(short.kind(), NodeKind::Symlink);
    assert_eq!(short.read_link().unwrap(), "docs/readme.txt");
    assert_eq!(short.size().unwrap(), 15);
    assert_eq!(short.blocks_count().unwrap(), 0);

    let boundary = "b".repeat(FAST_SYMLINK_MAX_LEN - 1);
    let inline = fs.create_symlink(&root, "boundary", &boundary).unwrap();
    assert_eq!(inline.read_link().unwrap(), boundary);
    assert_eq!(inline.blocks_count().unwrap(), 0);

    let target = "t".repeat(FAST_SYMLINK_MAX_LEN);
    let long = fs.create_symlink(&root, "long", &target).unwrap();
    assert_eq!(long.read_link().unwrap(), target);
    assert_eq!(long.blocks_count().unwrap(), 1);

    let found = root.lookup("long").unwrap();
    assert_eq!(found.kind(), NodeKind::Symlink);
    assert_eq!(found.read_link().unwrap(), target);

    let err = fs
        .create_symlink(&root, "too-long", &"x".repeat(BLOCK_SIZE))
        .unwrap_err();
    assert_eq!(err.errno(), NameTooLong);
    assert_eq!(root.read_link().unwrap_err().errno(), NotSymlink);
    assert_eq!(short.write(0, b"x").unwrap_err().errno(), Unsupported);

    for name in ["short", "boundary", "long"] {
        fs.remove(&root, name).unwrap();
    }
    fs.assert_consistent();
}

#[test]
fn state_survives_remount() {
    let disk = new_disk(4 * 1024 * 1024, &FormatOptions::new().blocks_per_group(1024));
    let content = pattern(20 * BLOCK_SIZE, 9);
    let (file_ino, charged) = {
        let fs = mount(&disk);
        let root = fs.root().unwrap();
        let dir = fs.create_dir(&root, "keep", None).unwrap();
        let file = create_file(&fs, &dir, "notes");
        file.write(0, &content).unwrap();
        file.set_perm(FilePerm::from_bits_truncate(0o600)).unwrap();
        file.set_uid(1000).unwrap();
        file.set_gid(100).unwrap();
        fs.create_symlink(&dir, "link", "notes").unwrap();
        fs.sync().unwrap();
        (file.ino(), file.blocks_count().unwrap())
    };
    // Twenty data blocks and one single indirect table.
    assert_eq!(charged, 21);

    let fs = mount(&disk);
    let root = fs.root().unwrap();
    assert_eq!(root.links().unwrap(), 3);
    let dir = root.lookup("keep").unwrap();
    assert_eq!(dir.kind(), NodeKind::Directory);
    assert_eq!(dir.links().unwrap(), 2);

    let file = dir.lookup("notes").unwrap();
    assert_eq!(file.ino(), file_ino);
    assert_eq!(file.blocks_count().unwrap(), charged);
    assert_eq!(file.size().unwrap(), content.len());
    assert_eq!(file.perm().unwrap(), FilePerm::from_bits_truncate(0o600));
    assert_eq!(file.uid().unwrap(), 1000);
    assert_eq!(file.gid().unwrap(), 100);
    assert_eq!(file.mtime().unwrap(), NOW);
    let mut buf = vec![0u8; content.len()];
    file.read(0, &mut buf).unwrap();
    assert_eq!(buf, content);

    assert_eq!(dir.lookup("link").unwrap().read_link().unwrap(), "notes");
    fs.assert_consistent();
}

#[test]
fn non_empty_directory_is_kept() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let dir = fs.create_dir(&root, "full", None).unwrap();
    assert_eq!(root.links().unwrap(), 3);
    assert_eq!(dir.links().unwrap(), 2);
    let sub = fs.create_dir(&dir, "sub", None).unwrap();
    assert_eq!(dir.links().unwrap(), 3);
    let entries = sub.entries().unwrap();
    assert!(entries.contains(&(String::from(".."), dir.ino())));
    assert!(entries.contains(&(String::from("."), sub.ino())));

    assert_eq!(fs.remove(&root, "full").unwrap_err().errno(), DirNotEmpty);
    fs.remove(&dir, "sub").unwrap();
    assert_eq!(dir.links().unwrap(), 2);
    fs.remove(&root, "full").unwrap();
    assert_eq!(root.links().unwrap(), 2);
    assert_eq!(root.lookup("full").unwrap_err().errno(), DoesNotExist);
    assert_eq!(dir.entries().unwrap_err().errno(), DoesNotExist);
    fs.assert_consistent();
}

#[test]
fn reserved_and_invalid_names_are_refused() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let file = create_file(&fs, &root, "plain");

    for name in [".", ".."] {
        assert_eq!(fs.remove(&root, name).unwrap_err().errno(), InvalidArgs);
        let err = fs.create_file(&root, name, None).unwrap_err();
        assert_eq!(err.errno(), InvalidArgs);
    }
    for name in ["", "a/b", "nul\0"] {
        let err = fs.create_file(&root, name, None).unwrap_err();
        assert_eq!(err.errno(), InvalidArgs);
    }
    let err = fs.create_file(&root, &"n".repeat(256), None).unwrap_err();
    assert_eq!(err.errno(), NameTooLong);
    create_file(&fs, &root, &"n".repeat(255));

    let err = fs.create_dir(&root, "plain", None).unwrap_err();
    assert_eq!(err.errno(), Exists);
    let err = fs.create_file(&file, "child", None).unwrap_err();
    assert_eq!(err.errno(), NotDir);
    assert_eq!(file.lookup("child").unwrap_err().errno(), NotDir);
    assert_eq!(fs.remove(&root, "missing").unwrap_err().errno(), DoesNotExist);

    let mut buf = [0u8; 8];
    assert_eq!(root.read(0, &mut buf).unwrap_err().errno(), IsDir);
    assert_eq!(root.write(0, b"x").unwrap_err().errno(), IsDir);
    fs.assert_consistent();
}

#[test]
fn nodes_from_another_volume_are_refused() {
    let fs = new_fs();
    let other = new_fs();
    let foreign = create_file(&other, &other.root().unwrap(), "foreign");
    let root = fs.root().unwrap();

    let err = fs.create_link(&root, "alias", &foreign).unwrap_err();
    assert_eq!(err.errno(), InvalidArgs);
    let err = fs.create_file(&other.root().unwrap(), "x", None).unwrap_err();
    assert_eq!(err.errno(), InvalidArgs);
}

#[test]
fn metadata_follows_the_permission_table() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let file = create_file(&fs, &root, "meta");
    assert_eq!(file.perm().unwrap(), FilePerm::from_bits_truncate(0o644));
    let expected = Permissions::USER_READ
        | Permissions::USER_WRITE
        | Permissions::GROUP_READ
        | Permissions::OTHER_READ;
    assert_eq!(file.permissions().unwrap(), expected);
    assert_eq!(file.atime().unwrap(), NOW);
    assert_eq!(file.ctime().unwrap(), NOW);

    file.set_perm(FilePerm::from_bits_truncate(0o4700)).unwrap();
    file.set_permissions(Permissions::USER_READ | Permissions::GROUP_EXEC)
        .unwrap();
    assert_eq!(file.perm().unwrap(), FilePerm::from_bits_truncate(0o4410));

    let dir = fs
        .create_dir(&root, "private", Some(FilePerm::from_bits_truncate(0o700)))
        .unwrap();
    assert_eq!(dir.perm().unwrap(), FilePerm::from_bits_truncate(0o700));
    let exec = fs
        .create_file(&root, "tool", Some(FilePerm::from_bits_truncate(0o755)))
        .unwrap();
    assert_eq!(exec.perm().unwrap(), FilePerm::from_bits_truncate(0o755));
}

#[test]
fn holes_read_as_zeros() {
    let fs = new_fs();
    let root = fs.root().unwrap();
    let file = create_file(&fs, &root, "sparse");
    let data = pattern(3 * BLOCK_SIZE, 5);
    file.write(0, &data).unwrap();

    fs.edit_raw_inode(file.ino(), |raw| raw.block_ptrs.set_direct(1, BlockId::NULL));
    let mut buf = vec![0xffu8; data.len()];
    assert_eq!(file.read(0, &mut buf).unwrap(), data.len());
    assert_eq!(&buf[..BLOCK_SIZE], &data[..BLOCK_SIZE]);
    assert!(buf[BLOCK_SIZE..2 * BLOCK_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&buf[2 * BLOCK_SIZE..], &data[2 * BLOCK_SIZE..]);

    let err = file.write(BLOCK_SIZE, b"fill").unwrap_err();
    assert_eq!(err.errno(), Unsupported);
}

#[test]
fn volumes_without_type_tags_use_inode_modes() {
    let disk = new_disk(1024 * 1024, &FormatOptions::new());
    let root_block = {
        let fs = mount(&disk);
        first_block_of(&fs, ROOT_INO)
    };

    // Clear the feature and the tags of `.` and `..`, which would otherwise be read
    // as the high byte of the name length.
    let mut raw = read_raw_super_block(disk.as_ref()).unwrap();
    raw.feature_incompat &= !FeatureInCompatSet::FILETYPE.bits();
    disk.write_at(SUPER_BLOCK_OFFSET, raw.as_bytes()).unwrap();
    let block_offset = root_block.to_offset(BLOCK_SIZE);
    disk.write_at(block_offset + 7, &[0]).unwrap();
    disk.write_at(block_offset + 12 + 7, &[0]).unwrap();

    {
        let fs = mount(&disk);
        let root = fs.root().unwrap();
        create_file(&fs, &root, "plain").write(0, b"text").unwrap();
        fs.create_dir(&root, "sub", None).unwrap();
        fs.create_symlink(&root, "link", "plain").unwrap();
    }

    let fs = mount(&disk);
    let root = fs.root().unwrap();
    assert_eq!(root.lookup("plain").unwrap().kind(), NodeKind::File);
    assert_eq!(root.lookup("sub").unwrap().kind(), NodeKind::Directory);
    assert_eq!(root.lookup("link").unwrap().kind(), NodeKind::Symlink);
    let names: Vec<String> = root.entries().unwrap().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, [".", "..", "link", "plain", "sub"]);
    fs.assert_consistent();
}

#[test]
fn mount_rejects_foreign_volumes() {
    let blank = Arc::new(MemDisk::new(1024 * 1024));
    assert_eq!(
        Ext2::open(blank, MountOptions::new()).unwrap_err().errno(),
        BadMagic
    );

    let disk = new_disk(1024 * 1024, &FormatOptions::new());
    let pristine = read_raw_super_block(disk.as_ref()).unwrap();
    let mut raw = pristine;
    raw.feature_incompat |= FeatureInCompatSet::COMPRESSION.bits();
    disk.write_at(SUPER_BLOCK_OFFSET, raw.as_bytes()).unwrap();
    assert_eq!(
        Ext2::open(disk.clone(), MountOptions::new()).unwrap_err().errno(),
        Unsupported
    );

    disk.write_at(SUPER_BLOCK_OFFSET, pristine.as_bytes()).unwrap();
    let image = disk.to_vec();
    let truncated = Arc::new(MemDisk::from_bytes(image[..image.len() / 2].to_vec()));
    assert_eq!(
        Ext2::open(truncated, MountOptions::new()).unwrap_err().errno(),
        CorruptEntry
    );
}

#[test]
fn failed_growth_into_double_indirect_releases_its_table() {
    let disk = new_disk(512 * 1024, &FormatOptions::new().inodes_per_group(16));
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let initial = free_blocks(&fs);

    // The direct and single indirect tiers are full: 268 data blocks and one table.
    let tiers = 12 + 256;
    let file = create_file(&fs, &root, "edge");
    file.write(0, &pattern(tiers * BLOCK_SIZE, 4)).unwrap();
    assert_eq!(file.blocks_count().unwrap(), tiers as u32 + 1);

    // Two blocks are left: one for data and one for the top table, none for the
    // second level table.
    let filler = create_file(&fs, &root, "filler");
    let spare = free_blocks(&fs) as usize - 2;
    assert!(spare > 13 && spare <= tiers + 1);
    filler.write(0, &vec![1u8; (spare - 1) * BLOCK_SIZE]).unwrap();
    assert_eq!(free_blocks(&fs), 2);

    let err = file.extend((tiers + 1) * BLOCK_SIZE).unwrap_err();
    assert_eq!(err.errno(), NoSpaceLeftOnDevice);
    assert_eq!(free_blocks(&fs), 2);
    assert_eq!(file.blocks_count().unwrap(), tiers as u32 + 1);
    assert_eq!(file.data_blocks().unwrap(), tiers);
    fs.assert_consistent();

    fs.remove(&root, "edge").unwrap();
    fs.remove(&root, "filler").unwrap();
    assert_eq!(free_blocks(&fs), initial);
    fs.assert_consistent();
}

#[test]
fn failed_mkdir_leaves_parent_links_alone() {
    let disk = new_disk(256 * 1024, &FormatOptions::new());
    let fs = mount(&disk);
    let root = fs.root().unwrap();
    let filler = create_file(&fs, &root, "filler");

    // Fill the only block of the root: 1000 bytes of slack less 16 for "filler",
    // three maximal records of 264 bytes, then one record of exactly 192 bytes.
    for (i, c) in ['a', 'b', 'c'].into_iter().enumerate() {
        add_raw_entry(&fs, &root, &c.to_string().repeat(MAX_FNAME_LEN), 20 + i as u32);
    }
    add_raw_entry(&fs, &root, &"d".repeat(184), 23);
    assert_eq!(root.data_blocks().unwrap(), 1);

    // One free block: enough for the new directory, not for the root to grow.
    let free = free_blocks(&fs) as usize;
    let data_blocks = if free - 1 <= 12 { free - 1 } else { free - 2 };
    filler.write(0, &vec![1u8; data_blocks * BLOCK_SIZE]).unwrap();
    assert_eq!(free_blocks(&fs), 1);

    let links = root.links().unwrap();
    let err = fs.create_dir(&root, "sub", None).unwrap_err();
    assert_eq!(err.errno(), NoSpaceLeftOnDevice);
    assert_eq!(root.links().unwrap(), links);
    assert_eq!(root.lookup("sub").unwrap_err().errno(), DoesNotExist);
    assert_eq!(root.data_blocks().unwrap(), 1);
}

#[test]
fn damaged_records_do_not_hide_their_neighbours() {
    let disk = new_disk(4 * 1024 * 1024, &FormatOptions::new().blocks_per_group(1024));
    let names: Vec<String> = (0..100).map(|i| format!("entry-{:03}", i)).collect();
    let (bad_type, bad_len, last) = {
        let fs = mount(&disk);
        let root = fs.root().unwrap();
        let dir = fs.create_dir(&root, "damaged", None).unwrap();
        for name in &names {
            create_file(&fs, &dir, name);
        }
        (
            record_location(&fs, &dir, "entry-010"),
            record_location(&fs, &dir, "entry-020"),
            record_location(&fs, &dir, "entry-099"),
        )
    };
    assert_eq!(bad_type.0, bad_len.0);
    assert_ne!(bad_type.0, last.0);

    // An unknown type tag, and a name longer than its record.
    let (bid, offset) = bad_type;
    disk.write_at(bid.to_offset(BLOCK_SIZE) + offset + 7, &[9]).unwrap();
    let (bid, offset) = bad_len;
    disk.write_at(bid.to_offset(BLOCK_SIZE) + offset + 6, &[250]).unwrap();

    let fs = mount(&disk);
    let dir = fs.root().unwrap().lookup("damaged").unwrap();
    for name in &names {
        let res = dir.lookup(name);
        if name == "entry-010" || name == "entry-020" {
            assert_eq!(res.unwrap_err().errno(), DoesNotExist);
        } else {
            assert!(res.is_ok(), "lost {}: {:?}", name, res.unwrap_err());
        }
    }
    assert_eq!(dir.entries().unwrap().len(), 2 + names.len() - 2);
}
