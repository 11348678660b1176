// SPDX-License-Identifier: MPL-2.0

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    block_mapper::BlockMapper,
    fs::FsCtx,
    inode::{FileType, InodeDesc, MAX_FNAME_LEN},
    node::NodeKind,
    prelude::*,
};

/// The header of a directory record. The name bytes follow it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DirEntryHeader {
    /// Inode number, zero for free space.
    ino: u32,
    /// The distance to the next record.
    rec_len: u16,
    /// Name length.
    name_len: u8,
    /// Type indicator, or the high byte of the name length without the FILETYPE feature.
    file_type: u8,
}

const HEADER_SIZE: usize = core::mem::size_of::<DirEntryHeader>();

const_assert_eq!(HEADER_SIZE, 8);

/// Returns the smallest record length able to hold a name of `name_len` bytes.
pub(crate) fn record_len(name_len: usize) -> usize {
    (HEADER_SIZE + name_len).next_multiple_of(4)
}

/// The type indicator of a directory record.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DirEntryFileType {
    Unknown = 0,
    File = 1,
    Dir = 2,
    Char = 3,
    Block = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl TryFrom<u8> for DirEntryFileType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let type_ = match value {
            0 => Self::Unknown,
            1 => Self::File,
            2 => Self::Dir,
            3 => Self::Char,
            4 => Self::Block,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            _ => return_errno_with_msg!(CorruptEntry, "invalid directory entry type"),
        };
        Ok(type_)
    }
}

impl From<FileType> for DirEntryFileType {
    fn from(file_type: FileType) -> Self {
        match file_type {
            FileType::Fifo => Self::Fifo,
            FileType::Char => Self::Char,
            FileType::Dir => Self::Dir,
            FileType::Block => Self::Block,
            FileType::File => Self::File,
            FileType::Symlink => Self::Symlink,
            FileType::Socket => Self::Socket,
        }
    }
}

/// The in-memory summary of one live directory record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CachedEntry {
    pub ino: u32,
    pub type_: DirEntryFileType,
    /// The logical block of the directory holding the record.
    pub block_idx: usize,
    /// The offset of the record inside that block.
    pub offset: usize,
}

/// A record as found while walking a directory block.
#[derive(Debug)]
struct RawRecord<'a> {
    offset: usize,
    ino: u32,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
    /// The bytes after the header, up to the end of the record.
    payload: &'a [u8],
}

impl<'a> RawRecord<'a> {
    /// Returns the name, or `None` if it does not fit inside the record.
    fn name(&self) -> Option<&'a [u8]> {
        self.payload.get(..self.name_len)
    }

    /// Returns the space this record could give up to a following record.
    fn slack(&self) -> usize {
        self.rec_len.saturating_sub(record_len(self.name_len))
    }
}

/// Walks the records of one directory block.
///
/// A record with an impossible length ends the walk of its block, since the
/// position of any following record is unknown.
struct RecordIter<'a> {
    buf: &'a [u8],
    offset: usize,
    filetype: bool,
}

impl<'a> RecordIter<'a> {
    fn new(buf: &'a [u8], filetype: bool) -> Self {
        Self {
            buf,
            offset: 0,
            filetype,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = RawRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset;
        if offset + HEADER_SIZE > self.buf.len() {
            return None;
        }

        let (header, _) = DirEntryHeader::read_from_prefix(&self.buf[offset..]).ok()?;
        let rec_len = header.rec_len as usize;
        if rec_len < HEADER_SIZE || rec_len % 4 != 0 || offset + rec_len > self.buf.len() {
            warn!(
                "ext2: corrupt directory record at offset {} with length {}",
                offset, rec_len
            );
            self.offset = self.buf.len();
            return None;
        }
        self.offset += rec_len;

        let (name_len, file_type) = if self.filetype {
            (header.name_len as usize, header.file_type)
        } else {
            ((header.name_len as usize) | ((header.file_type as usize) << 8), 0)
        };
        Some(RawRecord {
            offset,
            ino: header.ino,
            rec_len,
            name_len,
            file_type,
            payload: &self.buf[offset + HEADER_SIZE..offset + rec_len],
        })
    }
}

/// Writes a record into `buf` at `offset`, spanning `rec_len` bytes.
pub(crate) fn put_record(
    buf: &mut [u8],
    offset: usize,
    rec_len: usize,
    ino: u32,
    name: &[u8],
    type_: DirEntryFileType,
    filetype: bool,
) {
    let header = DirEntryHeader {
        ino,
        rec_len: rec_len as u16,
        name_len: name.len() as u8,
        file_type: if filetype { type_ as u8 } else { 0 },
    };
    let record = &mut buf[offset..offset + rec_len];
    record.fill(0);
    record[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    record[HEADER_SIZE..HEADER_SIZE + name.len()].copy_from_slice(name);
}

/// Turns the live record at `offset` into free space, keeping its length.
fn clear_record(buf: &mut [u8], offset: usize) -> Result<()> {
    let (header, _) = DirEntryHeader::read_from_prefix(&buf[offset..])
        .map_err(|_| Error::with_msg(CorruptEntry, "short directory record"))?;
    let rec_len = header.rec_len as usize;
    if rec_len < HEADER_SIZE || offset + rec_len > buf.len() {
        return_errno_with_msg!(CorruptEntry, "directory record crosses the block boundary");
    }
    buf[offset..offset + rec_len].fill(0);
    let free = DirEntryHeader {
        rec_len: header.rec_len,
        ..Default::default()
    };
    buf[offset..offset + HEADER_SIZE].copy_from_slice(free.as_bytes());
    Ok(())
}

/// The name to inode mapping of a directory, kept in the directory's data blocks.
///
/// The contents are read once, on first use, into an index by name. Every structural
/// change updates both the on-disk block and the index.
#[derive(Debug)]
pub(crate) struct DirectoryEntryStore {
    entries: Option<BTreeMap<String, CachedEntry>>,
    filetype: bool,
}

impl DirectoryEntryStore {
    /// Creates the store of a directory; `filetype` tells whether records carry type tags.
    pub fn new(filetype: bool) -> Self {
        Self {
            entries: None,
            filetype,
        }
    }

    /// Reads every block of the directory into the index, if not done yet.
    ///
    /// Free records are skipped. A damaged record is logged and skipped; the rest of
    /// its block is still read when the record length is sound.
    pub fn cache_contents(&mut self, mapper: &mut BlockMapper, cache: &BlockCache) -> Result<()> {
        if self.entries.is_some() {
            return Ok(());
        }

        let mut entries = BTreeMap::new();
        let mut buf = vec![0u8; cache.block_size()];
        for block_idx in 0..mapper.len() {
            let bid = mapper.resolve(cache, block_idx)?;
            if bid.is_null() {
                continue;
            }
            cache.read_block(bid, &mut buf)?;

            for record in RecordIter::new(&buf, self.filetype) {
                if record.ino == 0 {
                    continue;
                }
                let Some(name) = self.parse_name(&record) else {
                    continue;
                };
                let type_ = match DirEntryFileType::try_from(record.file_type) {
                    Ok(type_) => type_,
                    Err(_) => {
                        warn!(
                            "ext2: skipping directory record '{}' with type tag {}",
                            name, record.file_type
                        );
                        continue;
                    }
                };
                if entries.contains_key(&name) {
                    warn!("ext2: skipping duplicated directory record '{}'", name);
                    continue;
                }
                entries.insert(
                    name,
                    CachedEntry {
                        ino: record.ino,
                        type_,
                        block_idx,
                        offset: record.offset,
                    },
                );
            }
        }

        self.entries = Some(entries);
        Ok(())
    }

    fn parse_name(&self, record: &RawRecord<'_>) -> Option<String> {
        let Some(name) = record.name() else {
            warn!(
                "ext2: skipping directory record at offset {} whose name overflows it",
                record.offset
            );
            return None;
        };
        match core::str::from_utf8(name) {
            Ok(name) if !name.is_empty() => Some(String::from(name)),
            _ => {
                warn!(
                    "ext2: skipping directory record at offset {} with a malformed name",
                    record.offset
                );
                None
            }
        }
    }

    /// Looks up `name`.
    pub fn lookup(
        &mut self,
        mapper: &mut BlockMapper,
        cache: &BlockCache,
        name: &str,
    ) -> Result<Option<CachedEntry>> {
        Ok(self.index(mapper, cache)?.get(name).copied())
    }

    /// Returns every live entry, `.` and `..` included, ordered by name.
    pub fn entries(
        &mut self,
        mapper: &mut BlockMapper,
        cache: &BlockCache,
    ) -> Result<Vec<(String, CachedEntry)>> {
        Ok(self
            .index(mapper, cache)?
            .iter()
            .map(|(name, entry)| (name.clone(), *entry))
            .collect())
    }

    /// Returns whether the directory holds nothing but `.` and `..`.
    pub fn is_empty_dir(&mut self, mapper: &mut BlockMapper, cache: &BlockCache) -> Result<bool> {
        Ok(self
            .index(mapper, cache)?
            .keys()
            .all(|name| name == "." || name == ".."))
    }

    /// Adds a record mapping `name` to the inode `ino`.
    ///
    /// The first record with enough room is used: either a live record longer than its
    /// name needs, which is shrunk, or a free record, whose length is kept. Without
    /// room, the directory grows by one block. The caller accounts for the new link.
    pub fn add_entry(
        &mut self,
        mapper: &mut BlockMapper,
        desc: &mut InodeDesc,
        ctx: &mut FsCtx<'_>,
        name: &str,
        ino: u32,
        type_: DirEntryFileType,
    ) -> Result<()> {
        if name.is_empty() || name.len() > MAX_FNAME_LEN {
            return_errno_with_msg!(NameTooLong, "the name does not fit a directory record");
        }
        self.cache_contents(mapper, ctx.cache)?;

        let needed = record_len(name.len());
        let block_size = ctx.cache.block_size();
        let mut buf = vec![0u8; block_size];
        for block_idx in 0..mapper.len() {
            let bid = mapper.resolve(ctx.cache, block_idx)?;
            if bid.is_null() {
                continue;
            }
            ctx.cache.read_block(bid, &mut buf)?;
            if let Some(offset) = self.place_in_block(&mut buf, needed, name, ino, type_) {
                ctx.cache.write_block(bid, &buf)?;
                self.insert_cached(name, ino, type_, block_idx, offset);
                return Ok(());
            }
        }

        // No room left: grow by one block holding a single free record.
        let block_idx = mapper.len();
        mapper.ensure_size(desc, ctx, (block_idx + 1) * block_size, false)?;
        let bid = mapper.resolve(ctx.cache, block_idx)?;
        buf.fill(0);
        put_record(
            &mut buf,
            0,
            block_size,
            0,
            &[],
            DirEntryFileType::Unknown,
            self.filetype,
        );
        let offset = self
            .place_in_block(&mut buf, needed, name, ino, type_)
            .ok_or_else(|| Error::algorithmic("a fresh directory block has no room"))?;
        ctx.cache.write_block(bid, &buf)?;
        self.insert_cached(name, ino, type_, block_idx, offset);
        Ok(())
    }

    /// Places a record in the first slot of `buf` that fits, returning its offset.
    fn place_in_block(
        &self,
        buf: &mut [u8],
        needed: usize,
        name: &str,
        ino: u32,
        type_: DirEntryFileType,
    ) -> Option<usize> {
        let (offset, rec_len) = RecordIter::new(buf, self.filetype).find_map(|record| {
            if record.ino == 0 && record.rec_len >= needed {
                return Some((record.offset, record.rec_len));
            }
            if record.ino != 0 && record.name().is_some() && record.slack() >= needed {
                // Shrink the live record to its minimal length, then take the rest.
                let kept = record_len(record.name_len);
                return Some((record.offset + kept, record.rec_len - kept));
            }
            None
        })?;

        if offset > 0 {
            // Shrink the preceding live record, if any, so that it ends at `offset`.
            let prev = RecordIter::new(buf, self.filetype)
                .find(|record| record.offset < offset && record.offset + record.rec_len > offset)
                .map(|record| record.offset);
            if let Some(prev_offset) = prev {
                let shrunk = (offset - prev_offset) as u16;
                buf[prev_offset + 4..prev_offset + 6].copy_from_slice(&shrunk.to_le_bytes());
            }
        }

        put_record(buf, offset, rec_len, ino, name.as_bytes(), type_, self.filetype);
        Some(offset)
    }

    fn insert_cached(
        &mut self,
        name: &str,
        ino: u32,
        type_: DirEntryFileType,
        block_idx: usize,
        offset: usize,
    ) {
        if let Some(entries) = self.entries.as_mut() {
            entries.insert(
                String::from(name),
                CachedEntry {
                    ino,
                    type_,
                    block_idx,
                    offset,
                },
            );
        }
    }

    /// Removes the record mapping `name` to `ino`.
    ///
    /// The record becomes free space of the same length; it is not merged into its
    /// neighbours. The caller accounts for the dropped link.
    pub fn remove_entry(
        &mut self,
        mapper: &mut BlockMapper,
        cache: &BlockCache,
        name: &str,
        ino: u32,
    ) -> Result<CachedEntry> {
        let entry = match self.lookup(mapper, cache, name)? {
            Some(entry) if entry.ino == ino => entry,
            _ => return_errno_with_msg!(DoesNotExist, "no such directory entry"),
        };

        let bid = mapper.resolve(cache, entry.block_idx)?;
        if bid.is_null() {
            return Err(Error::algorithmic("a cached entry lives in a hole"));
        }
        let mut buf = vec![0u8; cache.block_size()];
        cache.read_block(bid, &mut buf)?;
        clear_record(&mut buf, entry.offset)?;
        cache.write_block(bid, &buf)?;

        if let Some(entries) = self.entries.as_mut() {
            entries.remove(name);
        }
        Ok(entry)
    }

    /// Returns the kind of node an entry points to.
    ///
    /// The type tag is trusted when present; otherwise the target inode's mode decides.
    pub fn entry_kind(&self, entry: &CachedEntry, ctx: &FsCtx<'_>) -> Result<NodeKind> {
        let file_type = match entry.type_ {
            DirEntryFileType::File => FileType::File,
            DirEntryFileType::Dir => FileType::Dir,
            DirEntryFileType::Symlink => FileType::Symlink,
            DirEntryFileType::Unknown => {
                let raw = ctx.table.read(ctx.cache, entry.ino)?;
                FileType::from_raw_mode(raw.mode)?
            }
            _ => return_errno_with_msg!(Unsupported, "special files are not supported"),
        };
        NodeKind::try_from(file_type)
    }

    fn index(
        &mut self,
        mapper: &mut BlockMapper,
        cache: &BlockCache,
    ) -> Result<&BTreeMap<String, CachedEntry>> {
        self.cache_contents(mapper, cache)?;
        self.entries
            .as_ref()
            .ok_or_else(|| Error::algorithmic("directory contents are not cached"))
    }
}
