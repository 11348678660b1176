// SPDX-License-Identifier: MPL-2.0

use alloc::boxed::Box;

use lru::LruCache;
use spin::Mutex;

use crate::{block_device::BlockDevice, prelude::*};

/// `BlockCache` keeps recently used filesystem blocks in memory on top of a `BlockDevice`.
///
/// Every write goes through to the device before the call returns, so the cache never
/// holds dirty data and an evicted block is simply dropped. A block may be pinned to
/// keep it resident across a multi-step operation; pinned blocks are never evicted.
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    capacity: usize,
    blocks: Mutex<LruCache<BlockId, CachedBlock>>,
}

struct CachedBlock {
    data: Box<[u8]>,
    pins: usize,
}

impl BlockCache {
    /// Creates a cache of `block_size`-byte blocks which keeps at most
    /// `capacity` unpinned blocks resident.
    pub fn new(device: Arc<dyn BlockDevice>, block_size: usize, capacity: usize) -> Self {
        Self {
            device,
            block_size,
            capacity: capacity.max(1),
            blocks: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Returns the underlying device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Returns the size of block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Reads the whole block `bid` into `buf`.
    pub fn read_block(&self, bid: BlockId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return_errno_with_msg!(InvalidArgs, "buffer is not block sized");
        }
        self.read_at(bid, 0, buf)
    }

    /// Reads `buf.len()` bytes at `offset` inside the block `bid`.
    pub fn read_at(&self, bid: BlockId, offset: usize, buf: &mut [u8]) -> Result<()> {
        let range = self.range_in_block(offset, buf.len())?;
        self.with_block(bid, |block| buf.copy_from_slice(&block.data[range]))
    }

    /// Replaces the whole block `bid` with `buf` and writes it to the device.
    pub fn write_block(&self, bid: BlockId, buf: &[u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return_errno_with_msg!(InvalidArgs, "buffer is not block sized");
        }
        self.device.write_at(bid.to_offset(self.block_size), buf)?;

        let mut blocks = self.blocks.lock();
        if let Some(block) = blocks.get_mut(&bid) {
            block.data.copy_from_slice(buf);
        } else {
            self.make_room(&mut blocks);
            blocks.put(
                bid,
                CachedBlock {
                    data: buf.into(),
                    pins: 0,
                },
            );
        }
        Ok(())
    }

    /// Writes `buf` at `offset` inside the block `bid`, then writes the block to the device.
    pub fn write_at(&self, bid: BlockId, offset: usize, buf: &[u8]) -> Result<()> {
        let range = self.range_in_block(offset, buf.len())?;
        self.update(bid, |data| data[range].copy_from_slice(buf))
    }

    /// Fills the block `bid` with zeros on the device.
    pub fn zero_block(&self, bid: BlockId) -> Result<()> {
        let zeros = vec![0u8; self.block_size];
        self.write_block(bid, &zeros)
    }

    /// Modifies the content of the block `bid` in place and writes it to the device.
    pub fn update<R>(&self, bid: BlockId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let offset = bid.to_offset(self.block_size);
        let device = &self.device;
        self.with_block(bid, |block| {
            let res = f(&mut block.data[..]);
            device.write_at(offset, &block.data[..]).map(|_| res)
        })?
    }

    /// Pins the block `bid` in memory until the returned guard is dropped.
    pub fn pin(&self, bid: BlockId) -> Result<PinnedBlock<'_>> {
        self.with_block(bid, |block| block.pins += 1)?;
        Ok(PinnedBlock { cache: self, bid })
    }

    /// Returns how many pins are held on the block `bid`.
    pub fn pin_count(&self, bid: BlockId) -> usize {
        self.blocks.lock().peek(&bid).map_or(0, |block| block.pins)
    }

    /// Returns the number of pins held over all blocks.
    pub fn total_pins(&self) -> usize {
        self.blocks.lock().iter().map(|(_, block)| block.pins).sum()
    }

    /// Returns the number of resident blocks.
    pub fn resident_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Flushes the device.
    pub fn flush(&self) -> Result<()> {
        self.device.flush()
    }

    fn unpin(&self, bid: BlockId) {
        let mut blocks = self.blocks.lock();
        match blocks.peek_mut(&bid) {
            Some(block) if block.pins > 0 => block.pins -= 1,
            _ => warn!("ext2: unbalanced unpin of block {}", bid.to_raw()),
        }
    }

    /// Runs `f` on the cached block `bid`, loading it from the device on a miss.
    fn with_block<R>(&self, bid: BlockId, f: impl FnOnce(&mut CachedBlock) -> R) -> Result<R> {
        let mut blocks = self.blocks.lock();
        if !blocks.contains(&bid) {
            let mut data = vec![0u8; self.block_size].into_boxed_slice();
            self.device
                .read_at(bid.to_offset(self.block_size), &mut data)?;
            self.make_room(&mut blocks);
            blocks.put(bid, CachedBlock { data, pins: 0 });
        }
        let block = blocks
            .get_mut(&bid)
            .ok_or(Error::with_msg(IoFailed, "cached block vanished"))?;
        Ok(f(block))
    }

    /// Evicts the least recently used unpinned blocks until there is room for one more.
    ///
    /// The cache grows past its capacity when every resident block is pinned.
    fn make_room(&self, blocks: &mut LruCache<BlockId, CachedBlock>) {
        while blocks.len() >= self.capacity {
            let victim = blocks
                .iter()
                .rev()
                .find(|(_, block)| block.pins == 0)
                .map(|(bid, _)| *bid);
            match victim {
                Some(bid) => {
                    blocks.pop(&bid);
                }
                None => break,
            }
        }
    }

    fn range_in_block(&self, offset: usize, len: usize) -> Result<core::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.block_size => Ok(offset..end),
            _ => return_errno_with_msg!(InvalidArgs, "access crosses the block boundary"),
        }
    }
}

impl Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("device", &self.device)
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("resident", &self.resident_blocks())
            .finish()
    }
}

/// A block held resident in the `BlockCache`.
///
/// The pin is released when the guard is dropped, on every exit path.
#[derive(Debug)]
pub struct PinnedBlock<'a> {
    cache: &'a BlockCache,
    bid: BlockId,
}

impl PinnedBlock<'_> {
    pub fn bid(&self) -> BlockId {
        self.bid
    }

    /// Copies the whole block out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.cache.block_size()];
        self.cache.read_block(self.bid, &mut buf)?;
        Ok(buf)
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.cache.read_at(self.bid, offset, buf)
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.cache.write_at(self.bid, offset, buf)
    }
}

impl Drop for PinnedBlock<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.bid);
    }
}
