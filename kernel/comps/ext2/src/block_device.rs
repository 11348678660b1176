// SPDX-License-Identifier: MPL-2.0

use spin::Mutex;

use crate::prelude::*;

/// A byte-addressable storage device holding an ext2 volume.
///
/// The driver only touches the device through the `BlockCache`,
/// which always transfers whole filesystem blocks.
pub trait BlockDevice: Send + Sync + Debug {
    /// Reads `buf.len()` bytes starting at the byte `offset`.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` starting at the byte `offset`.
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()>;

    /// Returns the size of the device in bytes.
    fn size(&self) -> usize;

    /// Waits until every completed write has reached the medium.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A RAM-backed device.
pub struct MemDisk {
    bytes: Mutex<Vec<u8>>,
}

impl MemDisk {
    /// Creates a zero-filled disk of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0u8; size])
    }

    /// Creates a disk over an existing image.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copies out the whole image.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn check_range(len: usize, offset: usize, size: usize) -> Result<core::ops::Range<usize>> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::with_msg(InvalidArgs, "device offset overflows"))?;
        if end > size {
            return_errno_with_msg!(IoFailed, "access beyond the end of the device");
        }
        Ok(offset..end)
    }
}

impl BlockDevice for MemDisk {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let range = Self::check_range(buf.len(), offset, bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let range = Self::check_range(buf.len(), offset, bytes.len())?;
        bytes[range].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> usize {
        self.bytes.lock().len()
    }
}

impl Debug for MemDisk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemDisk")
            .field("size", &self.size())
            .finish()
    }
}
