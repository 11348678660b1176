// SPDX-License-Identifier: MPL-2.0

use bitvec::prelude::{BitVec, Lsb0};

use crate::prelude::*;

/// An allocation bitmap of one block group.
///
/// A set bit means the block (or inode) is in use. Bit `i` lives in byte `i / 8`
/// at position `i % 8`, which is the bit order ext2 keeps on disk.
#[derive(Clone)]
pub(crate) struct Bitmap {
    bitset: BitVec<u8, Lsb0>,
    first_available_id: usize,
}

impl Bitmap {
    /// Constructs a bitmap from the raw bytes of an on-disk bitmap block.
    ///
    /// Only the first `capacity` bits are tracked; the rest of the block is padding.
    pub fn from_bytes_with_capacity(slice: &[u8], capacity: usize) -> Self {
        let bitset = if capacity > slice.len() * 8 {
            let mut bitset = BitVec::from_slice(slice);
            bitset.resize(capacity, true);
            bitset
        } else {
            let mut bitset = BitVec::from_slice(&slice[..capacity.div_ceil(8)]);
            bitset.truncate(capacity);
            bitset
        };

        let first_available_id = bitset.first_zero().unwrap_or(bitset.len());
        Self {
            bitset,
            first_available_id,
        }
    }

    /// Allocates the lowest free id.
    ///
    /// If every id is in use, it returns `None`.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.first_available_id >= self.bitset.len() {
            return None;
        }

        let id = self.first_available_id;
        self.bitset.set(id, true);
        self.first_available_id = self.next_available_from(id + 1);
        Some(id)
    }

    /// Releases the `id`.
    ///
    /// Returns `false` if the `id` was already free, leaving the bitmap untouched.
    ///
    /// # Panics
    ///
    /// If the `id` is out of bounds, this method will panic.
    pub fn free(&mut self, id: usize) -> bool {
        if !self.bitset[id] {
            return false;
        }
        self.bitset.set(id, false);
        if id < self.first_available_id {
            self.first_available_id = id;
        }
        true
    }

    /// Returns true if the `id` is allocated.
    ///
    /// # Panics
    ///
    /// If the `id` is out of bounds, this method will panic.
    pub fn is_allocated(&self, id: usize) -> bool {
        self.bitset[id]
    }

    fn next_available_from(&self, start: usize) -> usize {
        (start..self.bitset.len())
            .find(|&i| !self.bitset[i])
            .unwrap_or(self.bitset.len())
    }
}

impl Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.bitset.len())
            .field("first_available_id", &self.first_available_id)
            .finish()
    }
}

/// Returns the byte holding bit `id` and the mask of that bit inside it.
pub(crate) fn bit_position(id: usize) -> (usize, u8) {
    (id / 8, 1 << (id % 8))
}

#[cfg(test)]
impl Bitmap {
    pub fn len(&self) -> usize {
        self.bitset.len()
    }

    pub fn count_free(&self) -> usize {
        self.bitset.count_zeros()
    }
}
