//! Derived, purely computed geometry. Everything here is a pure function
//! of [`crate::metadata::Metadata`] and is read-only once the image is open.

use crate::metadata::Metadata;

/// Ceiling division, as used throughout the on-disk layout math.
fn ceil_division(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// `floor(log2(n))`, or `None` for `n == 0`.
fn log2(n: u64) -> Option<u64> {
    if n == 0 {
        None
    } else {
        Some(63 - n.leading_zeros() as u64)
    }
}

/// Quantities derived once from a [`Metadata`] at open time: block and
/// index-table geometry that every other component needs but none of them
/// owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The block size, in bytes.
    pub block_size: u64,
    /// Bytes reserved for the inode table.
    pub file_index_size: u64,
    /// Total size of the disk image, in bytes.
    pub file_system_size: u64,
    /// Width of the name field, in bytes.
    pub file_name_size: u64,

    /// Total number of data blocks the image can hold.
    pub num_blocks: u64,
    /// Bytes needed to encode any block count or block index.
    pub max_file_blocks_width: usize,
    /// Size of the bitmap region, in bytes.
    pub bitmap_size: u64,
    /// Size of a single encoded inode entry, in bytes.
    pub index_entry_size: u64,
    /// Maximum number of inodes the index table can hold.
    pub max_index_entries: u64,
}

impl Config {
    /// Derives the full geometry from a loaded [`Metadata`].
    pub fn from_metadata(meta: &Metadata) -> Self {
        let num_blocks = meta.file_system_size / meta.block_size;
        // math.ceil(math.log2(num_blocks) / 8), with num_blocks a power of
        // two landing on the exact exponent rather than the next one up.
        let n = num_blocks.max(1);
        let e = log2(n).unwrap_or(0);
        let bits_needed = if n.is_power_of_two() { e } else { e + 1 };
        let max_file_blocks_width = ceil_division(bits_needed.max(1), 8) as usize;
        let bitmap_size = num_blocks / 8;

        let index_entry_size = 4
            + meta.file_name_size
            + max_file_blocks_width as u64
            + max_file_blocks_width as u64
            + 1
            + max_file_blocks_width as u64
            + 4
            + 4;
        let max_index_entries = meta.file_index_size / index_entry_size;

        Self {
            block_size: meta.block_size,
            file_index_size: meta.file_index_size,
            file_system_size: meta.file_system_size,
            file_name_size: meta.file_name_size,
            num_blocks,
            max_file_blocks_width,
            bitmap_size,
            index_entry_size,
            max_index_entries,
        }
    }

    /// Byte offset of the first data block on the disk image.
    pub fn data_region_offset(&self) -> u64 {
        self.bitmap_size + self.file_index_size
    }

    /// Byte offset of block `block` on the disk image.
    pub fn block_offset(&self, block: u32) -> u64 {
        self.data_region_offset() + block as u64 * self.block_size
    }

    /// Byte offset of the index slot at `slot`.
    pub fn index_slot_offset(&self, slot: u64) -> u64 {
        self.bitmap_size + slot * self.index_entry_size
    }

    /// Total minimum size the backing image must have.
    pub fn required_image_size(&self) -> u64 {
        self.bitmap_size + self.file_index_size + self.file_system_size
    }
}
