#![forbid(unsafe_code)]
//! Shared newtypes and volume geometry for AmiFS.
//!
//! This crate is intentionally independent of the runtime error crate
//! (`amifs-error`): geometry validation failures are reported through the
//! crate-local [`GeometryError`] and converted at the consuming crate's
//! boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of bitmap-block pointers held inline in the root block. Pointers
/// beyond these live in the bitmap extension chain.
pub const ROOT_BITMAP_POINTERS: usize = 25;

/// Size in bytes of the checksum word prefixing every bitmap block.
pub const CHECKSUM_BYTES: u32 = 4;

/// Absolute block number on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Index into the bitmap directory (which physical bitmap block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BitmapIndex(pub usize);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid block size {0}: must be a multiple of 4 and at least 8 bytes")]
    InvalidBlockSize(u32),
    #[error("reserved blocks ({reserved}) must be below partition size ({partition_size})")]
    ReservedExceedsPartition { reserved: u64, partition_size: u64 },
}

/// Validated per-volume geometry: the parameters every bitmap computation
/// derives from.
///
/// The first `reserved` blocks are never part of the bitmap's addressable
/// range; bit 0 of bitmap block 0 corresponds to volume block `reserved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    reserved: u64,
    partition_size: u64,
    block_size: u32,
}

impl VolumeGeometry {
    /// Create a geometry if the parameters are structurally valid.
    ///
    /// `block_size` must hold the 32-bit checksum word plus at least one
    /// 32-bit payload word, and must be word-aligned.
    pub fn new(
        reserved: u64,
        partition_size: u64,
        block_size: u32,
    ) -> Result<Self, GeometryError> {
        if block_size % 4 != 0 || block_size < 8 {
            return Err(GeometryError::InvalidBlockSize(block_size));
        }
        if reserved >= partition_size {
            return Err(GeometryError::ReservedExceedsPartition {
                reserved,
                partition_size,
            });
        }
        Ok(Self {
            reserved,
            partition_size,
            block_size,
        })
    }

    #[must_use]
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    #[must_use]
    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Usable free/used bits per bitmap block: everything after the
    /// checksum word.
    #[must_use]
    pub fn bits_per_bitmap_block(&self) -> u32 {
        self.block_size * 8 - CHECKSUM_BYTES * 8
    }

    /// Payload words per bitmap block (32 bits each).
    #[must_use]
    pub fn words_per_bitmap_block(&self) -> usize {
        (self.bits_per_bitmap_block() / 32) as usize
    }

    /// Bitmap pointers per extension block: every word except the trailing
    /// next-extension pointer.
    #[must_use]
    pub fn pointers_per_extension_block(&self) -> usize {
        (self.block_size / 4 - 1) as usize
    }

    /// Number of bitmap blocks needed to cover the addressable range.
    #[must_use]
    pub fn bitmap_block_count(&self) -> usize {
        let addressable = self.partition_size - self.reserved;
        let bits = u64::from(self.bits_per_bitmap_block());
        #[expect(clippy::cast_possible_truncation)]
        {
            addressable.div_ceil(bits) as usize
        }
    }

    /// Bits used in the last bitmap block, or 0 if the addressable range
    /// fills it exactly.
    #[must_use]
    pub fn tail_bits(&self) -> u32 {
        let addressable = self.partition_size - self.reserved;
        #[expect(clippy::cast_possible_truncation)]
        {
            (addressable % u64::from(self.bits_per_bitmap_block())) as u32
        }
    }

    /// Whether `block` falls inside the bitmap's addressable range.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        block.0 >= self.reserved && block.0 < self.partition_size
    }

    /// Map an addressable block to its (bitmap index, bit position).
    ///
    /// Returns `None` for blocks outside the addressable range.
    #[must_use]
    pub fn bitmap_position(&self, block: BlockNumber) -> Option<(BitmapIndex, u32)> {
        if !self.contains(block) {
            return None;
        }
        let logical = block.0 - self.reserved;
        let bits = u64::from(self.bits_per_bitmap_block());
        #[expect(clippy::cast_possible_truncation)]
        let index = (logical / bits) as usize;
        #[expect(clippy::cast_possible_truncation)]
        let bit = (logical % bits) as u32;
        Some((BitmapIndex(index), bit))
    }

    /// Map a (bitmap index, bit position) back to the absolute block number.
    #[must_use]
    pub fn block_at(&self, index: BitmapIndex, bit: u32) -> BlockNumber {
        let logical =
            index.0 as u64 * u64::from(self.bits_per_bitmap_block()) + u64::from(bit);
        BlockNumber(self.reserved + logical)
    }
}
