//! Zero-sum block checksum and free-bit population count.
//!
//! A bitmap block is a sequence of big-endian `u32` words. Word 0 is the
//! checksum; it is chosen so the wrapping sum of the entire block is zero.
//! That invariant is what makes the allocator's incremental updates work:
//! adding `mask` to a payload word and subtracting `mask` from the
//! checksum word keeps the block valid without a full recompute.
//!
//! All byte-order handling lives here. Callers index words with
//! [`word_at`] / [`set_word_at`] and otherwise operate on host-native
//! integers.

/// Byte offset of the first payload word.
pub const PAYLOAD_OFFSET: usize = 4;

/// 16-entry population-count table, indexed by nibble.
const NIBBLE_ONES: [u8; 16] = [0, 1, 1, 2, 1, 2, 1, 2, 2, 3, 2, 3, 2, 3, 3, 4];

/// Decode big-endian word `index` of `block`.
#[must_use]
pub fn word_at(block: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_be_bytes([block[at], block[at + 1], block[at + 2], block[at + 3]])
}

/// Encode `value` as big-endian word `index` of `block`.
pub fn set_word_at(block: &mut [u8], index: usize, value: u32) {
    let at = index * 4;
    block[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Compute the checksum word for `block`: the wrapping negation of the sum
/// of every other word (the checksum slot itself is treated as zero).
#[must_use]
pub fn checksum_of(block: &[u8]) -> u32 {
    debug_assert_eq!(block.len() % 4, 0);
    let mut sum = 0_u32;
    for word in 1..block.len() / 4 {
        sum = sum.wrapping_add(word_at(block, word));
    }
    0_u32.wrapping_sub(sum)
}

/// Write the correct checksum into word 0 of `block`.
pub fn stamp(block: &mut [u8]) {
    let csum = checksum_of(block);
    set_word_at(block, 0, csum);
}

/// Whether the wrapping sum of the whole block (checksum word included)
/// is zero.
#[must_use]
pub fn validate(block: &[u8]) -> bool {
    debug_assert_eq!(block.len() % 4, 0);
    let mut sum = 0_u32;
    for word in 0..block.len() / 4 {
        sum = sum.wrapping_add(word_at(block, word));
    }
    sum == 0
}

/// Add `delta` to the checksum word, wrapping.
///
/// Used by the incremental-update paths: a payload word that changed by
/// `+mask` pairs with a checksum change of `-mask`, and vice versa.
pub fn adjust(block: &mut [u8], delta: u32) {
    let csum = word_at(block, 0).wrapping_add(delta);
    set_word_at(block, 0, csum);
}

/// Count set bits (free blocks) in the payload of `block`, skipping the
/// checksum word. Hot path: runs over every bitmap block at Init.
#[must_use]
pub fn free_bits(block: &[u8]) -> u32 {
    let mut free = 0_u32;
    for &byte in &block[PAYLOAD_OFFSET..] {
        free += u32::from(NIBBLE_ONES[usize::from(byte & 0x0F)]);
        free += u32::from(NIBBLE_ONES[usize::from(byte >> 4)]);
    }
    free
}
