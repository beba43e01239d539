#![forbid(unsafe_code)]
//! Free-space bitmap allocator.
//!
//! Tracks, for every addressable block on a volume, whether that block is
//! free or in use. The on-disk structure is a linear bitmap split across
//! fixed-size bitmap blocks (located by the root block's pointer list plus
//! an extension chain), each prefixed by a zero-sum checksum word. Bit
//! value 1 means free.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **[`checksum`]** — byte-order handling, zero-sum checksum,
//!    nibble-table popcount.
//! 2. **Slot cache** — the single currently pinned bitmap block,
//!    write-through (every mutation is flushed before the operation
//!    returns, so swap-out never writes back).
//! 3. **Bitmap directory** — one descriptor per bitmap block: on-disk
//!    location plus a cached free-bit count, built once at Init.
//! 4. **[`BitmapAllocator`]** — goal-directed allocate with same-word
//!    preallocation capture, idempotent free, O(directory) free counting.
//!
//! One `parking_lot::Mutex` guards the directory, the cache, and every
//! cached free count; it is held for the full duration of each call,
//! including block I/O. [`Prealloc`] is deliberately outside the lock: it
//! is owned per calling context (typically per open file) and consumed
//! without touching the bitmap at all.

pub mod checksum;

use amifs_block::BlockDevice;
use amifs_error::{AmifsError, Result};
use amifs_types::{BitmapIndex, BlockNumber, ROOT_BITMAP_POINTERS, VolumeGeometry};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

// ── Bitmap locations ────────────────────────────────────────────────────────

/// Where the volume's bitmap blocks live, as recorded by the root block.
#[derive(Debug, Clone, Default)]
pub struct BitmapLocations {
    /// Inline pointer list from the root block
    /// (up to [`ROOT_BITMAP_POINTERS`] entries).
    pub root: Vec<BlockNumber>,
    /// First bitmap extension block, when the inline list is not enough.
    /// Each extension block holds `block_size/4 - 1` pointers; its last
    /// word names the next extension block, zero terminating the chain.
    pub extension: Option<BlockNumber>,
}

// ── Preallocation state ─────────────────────────────────────────────────────

/// A run of contiguous free blocks located during one allocation scan and
/// reserved for the caller.
///
/// Owned per calling context, never shared, and read outside the volume
/// lock: the blocks in the run are already committed as allocated on disk,
/// so consuming one is pure bookkeeping. Release leftovers with
/// [`BitmapAllocator::release_prealloc`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Prealloc {
    next: u64,
    remaining: u32,
}

impl Prealloc {
    /// Consume the next block of the run, if any remains.
    pub fn take(&mut self) -> Option<BlockNumber> {
        if self.remaining == 0 {
            return None;
        }
        let block = self.next;
        self.next += 1;
        self.remaining -= 1;
        Some(BlockNumber(block))
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    fn capture(&mut self, next: BlockNumber, count: u32) {
        self.next = next.0;
        self.remaining = count;
    }
}

// ── Bitmap directory ────────────────────────────────────────────────────────

/// One bitmap block: its on-disk location and the cached count of free
/// bits in its payload.
///
/// Invariant: `free` always equals the population count of the
/// corresponding on-disk payload.
#[derive(Debug, Clone, Copy)]
struct BitmapBlockDesc {
    location: BlockNumber,
    free: u32,
}

/// Single-slot bitmap block cache.
///
/// At most one bitmap block is resident at a time; swapping in a different
/// one validates its checksum. Mutations are written through by the
/// caller before the operation returns, so releasing the slot never needs
/// a write-back.
#[derive(Debug, Default)]
struct SlotCache {
    index: Option<usize>,
    buf: Vec<u8>,
}

impl SlotCache {
    fn ensure(
        &mut self,
        dev: &dyn BlockDevice,
        index: usize,
        location: BlockNumber,
        block_size: usize,
    ) -> Result<&mut Vec<u8>> {
        if self.index != Some(index) {
            self.index = None;
            let buf = dev.read_block(location)?.into_inner();
            if buf.len() != block_size {
                return Err(AmifsError::Format(format!(
                    "bitmap block {} has size {} (expected {block_size})",
                    location.0,
                    buf.len()
                )));
            }
            if !checksum::validate(&buf) {
                return Err(AmifsError::Corruption {
                    block: location.0,
                    detail: "bitmap block checksum mismatch".into(),
                });
            }
            self.buf = buf;
            self.index = Some(index);
        }
        Ok(&mut self.buf)
    }
}

#[derive(Debug)]
struct BitmapState {
    dir: Vec<BitmapBlockDesc>,
    cache: SlotCache,
    /// Cleared on read-only mounts and whenever corruption is detected;
    /// once cleared it never comes back for this mount.
    writable: bool,
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Per-volume free-space allocator.
///
/// All mutable state lives behind one lock; see the module docs for the
/// concurrency model.
pub struct BitmapAllocator {
    dev: Arc<dyn BlockDevice>,
    geo: VolumeGeometry,
    state: Mutex<BitmapState>,
}

impl BitmapAllocator {
    /// Build the bitmap directory by walking the root block's pointer
    /// list and the extension chain.
    ///
    /// Every bitmap block is read once: its checksum validated (any
    /// failure aborts Init — there is no partial-bitmap mode) and its
    /// free bits counted. If the addressable range does not fill the
    /// last bitmap block, the bits past the end are cleared and the
    /// block rewritten, so the allocator can never hand out a block
    /// number beyond the partition.
    pub fn init(
        dev: Arc<dyn BlockDevice>,
        geo: VolumeGeometry,
        locations: &BitmapLocations,
    ) -> Result<Self> {
        let needed = geo.bitmap_block_count();
        let keys = harvest_locations(dev.as_ref(), &geo, locations, needed)?;

        let mut dir = Vec::with_capacity(needed);
        let mut last_buf = None;
        for (i, &location) in keys.iter().enumerate() {
            let buf = dev.read_block(location)?.into_inner();
            if buf.len() != geo.block_size() as usize {
                return Err(AmifsError::Format(format!(
                    "bitmap block {} has size {} (expected {})",
                    location.0,
                    buf.len(),
                    geo.block_size()
                )));
            }
            if !checksum::validate(&buf) {
                return Err(AmifsError::Corruption {
                    block: location.0,
                    detail: "bitmap block checksum mismatch".into(),
                });
            }
            let free = checksum::free_bits(&buf);
            dir.push(BitmapBlockDesc { location, free });
            if i + 1 == keys.len() {
                last_buf = Some(buf);
            }
        }

        let tail = geo.tail_bits();
        if tail != 0 {
            if let (Some(mut buf), Some(desc)) = (last_buf, dir.last_mut()) {
                clamp_tail(&mut buf, &geo, tail);
                checksum::stamp(&mut buf);
                dev.write_block(desc.location, &buf)?;
                desc.free = checksum::free_bits(&buf);
            }
        }

        let free: u64 = dir.iter().map(|d| u64::from(d.free)).sum();
        debug!(bitmap_blocks = dir.len(), free, "bitmap directory initialized");
        Ok(Self {
            dev,
            geo,
            state: Mutex::new(BitmapState {
                dir,
                cache: SlotCache::default(),
                writable: true,
            }),
        })
    }

    /// Allocator for a read-only mount (or a mount whose Init failed):
    /// no directory walk, every mutation refused, [`Self::count_free`]
    /// reports 0.
    #[must_use]
    pub fn disabled(dev: Arc<dyn BlockDevice>, geo: VolumeGeometry) -> Self {
        Self {
            dev,
            geo,
            state: Mutex::new(BitmapState {
                dir: Vec::new(),
                cache: SlotCache::default(),
                writable: false,
            }),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geo
    }

    /// Whether the volume still accepts allocate/free. Starts true for a
    /// successful Init and drops to false permanently when corruption is
    /// detected.
    #[must_use]
    pub fn writable(&self) -> bool {
        self.state.lock().writable
    }

    /// Allocate one block, biased toward `goal`.
    ///
    /// The caller's preallocation run is consumed first, with no bitmap
    /// access. A `goal` of zero, out of range, or pointing into an empty
    /// bitmap block falls back to the start of the addressable range.
    /// Returns `Ok(None)` when no free block exists anywhere.
    pub fn allocate(
        &self,
        goal: BlockNumber,
        prealloc: &mut Prealloc,
    ) -> Result<Option<BlockNumber>> {
        if let Some(block) = prealloc.take() {
            return Ok(Some(block));
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.writable {
            return Err(AmifsError::ReadOnly);
        }
        let count = state.dir.len();
        if count == 0 {
            return Ok(None);
        }

        let words = self.geo.words_per_bitmap_block();
        let (mut start_index, mut goal_bit) = self
            .geo
            .bitmap_position(goal)
            .map_or((0, 0), |(index, bit)| (index.0, bit));
        if state.dir[start_index].free == 0 {
            start_index = 0;
            goal_bit = 0;
        }

        for step in 0..count {
            let index = (start_index + step) % count;
            if state.dir[index].free == 0 {
                continue;
            }

            let location = state.dir[index].location;
            let block_size = self.geo.block_size() as usize;
            let buf = match state.cache.ensure(self.dev.as_ref(), index, location, block_size) {
                Ok(buf) => buf,
                Err(err) => {
                    if matches!(err, AmifsError::Corruption { .. }) {
                        state.writable = false;
                        warn!(
                            block = location.0,
                            "bitmap block failed validation, volume forced read-only"
                        );
                    }
                    return Err(err);
                }
            };

            let first_word = if step == 0 { (goal_bit / 32) as usize } else { 0 };
            let mut found = None;
            for w in first_word..words {
                let tmp = checksum::word_at(buf, 1 + w);
                if tmp != 0 {
                    found = Some((w, tmp));
                    break;
                }
            }

            let Some((word_index, tmp)) = found else {
                if first_word > 0 {
                    // The scan never revisits words before the goal within
                    // the same call; free bits earlier in this block are
                    // only reachable through a later descriptor pass.
                    continue;
                }
                let claimed = state.dir[index].free;
                state.writable = false;
                warn!(
                    block = location.0,
                    claimed, "free count disagrees with payload, volume forced read-only"
                );
                return Err(AmifsError::Corruption {
                    block: location.0,
                    detail: format!("free count claims {claimed} free bits but payload has none"),
                });
            };

            // Lowest set bit is the allocation; every contiguous set bit
            // above it in the same word becomes the caller's prealloc run.
            let bit = tmp.trailing_zeros();
            let mut mask = 1_u32 << bit;
            let mut run = 0_u32;
            let mut probe = mask;
            loop {
                probe <<= 1;
                if probe == 0 || tmp & probe == 0 {
                    break;
                }
                run += 1;
                mask |= probe;
            }

            checksum::set_word_at(buf, 1 + word_index, tmp & !mask);
            checksum::adjust(buf, mask);

            #[expect(clippy::cast_possible_truncation)]
            let bit_position = (word_index as u32) * 32 + bit;
            let block = self.geo.block_at(BitmapIndex(index), bit_position);
            if let Err(err) = self.dev.write_block(location, &state.cache.buf) {
                // The buffer no longer matches disk; drop it.
                state.cache.index = None;
                return Err(err);
            }
            state.dir[index].free -= 1 + run;
            prealloc.capture(BlockNumber(block.0 + 1), run);
            debug!(block = block.0, run, "allocated block");
            return Ok(Some(block));
        }

        Ok(None)
    }

    /// Return `block` to the free pool.
    ///
    /// Freeing an already-free block is logged and ignored: duplicate
    /// cleanup paths are benign and must not fail.
    pub fn free(&self, block: BlockNumber) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.writable {
            return Err(AmifsError::ReadOnly);
        }

        let Some((index, bit)) = self.geo.bitmap_position(block) else {
            return Err(AmifsError::OutOfRange { block: block.0 });
        };
        let index = index.0;
        let location = state.dir[index].location;
        let block_size = self.geo.block_size() as usize;
        let buf = match state.cache.ensure(self.dev.as_ref(), index, location, block_size) {
            Ok(buf) => buf,
            Err(err) => {
                if matches!(err, AmifsError::Corruption { .. }) {
                    state.writable = false;
                    warn!(
                        block = location.0,
                        "bitmap block failed validation, volume forced read-only"
                    );
                }
                return Err(err);
            }
        };

        let word_index = 1 + (bit / 32) as usize;
        let mask = 1_u32 << (bit % 32);
        let tmp = checksum::word_at(buf, word_index);
        if tmp & mask != 0 {
            warn!(block = block.0, "double free ignored");
            return Ok(());
        }

        checksum::set_word_at(buf, word_index, tmp | mask);
        checksum::adjust(buf, 0_u32.wrapping_sub(mask));
        if let Err(err) = self.dev.write_block(location, &state.cache.buf) {
            state.cache.index = None;
            return Err(err);
        }
        state.dir[index].free += 1;
        Ok(())
    }

    /// Return every unconsumed block of a preallocation run to the free
    /// pool, as on file release.
    ///
    /// The run only advances past a block once its free has committed, so
    /// a failed call leaves the remaining blocks in the run and can be
    /// retried without leaking them.
    pub fn release_prealloc(&self, prealloc: &mut Prealloc) -> Result<()> {
        while prealloc.remaining > 0 {
            self.free(BlockNumber(prealloc.next))?;
            prealloc.next += 1;
            prealloc.remaining -= 1;
        }
        Ok(())
    }

    /// Total free blocks, summed from the cached per-descriptor counts.
    /// No I/O. A read-only or invalidated volume reports 0.
    #[must_use]
    pub fn count_free(&self) -> u64 {
        let state = self.state.lock();
        if !state.writable {
            return 0;
        }
        state.dir.iter().map(|d| u64::from(d.free)).sum()
    }
}

/// Collect `needed` bitmap block locations: the root block's inline list
/// first, then successive extension blocks, each buffer released after its
/// pointers are harvested.
fn harvest_locations(
    dev: &dyn BlockDevice,
    geo: &VolumeGeometry,
    locations: &BitmapLocations,
    needed: usize,
) -> Result<Vec<BlockNumber>> {
    let mut keys = Vec::with_capacity(needed);

    for &ptr in locations.root.iter().take(ROOT_BITMAP_POINTERS) {
        if keys.len() == needed {
            break;
        }
        if ptr.0 == 0 {
            return Err(AmifsError::Format(format!(
                "zero bitmap pointer at directory index {}",
                keys.len()
            )));
        }
        keys.push(ptr);
    }

    let mut next_ext = locations.extension;
    while keys.len() < needed {
        let Some(ext) = next_ext.filter(|b| b.0 != 0) else {
            return Err(AmifsError::Format(format!(
                "bitmap pointer chain exhausted: have {} of {needed} bitmap blocks",
                keys.len()
            )));
        };

        let buf = dev.read_block(ext)?.into_inner();
        let slots = geo.pointers_per_extension_block();
        for slot in 0..slots {
            if keys.len() == needed {
                break;
            }
            let ptr = checksum::word_at(&buf, slot);
            if ptr == 0 {
                return Err(AmifsError::Format(format!(
                    "zero bitmap pointer at directory index {}",
                    keys.len()
                )));
            }
            keys.push(BlockNumber(u64::from(ptr)));
        }
        let next = checksum::word_at(&buf, slots);
        next_ext = (next != 0).then_some(BlockNumber(u64::from(next)));
    }

    Ok(keys)
}

/// Mark every payload bit at position >= `tail` as allocated. The last
/// bitmap block's bit range may exceed the partition; those bits must
/// never look free.
fn clamp_tail(buf: &mut [u8], geo: &VolumeGeometry, tail: u32) {
    for w in 0..geo.words_per_bitmap_block() {
        #[expect(clippy::cast_possible_truncation)]
        let word_start = (w as u32) * 32;
        if tail >= word_start + 32 {
            continue;
        }
        let keep_mask = if tail > word_start {
            (1_u32 << (tail - word_start)) - 1
        } else {
            0
        };
        let tmp = checksum::word_at(buf, 1 + w);
        checksum::set_word_at(buf, 1 + w, tmp & keep_mask);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
