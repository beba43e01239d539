#![forbid(unsafe_code)]
//! AmiFS public API facade.
//!
//! Re-exports the volume geometry, block I/O, and free-space allocator
//! surfaces through one crate. This is the crate downstream consumers
//! depend on.

pub use amifs_bitmap::{BitmapAllocator, BitmapLocations, Prealloc, checksum};
pub use amifs_block::{BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice};
pub use amifs_error::{AmifsError, Result};
pub use amifs_types::{
    BitmapIndex, BlockNumber, CHECKSUM_BYTES, GeometryError, ROOT_BITMAP_POINTERS,
    VolumeGeometry,
};
