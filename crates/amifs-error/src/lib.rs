#![forbid(unsafe_code)]
//! Error types for AmiFS.
//!
//! # Error Taxonomy
//!
//! `AmifsError` is the single user-facing error type; crate-internal errors
//! (like `GeometryError` in `amifs-types`) convert into `AmifsError` at
//! their respective crate boundaries. All string payloads are owned
//! (`String`).
//!
//! The allocator's propagation policy:
//!
//! | Condition | Variant | Escalation |
//! |-----------|---------|------------|
//! | Bad checksum or free-count inconsistency | `Corruption` | forces the volume read-only |
//! | Structurally invalid on-disk data (zero pointer, truncated chain) | `Format` | aborts Init |
//! | Invalid mount parameters | `InvalidGeometry` | aborts Init |
//! | Block number outside the addressable range | `OutOfRange` | refused, no state mutated |
//! | Write attempted on a read-only volume | `ReadOnly` | refused |
//! | Underlying device failure | `Io` | propagated verbatim, never retried |
//!
//! Exhaustion (no free block anywhere) is a normal outcome and is reported
//! as `Ok(None)` from the allocate path, never as an error. Double-free is
//! intentionally an idempotent no-op (logged), never an error.

use thiserror::Error;

/// Unified error type for all AmiFS operations.
#[derive(Debug, Error)]
pub enum AmifsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Used for bitmap-block checksum mismatches and for cached free
    /// counts that disagree with the on-disk payload. Detecting this
    /// forces the volume read-only.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk structure (zero bitmap pointer, truncated
    /// extension chain, wrong buffer size).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Mount parameters are numerically invalid or out of the supported
    /// range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Block number outside the bitmap's addressable range. A caller
    /// programming error: the operation is refused without mutating state.
    #[error("block {block} is outside the addressable range")]
    OutOfRange { block: u64 },

    /// Volume is read-only (mounted read-only, or forced read-only after
    /// corruption) and a mutation was attempted.
    #[error("read-only volume")]
    ReadOnly,
}

impl AmifsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm, so
    /// adding a variant without assigning its errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) | Self::OutOfRange { .. } => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

impl From<amifs_types::GeometryError> for AmifsError {
    fn from(err: amifs_types::GeometryError) -> Self {
        Self::InvalidGeometry(err.to_string())
    }
}

/// Result alias using `AmifsError`.
pub type Result<T> = std::result::Result<T, AmifsError>;
