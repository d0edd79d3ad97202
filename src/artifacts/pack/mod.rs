//! Pack file storage
//!
//! Packs bundle many objects into one file, compressing each object with
//! zlib and allowing objects to be stored as deltas against other objects.
//! Every pack is paired with an index file mapping object ids to offsets.
//!
//! ## On-disk layout
//!
//! ```text
//! pack:  "PACK" | u32 version (2) | u32 object count | objects... | 20-byte SHA-1 trailer
//! index: v1 or v2, see pack_index
//! ```

pub mod delta;
pub mod pack_file;
pub mod pack_index;
pub mod window_cache;

use crate::artifacts::objects::object_id::ObjectId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Magic bytes opening every pack file.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";

/// The only supported pack version.
pub const PACK_VERSION: u32 = 2;

/// Pack representation code for a delta whose base is at a relative offset.
pub const OBJ_OFS_DELTA: u8 = 6;

/// Pack representation code for a delta whose base is named by id.
pub const OBJ_REF_DELTA: u8 = 7;

/// Default bound on delta chain length; longer chains are treated as cyclic.
pub const DEFAULT_DELTA_DEPTH_LIMIT: usize = 50;

/// Failures of the pack and loose-object decoders.
///
/// `Corrupt` carries the precise location so diagnostics can name the file
/// and offset that failed to decode.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("corrupt object in {file} at offset {offset}: {cause}")]
    Corrupt {
        file: PathBuf,
        offset: u64,
        cause: String,
    },
    #[error("unsupported pack version {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported pack index version {0}")]
    UnsupportedIndexVersion(u32),
    #[error("delta base {base} of object at offset {offset} is not present")]
    MissingBase { offset: u64, base: ObjectId },
    #[error("delta chain at offset {offset} exceeds depth limit {limit}")]
    DeltaDepthExceeded { offset: u64, limit: usize },
    #[error("object of {size} bytes is too large to materialize; use streaming")]
    LargeObject { size: u64 },
    #[error(transparent)]
    Cancelled(#[from] crate::artifacts::core::CancelledOperation),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PackError {
    /// Shorthand for a located corruption report.
    pub fn corrupt(file: &std::path::Path, offset: u64, cause: impl Into<String>) -> Self {
        PackError::Corrupt {
            file: file.to_path_buf(),
            offset,
            cause: cause.into(),
        }
    }
}
