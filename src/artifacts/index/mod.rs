//! Index (DirCache) file format
//!
//! The index records the merged state of the working tree: a sorted list
//! of path entries with stat data for fast change detection.
//!
//! ## File format
//!
//! ```text
//! Header (12 bytes):
//!   - Signature: "DIRC"
//!   - Version: 2, 3, or 4
//!   - Entry count
//!
//! Entries, sorted by (path, stage):
//!   - stat fields, id, flags, path
//!   - versions 2/3 pad each entry to 8-byte alignment
//!   - version 4 prefix-compresses paths instead
//!
//! Extensions (optional), then a SHA-1 checksum of everything above.
//! ```

pub mod checksum;
pub mod entry_mode;
pub mod index_entry;
pub mod index_header;

/// Size of the SHA-1 trailer in bytes.
pub const CHECKSUM_SIZE: usize = 20;

/// Size of the index header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Magic signature identifying index files.
pub const SIGNATURE: &[u8; 4] = b"DIRC";

/// Version written by this implementation.
pub const WRITE_VERSION: u32 = 2;

/// Versions accepted when reading.
pub const READ_VERSIONS: [u32; 3] = [2, 3, 4];

/// Alignment block of index entries (versions 2 and 3).
pub const ENTRY_BLOCK: usize = 8;
