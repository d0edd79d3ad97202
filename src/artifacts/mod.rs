//! Git data structures and algorithms
//!
//! The format-level types the storage areas are built from:
//!
//! - `core`: shared utilities (cancellation)
//! - `index`: DirCache entry, header, and checksum encoding
//! - `lock_file`: atomic write-then-rename
//! - `objects`: object ids, types, loaders, commit and tag payloads
//! - `pack`: pack files, pack indexes, deltas, and the window cache
//! - `revision`: revision-expression parsing and evaluation
//! - `tree`: canonical tree iteration

pub mod core;
pub mod index;
pub mod lock_file;
pub mod objects;
pub mod pack;
pub mod revision;
pub mod tree;
