//! grit — reader and manipulator for the on-disk git repository format
//!
//! The library turns raw repository bytes and symbolic names into typed,
//! verified objects: the object store (loose files, pack files with
//! delta chains, alternates), the reference store (loose refs,
//! packed-refs, reflogs, atomic updates), and the revision-expression
//! resolver (`HEAD`, `master~3:foo/bar`, `abc1234^{tree}`).
//!
//! ## Entry points
//!
//! ```no_run
//! use grit::Repository;
//!
//! let repo = Repository::discover(".")?;
//! let head = repo.resolve("HEAD")?;
//! let readme = repo.resolve("master:README.md")?;
//! # anyhow::Ok(())
//! ```
//!
//! Porcelain commands, wire protocols, diffs, and working-tree
//! materialization are out of scope; this crate is the storage core
//! those layers sit on.

pub mod areas;
pub mod artifacts;

pub use areas::database::{
    AmbiguousObject, MissingObject, ObjectDatabase, ObjectInserter, ObjectReader,
};
pub use areas::index::DirCache;
pub use areas::loose::LooseObjectStore;
pub use areas::ref_update::{RefUpdate, RefUpdateResult};
pub use areas::reflog::{Reflog, ReflogEntry};
pub use areas::refs::{Ref, RefDatabase, RefError, RefStorage};
pub use areas::repository::Repository;
pub use artifacts::core::{CancelToken, CancelledOperation};
pub use artifacts::lock_file::{LockError, LockFile};
pub use artifacts::objects::loader::ObjectLoader;
pub use artifacts::objects::object_id::{AbbreviatedObjectId, IdError, ObjectId};
pub use artifacts::objects::object_type::ObjectType;
pub use artifacts::pack::window_cache::WindowCacheOptions;
pub use artifacts::pack::PackError;
pub use artifacts::revision::{IncorrectObjectType, Revision};
