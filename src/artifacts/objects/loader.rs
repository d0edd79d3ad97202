//! Object loaders
//!
//! Opening an object yields a loader rather than raw bytes, so callers can
//! ask for the type and size before deciding how to consume the content.
//! Small objects are materialized; objects over the stream threshold only
//! expose a streaming reader, and asking for their bytes fails with
//! [`PackError::LargeObject`] instead of exhausting memory.

use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::pack::PackError;
use bytes::Bytes;
use std::io::Read;

/// Factory producing a fresh content stream on every call.
pub type StreamFactory =
    Box<dyn Fn() -> anyhow::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Handle to one stored object.
///
/// A sealed sum over the two materialization strategies; dispatch is by
/// variant, not by virtual calls.
pub enum ObjectLoader {
    /// Content small enough to hold in memory.
    Cached { kind: ObjectType, bytes: Bytes },
    /// Content past the stream threshold; only sequential access.
    Streamed {
        kind: ObjectType,
        size: u64,
        open: StreamFactory,
    },
}

impl ObjectLoader {
    /// The object's type tag.
    pub fn kind(&self) -> ObjectType {
        match self {
            ObjectLoader::Cached { kind, .. } | ObjectLoader::Streamed { kind, .. } => *kind,
        }
    }

    /// The object's content size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            ObjectLoader::Cached { bytes, .. } => bytes.len() as u64,
            ObjectLoader::Streamed { size, .. } => *size,
        }
    }

    /// Whether this object refused materialization.
    pub fn is_large(&self) -> bool {
        matches!(self, ObjectLoader::Streamed { .. })
    }

    /// The materialized content.
    ///
    /// # Errors
    ///
    /// [`PackError::LargeObject`] for streamed objects; use
    /// [`open_stream`](Self::open_stream) instead.
    pub fn cached_bytes(&self) -> Result<Bytes, PackError> {
        match self {
            ObjectLoader::Cached { bytes, .. } => Ok(bytes.clone()),
            ObjectLoader::Streamed { size, .. } => Err(PackError::LargeObject { size: *size }),
        }
    }

    /// Open a fresh sequential reader over the content.
    ///
    /// Works for both variants; the cached variant reads from memory.
    pub fn open_stream(&self) -> anyhow::Result<Box<dyn Read + Send>> {
        match self {
            ObjectLoader::Cached { bytes, .. } => {
                Ok(Box::new(std::io::Cursor::new(bytes.clone())))
            }
            ObjectLoader::Streamed { open, .. } => open(),
        }
    }
}

impl std::fmt::Debug for ObjectLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectLoader::Cached { kind, bytes } => f
                .debug_struct("ObjectLoader::Cached")
                .field("kind", kind)
                .field("size", &bytes.len())
                .finish(),
            ObjectLoader::Streamed { kind, size, .. } => f
                .debug_struct("ObjectLoader::Streamed")
                .field("kind", kind)
                .field("size", size)
                .finish(),
        }
    }
}
