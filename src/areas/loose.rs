//! Loose object storage
//!
//! Objects not yet packed live one-per-file under
//! `objects/<first-2-hex>/<remaining-38-hex>` as a zlib stream whose
//! inflated form is `"<type> <size>\0"` followed by the payload.
//!
//! Every read hashes the canonical form and verifies it against the
//! requested id, so a corrupted file can never masquerade as the object
//! it is named after. Writes go through a lock file at the final path:
//! content lands in the temporary, is fsynced, and is renamed into place.

use crate::artifacts::core::CancelToken;
use crate::artifacts::lock_file::{LockError, LockFile};
use crate::artifacts::objects::loader::ObjectLoader;
use crate::artifacts::objects::object_id::{AbbreviatedObjectId, ObjectId};
use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::pack::PackError;
use anyhow::Context;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Store of zlib-framed loose objects under an `objects/` directory.
#[derive(Debug)]
pub struct LooseObjectStore {
    path: Box<Path>,
    stream_file_threshold: u64,
}

impl LooseObjectStore {
    /// Create a store rooted at `path` (typically `<git-dir>/objects`).
    pub fn new(path: Box<Path>, stream_file_threshold: u64) -> Self {
        LooseObjectStore {
            path,
            stream_file_threshold,
        }
    }

    pub fn objects_path(&self) -> &Path {
        &self.path
    }

    fn object_file(&self, id: &ObjectId) -> PathBuf {
        self.path.join(id.to_path())
    }

    /// Whether a loose file for `id` exists.
    pub fn has(&self, id: &ObjectId) -> bool {
        self.object_file(id).exists()
    }

    /// Open the loose object `id`.
    ///
    /// Small objects are inflated, length-checked, and hash-verified
    /// before being returned. Objects past the stream threshold return a
    /// streaming loader whose reader verifies the hash when it reaches
    /// the end of the stream.
    pub fn open(
        &self,
        id: &ObjectId,
        _token: &CancelToken,
    ) -> Result<Option<ObjectLoader>, PackError> {
        let object_path = self.object_file(id);
        let file = match File::open(&object_path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut inflater = BufReader::new(ZlibDecoder::new(BufReader::new(file)));
        let (kind, size, header_bytes) = read_header(&mut inflater, &object_path)?;

        if size > self.stream_file_threshold {
            let path = object_path.clone();
            let expected = *id;
            return Ok(Some(ObjectLoader::Streamed {
                kind,
                size,
                open: Box::new(move || {
                    let file = File::open(&path)
                        .with_context(|| format!("unable to reopen {}", path.display()))?;
                    let mut inflater = BufReader::new(ZlibDecoder::new(BufReader::new(file)));
                    let (_, _, header_bytes) = read_header(&mut inflater, &path)?;
                    Ok(Box::new(HashVerifyReader::new(
                        inflater,
                        expected,
                        &header_bytes,
                        size,
                    )) as Box<dyn Read + Send>)
                }),
            }));
        }

        let mut payload = Vec::with_capacity(size as usize);
        inflater.read_to_end(&mut payload)?;
        if payload.len() as u64 != size {
            return Err(PackError::corrupt(
                &object_path,
                0,
                format!("payload is {} bytes, header declared {size}", payload.len()),
            ));
        }

        let mut hasher = Sha1::new();
        hasher.update(&header_bytes);
        hasher.update(&payload);
        let actual: [u8; 20] = hasher.finalize().into();
        if &actual != id.as_bytes() {
            return Err(PackError::corrupt(
                &object_path,
                0,
                format!("content hashes to {}, not {id}", ObjectId::from_raw(actual)),
            ));
        }

        Ok(Some(ObjectLoader::Cached {
            kind,
            bytes: Bytes::from(payload),
        }))
    }

    /// Store `payload` as a loose object of `kind`.
    ///
    /// # Returns
    ///
    /// The content id. Already-present objects short-circuit: the store is
    /// content-addressed, so an existing file with this id is this object.
    pub fn insert(&self, kind: ObjectType, payload: &[u8]) -> anyhow::Result<ObjectId> {
        let id = hash_object(kind, payload);
        let object_path = self.object_file(&id);
        if object_path.exists() {
            return Ok(id);
        }

        let mut lock = match LockFile::acquire(&object_path) {
            Ok(lock) => lock,
            // a racing writer is inserting the same content
            Err(LockError::CannotLock { .. }) => return Ok(id),
            Err(err) => return Err(err.into()),
        };

        let mut encoder =
            flate2::write::ZlibEncoder::new(lock.writer(), flate2::Compression::default());
        encoder.write_all(format!("{} {}\0", kind, payload.len()).as_bytes())?;
        encoder.write_all(payload)?;
        encoder.finish().context("unable to compress object")?;
        lock.commit()?;

        debug!(%id, %kind, size = payload.len(), "stored loose object");
        Ok(id)
    }

    /// Collect loose ids starting with `abbrev` into `matches`.
    ///
    /// Stops after `max_matches + 1` so callers can detect ambiguity.
    pub fn resolve(
        &self,
        abbrev: &AbbreviatedObjectId,
        max_matches: usize,
        matches: &mut Vec<ObjectId>,
    ) -> anyhow::Result<()> {
        let hex = abbrev.to_hex();
        let dir_path = self.path.join(&hex[..2]);
        let file_prefix = &hex[2..];

        let entries = match std::fs::read_dir(&dir_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.starts_with(file_prefix) {
                continue;
            }
            if let Ok(id) = ObjectId::from_hex(&format!("{}{}", &hex[..2], file_name)) {
                if id.starts_with(abbrev) && !matches.contains(&id) {
                    matches.push(id);
                    if matches.len() > max_matches {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Hash the canonical serialization `"<type> <size>\0" + payload`.
pub fn hash_object(kind: ObjectType, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", kind, payload.len()).as_bytes());
    hasher.update(payload);
    ObjectId::from_raw(hasher.finalize().into())
}

/// Read the `"<type> <size>\0"` header, returning its raw bytes as well
/// so callers can seed the verification hash.
fn read_header(
    reader: &mut impl BufRead,
    path: &Path,
) -> Result<(ObjectType, u64, Vec<u8>), PackError> {
    let mut header = Vec::with_capacity(32);
    loop {
        let mut byte = [0u8; 1];
        reader
            .read_exact(&mut byte)
            .map_err(|_| PackError::corrupt(path, 0, "truncated object header"))?;
        header.push(byte[0]);
        if byte[0] == 0 {
            break;
        }
        if header.len() > 64 {
            return Err(PackError::corrupt(path, 0, "object header is implausibly long"));
        }
    }

    let mut cursor = io::Cursor::new(&header);
    let (kind, size) = ObjectType::parse_header(&mut cursor)
        .map_err(|err| PackError::corrupt(path, 0, err.to_string()))?;
    Ok((kind, size, header))
}

/// Hashes the canonical form as a stream is consumed and verifies it
/// against the expected id at end of stream.
struct HashVerifyReader<R> {
    inner: R,
    hasher: Sha1,
    expected: ObjectId,
    remaining: u64,
    verified: bool,
}

impl<R: Read> HashVerifyReader<R> {
    fn new(inner: R, expected: ObjectId, header: &[u8], size: u64) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(header);
        HashVerifyReader {
            inner,
            hasher,
            expected,
            remaining: size,
            verified: false,
        }
    }
}

impl<R: Read> Read for HashVerifyReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        if n as u64 > self.remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "object stream longer than its declared size",
            ));
        }
        self.hasher.update(&out[..n]);
        self.remaining -= n as u64;

        if n == 0 && !out.is_empty() && !self.verified {
            if self.remaining != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "object stream shorter than its declared size",
                ));
            }
            let actual: [u8; 20] = self.hasher.clone().finalize().into();
            if &actual != self.expected.as_bytes() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "content hashes to {}, not {}",
                        ObjectId::from_raw(actual),
                        self.expected
                    ),
                ));
            }
            self.verified = true;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    fn store(dir: &TempDir) -> LooseObjectStore {
        LooseObjectStore::new(dir.path().join("objects").into_boxed_path(), 1024)
    }

    #[test]
    fn test_insert_then_open_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let id = store.insert(ObjectType::Blob, b"hello loose world").unwrap();
        let loader = store.open(&id, &CancelToken::none()).unwrap().unwrap();

        assert_eq!(loader.kind(), ObjectType::Blob);
        assert_eq!(&loader.cached_bytes().unwrap()[..], b"hello loose world");
    }

    #[test]
    fn test_insert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let first = store.insert(ObjectType::Blob, b"same bytes").unwrap();
        let second = store.insert(ObjectType::Blob, b"same bytes").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_open_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = ObjectId::from_hex("49322bb17d3acc9146f98c97d078513228bbf3c0").unwrap();
        assert!(store.open(&id, &CancelToken::none()).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_content_fails_hash_check() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let id = store.insert(ObjectType::Blob, b"original").unwrap();
        // overwrite with a valid stream for different content
        let other = hash_object(ObjectType::Blob, b"tampered");
        assert_ne!(id, other);
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Default::default());
        encoder.write_all(b"blob 8\0tampered").unwrap();
        let bytes = encoder.finish().unwrap();
        std::fs::write(store.objects_path().join(id.to_path()), bytes).unwrap();

        let result = store.open(&id, &CancelToken::none());
        assert!(matches!(result, Err(PackError::Corrupt { .. })));
    }

    #[test]
    fn test_large_object_streams_and_refuses_bytes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let payload = vec![b'x'; 4096]; // over the 1024 test threshold
        let id = store.insert(ObjectType::Blob, &payload).unwrap();
        let loader = store.open(&id, &CancelToken::none()).unwrap().unwrap();

        assert!(loader.is_large());
        assert!(matches!(
            loader.cached_bytes(),
            Err(PackError::LargeObject { size: 4096 })
        ));

        let mut streamed = Vec::new();
        loader
            .open_stream()
            .unwrap()
            .read_to_end(&mut streamed)
            .unwrap();
        assert_eq!(streamed, payload);
    }

    #[test]
    fn test_streamed_read_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let payload = vec![b'y'; 4096];
        let id = store.insert(ObjectType::Blob, &payload).unwrap();

        let mut tampered = payload.clone();
        tampered[100] = b'z';
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Default::default());
        encoder.write_all(b"blob 4096\0").unwrap();
        encoder.write_all(&tampered).unwrap();
        let bytes = encoder.finish().unwrap();
        std::fs::write(store.objects_path().join(id.to_path()), bytes).unwrap();

        let loader = store.open(&id, &CancelToken::none()).unwrap().unwrap();
        let mut sink = Vec::new();
        let result = loader.open_stream().unwrap().read_to_end(&mut sink);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_reports_every_prefix_match() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        // candidate enumeration is by file name, so colliding prefixes can
        // be staged directly on disk
        let dir_12 = store.objects_path().join("12");
        std::fs::create_dir_all(&dir_12).unwrap();
        std::fs::write(dir_12.join("34".repeat(19)), b"").unwrap();
        std::fs::write(dir_12.join(format!("{}ab", "34".repeat(18))), b"").unwrap();
        std::fs::write(dir_12.join(format!("{}cd", "34".repeat(18))), b"").unwrap();

        let abbrev = AbbreviatedObjectId::from_hex("123434").unwrap();
        let mut matches = Vec::new();
        store.resolve(&abbrev, 8, &mut matches).unwrap();
        assert_eq!(matches.len(), 3);

        let narrow = AbbreviatedObjectId::from_hex(&format!("12{}ab", "34".repeat(18))).unwrap();
        let mut narrow_matches = Vec::new();
        store.resolve(&narrow, 8, &mut narrow_matches).unwrap();
        assert_eq!(narrow_matches.len(), 1);
    }
}
