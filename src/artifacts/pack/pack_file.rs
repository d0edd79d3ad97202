//! Pack file reader
//!
//! Decodes object headers at arbitrary offsets, inflates object content
//! through the window cache, and reconstructs deltified objects by walking
//! their chains to a non-delta base. All reads go through
//! [`WindowCache`] windows, so concurrent readers share mapped bytes and
//! memory stays bounded by the cache budget.

use crate::artifacts::core::CancelToken;
use crate::artifacts::objects::loader::ObjectLoader;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::objects::OBJECT_ID_LENGTH;
use crate::artifacts::pack::delta::{self, DeltaBaseCache};
use crate::artifacts::pack::pack_index::PackIndex;
use crate::artifacts::pack::window_cache::{Window, WindowCache};
use crate::artifacts::pack::{
    PackError, DEFAULT_DELTA_DEPTH_LIMIT, OBJ_OFS_DELTA, OBJ_REF_DELTA, PACK_SIGNATURE,
    PACK_VERSION,
};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use flate2::{Decompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Size of the fixed pack header: signature, version, object count.
const PACK_HEADER_SIZE: u64 = 12;

/// Monotonic source ids for the window cache.
static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Where a delta finds its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseLocation {
    /// OFS_DELTA: absolute offset of the base within the same pack.
    Offset(u64),
    /// REF_DELTA: base named by id (possibly in another pack for thin
    /// packs before fixup).
    Id(ObjectId),
}

/// Decoded representation of one packed object's header.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRepresentation {
    /// Offset of the object's header within the pack.
    pub offset: u64,
    /// Bytes occupied by the header (varint plus base reference).
    pub header_length: u64,
    /// Declared inflated size: content size for whole objects, delta
    /// stream size for deltas.
    pub inflated_size: u64,
    /// 3-bit pack type code.
    pub type_code: u8,
    /// Base reference for delta representations.
    pub base: Option<BaseLocation>,
}

impl ObjectRepresentation {
    /// Offset of the zlib stream following the header.
    pub fn data_offset(&self) -> u64 {
        self.offset + self.header_length
    }

    pub fn is_delta(&self) -> bool {
        self.base.is_some()
    }
}

/// One open pack file with its index.
#[derive(Debug)]
pub struct PackFile {
    pack_path: PathBuf,
    file: File,
    length: u64,
    cache_id: u64,
    index: PackIndex,
    windows: Arc<WindowCache>,
    bases: Arc<DeltaBaseCache>,
    delta_depth_limit: usize,
}

impl PackFile {
    /// Open a pack and its `.idx` companion.
    ///
    /// Validates the pack header and checks the pack's 20-byte trailer
    /// against the checksum recorded in the index, so a mismatched
    /// pack/index pair is rejected before any object is read.
    pub fn open(
        pack_path: &Path,
        windows: Arc<WindowCache>,
        bases: Arc<DeltaBaseCache>,
    ) -> Result<Arc<PackFile>, PackError> {
        let index = PackIndex::open(&pack_path.with_extension("idx"))?;
        let file = File::open(pack_path)?;
        let length = file.metadata()?.len();

        if length < PACK_HEADER_SIZE + OBJECT_ID_LENGTH as u64 {
            return Err(PackError::corrupt(pack_path, 0, "pack file truncated"));
        }

        let mut header = [0u8; PACK_HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        if &header[..4] != PACK_SIGNATURE {
            return Err(PackError::corrupt(pack_path, 0, "not a pack file"));
        }
        let version = BigEndian::read_u32(&header[4..8]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let object_count = BigEndian::read_u32(&header[8..12]);
        if object_count != index.object_count() {
            return Err(PackError::corrupt(
                pack_path,
                8,
                format!(
                    "pack holds {object_count} objects but index lists {}",
                    index.object_count()
                ),
            ));
        }

        let mut trailer = [0u8; OBJECT_ID_LENGTH];
        file.read_exact_at(&mut trailer, length - OBJECT_ID_LENGTH as u64)?;
        if &trailer != index.pack_checksum() {
            return Err(PackError::corrupt(
                pack_path,
                length - OBJECT_ID_LENGTH as u64,
                "pack trailer does not match index checksum",
            ));
        }

        debug!(pack = %pack_path.display(), objects = object_count, "opened pack");
        Ok(Arc::new(PackFile {
            pack_path: pack_path.to_path_buf(),
            file,
            length,
            cache_id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            index,
            windows,
            bases,
            delta_depth_limit: DEFAULT_DELTA_DEPTH_LIMIT,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Stable id keying this pack in the shared caches.
    pub fn cache_id(&self) -> u64 {
        self.cache_id
    }

    /// Whether `id` is stored in this pack.
    pub fn has(&self, id: &ObjectId) -> bool {
        self.index.has(id)
    }

    /// Open the object `id`, choosing cached or streamed delivery by the
    /// configured stream threshold.
    pub fn open_object(
        self: &Arc<Self>,
        id: &ObjectId,
        token: &CancelToken,
    ) -> Result<Option<ObjectLoader>, PackError> {
        let Some(offset) = self.index.find_offset(id) else {
            return Ok(None);
        };
        self.load(offset, token).map(Some)
    }

    /// Open the object at `offset`.
    pub fn load(
        self: &Arc<Self>,
        offset: u64,
        token: &CancelToken,
    ) -> Result<ObjectLoader, PackError> {
        let (kind, size) = self.object_info(offset, token)?;

        if size > self.windows.options().stream_file_threshold {
            let pack = Arc::clone(self);
            let stream_token = token.clone();
            Ok(ObjectLoader::Streamed {
                kind,
                size,
                open: Box::new(move || {
                    pack.open_stream_at(offset, &stream_token)
                        .map(|(_, _, reader)| reader)
                        .map_err(anyhow::Error::from)
                }),
            })
        } else {
            let (kind, bytes) = self.materialize(offset, token)?;
            Ok(ObjectLoader::Cached { kind, bytes })
        }
    }

    /// Resolve the final type and content size of the object at `offset`
    /// without materializing anything.
    ///
    /// Walks delta headers to the chain's non-delta bottom for the type;
    /// the size of a delta result comes from the delta stream's second
    /// varint, inflated just far enough to read it.
    pub fn object_info(
        &self,
        offset: u64,
        token: &CancelToken,
    ) -> Result<(ObjectType, u64), PackError> {
        let representation = self.representation(offset)?;

        let size = if representation.is_delta() {
            self.delta_result_size(&representation)?
        } else {
            representation.inflated_size
        };

        // chase base references to learn the real object type
        let mut current = representation;
        let mut depth = 0usize;
        let kind = loop {
            token.check()?;
            match current.base {
                None => break ObjectType::from_pack_code(current.type_code).map_err(|_| {
                    PackError::corrupt(
                        &self.pack_path,
                        current.offset,
                        format!("invalid object type code {}", current.type_code),
                    )
                })?,
                Some(base) => {
                    depth += 1;
                    if depth > self.delta_depth_limit {
                        return Err(PackError::DeltaDepthExceeded {
                            offset,
                            limit: self.delta_depth_limit,
                        });
                    }
                    let base_offset = self.base_offset(&current, base)?;
                    current = self.representation(base_offset)?;
                }
            }
        };

        Ok((kind, size))
    }

    /// Decode the object header at `offset`.
    pub fn representation(&self, offset: u64) -> Result<ObjectRepresentation, PackError> {
        if offset < PACK_HEADER_SIZE || offset >= self.length - OBJECT_ID_LENGTH as u64 {
            return Err(PackError::corrupt(
                &self.pack_path,
                offset,
                "object offset outside pack body",
            ));
        }

        let mut cursor = PackCursor::new(self, offset);
        let mut byte = cursor.next_byte()?;
        let type_code = (byte >> 4) & 0x07;
        let mut inflated_size = u64::from(byte & 0x0f);
        let mut shift = 4u32;
        while byte & 0x80 != 0 {
            byte = cursor.next_byte()?;
            if shift > 57 {
                return Err(PackError::corrupt(
                    &self.pack_path,
                    offset,
                    "object size varint overflows",
                ));
            }
            inflated_size |= u64::from(byte & 0x7f) << shift;
            shift += 7;
        }

        let base = match type_code {
            OBJ_OFS_DELTA => {
                // big-endian varint with the +1 disambiguator
                byte = cursor.next_byte()?;
                let mut relative = u64::from(byte & 0x7f);
                while byte & 0x80 != 0 {
                    byte = cursor.next_byte()?;
                    relative = relative
                        .checked_add(1)
                        .and_then(|r| r.checked_shl(7))
                        .map(|r| r | u64::from(byte & 0x7f))
                        .ok_or_else(|| {
                            PackError::corrupt(&self.pack_path, offset, "base offset overflows")
                        })?;
                }
                let base_offset = offset.checked_sub(relative).filter(|o| *o >= PACK_HEADER_SIZE);
                match base_offset {
                    Some(base_offset) => Some(BaseLocation::Offset(base_offset)),
                    None => {
                        return Err(PackError::corrupt(
                            &self.pack_path,
                            offset,
                            "delta base offset before pack start",
                        ))
                    }
                }
            }
            OBJ_REF_DELTA => {
                let mut raw = [0u8; OBJECT_ID_LENGTH];
                cursor.read_exact(&mut raw)?;
                Some(BaseLocation::Id(ObjectId::from_raw(raw)))
            }
            _ => None,
        };

        Ok(ObjectRepresentation {
            offset,
            header_length: cursor.position() - offset,
            inflated_size,
            type_code,
            base,
        })
    }

    /// Materialize the object at `offset`, applying any delta chain.
    pub fn materialize(
        &self,
        offset: u64,
        token: &CancelToken,
    ) -> Result<(ObjectType, Bytes), PackError> {
        // Walk down to a cached or non-delta base, remembering each delta
        // representation passed on the way.
        let mut chain: Vec<ObjectRepresentation> = Vec::new();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut cursor_offset = offset;

        let (kind, mut content) = loop {
            token.check()?;
            if !visited.insert(cursor_offset) {
                return Err(PackError::corrupt(
                    &self.pack_path,
                    cursor_offset,
                    "delta chain forms a cycle",
                ));
            }
            if chain.len() > self.delta_depth_limit {
                return Err(PackError::DeltaDepthExceeded {
                    offset,
                    limit: self.delta_depth_limit,
                });
            }
            if let Some((kind, bytes)) = self.bases.get(self.cache_id, cursor_offset) {
                break (kind, bytes);
            }

            let representation = self.representation(cursor_offset)?;
            match representation.base {
                None => {
                    let kind =
                        ObjectType::from_pack_code(representation.type_code).map_err(|_| {
                            PackError::corrupt(
                                &self.pack_path,
                                cursor_offset,
                                format!("invalid object type code {}", representation.type_code),
                            )
                        })?;
                    let bytes = self.inflate_exact(&representation, token)?;
                    break (kind, bytes);
                }
                Some(base) => {
                    cursor_offset = self.base_offset(&representation, base)?;
                    chain.push(representation);
                }
            }
        };

        // Unwind, applying each delta; intermediate results become cached
        // bases for neighbouring chains.
        while let Some(representation) = chain.pop() {
            token.check()?;
            self.bases.put(
                self.cache_id,
                representation
                    .base
                    .map(|base| self.base_offset(&representation, base))
                    .transpose()?
                    .expect("chain entries are deltas"),
                kind,
                content.clone(),
            );

            let delta_bytes = self.inflate_exact(&representation, token)?;
            // the delta result keeps the base's type
            content = delta::apply(
                (&self.pack_path, representation.offset),
                &content,
                &delta_bytes,
            )?;
        }

        Ok((kind, content))
    }

    /// Open a sequential stream over the object at `offset`.
    ///
    /// Whole objects inflate straight out of the window cache. Delta
    /// results apply their commands lazily against a base stream that is
    /// reopened (and re-walked) whenever a copy command seeks backwards,
    /// trading time for bounded memory.
    pub fn open_stream_at(
        self: &Arc<Self>,
        offset: u64,
        token: &CancelToken,
    ) -> Result<(ObjectType, u64, Box<dyn Read + Send>), PackError> {
        let representation = self.representation(offset)?;

        match representation.base {
            None => {
                let kind = ObjectType::from_pack_code(representation.type_code).map_err(|_| {
                    PackError::corrupt(
                        &self.pack_path,
                        offset,
                        format!("invalid object type code {}", representation.type_code),
                    )
                })?;
                let reader = ExactLengthReader::new(
                    InflateReader::new(
                        Arc::clone(self),
                        representation.data_offset(),
                        token.clone(),
                    ),
                    representation.inflated_size,
                );
                Ok((kind, representation.inflated_size, Box::new(reader)))
            }
            Some(base) => {
                let base_offset = self.base_offset(&representation, base)?;
                let (kind, _) = self.object_info(base_offset, token)?;

                let delta_bytes = self.inflate_exact(&representation, token)?;
                let header = delta::parse_header(&delta_bytes).ok_or_else(|| {
                    PackError::corrupt(&self.pack_path, offset, "truncated delta header")
                })?;

                let reader = DeltaStreamReader::new(
                    Arc::clone(self),
                    base_offset,
                    delta_bytes,
                    header,
                    token.clone(),
                    (self.pack_path.clone(), offset),
                )?;
                Ok((kind, header.result_size, Box::new(reader)))
            }
        }
    }

    /// Verify every object's CRC32 (v2 index) and the pack trailer hash.
    pub fn verify(&self, token: &CancelToken) -> Result<(), PackError> {
        // trailer: SHA-1 over everything before the final 20 bytes
        let mut hasher = Sha1::new();
        let mut position = 0u64;
        let body_end = self.length - OBJECT_ID_LENGTH as u64;
        let mut buffer = vec![0u8; 64 * 1024];
        while position < body_end {
            token.check()?;
            let want = buffer.len().min((body_end - position) as usize);
            self.file.read_exact_at(&mut buffer[..want], position)?;
            hasher.update(&buffer[..want]);
            position += want as u64;
        }
        let computed: [u8; OBJECT_ID_LENGTH] = hasher.finalize().into();
        if &computed != self.index.pack_checksum() {
            return Err(PackError::corrupt(
                &self.pack_path,
                body_end,
                "pack content does not match its trailer hash",
            ));
        }

        for entry in self.index.iter() {
            token.check()?;
            if let Some(expected) = self.index.crc32(&entry.id) {
                let actual = self.packed_crc32(entry.offset, token)?;
                if actual != expected {
                    return Err(PackError::corrupt(
                        &self.pack_path,
                        entry.offset,
                        format!("CRC32 mismatch for {}", entry.id),
                    ));
                }
            }
        }
        Ok(())
    }

    /// CRC32 over the packed representation at `offset`: header bytes
    /// plus the compressed stream, exactly as the v2 index records it.
    fn packed_crc32(&self, offset: u64, token: &CancelToken) -> Result<u32, PackError> {
        let representation = self.representation(offset)?;
        let mut crc = flate2::Crc::new();

        let mut header = vec![0u8; representation.header_length as usize];
        self.file.read_exact_at(&mut header, offset)?;
        crc.update(&header);

        // inflate, discarding output, CRC-ing exactly the consumed input
        let mut inflater = Decompress::new(true);
        let mut position = representation.data_offset();
        let mut sink = [0u8; 16 * 1024];
        loop {
            token.check()?;
            let window = self.window_at(position)?;
            let input = window.slice_from(position);
            let before_in = inflater.total_in();
            let status = inflater
                .decompress(input, &mut sink, FlushDecompress::None)
                .map_err(|err| {
                    PackError::corrupt(&self.pack_path, offset, format!("bad zlib stream: {err}"))
                })?;
            let consumed = (inflater.total_in() - before_in) as usize;
            crc.update(&input[..consumed]);
            position += consumed as u64;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && inflater.total_out() > 0 && input.is_empty() {
                        return Err(PackError::corrupt(
                            &self.pack_path,
                            offset,
                            "zlib stream ran past pack end",
                        ));
                    }
                }
            }
        }
        Ok(crc.sum())
    }

    /// Result size of a delta representation, read from the second
    /// varint of its instruction stream.
    ///
    /// Only the first few bytes of the delta are inflated; two varints
    /// never need more than 20.
    fn delta_result_size(
        &self,
        representation: &ObjectRepresentation,
    ) -> Result<u64, PackError> {
        let mut inflater = Decompress::new(true);
        let mut head = [0u8; 32];
        let mut produced = 0usize;
        let mut position = representation.data_offset();

        while produced < head.len() {
            let window = self.window_at(position)?;
            let input = window.slice_from(position);
            let before_in = inflater.total_in();
            let before_out = inflater.total_out();
            let status = inflater
                .decompress(input, &mut head[produced..], FlushDecompress::None)
                .map_err(|err| {
                    PackError::corrupt(
                        &self.pack_path,
                        representation.offset,
                        format!("bad zlib stream: {err}"),
                    )
                })?;
            position += inflater.total_in() - before_in;
            produced += (inflater.total_out() - before_out) as usize;
            if status == Status::StreamEnd {
                break;
            }
        }

        delta::parse_header(&head[..produced])
            .map(|header| header.result_size)
            .ok_or_else(|| {
                PackError::corrupt(
                    &self.pack_path,
                    representation.offset,
                    "truncated delta header",
                )
            })
    }

    /// Resolve a delta's base reference to an offset in this pack.
    fn base_offset(
        &self,
        representation: &ObjectRepresentation,
        base: BaseLocation,
    ) -> Result<u64, PackError> {
        match base {
            BaseLocation::Offset(offset) => Ok(offset),
            BaseLocation::Id(id) => {
                self.index
                    .find_offset(&id)
                    .ok_or(PackError::MissingBase {
                        offset: representation.offset,
                        base: id,
                    })
            }
        }
    }

    /// Inflate the stream of `representation` and enforce its declared size.
    fn inflate_exact(
        &self,
        representation: &ObjectRepresentation,
        token: &CancelToken,
    ) -> Result<Bytes, PackError> {
        let expected = representation.inflated_size as usize;
        let mut out = Vec::with_capacity(expected.min(64 * 1024 * 1024));

        let mut inflater = Decompress::new(true);
        let mut position = representation.data_offset();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            token.check()?;
            let window = self.window_at(position)?;
            let input = window.slice_from(position);
            let before_in = inflater.total_in();
            let before_out = inflater.total_out();
            let status = inflater
                .decompress(input, &mut chunk, FlushDecompress::None)
                .map_err(|err| {
                    PackError::corrupt(
                        &self.pack_path,
                        representation.offset,
                        format!("bad zlib stream: {err}"),
                    )
                })?;
            position += inflater.total_in() - before_in;
            out.extend_from_slice(&chunk[..(inflater.total_out() - before_out) as usize]);
            if out.len() > expected {
                break;
            }
            if status == Status::StreamEnd {
                break;
            }
        }

        if out.len() != expected {
            return Err(PackError::corrupt(
                &self.pack_path,
                representation.offset,
                format!("inflated {} bytes, header declared {expected}", out.len()),
            ));
        }
        Ok(Bytes::from(out))
    }

    fn window_at(&self, position: u64) -> Result<Arc<Window>, PackError> {
        Ok(self
            .windows
            .get_window(&self.file, self.cache_id, self.length, position)?)
    }
}

/// Byte cursor over pack windows, for header decoding.
struct PackCursor<'p> {
    pack: &'p PackFile,
    position: u64,
    window: Option<Arc<Window>>,
}

impl<'p> PackCursor<'p> {
    fn new(pack: &'p PackFile, position: u64) -> Self {
        PackCursor {
            pack,
            position,
            window: None,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn next_byte(&mut self) -> Result<u8, PackError> {
        let window = match &self.window {
            Some(window) if window.contains(self.position) => Arc::clone(window),
            _ => {
                let window = self.pack.window_at(self.position)?;
                self.window = Some(Arc::clone(&window));
                window
            }
        };
        let byte = window.slice_from(self.position)[0];
        self.position += 1;
        Ok(byte)
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), PackError> {
        let mut filled = 0;
        while filled < dst.len() {
            let window = match &self.window {
                Some(window) if window.contains(self.position) => Arc::clone(window),
                _ => {
                    let window = self.pack.window_at(self.position)?;
                    self.window = Some(Arc::clone(&window));
                    window
                }
            };
            let n = window.copy(self.position, &mut dst[filled..]);
            filled += n;
            self.position += n as u64;
        }
        Ok(())
    }
}

/// Streaming zlib inflater drawing compressed bytes through pack windows.
///
/// Cancellation is observed at window boundaries.
pub(crate) struct InflateReader {
    pack: Arc<PackFile>,
    position: u64,
    inflater: Decompress,
    done: bool,
    token: CancelToken,
}

impl InflateReader {
    pub(crate) fn new(pack: Arc<PackFile>, data_offset: u64, token: CancelToken) -> Self {
        InflateReader {
            pack,
            position: data_offset,
            inflater: Decompress::new(true),
            done: false,
            token,
        }
    }
}

impl Read for InflateReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.done {
            return Ok(0);
        }
        loop {
            self.token.check().map_err(io::Error::other)?;
            let window = self
                .pack
                .window_at(self.position)
                .map_err(io::Error::other)?;
            let input = window.slice_from(self.position);
            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();
            let status = self
                .inflater
                .decompress(input, out, FlushDecompress::None)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            self.position += self.inflater.total_in() - before_in;
            let produced = (self.inflater.total_out() - before_out) as usize;
            if status == Status::StreamEnd {
                self.done = true;
            }
            if produced > 0 || self.done {
                return Ok(produced);
            }
        }
    }
}

/// Enforces a declared length on an inner stream, failing at EOF when the
/// produced byte count disagrees.
pub(crate) struct ExactLengthReader<R> {
    inner: R,
    expected: u64,
    produced: u64,
}

impl<R: Read> ExactLengthReader<R> {
    pub(crate) fn new(inner: R, expected: u64) -> Self {
        ExactLengthReader {
            inner,
            expected,
            produced: 0,
        }
    }
}

impl<R: Read> Read for ExactLengthReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        self.produced += n as u64;
        if self.produced > self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream produced more bytes than its declared size",
            ));
        }
        if n == 0 && !out.is_empty() && self.produced != self.expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended at {} of {} declared bytes",
                    self.produced, self.expected
                ),
            ));
        }
        Ok(n)
    }
}

/// Applies delta commands lazily against a base stream.
///
/// The base is opened through [`PackFile::open_stream_at`], so a chained
/// base is itself streamed. Copy commands that seek backwards reopen the
/// base from the start; forward seeks skip.
struct DeltaStreamReader {
    pack: Arc<PackFile>,
    base_offset: u64,
    delta: Bytes,
    command_position: usize,
    result_size: u64,
    produced: u64,
    base: Option<Box<dyn Read + Send>>,
    base_position: u64,
    /// Remaining (base offset, length) of the copy command in progress.
    pending_copy: Option<(u64, u64)>,
    /// Remaining delta-buffer range of the insert command in progress.
    pending_insert: Option<(usize, usize)>,
    token: CancelToken,
    location: (PathBuf, u64),
}

impl DeltaStreamReader {
    fn new(
        pack: Arc<PackFile>,
        base_offset: u64,
        delta: Bytes,
        header: delta::DeltaHeader,
        token: CancelToken,
        location: (PathBuf, u64),
    ) -> Result<Self, PackError> {
        Ok(DeltaStreamReader {
            pack,
            base_offset,
            command_position: header.header_length,
            result_size: header.result_size,
            produced: 0,
            base: None,
            base_position: 0,
            pending_copy: None,
            pending_insert: None,
            delta,
            token,
            location,
        })
    }

    fn corrupt(&self, cause: &str) -> io::Error {
        io::Error::other(PackError::corrupt(&self.location.0, self.location.1, cause))
    }

    /// Position the base stream at `offset`, reopening when seeking back.
    fn seek_base(&mut self, offset: u64) -> io::Result<()> {
        if self.base.is_none() || offset < self.base_position {
            let (_, _, reader) = self
                .pack
                .open_stream_at(self.base_offset, &self.token)
                .map_err(io::Error::other)?;
            self.base = Some(reader);
            self.base_position = 0;
        }
        let mut to_skip = offset - self.base_position;
        let mut scratch = [0u8; 8 * 1024];
        while to_skip > 0 {
            let want = scratch.len().min(to_skip as usize);
            let base = self.base.as_mut().expect("base opened above");
            let n = base.read(&mut scratch[..want])?;
            if n == 0 {
                return Err(self.corrupt("copy command seeks past base end"));
            }
            to_skip -= n as u64;
        }
        self.base_position = offset;
        Ok(())
    }

    /// Decode the next command into either a pending copy or a literal run.
    fn next_command(&mut self) -> io::Result<Option<Command>> {
        if self.command_position >= self.delta.len() {
            return Ok(None);
        }
        let command = self.delta[self.command_position];
        self.command_position += 1;

        if command & 0x80 != 0 {
            let mut offset = 0u64;
            let mut size = 0u64;
            for bit in 0..4 {
                if command & (1 << bit) != 0 {
                    let byte = *self
                        .delta
                        .get(self.command_position)
                        .ok_or_else(|| self.corrupt("truncated copy offset"))?;
                    self.command_position += 1;
                    offset |= u64::from(byte) << (8 * bit);
                }
            }
            for bit in 0..3 {
                if command & (1 << (4 + bit)) != 0 {
                    let byte = *self
                        .delta
                        .get(self.command_position)
                        .ok_or_else(|| self.corrupt("truncated copy size"))?;
                    self.command_position += 1;
                    size |= u64::from(byte) << (8 * bit);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            Ok(Some(Command::Copy { offset, size }))
        } else if command != 0 {
            let count = command as usize;
            if self.command_position + count > self.delta.len() {
                return Err(self.corrupt("truncated insert data"));
            }
            let start = self.command_position;
            self.command_position += count;
            Ok(Some(Command::Insert {
                start,
                end: start + count,
            }))
        } else {
            Err(self.corrupt("delta command byte 0 is invalid"))
        }
    }
}

enum Command {
    Copy { offset: u64, size: u64 },
    Insert { start: usize, end: usize },
}

impl Read for DeltaStreamReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.token.check().map_err(io::Error::other)?;

        loop {
            // continue a copy in progress
            if let Some((offset, remaining)) = self.pending_copy {
                self.seek_base(offset)?;
                let want = out.len().min(remaining as usize);
                let base = self.base.as_mut().expect("base opened by seek_base");
                let n = base.read(&mut out[..want])?;
                if n == 0 {
                    return Err(self.corrupt("copy command reads past base end"));
                }
                self.base_position += n as u64;
                self.produced += n as u64;
                self.pending_copy = if remaining > n as u64 {
                    Some((offset + n as u64, remaining - n as u64))
                } else {
                    None
                };
                return Ok(n);
            }

            // continue a literal run in progress
            if let Some((start, end)) = self.pending_insert {
                let n = out.len().min(end - start);
                out[..n].copy_from_slice(&self.delta[start..start + n]);
                self.pending_insert = (start + n < end).then_some((start + n, end));
                self.produced += n as u64;
                if self.produced > self.result_size {
                    return Err(self.corrupt("delta produced more bytes than declared"));
                }
                return Ok(n);
            }

            match self.next_command()? {
                None => {
                    if self.produced != self.result_size {
                        return Err(self.corrupt("delta produced fewer bytes than declared"));
                    }
                    return Ok(0);
                }
                Some(Command::Copy { offset, size }) => {
                    self.pending_copy = Some((offset, size));
                }
                Some(Command::Insert { start, end }) => {
                    self.pending_insert = Some((start, end));
                }
            }
        }
    }
}
