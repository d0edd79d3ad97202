//! Pack index files (v1 and v2)
//!
//! The index maps object ids to byte offsets inside its pack. Both
//! versions open with a 256-entry fanout table: `fanout[b]` counts the
//! objects whose first id byte is ≤ `b`, so the bucket for a lookup is
//! `[fanout[b-1], fanout[b])` and the search inside it is binary.
//!
//! ## Layout
//!
//! ```text
//! v1: 256×u32 fanout | N×(u32 offset, 20-byte id) | pack sha1 | idx sha1
//! v2: \xff t O c | u32 version (2) | 256×u32 fanout | N×20 ids
//!     | N×u32 crc32 | N×u32 offsets | M×u64 large offsets
//!     | pack sha1 | idx sha1
//! ```
//!
//! v2 is column-major: a position found by binary search in the id column
//! indexes the CRC and offset columns directly. An offset with the high
//! bit set points into the 64-bit table (packs over 4 GiB).

use crate::artifacts::objects::object_id::{AbbreviatedObjectId, ObjectId};
use crate::artifacts::objects::OBJECT_ID_LENGTH;
use crate::artifacts::pack::PackError;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Magic bytes of a v2 (or later) index.
const INDEX_V2_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];

/// Fanout table size in bytes.
const FANOUT_SIZE: usize = 256 * 4;

/// Length of the two trailing checksums.
const TRAILER_SIZE: usize = 2 * OBJECT_ID_LENGTH;

/// An id/offset pair yielded by index iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackIndexEntry {
    pub id: ObjectId,
    pub offset: u64,
}

/// A parsed pack index, either layout behind one lookup API.
#[derive(Debug)]
pub enum PackIndex {
    V1(IndexV1),
    V2(IndexV2),
}

impl PackIndex {
    /// Read and parse an index file.
    pub fn open(path: &Path) -> Result<PackIndex, PackError> {
        let bytes = Bytes::from(std::fs::read(path)?);
        Self::from_bytes(path.to_path_buf(), bytes)
    }

    /// Parse an index from bytes already in memory.
    ///
    /// `path` is only used to locate corruption reports.
    pub fn from_bytes(path: PathBuf, bytes: Bytes) -> Result<PackIndex, PackError> {
        if bytes.len() >= 8 && bytes[..4] == INDEX_V2_MAGIC {
            let version = BigEndian::read_u32(&bytes[4..8]);
            if version != 2 {
                return Err(PackError::UnsupportedIndexVersion(version));
            }
            IndexV2::parse(path, bytes).map(PackIndex::V2)
        } else {
            IndexV1::parse(path, bytes).map(PackIndex::V1)
        }
    }

    /// Number of objects in the pack.
    pub fn object_count(&self) -> u32 {
        match self {
            PackIndex::V1(v1) => v1.count,
            PackIndex::V2(v2) => v2.count,
        }
    }

    /// The pack checksum recorded in the index trailer.
    ///
    /// Must equal the 20 trailing bytes of the pack file itself; a
    /// mismatch means the index describes a different pack.
    pub fn pack_checksum(&self) -> &[u8; OBJECT_ID_LENGTH] {
        match self {
            PackIndex::V1(v1) => &v1.pack_checksum,
            PackIndex::V2(v2) => &v2.pack_checksum,
        }
    }

    /// Find the pack offset of `id`.
    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        let position = self.find_position(id)?;
        Some(match self {
            PackIndex::V1(v1) => v1.offset_at(position),
            PackIndex::V2(v2) => v2.offset_at(position),
        })
    }

    /// CRC32 of the packed representation of `id` (v2 only).
    pub fn crc32(&self, id: &ObjectId) -> Option<u32> {
        match self {
            PackIndex::V1(_) => None,
            PackIndex::V2(v2) => {
                let position = self.find_position(id)?;
                Some(BigEndian::read_u32(&v2.crcs[position * 4..]))
            }
        }
    }

    /// Whether `id` is present.
    pub fn has(&self, id: &ObjectId) -> bool {
        self.find_position(id).is_some()
    }

    /// Collect ids starting with `abbrev` into `matches`.
    ///
    /// Stops after `max_matches + 1` hits so callers can distinguish "unique"
    /// from "ambiguous" without enumerating the whole bucket.
    pub fn resolve(
        &self,
        abbrev: &AbbreviatedObjectId,
        max_matches: usize,
        matches: &mut Vec<ObjectId>,
    ) {
        let bucket = self.bucket_of(abbrev.first_byte());
        let mut position = self.lower_bound(bucket.clone(), |id| abbrev.prefix_compare(id));

        while position < bucket.end {
            let id = self.id_at(position);
            if abbrev.prefix_compare(&id) != Ordering::Equal {
                break;
            }
            if !matches.contains(&id) {
                matches.push(id);
            }
            if matches.len() > max_matches {
                break;
            }
            position += 1;
        }
    }

    /// Iterate entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = PackIndexEntry> + '_ {
        (0..self.object_count() as usize).map(move |position| PackIndexEntry {
            id: self.id_at(position),
            offset: match self {
                PackIndex::V1(v1) => v1.offset_at(position),
                PackIndex::V2(v2) => v2.offset_at(position),
            },
        })
    }

    fn id_at(&self, position: usize) -> ObjectId {
        let bytes = match self {
            PackIndex::V1(v1) => &v1.records[position * 24 + 4..position * 24 + 24],
            PackIndex::V2(v2) => {
                &v2.ids[position * OBJECT_ID_LENGTH..(position + 1) * OBJECT_ID_LENGTH]
            }
        };
        ObjectId::from_bytes(bytes).expect("index id column slice is 20 bytes")
    }

    fn fanout_at(&self, byte: usize) -> u32 {
        let fanout = match self {
            PackIndex::V1(v1) => &v1.fanout,
            PackIndex::V2(v2) => &v2.fanout,
        };
        BigEndian::read_u32(&fanout[byte * 4..])
    }

    fn bucket_of(&self, first_byte: u8) -> std::ops::Range<usize> {
        let start = if first_byte == 0 {
            0
        } else {
            self.fanout_at(first_byte as usize - 1) as usize
        };
        let end = self.fanout_at(first_byte as usize) as usize;
        start..end
    }

    fn find_position(&self, id: &ObjectId) -> Option<usize> {
        let bucket = self.bucket_of(id.as_bytes()[0]);
        let position = self.lower_bound(bucket.clone(), |candidate| id.cmp(candidate));
        (position < bucket.end && &self.id_at(position) == id).then_some(position)
    }

    /// First position in `range` whose id is not below the probe, per
    /// `compare(probe_vs_entry)`.
    fn lower_bound(
        &self,
        range: std::ops::Range<usize>,
        compare: impl Fn(&ObjectId) -> Ordering,
    ) -> usize {
        let mut low = range.start;
        let mut high = range.end;
        while low < high {
            let mid = (low + high) / 2;
            match compare(&self.id_at(mid)) {
                Ordering::Greater => low = mid + 1,
                _ => high = mid,
            }
        }
        low
    }
}

/// Legacy index: interleaved (offset, id) records.
#[derive(Debug)]
pub struct IndexV1 {
    fanout: Bytes,
    records: Bytes,
    pack_checksum: [u8; OBJECT_ID_LENGTH],
    count: u32,
}

impl IndexV1 {
    fn parse(path: PathBuf, bytes: Bytes) -> Result<IndexV1, PackError> {
        if bytes.len() < FANOUT_SIZE + TRAILER_SIZE {
            return Err(PackError::corrupt(&path, 0, "index file truncated"));
        }

        let fanout = bytes.slice(..FANOUT_SIZE);
        let count = validate_fanout(&path, &fanout)?;

        let records_len = count as usize * 24;
        let expected = FANOUT_SIZE + records_len + TRAILER_SIZE;
        if bytes.len() != expected {
            return Err(PackError::corrupt(
                &path,
                0,
                format!("index length {} does not match {count} objects", bytes.len()),
            ));
        }

        let records = bytes.slice(FANOUT_SIZE..FANOUT_SIZE + records_len);
        let mut pack_checksum = [0u8; OBJECT_ID_LENGTH];
        pack_checksum.copy_from_slice(
            &bytes[FANOUT_SIZE + records_len..FANOUT_SIZE + records_len + OBJECT_ID_LENGTH],
        );

        Ok(IndexV1 {
            fanout,
            records,
            pack_checksum,
            count,
        })
    }

    fn offset_at(&self, position: usize) -> u64 {
        BigEndian::read_u32(&self.records[position * 24..]) as u64
    }
}

/// Column-major index with CRCs and 64-bit offset spillover.
#[derive(Debug)]
pub struct IndexV2 {
    fanout: Bytes,
    ids: Bytes,
    crcs: Bytes,
    offsets: Bytes,
    large_offsets: Bytes,
    pack_checksum: [u8; OBJECT_ID_LENGTH],
    count: u32,
}

impl IndexV2 {
    fn parse(path: PathBuf, bytes: Bytes) -> Result<IndexV2, PackError> {
        const HEADER: usize = 8;
        if bytes.len() < HEADER + FANOUT_SIZE + TRAILER_SIZE {
            return Err(PackError::corrupt(&path, 0, "index file truncated"));
        }

        let fanout = bytes.slice(HEADER..HEADER + FANOUT_SIZE);
        let count = validate_fanout(&path, &fanout)?;
        let n = count as usize;

        let ids_start = HEADER + FANOUT_SIZE;
        let crcs_start = ids_start + n * OBJECT_ID_LENGTH;
        let offsets_start = crcs_start + n * 4;
        let large_start = offsets_start + n * 4;
        let large_end = bytes.len() - TRAILER_SIZE;

        if large_end < large_start || (large_end - large_start) % 8 != 0 {
            return Err(PackError::corrupt(
                &path,
                0,
                "index columns do not fit the recorded object count",
            ));
        }

        let index = IndexV2 {
            fanout,
            ids: bytes.slice(ids_start..crcs_start),
            crcs: bytes.slice(crcs_start..offsets_start),
            offsets: bytes.slice(offsets_start..large_start),
            large_offsets: bytes.slice(large_start..large_end),
            pack_checksum: {
                let mut sum = [0u8; OBJECT_ID_LENGTH];
                sum.copy_from_slice(&bytes[large_end..large_end + OBJECT_ID_LENGTH]);
                sum
            },
            count,
        };

        // every spilled offset must land inside the 64-bit table
        let large_count = (large_end - large_start) / 8;
        for position in 0..n {
            let offset = BigEndian::read_u32(&index.offsets[position * 4..]);
            if offset & 0x8000_0000 != 0 && (offset & 0x7fff_ffff) as usize >= large_count {
                return Err(PackError::corrupt(
                    &path,
                    0,
                    format!("large offset {offset:#x} outside the 64-bit table"),
                ));
            }
        }

        Ok(index)
    }

    fn offset_at(&self, position: usize) -> u64 {
        let offset = BigEndian::read_u32(&self.offsets[position * 4..]);
        if offset & 0x8000_0000 == 0 {
            offset as u64
        } else {
            let large_position = (offset & 0x7fff_ffff) as usize;
            BigEndian::read_u64(&self.large_offsets[large_position * 8..])
        }
    }
}

/// Check monotonicity and return the object count (`fanout[255]`).
fn validate_fanout(path: &Path, fanout: &[u8]) -> Result<u32, PackError> {
    let mut previous = 0u32;
    for byte in 0..256 {
        let value = BigEndian::read_u32(&fanout[byte * 4..]);
        if value < previous {
            return Err(PackError::corrupt(
                path,
                (byte * 4) as u64,
                "fanout table is not monotonic",
            ));
        }
        previous = value;
    }
    Ok(previous)
}

impl AbbreviatedObjectId {
    /// First full byte of the prefix (abbreviations are ≥ 2 nibbles).
    fn first_byte(&self) -> u8 {
        let hex = self.to_hex();
        u8::from_str_radix(&hex[..2], 16).expect("abbreviation starts with two hex nibbles")
    }
}
