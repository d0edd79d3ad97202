//! Index entry representation
//!
//! Each entry pairs a path with the id of its staged content and a stat
//! snapshot for change detection.
//!
//! ## Entry format
//!
//! ```text
//! ctime, ctime_nsec, mtime, mtime_nsec,    4 bytes each
//! dev, ino, mode, uid, gid, size,          4 bytes each
//! id,                                      20 bytes
//! flags,                                   2 bytes
//! [extended flags,                         2 bytes, v3+ when flagged]
//! path, NUL, padding to 8-byte alignment   (v2/v3)
//! strip-varint, path suffix, NUL           (v4, prefix-compressed)
//! ```

use crate::artifacts::index::checksum::Checksum;
use crate::artifacts::index::entry_mode::{EntryMode, FileMode};
use crate::artifacts::index::ENTRY_BLOCK;
use crate::artifacts::objects::object_id::ObjectId;
use anyhow::Context;
use bitflags::bitflags;
use byteorder::{ByteOrder, WriteBytesExt};
use bytes::Bytes;
use is_executable::IsExecutable;
use std::fs::Metadata;
use std::io::{Read, Write};
use std::os::unix::prelude::MetadataExt;
use std::path::Path;

/// Fixed-size portion of an entry before the path.
pub const ENTRY_FIXED_SIZE: usize = 62;

/// Name lengths at or past this sentinel are not stored in the flags.
const NAME_LENGTH_MASK: u16 = 0x0fff;

/// Stage bits within the flag word.
const STAGE_SHIFT: u16 = 12;
const STAGE_MASK: u16 = 0x3000;

bitflags! {
    /// Boolean flags of the 16-bit flag word (stage and name length
    /// occupy the remaining bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u16 {
        const ASSUME_VALID = 0x8000;
        const EXTENDED = 0x4000;
    }
}

bitflags! {
    /// The v3 extended flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtendedFlags: u16 {
        const SKIP_WORKTREE = 0x4000;
        const INTENT_TO_ADD = 0x2000;
    }
}

/// Stat snapshot enabling change detection without reading content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStat {
    pub ctime: u32,
    pub ctime_nsec: u32,
    pub mtime: u32,
    pub mtime_nsec: u32,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
}

impl TryFrom<(&Path, &Metadata)> for EntryStat {
    type Error = anyhow::Error;

    fn try_from((_, metadata): (&Path, &Metadata)) -> anyhow::Result<Self> {
        Ok(EntryStat {
            ctime: metadata.ctime() as u32,
            ctime_nsec: metadata.ctime_nsec() as u32,
            mtime: metadata.mtime() as u32,
            mtime_nsec: metadata.mtime_nsec() as u32,
            dev: metadata.dev() as u32,
            ino: metadata.ino() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size() as u32,
        })
    }
}

/// One tracked path in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirCacheEntry {
    /// Repository-relative path, `/`-separated.
    pub path: String,
    /// Id of the staged content.
    pub id: ObjectId,
    pub mode: EntryMode,
    pub stat: EntryStat,
    pub flags: EntryFlags,
    pub extended: ExtendedFlags,
    stage: u8,
}

impl DirCacheEntry {
    pub fn new(path: impl Into<String>, id: ObjectId, mode: EntryMode) -> Self {
        DirCacheEntry {
            path: path.into(),
            id,
            mode,
            stat: EntryStat::default(),
            flags: EntryFlags::empty(),
            extended: ExtendedFlags::empty(),
            stage: 0,
        }
    }

    /// Build an entry from a file in the working tree.
    pub fn from_workspace_file(
        path: impl Into<String>,
        file_path: &Path,
        id: ObjectId,
    ) -> anyhow::Result<Self> {
        let metadata = std::fs::metadata(file_path)
            .with_context(|| format!("unable to stat {}", file_path.display()))?;
        let mode = if file_path.is_executable() {
            EntryMode::File(FileMode::Executable)
        } else {
            EntryMode::File(FileMode::Regular)
        };

        let mut entry = DirCacheEntry::new(path, id, mode);
        entry.stat = EntryStat::try_from((file_path, &metadata))?;
        Ok(entry)
    }

    /// Merge stage (0 for a normal entry, 1..=3 during conflicts).
    pub fn stage(&self) -> u8 {
        self.stage
    }

    pub fn with_stage(mut self, stage: u8) -> Self {
        self.stage = stage & 0x3;
        self
    }

    pub fn assume_valid(&self) -> bool {
        self.flags.contains(EntryFlags::ASSUME_VALID)
    }

    /// Whether `stat` matches this entry closely enough to skip content
    /// comparison.
    pub fn stat_matches(&self, stat: &EntryStat) -> bool {
        self.stat.mtime == stat.mtime
            && self.stat.mtime_nsec == stat.mtime_nsec
            && self.stat.size == stat.size
            && self.stat.ino == stat.ino
            && self.stat.dev == stat.dev
    }

    /// Serialize in version 2 layout, padded to the entry block size.
    pub fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut bytes = Vec::with_capacity(ENTRY_FIXED_SIZE + self.path.len() + ENTRY_BLOCK);
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.ctime)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.ctime_nsec)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.mtime)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.mtime_nsec)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.dev)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.ino)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.mode.as_u32())?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.uid)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.gid)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.stat.size)?;
        self.id.write_raw_to(&mut bytes)?;

        let name_length = self.path.len().min(NAME_LENGTH_MASK as usize) as u16;
        let flags = (self.flags & EntryFlags::ASSUME_VALID).bits()
            | (u16::from(self.stage) << STAGE_SHIFT)
            | name_length;
        bytes.write_u16::<byteorder::NetworkEndian>(flags)?;
        bytes.write_all(self.path.as_bytes())?;

        // at least one NUL, then pad the whole entry to the block size
        bytes.push(0);
        while bytes.len() % ENTRY_BLOCK != 0 {
            bytes.push(0);
        }
        Ok(Bytes::from(bytes))
    }

    /// Parse the next entry from `reader`.
    ///
    /// `previous_path` feeds version 4 prefix compression and must be the
    /// path of the entry read immediately before (empty for the first).
    pub fn parse<R: Read>(
        reader: &mut Checksum<R>,
        version: u32,
        previous_path: &str,
    ) -> anyhow::Result<DirCacheEntry> {
        let fixed = reader.read(ENTRY_FIXED_SIZE)?;

        let stat = EntryStat {
            ctime: byteorder::NetworkEndian::read_u32(&fixed[0..4]),
            ctime_nsec: byteorder::NetworkEndian::read_u32(&fixed[4..8]),
            mtime: byteorder::NetworkEndian::read_u32(&fixed[8..12]),
            mtime_nsec: byteorder::NetworkEndian::read_u32(&fixed[12..16]),
            dev: byteorder::NetworkEndian::read_u32(&fixed[16..20]),
            ino: byteorder::NetworkEndian::read_u32(&fixed[20..24]),
            uid: byteorder::NetworkEndian::read_u32(&fixed[28..32]),
            gid: byteorder::NetworkEndian::read_u32(&fixed[32..36]),
            size: byteorder::NetworkEndian::read_u32(&fixed[36..40]),
        };
        let mode = EntryMode::try_from(byteorder::NetworkEndian::read_u32(&fixed[24..28]))?;
        let id = ObjectId::from_bytes(&fixed[40..60]).expect("fixed slice is 20 bytes");
        let raw_flags = byteorder::NetworkEndian::read_u16(&fixed[60..62]);

        let flags = EntryFlags::from_bits_truncate(raw_flags);
        let stage = ((raw_flags & STAGE_MASK) >> STAGE_SHIFT) as u8;
        let name_length = raw_flags & NAME_LENGTH_MASK;

        let mut extended = ExtendedFlags::empty();
        let mut extended_size = 0;
        if flags.contains(EntryFlags::EXTENDED) {
            if version < 3 {
                anyhow::bail!("extended flags are not valid in a version-2 index");
            }
            let word = reader.read(2)?;
            extended =
                ExtendedFlags::from_bits_truncate(byteorder::NetworkEndian::read_u16(&word));
            extended_size = 2;
        }

        let path = if version == 4 {
            read_compressed_path(reader, previous_path)?
        } else {
            read_padded_path(reader, name_length, extended_size)?
        };

        Ok(DirCacheEntry {
            path,
            id,
            mode,
            stat,
            flags: flags & (EntryFlags::ASSUME_VALID | EntryFlags::EXTENDED),
            extended,
            stage,
        })
    }
}

/// Read a v2/v3 path plus the NUL padding aligning the entry.
///
/// An entry is padded with 1..=8 NULs to the block size, so the total is
/// computed over the name plus its mandatory terminator.
fn read_padded_path<R: Read>(
    reader: &mut Checksum<R>,
    name_length: u16,
    extended_size: usize,
) -> anyhow::Result<String> {
    let (path_bytes, consumed) = if name_length < NAME_LENGTH_MASK {
        let bytes = reader.read(name_length as usize)?.to_vec();
        let consumed = ENTRY_FIXED_SIZE + extended_size + bytes.len();
        (bytes, consumed)
    } else {
        // overlong path: stored NUL-terminated, length not in the flags
        let mut bytes = Vec::with_capacity(NAME_LENGTH_MASK as usize);
        loop {
            let byte = reader.read(1)?[0];
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        let consumed = ENTRY_FIXED_SIZE + extended_size + bytes.len() + 1;
        (bytes, consumed)
    };

    let total = (ENTRY_FIXED_SIZE + extended_size + path_bytes.len() + 1)
        .div_ceil(ENTRY_BLOCK)
        * ENTRY_BLOCK;
    let padding = reader.read(total - consumed)?;
    if padding.iter().any(|&byte| byte != 0) {
        anyhow::bail!("index entry padding contains non-NUL bytes");
    }

    String::from_utf8(path_bytes).context("index entry path is not valid UTF-8")
}

/// Read a v4 prefix-compressed path: a strip count followed by the
/// NUL-terminated suffix appended to the previous path.
fn read_compressed_path<R: Read>(
    reader: &mut Checksum<R>,
    previous_path: &str,
) -> anyhow::Result<String> {
    let mut strip: usize = 0;
    loop {
        let byte = reader.read(1)?[0];
        strip = (strip << 7) | (byte & 0x7f) as usize;
        if byte & 0x80 == 0 {
            break;
        }
        strip += 1;
    }

    let keep = previous_path
        .len()
        .checked_sub(strip)
        .context("index v4 strip count exceeds previous path length")?;

    let mut path = previous_path.as_bytes()[..keep].to_vec();
    loop {
        let byte = reader.read(1)?[0];
        if byte == 0 {
            break;
        }
        path.push(byte);
    }
    String::from_utf8(path).context("index entry path is not valid UTF-8")
}
