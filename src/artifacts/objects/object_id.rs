//! Git object identifier (SHA-1 hash)
//!
//! Object IDs are 20-byte SHA-1 hashes identifying every object in the
//! repository (blobs, trees, commits, tags). They are carried as raw bytes;
//! the 40-character hexadecimal form is a presentation detail.
//!
//! ## Format
//!
//! - Full: 20 bytes, displayed as 40 lowercase hex characters
//! - Abbreviated: a prefix of 2..=40 hex nibbles (see [`AbbreviatedObjectId`])
//!
//! ## Storage
//!
//! Loose objects are stored in `objects/<first-2-hex>/<remaining-38-hex>`

use crate::artifacts::objects::{OBJECT_ID_HEX_LENGTH, OBJECT_ID_LENGTH};
use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while parsing object ids and abbreviations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid object id length: {0}")]
    InvalidLength(usize),
    #[error("invalid hex digit in object id: {0:?}")]
    InvalidHexDigit(char),
    #[error("invalid abbreviation length: {0} (expected 2..=40)")]
    InvalidAbbrevLength(usize),
}

/// Git object identifier (SHA-1 hash)
///
/// A fixed 20-byte value that uniquely identifies an object. Equality,
/// ordering and hashing are by bytes. The all-zero id is reserved to mean
/// "no such object" (a ref that did not previously exist, a deletion).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; OBJECT_ID_LENGTH]);

impl ObjectId {
    /// The distinguished all-zero id.
    pub const ZERO: ObjectId = ObjectId([0; OBJECT_ID_LENGTH]);

    /// Wrap a raw 20-byte array.
    pub const fn from_raw(bytes: [u8; OBJECT_ID_LENGTH]) -> Self {
        ObjectId(bytes)
    }

    /// Parse an id from a byte slice.
    ///
    /// # Arguments
    ///
    /// * `bytes` - exactly 20 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != OBJECT_ID_LENGTH {
            return Err(IdError::InvalidLength(bytes.len()));
        }
        let mut raw = [0u8; OBJECT_ID_LENGTH];
        raw.copy_from_slice(bytes);
        Ok(ObjectId(raw))
    }

    /// Parse and validate an id from its 40-nibble hexadecimal form.
    ///
    /// # Arguments
    ///
    /// * `hex` - 40 hexadecimal characters, upper or lower case
    ///
    /// # Returns
    ///
    /// Validated ObjectId or error if invalid length/characters
    pub fn from_hex(hex: &str) -> Result<Self, IdError> {
        if hex.len() != OBJECT_ID_HEX_LENGTH {
            return Err(IdError::InvalidLength(hex.len()));
        }

        let mut raw = [0u8; OBJECT_ID_LENGTH];
        let bytes = hex.as_bytes();
        for (i, chunk) in raw.iter_mut().enumerate() {
            let hi = hex_value(bytes[2 * i])?;
            let lo = hex_value(bytes[2 * i + 1])?;
            *chunk = (hi << 4) | lo;
        }

        Ok(ObjectId(raw))
    }

    /// Whether this is the distinguished all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; OBJECT_ID_LENGTH]
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LENGTH] {
        &self.0
    }

    /// The first four bytes of the id as a 32-bit integer.
    ///
    /// SHA-1 output is uniformly distributed, so this word is suitable as
    /// a bucket index for hash maps sized to a power of two.
    pub fn first_word(&self) -> u32 {
        BigEndian::read_u32(&self.0[..4])
    }

    /// Format as 40 lowercase hexadecimal characters.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(OBJECT_ID_HEX_LENGTH);
        for byte in &self.0 {
            hex.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            hex.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
        }
        hex
    }

    /// Convert to the loose-object file system path `xx/yyyy...`.
    ///
    /// For example, `abc123...` becomes `ab/c123...`
    pub fn to_path(&self) -> PathBuf {
        let hex = self.to_hex();
        let (dir, file) = hex.split_at(2);
        PathBuf::from(dir).join(file)
    }

    /// Shorten to an abbreviation of `length` nibbles.
    pub fn abbreviate(&self, length: usize) -> Result<AbbreviatedObjectId, IdError> {
        AbbreviatedObjectId::from_hex(&self.to_hex()[..length.min(OBJECT_ID_HEX_LENGTH)])
    }

    /// Whether this id begins with the given abbreviation.
    pub fn starts_with(&self, abbrev: &AbbreviatedObjectId) -> bool {
        abbrev.prefix_compare(self) == Ordering::Equal
    }

    /// Write the raw 20 bytes to a writer.
    ///
    /// Used when serializing tree entries and index entries.
    pub fn write_raw_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.0)
    }

    /// Read the raw 20 bytes from a reader.
    pub fn read_raw_from<R: io::Read + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut raw = [0u8; OBJECT_ID_LENGTH];
        reader.read_exact(&mut raw)?;
        Ok(ObjectId(raw))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::from_hex(s)
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn hex_value(digit: u8) -> Result<u8, IdError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        other => Err(IdError::InvalidHexDigit(other as char)),
    }
}

/// A prefix of an [`ObjectId`] with length 2..=40 hex nibbles.
///
/// Carries the prefix bytes plus the nibble count, so odd-length prefixes
/// compare correctly on their trailing half byte. Two distinct ids may share
/// a prefix; callers resolving abbreviations must treat multiple matches as
/// ambiguous rather than picking one.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbbreviatedObjectId {
    /// Prefix bytes, zero-padded past the prefix.
    bytes: [u8; OBJECT_ID_LENGTH],
    /// Number of hex nibbles in the prefix.
    nibbles: usize,
}

impl AbbreviatedObjectId {
    /// Parse an abbreviation from 2..=40 hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, IdError> {
        if hex.len() < 2 || hex.len() > OBJECT_ID_HEX_LENGTH {
            return Err(IdError::InvalidAbbrevLength(hex.len()));
        }

        let mut bytes = [0u8; OBJECT_ID_LENGTH];
        for (i, digit) in hex.as_bytes().iter().enumerate() {
            let value = hex_value(*digit)?;
            if i % 2 == 0 {
                bytes[i / 2] |= value << 4;
            } else {
                bytes[i / 2] |= value;
            }
        }

        Ok(AbbreviatedObjectId {
            bytes,
            nibbles: hex.len(),
        })
    }

    /// Number of hex nibbles in this prefix.
    pub fn length(&self) -> usize {
        self.nibbles
    }

    /// Whether the prefix covers a complete 40-nibble id.
    pub fn is_complete(&self) -> bool {
        self.nibbles == OBJECT_ID_HEX_LENGTH
    }

    /// The complete id, when [`is_complete`](Self::is_complete) holds.
    pub fn to_object_id(&self) -> Option<ObjectId> {
        self.is_complete().then(|| ObjectId(self.bytes))
    }

    /// Compare the first `length()` nibbles of `id` against this prefix.
    ///
    /// # Returns
    ///
    /// `Ordering::Equal` when `id` starts with this prefix; otherwise the
    /// ordering of the prefix relative to the id's leading nibbles.
    pub fn prefix_compare(&self, id: &ObjectId) -> Ordering {
        let full_bytes = self.nibbles / 2;
        match self.bytes[..full_bytes].cmp(&id.0[..full_bytes]) {
            Ordering::Equal if self.nibbles % 2 == 1 => {
                let ours = self.bytes[full_bytes] >> 4;
                let theirs = id.0[full_bytes] >> 4;
                ours.cmp(&theirs)
            }
            ordering => ordering,
        }
    }

    /// Format as the original hex prefix.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(self.nibbles);
        for i in 0..self.nibbles {
            let byte = self.bytes[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            hex.push(HEX_DIGITS[nibble as usize] as char);
        }
        hex
    }
}

impl std::fmt::Display for AbbreviatedObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for AbbreviatedObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AbbreviatedObjectId({})", self.to_hex())
    }
}
