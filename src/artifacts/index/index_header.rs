use crate::artifacts::index::{HEADER_SIZE, READ_VERSIONS, SIGNATURE};
use anyhow::anyhow;
use byteorder::{ByteOrder, WriteBytesExt};
use bytes::Bytes;
use derive_new::new;
use std::io::Write;

/// The 12-byte `DIRC` header of an index file.
#[derive(Debug, Clone, new)]
pub struct IndexHeader {
    pub(crate) version: u32,
    pub(crate) entries_count: u32,
}

impl IndexHeader {
    pub fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.write_all(SIGNATURE)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.version)?;
        bytes.write_u32::<byteorder::NetworkEndian>(self.entries_count)?;
        Ok(Bytes::from(bytes))
    }

    /// Parse and validate the header: signature and supported version.
    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(anyhow!("index header truncated"));
        }
        if &bytes[0..4] != SIGNATURE {
            return Err(anyhow!("invalid index file signature"));
        }

        let version = byteorder::NetworkEndian::read_u32(&bytes[4..8]);
        if !READ_VERSIONS.contains(&version) {
            return Err(anyhow!("unsupported index file version: {version}"));
        }
        let entries_count = byteorder::NetworkEndian::read_u32(&bytes[8..12]);

        Ok(IndexHeader {
            version,
            entries_count,
        })
    }
}
