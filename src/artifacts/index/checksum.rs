//! Streaming SHA-1 wrapper for index I/O
//!
//! The index file ends with a SHA-1 of everything before it. Reads and
//! writes flow through this wrapper so the digest tracks the bytes as
//! they pass, and the trailer can be verified (or emitted) at the end.

use crate::artifacts::index::CHECKSUM_SIZE;
use anyhow::anyhow;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

#[derive(Debug)]
pub struct Checksum<F> {
    file: F,
    digest: Sha1,
    consumed: u64,
}

impl<F> Checksum<F> {
    pub fn new(file: F) -> Self {
        Checksum {
            file,
            digest: Sha1::new(),
            consumed: 0,
        }
    }

    /// Bytes read or written through this wrapper so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl<F: Read> Checksum<F> {
    /// Read exactly `size` bytes, folding them into the digest.
    pub fn read(&mut self, size: usize) -> anyhow::Result<Bytes> {
        let mut buffer = vec![0; size];
        self.file
            .read_exact(&mut buffer)
            .map_err(|_| anyhow!("unexpected end-of-file while reading index"))?;

        self.digest.update(&buffer);
        self.consumed += size as u64;
        Ok(Bytes::from(buffer))
    }

    /// Read the trailer and compare it to the digest of everything read.
    pub fn verify(&mut self) -> anyhow::Result<()> {
        let mut expected = [0u8; CHECKSUM_SIZE];
        self.file.read_exact(&mut expected)?;

        let actual = self.digest.clone().finalize();
        if expected != actual.as_slice() {
            return Err(anyhow!("index checksum does not match value stored on disk"));
        }
        Ok(())
    }
}

impl<F: Write> Checksum<F> {
    /// Write `data`, folding it into the digest.
    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(data)?;
        self.digest.update(data);
        self.consumed += data.len() as u64;
        Ok(())
    }

    /// Emit the digest of everything written as the trailer.
    pub fn write_checksum(&mut self) -> anyhow::Result<()> {
        let checksum = self.digest.clone().finalize();
        self.file
            .write_all(checksum.as_slice())
            .map_err(|_| anyhow!("failed to write index checksum"))?;
        Ok(())
    }
}
