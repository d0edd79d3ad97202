//! DirCache: the on-disk index
//!
//! Holds the sorted entry list of the index file, rereads it when the
//! backing file changes, and rewrites it whole through a lock-file swap.
//!
//! ## Concurrency
//!
//! Readers take a shared advisory lock while parsing so a concurrent
//! writer's rename cannot interleave with the read. The in-memory copy
//! remembers the stat of the file it was parsed from; `is_outdated`
//! compares that against the file's current stat.

use crate::artifacts::index::checksum::Checksum;
use crate::artifacts::index::index_entry::DirCacheEntry;
use crate::artifacts::index::index_header::IndexHeader;
use crate::artifacts::index::{CHECKSUM_SIZE, HEADER_SIZE, WRITE_VERSION};
use crate::artifacts::lock_file::{CommitStat, LockFile};
use anyhow::Context;
use std::collections::BTreeMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// In-memory copy of the index file.
#[derive(Debug, Default)]
pub struct DirCache {
    path: PathBuf,
    /// Entries keyed by (path, stage); the map order is the file order.
    entries: BTreeMap<(String, u8), DirCacheEntry>,
    /// Stat of the file the entries were parsed from.
    loaded_stat: Option<CommitStat>,
    changed: bool,
}

impl DirCache {
    /// Bind to an index file (typically `<git-dir>/index`).
    pub fn new(path: PathBuf) -> Self {
        DirCache {
            path,
            ..DirCache::default()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirCacheEntry> {
        self.entries.values()
    }

    /// Look up the stage-0 entry at `path`.
    pub fn entry(&self, path: &str) -> Option<&DirCacheEntry> {
        self.entry_at_stage(path, 0)
    }

    pub fn entry_at_stage(&self, path: &str, stage: u8) -> Option<&DirCacheEntry> {
        self.entries.get(&(path.to_string(), stage))
    }

    /// Whether the backing file changed since [`read`](Self::read).
    pub fn is_outdated(&self) -> anyhow::Result<bool> {
        Ok(CommitStat::of(&self.path)? != self.loaded_stat)
    }

    /// Load the index from disk, replacing the in-memory entries.
    ///
    /// A missing file loads as an empty index. The SHA-1 trailer is
    /// verified over everything read.
    pub fn read(&mut self) -> anyhow::Result<()> {
        self.entries.clear();
        self.changed = false;
        self.loaded_stat = CommitStat::of(&self.path)?;

        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).context(format!("unable to open index {}", self.path.display()))
            }
        };
        let file_length = file.metadata()?.len();
        if file_length == 0 {
            return Ok(());
        }

        let mut locked = file;
        let mut guard = file_guard::lock(&mut locked, file_guard::Lock::Shared, 0, 1)?;
        let mut reader = Checksum::new(BufReader::new(&mut *guard));

        let header = IndexHeader::deserialize(&reader.read(HEADER_SIZE)?)?;
        let mut previous_path = String::new();
        for _ in 0..header.entries_count {
            let entry = DirCacheEntry::parse(&mut reader, header.version, &previous_path)?;
            previous_path = entry.path.clone();
            self.entries
                .insert((entry.path.clone(), entry.stage()), entry);
        }

        self.skip_extensions(&mut reader, file_length)?;
        reader.verify()?;

        debug!(entries = self.entries.len(), version = header.version, "read index");
        Ok(())
    }

    /// Stage an entry, replacing any existing entry of the same path and
    /// stage.
    pub fn add(&mut self, entry: DirCacheEntry) {
        self.entries
            .insert((entry.path.clone(), entry.stage()), entry);
        self.changed = true;
    }

    /// Drop every stage of `path`.
    pub fn remove(&mut self, path: &str) {
        let before = self.entries.len();
        self.entries.retain(|(entry_path, _), _| entry_path != path);
        if self.entries.len() != before {
            self.changed = true;
        }
    }

    pub fn has_changes(&self) -> bool {
        self.changed
    }

    /// Rewrite the index file through a lock-file swap.
    ///
    /// The whole file is rebuilt in version 2 layout; the committed stat
    /// becomes the new baseline for [`is_outdated`](Self::is_outdated).
    pub fn write(&mut self) -> anyhow::Result<()> {
        let mut lock = LockFile::acquire(&self.path)?;
        {
            let mut writer = Checksum::new(lock.writer());
            let header = IndexHeader::new(WRITE_VERSION, self.entries.len() as u32);
            writer.write(&header.serialize()?)?;
            for entry in self.entries.values() {
                writer.write(&entry.serialize()?)?;
            }
            writer.write_checksum()?;
        }
        let stat = lock.commit()?;

        self.loaded_stat = Some(stat);
        self.changed = false;
        debug!(entries = self.entries.len(), "wrote index");
        Ok(())
    }

    /// Skip extensions between the entries and the trailer.
    ///
    /// Extensions whose signature starts with an uppercase letter are
    /// optional and ignorable; anything else is mandatory and unknown
    /// here, so the load fails rather than silently dropping state.
    fn skip_extensions(
        &self,
        reader: &mut Checksum<impl std::io::Read>,
        file_length: u64,
    ) -> anyhow::Result<()> {
        use byteorder::ByteOrder;

        if reader.consumed() + CHECKSUM_SIZE as u64 > file_length {
            anyhow::bail!("index file truncated");
        }
        while reader.consumed() + (CHECKSUM_SIZE as u64) < file_length {
            let signature = reader.read(4)?;
            if !signature[0].is_ascii_uppercase() {
                anyhow::bail!(
                    "index carries unsupported mandatory extension {:?}",
                    String::from_utf8_lossy(&signature)
                );
            }
            let size = byteorder::NetworkEndian::read_u32(&reader.read(4)?);
            reader.read(size as usize)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::index::entry_mode::EntryMode;
    use crate::artifacts::objects::object_id::ObjectId;
    use assert_fs::TempDir;
    use byteorder::WriteBytesExt;

    fn id(fill: char) -> ObjectId {
        ObjectId::from_hex(&fill.to_string().repeat(40)).unwrap()
    }

    fn entry(path: &str, fill: char) -> DirCacheEntry {
        DirCacheEntry::new(path, id(fill), EntryMode::default_file())
    }

    #[test]
    fn test_write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirCache::new(dir.path().join("index"));
        cache.add(entry("b.txt", 'b'));
        cache.add(entry("a.txt", 'a'));
        cache.add(entry("dir/nested.txt", 'c'));
        cache.write().unwrap();

        let mut reloaded = DirCache::new(dir.path().join("index"));
        reloaded.read().unwrap();
        assert_eq!(reloaded.len(), 3);
        // entries come back in sorted path order
        let paths: Vec<_> = reloaded.entries().map(|e| e.path.clone()).collect();
        pretty_assertions::assert_eq!(paths, vec!["a.txt", "b.txt", "dir/nested.txt"]);
        assert_eq!(reloaded.entry("a.txt").unwrap().id, id('a'));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirCache::new(dir.path().join("index"));
        cache.read().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_is_outdated_tracks_backing_file() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirCache::new(dir.path().join("index"));
        cache.add(entry("a.txt", 'a'));
        cache.write().unwrap();
        assert!(!cache.is_outdated().unwrap());

        let mut other = DirCache::new(dir.path().join("index"));
        other.read().unwrap();
        other.add(entry("b.txt", 'b'));
        other.write().unwrap();

        assert!(cache.is_outdated().unwrap());
    }

    #[test]
    fn test_corrupted_trailer_fails_read() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirCache::new(dir.path().join("index"));
        cache.add(entry("a.txt", 'a'));
        cache.write().unwrap();

        let mut bytes = std::fs::read(dir.path().join("index")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(dir.path().join("index"), bytes).unwrap();

        let mut reloaded = DirCache::new(dir.path().join("index"));
        assert!(reloaded.read().is_err());
    }

    #[test]
    fn test_optional_extension_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirCache::new(dir.path().join("index"));
        cache.add(entry("a.txt", 'a'));
        cache.write().unwrap();

        // splice a TREE extension between the entries and the trailer
        let bytes = std::fs::read(dir.path().join("index")).unwrap();
        let body = &bytes[..bytes.len() - CHECKSUM_SIZE];
        let mut spliced = body.to_vec();
        spliced.extend_from_slice(b"TREE");
        spliced.write_u32::<byteorder::NetworkEndian>(4).unwrap();
        spliced.extend_from_slice(b"data");
        let mut rebuilt = Vec::new();
        {
            let mut writer = Checksum::new(&mut rebuilt);
            writer.write(&spliced).unwrap();
            writer.write_checksum().unwrap();
        }
        std::fs::write(dir.path().join("index"), rebuilt).unwrap();

        let mut reloaded = DirCache::new(dir.path().join("index"));
        reloaded.read().unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_mandatory_extension_fails_read() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirCache::new(dir.path().join("index"));
        cache.add(entry("a.txt", 'a'));
        cache.write().unwrap();

        let bytes = std::fs::read(dir.path().join("index")).unwrap();
        let body = &bytes[..bytes.len() - CHECKSUM_SIZE];
        let mut rebuilt = Vec::new();
        {
            let mut writer = Checksum::new(&mut rebuilt);
            writer.write(body).unwrap();
            writer.write(b"link").unwrap();
            writer.write(&0u32.to_be_bytes()).unwrap();
            writer.write_checksum().unwrap();
        }
        std::fs::write(dir.path().join("index"), rebuilt).unwrap();

        let mut reloaded = DirCache::new(dir.path().join("index"));
        assert!(reloaded.read().is_err());
    }
}
