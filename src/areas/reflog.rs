//! Reflog reading and writing
//!
//! Each logged ref has an append-only file under `logs/<name>` recording
//! every value it has held:
//!
//! ```text
//! <old-id> SP <new-id> SP <name> SP <email> SP <secs> SP <tz> TAB <message> LF
//! ```
//!
//! The reader tolerates a trailing partial line (an append may be in
//! flight); a malformed line elsewhere aborts the scan, since silently
//! resynchronizing would misnumber `@{N}` positions.

use crate::artifacts::objects::commit::Identity;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::OBJECT_ID_HEX_LENGTH;
use anyhow::Context;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One recorded transition of a ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub identity: Identity,
    pub message: String,
}

impl ReflogEntry {
    fn parse(line: &str) -> anyhow::Result<ReflogEntry> {
        // slice with get(): a malformed line may put a multi-byte
        // character on the boundary
        let old_hex = line
            .get(..OBJECT_ID_HEX_LENGTH)
            .context("reflog line is too short")?;
        let old_id = ObjectId::from_hex(old_hex)?;
        let new_hex = line
            .get(OBJECT_ID_HEX_LENGTH + 1..2 * OBJECT_ID_HEX_LENGTH + 1)
            .context("reflog line is too short")?;
        if line.as_bytes()[OBJECT_ID_HEX_LENGTH] != b' ' {
            anyhow::bail!("reflog line is missing its id separator");
        }
        let new_id = ObjectId::from_hex(new_hex)?;

        let rest = line
            .get(2 * OBJECT_ID_HEX_LENGTH + 1..)
            .context("reflog line is too short")?
            .strip_prefix(' ')
            .context("reflog line is missing its identity")?;
        let (identity, message) = match rest.split_once('\t') {
            Some((identity, message)) => (identity, message.to_string()),
            None => (rest, String::new()),
        };

        Ok(ReflogEntry {
            old_id,
            new_id,
            identity: Identity::parse(identity)?,
            message,
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{} {} {}\t{}\n",
            self.old_id,
            self.new_id,
            self.identity.to_wire(),
            self.message
        )
    }
}

/// Reader and writer for one ref's log.
#[derive(Debug)]
pub struct Reflog {
    log_path: PathBuf,
}

impl Reflog {
    /// The log of `name` in `git_dir`.
    pub fn for_ref(git_dir: &Path, name: &str) -> Self {
        Reflog {
            log_path: git_dir.join("logs").join(name),
        }
    }

    pub fn exists(&self) -> bool {
        self.log_path.exists()
    }

    /// Every entry, oldest first.
    ///
    /// A partial final line (a write in flight) is skipped.
    pub fn entries(&self) -> anyhow::Result<Vec<ReflogEntry>> {
        let content = match std::fs::read_to_string(&self.log_path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .context(format!("unable to read reflog {}", self.log_path.display()))
            }
        };

        let ends_complete = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();
        let mut entries = Vec::with_capacity(lines.len());

        for (position, line) in lines.iter().enumerate() {
            match ReflogEntry::parse(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    let is_last = position + 1 == lines.len();
                    if is_last && !ends_complete {
                        break; // trailing partial line, append in flight
                    }
                    return Err(err).context(format!(
                        "malformed reflog line {} in {}",
                        position + 1,
                        self.log_path.display()
                    ));
                }
            }
        }
        Ok(entries)
    }

    /// The entry `nth` steps back from the newest (`@{N}`, 0-based).
    pub fn read(&self, nth: usize) -> anyhow::Result<Option<ReflogEntry>> {
        let entries = self.entries()?;
        Ok(entries.into_iter().rev().nth(nth))
    }

    /// The newest entry at or before `when` (`@{<date>}`).
    pub fn entry_at(
        &self,
        when: chrono::DateTime<chrono::FixedOffset>,
    ) -> anyhow::Result<Option<ReflogEntry>> {
        let entries = self.entries()?;
        Ok(entries
            .into_iter()
            .rev()
            .find(|entry| entry.identity.timestamp <= when))
    }

    /// Append a transition record.
    pub fn append(
        &self,
        old_id: &ObjectId,
        new_id: &ObjectId,
        identity: &Identity,
        message: &str,
    ) -> anyhow::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entry = ReflogEntry {
            old_id: *old_id,
            new_id: *new_id,
            identity: identity.clone(),
            // reflog messages are single-line by format
            message: message.replace(['\n', '\t'], " "),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("unable to append reflog {}", self.log_path.display()))?;
        file.write_all(entry.to_line().as_bytes())?;

        debug!(log = %self.log_path.display(), "appended reflog entry");
        Ok(())
    }

    /// Remove the log, e.g. when its ref is deleted.
    pub fn delete(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.log_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).context(format!("unable to delete reflog {}", self.log_path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    fn id(fill: char) -> ObjectId {
        ObjectId::from_hex(&fill.to_string().repeat(40)).unwrap()
    }

    fn ident(secs: i64) -> Identity {
        Identity::parse(&format!("R E Flog <reflog@example.com> {secs} +0000")).unwrap()
    }

    #[test]
    fn test_append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let log = Reflog::for_ref(dir.path(), "refs/heads/master");

        log.append(&ObjectId::ZERO, &id('a'), &ident(100), "commit (initial): one")
            .unwrap();
        log.append(&id('a'), &id('b'), &ident(200), "commit: two").unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].old_id, ObjectId::ZERO);
        assert_eq!(entries[0].message, "commit (initial): one");
        assert_eq!(entries[1].new_id, id('b'));
    }

    #[test]
    fn test_read_counts_back_from_newest() {
        let dir = TempDir::new().unwrap();
        let log = Reflog::for_ref(dir.path(), "HEAD");
        log.append(&ObjectId::ZERO, &id('a'), &ident(100), "one").unwrap();
        log.append(&id('a'), &id('b'), &ident(200), "two").unwrap();
        log.append(&id('b'), &id('c'), &ident(300), "three").unwrap();

        assert_eq!(log.read(0).unwrap().unwrap().new_id, id('c'));
        assert_eq!(log.read(2).unwrap().unwrap().new_id, id('a'));
        assert!(log.read(3).unwrap().is_none());
    }

    #[test]
    fn test_entry_at_picks_newest_at_or_before() {
        let dir = TempDir::new().unwrap();
        let log = Reflog::for_ref(dir.path(), "HEAD");
        log.append(&ObjectId::ZERO, &id('a'), &ident(100), "one").unwrap();
        log.append(&id('a'), &id('b'), &ident(200), "two").unwrap();

        let at_150 = log.entry_at(ident(150).timestamp).unwrap().unwrap();
        assert_eq!(at_150.new_id, id('a'));
        let at_200 = log.entry_at(ident(200).timestamp).unwrap().unwrap();
        assert_eq!(at_200.new_id, id('b'));
        assert!(log.entry_at(ident(50).timestamp).unwrap().is_none());
    }

    #[test]
    fn test_trailing_partial_line_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let log = Reflog::for_ref(dir.path(), "HEAD");
        log.append(&ObjectId::ZERO, &id('a'), &ident(100), "one").unwrap();

        // simulate an append caught mid-write
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("logs").join("HEAD"))
            .unwrap();
        file.write_all(format!("{} {}", id('a'), "bbbb").as_bytes())
            .unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_malformed_middle_line_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(
            dir.path().join("logs").join("HEAD"),
            "garbage line\nmore garbage\n",
        )
        .unwrap();

        let log = Reflog::for_ref(dir.path(), "HEAD");
        assert!(log.entries().is_err());
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = Reflog::for_ref(dir.path(), "refs/heads/none");
        assert!(log.entries().unwrap().is_empty());
        assert!(log.read(0).unwrap().is_none());
    }
}
