//! Lock files for atomic writes
//!
//! Every writer that mutates repository state goes through a lock file:
//! the new content is written to `X.lock` (created exclusively, so a
//! second writer fails fast), flushed, and renamed over `X`. The rename is
//! the linearization point; readers either see the old file or the new
//! one, never a partial write.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Suffix appended to the target path while a writer holds it.
pub const LOCK_SUFFIX: &str = ".lock";

/// Failures of the lock-file protocol.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot lock {path}: held by another writer")]
    CannotLock {
        path: PathBuf,
        source: io::Error,
    },
    #[error("cannot commit {path}")]
    CannotCommit {
        path: PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Stat of the committed target, captured at commit time.
///
/// Readers that cached the file's content compare against this to decide
/// whether their snapshot is outdated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStat {
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub length: u64,
}

impl CommitStat {
    /// Capture the stat of `path`, or `None` if it does not exist.
    pub fn of(path: &Path) -> io::Result<Option<CommitStat>> {
        match std::fs::metadata(path) {
            Ok(metadata) => {
                let mtime = metadata.modified()?;
                let since_epoch = mtime
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default();
                Ok(Some(CommitStat {
                    mtime_secs: since_epoch.as_secs() as i64,
                    mtime_nanos: since_epoch.subsec_nanos(),
                    length: metadata.len(),
                }))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// An exclusively held lock on a target path.
///
/// Dropping an uncommitted lock removes the `.lock` file, so an unwinding
/// writer never leaves the target locked.
#[derive(Debug)]
pub struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    committed: bool,
    commit_stat: Option<CommitStat>,
}

impl LockFile {
    /// Acquire the lock for `target` by exclusively creating `target.lock`.
    ///
    /// Parent directories are created as needed (a ref like
    /// `refs/heads/topic/a` may be the first under `topic/`).
    ///
    /// # Errors
    ///
    /// [`LockError::CannotLock`] when another writer holds the lock.
    pub fn acquire(target: impl Into<PathBuf>) -> Result<Self, LockError> {
        let target = target.into();
        let lock_path = lock_path_for(&target);

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    LockError::CannotLock {
                        path: target.clone(),
                        source,
                    }
                } else {
                    LockError::Io(source)
                }
            })?;

        debug!(target = %target.display(), "acquired lock file");
        Ok(LockFile {
            target,
            lock_path,
            file: Some(file),
            committed: false,
            commit_stat: None,
        })
    }

    /// The path being replaced when this lock commits.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Write `bytes` to the lock file.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), LockError> {
        self.writer().write_all(bytes)?;
        Ok(())
    }

    /// The underlying writer, for streaming content into the lock.
    pub fn writer(&mut self) -> &mut File {
        self.file
            .as_mut()
            .expect("lock file already committed or unlocked")
    }

    /// Flush, fsync, and atomically rename the lock over the target.
    ///
    /// Captures the committed stat for [`commit_stat`](Self::commit_stat).
    pub fn commit(mut self) -> Result<CommitStat, LockError> {
        let file = self
            .file
            .take()
            .expect("lock file already committed or unlocked");

        let finish = |file: File| -> io::Result<CommitStat> {
            file.sync_all()?;
            drop(file);
            std::fs::rename(&self.lock_path, &self.target)?;
            CommitStat::of(&self.target)?
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "renamed target vanished"))
        };

        match finish(file) {
            Ok(stat) => {
                self.committed = true;
                self.commit_stat = Some(stat);
                debug!(target = %self.target.display(), "committed lock file");
                Ok(stat)
            }
            Err(source) => {
                // leave cleanup of the .lock to Drop
                Err(LockError::CannotCommit {
                    path: self.target.clone(),
                    source,
                })
            }
        }
    }

    /// Abandon the lock, removing the `.lock` file.
    pub fn unlock(mut self) {
        self.release();
    }

    /// Stat captured by the last successful [`commit`](Self::commit).
    pub fn commit_stat(&self) -> Option<CommitStat> {
        self.commit_stat
    }

    fn release(&mut self) {
        if self.committed {
            return;
        }
        self.file.take();
        if let Err(err) = std::fs::remove_file(&self.lock_path) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(lock = %self.lock_path.display(), %err, "failed to remove lock file");
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// The `.lock` sibling of `target`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(LOCK_SUFFIX);
    target.with_file_name(name)
}
