//! Repository discovery and coordination
//!
//! `Repository` binds the object database, reference database, and index
//! of one git directory and is the entry point collaborators use. It
//! holds each component as an immutable field; components never point
//! back at the repository.
//!
//! ## Discovery
//!
//! A repository is found either by explicit git-dir path or by ascending
//! from a working-tree directory looking for `.git` — a directory, or a
//! gitfile whose single line `gitdir: <path>` points elsewhere
//! (worktrees, submodules).

use crate::areas::database::{ObjectDatabase, ObjectInserter, ObjectReader};
use crate::areas::index::DirCache;
use crate::areas::ref_update::RefUpdate;
use crate::areas::refs::RefDatabase;
use crate::artifacts::core::CancelToken;
use crate::artifacts::objects::commit::Commit;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::pack::window_cache::WindowCacheOptions;
use crate::artifacts::revision::Revision;
use anyhow::Context;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Git directory name searched for during discovery.
const DOT_GIT: &str = ".git";

/// Object database directory inside the git dir.
const OBJECTS_DIR: &str = "objects";

/// Index file name inside the git dir.
const INDEX_FILE: &str = "index";

/// An opened repository.
pub struct Repository {
    git_dir: PathBuf,
    objects: Arc<ObjectDatabase>,
    refs: RefDatabase,
}

impl Repository {
    /// Open the repository whose git directory is `git_dir`.
    pub fn open(git_dir: impl Into<PathBuf>) -> anyhow::Result<Repository> {
        Self::open_with_options(git_dir, WindowCacheOptions::default())
    }

    /// Open with explicit cache configuration.
    pub fn open_with_options(
        git_dir: impl Into<PathBuf>,
        options: WindowCacheOptions,
    ) -> anyhow::Result<Repository> {
        let git_dir = git_dir.into();
        if !git_dir.join("HEAD").exists() || !git_dir.join(OBJECTS_DIR).exists() {
            anyhow::bail!("{} is not a git directory", git_dir.display());
        }

        let objects = ObjectDatabase::open(git_dir.join(OBJECTS_DIR), options)?;
        let refs = RefDatabase::new(git_dir.clone());

        debug!(git_dir = %git_dir.display(), "opened repository");
        Ok(Repository {
            git_dir,
            objects,
            refs,
        })
    }

    /// Discover a repository by ascending from `start`.
    ///
    /// Each directory is checked for a `.git` entry: a directory is the
    /// git dir itself; a file is a gitfile redirect. A bare git dir (the
    /// start directory containing `HEAD` and `objects/`) also matches.
    pub fn discover(start: impl AsRef<Path>) -> anyhow::Result<Repository> {
        let start = start.as_ref().canonicalize().with_context(|| {
            format!("unable to canonicalize {}", start.as_ref().display())
        })?;

        let mut current = Some(start.as_path());
        while let Some(dir) = current {
            let dot_git = dir.join(DOT_GIT);
            if dot_git.is_dir() {
                return Self::open(dot_git);
            }
            if dot_git.is_file() {
                return Self::open(read_gitfile(&dot_git)?);
            }
            if dir.join("HEAD").exists() && dir.join(OBJECTS_DIR).exists() {
                return Self::open(dir);
            }
            current = dir.parent();
        }
        anyhow::bail!("no git repository found above {}", start.display())
    }

    /// The git directory this repository was opened from.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn object_database(&self) -> &Arc<ObjectDatabase> {
        &self.objects
    }

    pub fn ref_database(&self) -> &RefDatabase {
        &self.refs
    }

    /// A scoped reader over the object database.
    pub fn new_reader(&self) -> ObjectReader {
        ObjectReader::new(Arc::clone(&self.objects), CancelToken::none())
    }

    /// A reader whose operations observe `token`.
    pub fn new_reader_with_token(&self, token: CancelToken) -> ObjectReader {
        ObjectReader::new(Arc::clone(&self.objects), token)
    }

    /// A writer that stores new loose objects.
    pub fn new_inserter(&self) -> ObjectInserter {
        ObjectInserter::new(Arc::clone(&self.objects))
    }

    /// The DirCache bound to this repository's index file, already read.
    pub fn index(&self) -> anyhow::Result<DirCache> {
        let mut cache = DirCache::new(self.git_dir.join(INDEX_FILE));
        cache.read()?;
        Ok(cache)
    }

    /// Resolve a revision expression to an object id.
    ///
    /// # Returns
    ///
    /// `None` when the expression is syntactically valid but names
    /// nothing; errors carry ambiguity, type mismatches, and I/O.
    pub fn resolve(&self, expression: &str) -> anyhow::Result<Option<ObjectId>> {
        Revision::parse(expression)?.resolve(self)
    }

    /// A ref update for `name`, wired with this repository's
    /// reachability oracle for the fast-forward check.
    pub fn update_ref(&self, name: &str) -> RefUpdate<'_> {
        let mut update = RefUpdate::new(&self.refs, name);
        let reader = self.new_reader();
        update.set_reachability_oracle(Box::new(move |tip, ancestor| {
            is_reachable_from(&reader, tip, ancestor)
        }));
        update
    }

    /// The id HEAD currently resolves to, if any commit is checked out.
    pub fn head_id(&self) -> anyhow::Result<Option<ObjectId>> {
        self.refs.resolve_name("HEAD")
    }
}

/// Parse a gitfile: `gitdir: <path>`, relative paths resolved against
/// the file's directory.
fn read_gitfile(path: &Path) -> anyhow::Result<PathBuf> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read gitfile {}", path.display()))?;
    let target = content
        .strip_prefix("gitdir:")
        .with_context(|| format!("{} is not a gitfile", path.display()))?
        .trim();

    let target_path = PathBuf::from(target);
    if target_path.is_absolute() {
        Ok(target_path)
    } else {
        Ok(path
            .parent()
            .expect("gitfile has a containing directory")
            .join(target_path))
    }
}

/// Walk commit parents from `tip` looking for `ancestor`.
///
/// Breadth-first over all parents, bounded by the set of commits seen;
/// enough for fast-forward checks without a full revision walk.
pub fn is_reachable_from(
    reader: &ObjectReader,
    tip: &ObjectId,
    ancestor: &ObjectId,
) -> anyhow::Result<bool> {
    if tip == ancestor {
        return Ok(true);
    }

    let mut queue = VecDeque::from([*tip]);
    let mut seen: HashSet<ObjectId> = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if &id == ancestor {
            return Ok(true);
        }
        let Ok(payload) = reader.open_as(&id, ObjectType::Commit) else {
            // a missing or non-commit tip cannot prove descent
            continue;
        };
        let commit = Commit::parse(&payload)?;
        queue.extend(commit.parents().iter().copied());
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    fn init_git_dir(root: &Path) {
        std::fs::create_dir_all(root.join("objects")).unwrap();
        std::fs::create_dir_all(root.join("refs").join("heads")).unwrap();
        std::fs::write(root.join("HEAD"), "ref: refs/heads/master\n").unwrap();
    }

    #[test]
    fn test_open_rejects_non_repository() {
        let dir = TempDir::new().unwrap();
        assert!(Repository::open(dir.path()).is_err());
    }

    #[test]
    fn test_discover_finds_dot_git_above() {
        let dir = TempDir::new().unwrap();
        init_git_dir(&dir.path().join(".git"));
        let nested = dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let repo = Repository::discover(&nested).unwrap();
        assert!(repo.git_dir().ends_with(".git"));
    }

    #[test]
    fn test_discover_follows_gitfile() {
        let dir = TempDir::new().unwrap();
        let real_git = dir.path().join("real-git-dir");
        init_git_dir(&real_git);
        let worktree = dir.path().join("worktree");
        std::fs::create_dir_all(&worktree).unwrap();
        std::fs::write(
            worktree.join(".git"),
            format!("gitdir: {}\n", real_git.display()),
        )
        .unwrap();

        let repo = Repository::discover(&worktree).unwrap();
        assert_eq!(
            repo.git_dir().canonicalize().unwrap(),
            real_git.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_discover_accepts_bare_git_dir() {
        let dir = TempDir::new().unwrap();
        init_git_dir(dir.path());
        let repo = Repository::discover(dir.path()).unwrap();
        assert_eq!(
            repo.git_dir().canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_discover_fails_outside_any_repository() {
        let dir = TempDir::new().unwrap();
        assert!(Repository::discover(dir.path()).is_err());
    }
}
