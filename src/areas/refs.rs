//! Git references (branches, tags, HEAD)
//!
//! References are human-readable names pointing at objects. A reference is
//! either direct (its file holds an object id) or symbolic (its file holds
//! `ref: <name>` and resolution follows the chain).
//!
//! ## Storage
//!
//! - `HEAD` and `refs/**`: one file per loose ref
//! - `packed-refs`: a bulk snapshot, one `id SP name` line per ref, with
//!   `^id` continuation lines recording the peeled target of annotated
//!   tags
//!
//! A loose ref shadows a packed ref of the same name; the packed file is
//! treated as an immutable snapshot and reloaded only when its stat
//! changes on disk.

use crate::artifacts::lock_file::CommitStat;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::OBJECT_ID_HEX_LENGTH;
use anyhow::Context;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Name of the HEAD reference.
pub const HEAD: &str = "HEAD";

/// Prefix of local branch refs.
pub const HEADS_PREFIX: &str = "refs/heads/";

/// Prefix of tag refs.
pub const TAGS_PREFIX: &str = "refs/tags/";

/// Symbolic ref chains longer than this are treated as cyclic.
pub const MAX_SYMBOLIC_DEPTH: usize = 5;

/// Search order used to expand a short ref name.
const SEARCH_PATHS: [&str; 6] = [
    "{}",
    "refs/{}",
    "refs/tags/{}",
    "refs/heads/{}",
    "refs/remotes/{}",
    "refs/remotes/{}/HEAD",
];

/// Ref-store failures callers are expected to match on.
#[derive(Debug, Error)]
pub enum RefError {
    #[error("invalid ref name {0:?}")]
    InvalidName(String),
    #[error("symbolic ref chain starting at {0:?} is cyclic or deeper than {MAX_SYMBOLIC_DEPTH}")]
    DepthExceeded(String),
    #[error("ref file {0:?} is malformed")]
    Malformed(PathBuf),
}

/// How a reference is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefStorage {
    /// Only the loose file exists.
    Loose,
    /// Only a packed-refs entry exists.
    Packed,
    /// Loose file present and authoritative; the packed entry is stale.
    LoosePacked,
    /// Learned from a remote, never stored locally.
    Network,
    /// Not yet written anywhere.
    New,
}

/// Peel state of a direct reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peeled {
    /// Not yet determined.
    Unknown,
    /// The target is not an annotated tag.
    NonTag,
    /// The target is an annotated tag peeling to this id.
    Tag(ObjectId),
}

/// A named reference, direct or symbolic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    Direct {
        name: String,
        id: ObjectId,
        storage: RefStorage,
        peeled: Peeled,
    },
    Symbolic {
        name: String,
        target: String,
        storage: RefStorage,
    },
}

impl Ref {
    pub fn name(&self) -> &str {
        match self {
            Ref::Direct { name, .. } | Ref::Symbolic { name, .. } => name,
        }
    }

    pub fn storage(&self) -> RefStorage {
        match self {
            Ref::Direct { storage, .. } | Ref::Symbolic { storage, .. } => *storage,
        }
    }

    /// The object id of a direct ref; `None` for symbolic refs.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            Ref::Direct { id, .. } => Some(id),
            Ref::Symbolic { .. } => None,
        }
    }

    /// The target name of a symbolic ref.
    pub fn symbolic_target(&self) -> Option<&str> {
        match self {
            Ref::Symbolic { target, .. } => Some(target),
            Ref::Direct { .. } => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Ref::Symbolic { .. })
    }

    /// Peel state, for direct refs loaded from a peeled packed-refs file.
    pub fn peeled(&self) -> Peeled {
        match self {
            Ref::Direct { peeled, .. } => *peeled,
            Ref::Symbolic { .. } => Peeled::Unknown,
        }
    }

    /// Short form for display: strips `refs/heads/` or `refs/tags/`.
    pub fn short_name(&self) -> &str {
        self.name()
            .strip_prefix(HEADS_PREFIX)
            .or_else(|| self.name().strip_prefix(TAGS_PREFIX))
            .unwrap_or_else(|| self.name())
    }
}

/// Immutable snapshot of the packed-refs file.
#[derive(Debug, Default)]
pub(crate) struct PackedRefs {
    pub(crate) refs: BTreeMap<String, (ObjectId, Peeled)>,
    pub(crate) stat: Option<CommitStat>,
}

/// Reference store of one repository.
#[derive(Debug)]
pub struct RefDatabase {
    git_dir: PathBuf,
    packed: RwLock<Arc<PackedRefs>>,
    /// Names with an update in flight in this process; prevents two
    /// threads racing to lock the same ref.
    in_progress: Mutex<HashSet<String>>,
}

impl RefDatabase {
    pub fn new(git_dir: PathBuf) -> Self {
        RefDatabase {
            git_dir,
            packed: RwLock::new(Arc::new(PackedRefs::default())),
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub(crate) fn packed_refs_path(&self) -> PathBuf {
        self.git_dir.join("packed-refs")
    }

    pub(crate) fn loose_path(&self, name: &str) -> PathBuf {
        self.git_dir.join(name)
    }

    /// Read the reference stored under exactly `name`.
    ///
    /// # Returns
    ///
    /// The ref as stored: a symbolic ref is returned unresolved. `None`
    /// when neither a loose file nor a packed entry exists.
    pub fn exact_ref(&self, name: &str) -> anyhow::Result<Option<Ref>> {
        let packed = self.packed_snapshot()?;
        let packed_entry = packed.refs.get(name);

        match read_loose_file(&self.loose_path(name))? {
            Some(LooseValue::Symbolic(target)) => Ok(Some(Ref::Symbolic {
                name: name.to_string(),
                target,
                storage: RefStorage::Loose,
            })),
            Some(LooseValue::Id(id)) => Ok(Some(Ref::Direct {
                name: name.to_string(),
                id,
                storage: if packed_entry.is_some() {
                    RefStorage::LoosePacked
                } else {
                    RefStorage::Loose
                },
                peeled: Peeled::Unknown,
            })),
            None => Ok(packed_entry.map(|(id, peeled)| Ref::Direct {
                name: name.to_string(),
                id: *id,
                storage: RefStorage::Packed,
                peeled: *peeled,
            })),
        }
    }

    /// Find a ref by short name using the standard search order:
    /// `name`, `refs/name`, `refs/tags/name`, `refs/heads/name`,
    /// `refs/remotes/name`, `refs/remotes/name/HEAD`.
    pub fn find_ref(&self, short: &str) -> anyhow::Result<Option<Ref>> {
        for pattern in SEARCH_PATHS {
            let name = pattern.replace("{}", short);
            if let Some(found) = self.exact_ref(&name)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Follow a symbolic chain from `reference` to its direct leaf.
    ///
    /// # Errors
    ///
    /// [`RefError::DepthExceeded`] after [`MAX_SYMBOLIC_DEPTH`] hops.
    pub fn resolve(&self, reference: &Ref) -> anyhow::Result<Option<Ref>> {
        let mut current = reference.clone();
        for _ in 0..MAX_SYMBOLIC_DEPTH {
            match current {
                Ref::Direct { .. } => return Ok(Some(current)),
                Ref::Symbolic { ref target, .. } => match self.exact_ref(target)? {
                    Some(next) => current = next,
                    None => return Ok(None),
                },
            }
        }
        Err(RefError::DepthExceeded(reference.name().to_string()).into())
    }

    /// Resolve `name` all the way to an object id.
    pub fn resolve_name(&self, name: &str) -> anyhow::Result<Option<ObjectId>> {
        let Some(reference) = self.exact_ref(name)? else {
            return Ok(None);
        };
        Ok(self
            .resolve(&reference)?
            .and_then(|leaf| leaf.object_id().copied()))
    }

    /// The leaf ref name an update of `name` should write to.
    ///
    /// Updating `HEAD` while it is symbolic updates the branch it points
    /// at; a dangling symref resolves to its (unborn) target name.
    pub fn update_target(&self, name: &str) -> anyhow::Result<String> {
        let mut current = name.to_string();
        for _ in 0..=MAX_SYMBOLIC_DEPTH {
            match read_loose_file(&self.loose_path(&current))? {
                Some(LooseValue::Symbolic(target)) => current = target,
                Some(LooseValue::Id(_)) | None => return Ok(current),
            }
        }
        Err(RefError::DepthExceeded(name.to_string()).into())
    }

    /// All refs whose name starts with `prefix`, loose shadowing packed.
    pub fn refs_with_prefix(&self, prefix: &str) -> anyhow::Result<BTreeMap<String, Ref>> {
        let mut found = BTreeMap::new();

        let refs_root = self.git_dir.join("refs");
        if refs_root.exists() {
            for entry in WalkDir::new(&refs_root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_file())
            {
                let Ok(relative) = entry.path().strip_prefix(&self.git_dir) else {
                    continue;
                };
                let name = relative.to_string_lossy().replace('\\', "/");
                if !name.starts_with(prefix) || name.ends_with(".lock") {
                    continue;
                }
                if let Some(reference) = self.exact_ref(&name)? {
                    found.insert(name, reference);
                }
            }
        }

        let packed = self.packed_snapshot()?;
        for (name, (id, peeled)) in packed.refs.range(prefix.to_string()..) {
            if !name.starts_with(prefix) {
                break;
            }
            found.entry(name.clone()).or_insert_with(|| Ref::Direct {
                name: name.clone(),
                id: *id,
                storage: RefStorage::Packed,
                peeled: *peeled,
            });
        }

        Ok(found)
    }

    /// The current packed-refs snapshot, reloading if the file's stat
    /// moved since it was last read.
    pub(crate) fn packed_snapshot(&self) -> anyhow::Result<Arc<PackedRefs>> {
        let path = self.packed_refs_path();
        let on_disk = CommitStat::of(&path)?;
        {
            let snapshot = self.packed.read().unwrap();
            if snapshot.stat == on_disk {
                return Ok(Arc::clone(&snapshot));
            }
        }

        let fresh = Arc::new(parse_packed_refs(&path, on_disk)?);
        debug!(refs = fresh.refs.len(), "reloaded packed-refs snapshot");
        let mut snapshot = self.packed.write().unwrap();
        *snapshot = Arc::clone(&fresh);
        Ok(fresh)
    }

    /// Claim `name` for an in-process writer.
    pub(crate) fn begin_update(&self, name: &str) -> bool {
        self.in_progress.lock().unwrap().insert(name.to_string())
    }

    pub(crate) fn end_update(&self, name: &str) {
        self.in_progress.lock().unwrap().remove(name);
    }
}

/// Content of one loose ref file.
pub(crate) enum LooseValue {
    Symbolic(String),
    Id(ObjectId),
}

/// Read and classify a loose ref file; `None` when absent or empty.
pub(crate) fn read_loose_file(path: &Path) -> anyhow::Result<Option<LooseValue>> {
    // a directory of the same name (refs/heads/a vs refs/heads/a/b) is
    // not a ref
    if path.is_dir() {
        return Ok(None);
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context(format!("unable to read ref {}", path.display())),
    };
    let content = content.trim_end();
    if content.is_empty() {
        return Ok(None);
    }

    if let Some(target) = content.strip_prefix("ref: ") {
        return Ok(Some(LooseValue::Symbolic(target.trim().to_string())));
    }
    let hex = &content[..content.len().min(OBJECT_ID_HEX_LENGTH)];
    let id = ObjectId::from_hex(hex).map_err(|_| RefError::Malformed(path.to_path_buf()))?;
    Ok(Some(LooseValue::Id(id)))
}

/// Parse the packed-refs snapshot format.
///
/// `# pack-refs with: peeled` header, `id SP name` entries, and `^id`
/// lines carrying the peeled target of the preceding annotated tag.
fn parse_packed_refs(path: &Path, stat: Option<CommitStat>) -> anyhow::Result<PackedRefs> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(PackedRefs {
                refs: BTreeMap::new(),
                stat,
            })
        }
        Err(err) => return Err(err).context("unable to read packed-refs"),
    };

    let mut refs: BTreeMap<String, (ObjectId, Peeled)> = BTreeMap::new();
    let mut peeled_capable = false;
    let mut last_name: Option<String> = None;

    for line in content.lines() {
        if let Some(traits) = line.strip_prefix("# pack-refs with:") {
            peeled_capable = traits.split_whitespace().any(|t| t == "peeled");
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(peel_hex) = line.strip_prefix('^') {
            let peel_id = ObjectId::from_hex(peel_hex.trim())
                .map_err(|_| RefError::Malformed(path.to_path_buf()))?;
            let name = last_name
                .as_ref()
                .ok_or_else(|| RefError::Malformed(path.to_path_buf()))?;
            if let Some(entry) = refs.get_mut(name) {
                entry.1 = Peeled::Tag(peel_id);
            }
            continue;
        }

        let (hex, name) = line
            .split_once(' ')
            .ok_or_else(|| RefError::Malformed(path.to_path_buf()))?;
        let id =
            ObjectId::from_hex(hex).map_err(|_| RefError::Malformed(path.to_path_buf()))?;
        // in a peeled file, an entry without a ^ line is known non-tag
        let peeled = if peeled_capable {
            Peeled::NonTag
        } else {
            Peeled::Unknown
        };
        refs.insert(name.to_string(), (id, peeled));
        last_name = Some(name.to_string());
    }

    Ok(PackedRefs { refs, stat })
}

/// Validate a reference name against the git syntax rules.
///
/// Rejects empty components, leading dots, `..`, control characters,
/// space and the glob/special set, `@{`, a bare `@`, trailing `.lock`,
/// and leading/trailing/duplicate slashes.
pub fn validate_ref_name(name: &str) -> Result<(), RefError> {
    let invalid = || RefError::InvalidName(name.to_string());

    if name.is_empty() || name == "@" {
        return Err(invalid());
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(invalid());
    }
    if name.contains("@{") || name.contains("..") {
        return Err(invalid());
    }
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') {
            return Err(invalid());
        }
        if component.ends_with(".lock") || component.ends_with('.') {
            return Err(invalid());
        }
    }
    for ch in name.chars() {
        if ch.is_ascii_control()
            || matches!(ch, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\')
        {
            return Err(invalid());
        }
    }
    Ok(())
}
