//! Object database
//!
//! Multiplexes every object source of a repository behind one lookup:
//! pack files (most-recently-used first), loose objects, and the object
//! stores of alternates linked through `objects/info/alternates`.
//!
//! ## Search order
//!
//! 1. Already-loaded packs, most recently hit first
//! 2. A pack-directory rescan when its mtime moved since the last scan
//! 3. Loose objects
//! 4. Alternates, each searched the same way
//!
//! Abbreviation resolution never short-circuits: candidates are unioned
//! across all sources so a prefix colliding across stores is reported as
//! ambiguous instead of silently picking whichever store answered first.

use crate::areas::loose::LooseObjectStore;
use crate::artifacts::core::CancelToken;
use crate::artifacts::objects::loader::ObjectLoader;
use crate::artifacts::objects::object_id::{AbbreviatedObjectId, ObjectId};
use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::pack::delta::DeltaBaseCache;
use crate::artifacts::pack::pack_file::PackFile;
use crate::artifacts::pack::window_cache::{WindowCache, WindowCacheOptions};
use crate::artifacts::pack::PackError;
use anyhow::Context;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

/// An abbreviation matched two or more objects.
///
/// Carries every colliding id so callers can show the candidates.
#[derive(Debug, Error)]
#[error("short object id {prefix} is ambiguous ({} candidates)", candidates.len())]
pub struct AmbiguousObject {
    pub prefix: String,
    pub candidates: Vec<ObjectId>,
}

/// A direct open named an object no source holds.
#[derive(Debug, Error)]
#[error("object {0} not found")]
pub struct MissingObject(pub ObjectId);

/// Most matches collected before a prefix is declared hopeless.
const MAX_ABBREV_CANDIDATES: usize = 256;

#[derive(Debug)]
struct PackSnapshot {
    scanned_mtime: Option<SystemTime>,
    packs: Vec<Arc<PackFile>>,
}

/// The object database of one repository.
#[derive(Debug)]
pub struct ObjectDatabase {
    objects_dir: PathBuf,
    loose: LooseObjectStore,
    packs: RwLock<PackSnapshot>,
    alternates: RwLock<Option<Arc<Vec<Arc<ObjectDatabase>>>>>,
    windows: Arc<WindowCache>,
    bases: Arc<DeltaBaseCache>,
}

impl ObjectDatabase {
    /// Open the database rooted at `objects_dir`.
    pub fn open(
        objects_dir: PathBuf,
        options: WindowCacheOptions,
    ) -> anyhow::Result<Arc<ObjectDatabase>> {
        options.validate()?;
        let windows = Arc::new(WindowCache::new(options.clone()));
        let bases = Arc::new(DeltaBaseCache::new(options.delta_base_cache_limit));
        Ok(Self::with_caches(objects_dir, windows, bases))
    }

    fn with_caches(
        objects_dir: PathBuf,
        windows: Arc<WindowCache>,
        bases: Arc<DeltaBaseCache>,
    ) -> Arc<ObjectDatabase> {
        let threshold = windows.options().stream_file_threshold;
        Arc::new(ObjectDatabase {
            loose: LooseObjectStore::new(objects_dir.clone().into_boxed_path(), threshold),
            objects_dir,
            packs: RwLock::new(PackSnapshot {
                scanned_mtime: None,
                packs: Vec::new(),
            }),
            alternates: RwLock::new(None),
            windows,
            bases,
        })
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub fn loose(&self) -> &LooseObjectStore {
        &self.loose
    }

    fn pack_dir(&self) -> PathBuf {
        self.objects_dir.join("pack")
    }

    /// Open `id`, searching packs, loose storage, then alternates.
    pub fn open_object(
        self: &Arc<Self>,
        id: &ObjectId,
        token: &CancelToken,
    ) -> Result<Option<ObjectLoader>, PackError> {
        if let Some(loader) = self.open_from_packs(id, token)? {
            return Ok(Some(loader));
        }
        if self.rescan_packs_if_stale()? {
            if let Some(loader) = self.open_from_packs(id, token)? {
                return Ok(Some(loader));
            }
        }
        if let Some(loader) = self.loose.open(id, token)? {
            return Ok(Some(loader));
        }
        for alternate in self.alternates(token)?.iter() {
            token.check()?;
            if let Some(loader) = alternate.open_object(id, token)? {
                return Ok(Some(loader));
            }
        }
        Ok(None)
    }

    /// Whether any source holds `id`; short-circuits at the first hit.
    pub fn has(self: &Arc<Self>, id: &ObjectId, token: &CancelToken) -> Result<bool, PackError> {
        {
            let snapshot = self.packs.read().unwrap();
            if snapshot.packs.iter().any(|pack| pack.has(id)) {
                return Ok(true);
            }
        }
        if self.rescan_packs_if_stale()? {
            let snapshot = self.packs.read().unwrap();
            if snapshot.packs.iter().any(|pack| pack.has(id)) {
                return Ok(true);
            }
        }
        if self.loose.has(id) {
            return Ok(true);
        }
        for alternate in self.alternates(token)?.iter() {
            token.check()?;
            if alternate.has(id, token)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolve an abbreviation to the unique object it names.
    ///
    /// # Returns
    ///
    /// `None` when nothing matches; [`AmbiguousObject`] when two or more
    /// objects share the prefix.
    pub fn resolve(
        self: &Arc<Self>,
        abbrev: &AbbreviatedObjectId,
        token: &CancelToken,
    ) -> anyhow::Result<Option<ObjectId>> {
        if let Some(id) = abbrev.to_object_id() {
            return Ok(Some(id));
        }

        let candidates = self.resolve_candidates(abbrev, 1, token)?;
        match candidates.len() {
            0 => Ok(None),
            1 => Ok(Some(candidates[0])),
            _ => Err(AmbiguousObject {
                prefix: abbrev.to_hex(),
                candidates,
            }
            .into()),
        }
    }

    /// Union prefix candidates from every source, up to `max_matches + 1`.
    pub fn resolve_candidates(
        self: &Arc<Self>,
        abbrev: &AbbreviatedObjectId,
        max_matches: usize,
        token: &CancelToken,
    ) -> anyhow::Result<Vec<ObjectId>> {
        let max_matches = max_matches.min(MAX_ABBREV_CANDIDATES);
        let mut matches = Vec::new();

        self.rescan_packs_if_stale()?;
        {
            let snapshot = self.packs.read().unwrap();
            for pack in &snapshot.packs {
                token.check()?;
                pack.index().resolve(abbrev, max_matches, &mut matches);
            }
        }
        self.loose.resolve(abbrev, max_matches, &mut matches)?;
        for alternate in self.alternates(token)?.iter() {
            token.check()?;
            for id in alternate.resolve_candidates(abbrev, max_matches, token)? {
                if !matches.contains(&id) {
                    matches.push(id);
                }
            }
        }
        Ok(matches)
    }

    /// Store `payload` as a loose object in the primary store.
    pub fn insert(&self, kind: ObjectType, payload: &[u8]) -> anyhow::Result<ObjectId> {
        self.loose.insert(kind, payload)
    }

    fn open_from_packs(
        self: &Arc<Self>,
        id: &ObjectId,
        token: &CancelToken,
    ) -> Result<Option<ObjectLoader>, PackError> {
        let (pack, position) = {
            let snapshot = self.packs.read().unwrap();
            match snapshot
                .packs
                .iter()
                .enumerate()
                .find(|(_, pack)| pack.has(id))
            {
                Some((position, pack)) => (Arc::clone(pack), position),
                None => return Ok(None),
            }
        };

        // keep the hit pack at the front of the search order
        if position != 0 {
            let mut snapshot = self.packs.write().unwrap();
            if let Some(current) = snapshot.packs.iter().position(|p| Arc::ptr_eq(p, &pack)) {
                let hit = snapshot.packs.remove(current);
                snapshot.packs.insert(0, hit);
            }
        }

        pack.open_object(id, token)
    }

    /// Reload the pack list when `objects/pack` changed since the last
    /// scan.
    ///
    /// # Returns
    ///
    /// Whether a rescan happened.
    fn rescan_packs_if_stale(&self) -> Result<bool, PackError> {
        let current_mtime = std::fs::metadata(self.pack_dir())
            .and_then(|m| m.modified())
            .ok();
        {
            let snapshot = self.packs.read().unwrap();
            if snapshot.scanned_mtime == current_mtime {
                return Ok(false);
            }
        }

        let mut snapshot = self.packs.write().unwrap();
        if snapshot.scanned_mtime == current_mtime {
            return Ok(false);
        }

        let mut fresh: Vec<Arc<PackFile>> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.pack_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.extension().is_some_and(|ext| ext == "pack") {
                    continue;
                }
                if !path.with_extension("idx").exists() {
                    continue;
                }
                if let Some(existing) = snapshot.packs.iter().find(|pack| pack.path() == path) {
                    fresh.push(Arc::clone(existing));
                    continue;
                }
                match PackFile::open(&path, Arc::clone(&self.windows), Arc::clone(&self.bases)) {
                    Ok(pack) => fresh.push(pack),
                    Err(err) => {
                        warn!(pack = %path.display(), %err, "skipping unreadable pack");
                    }
                }
            }
        }

        for dropped in snapshot
            .packs
            .iter()
            .filter(|old| !fresh.iter().any(|new| Arc::ptr_eq(old, new)))
        {
            self.windows.purge(dropped.cache_id());
        }

        debug!(count = fresh.len(), dir = %self.pack_dir().display(), "scanned pack directory");
        snapshot.packs = fresh;
        snapshot.scanned_mtime = current_mtime;
        Ok(true)
    }

    /// The flattened, deduplicated, cycle-guarded transitive alternates.
    fn alternates(&self, token: &CancelToken) -> Result<Arc<Vec<Arc<ObjectDatabase>>>, PackError> {
        if let Some(loaded) = self.alternates.read().unwrap().as_ref() {
            return Ok(Arc::clone(loaded));
        }

        let mut seen: HashSet<PathBuf> = HashSet::new();
        if let Ok(own) = self.objects_dir.canonicalize() {
            seen.insert(own);
        }

        let mut loaded: Vec<Arc<ObjectDatabase>> = Vec::new();
        let mut queue: Vec<PathBuf> = read_alternate_links(&self.objects_dir);
        while let Some(dir) = queue.pop() {
            token.check()?;
            let canonical = match dir.canonicalize() {
                Ok(canonical) => canonical,
                Err(_) => {
                    warn!(alternate = %dir.display(), "skipping unreachable alternate");
                    continue;
                }
            };
            if !seen.insert(canonical.clone()) {
                continue; // duplicate or cycle
            }
            queue.extend(read_alternate_links(&canonical));
            loaded.push(ObjectDatabase::with_caches(
                canonical,
                Arc::clone(&self.windows),
                Arc::clone(&self.bases),
            ));
        }

        let loaded = Arc::new(loaded);
        *self.alternates.write().unwrap() = Some(Arc::clone(&loaded));
        Ok(loaded)
    }
}

/// Parse `objects/info/alternates`: one path per line, `#` comments,
/// relative paths resolved against the objects directory.
fn read_alternate_links(objects_dir: &Path) -> Vec<PathBuf> {
    let Ok(content) = std::fs::read_to_string(objects_dir.join("info").join("alternates")) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let path = PathBuf::from(line);
            if path.is_absolute() {
                path
            } else {
                objects_dir.join(path)
            }
        })
        .collect()
}

/// A scoped read handle over the object database.
///
/// Holding a reader keeps the database (and therefore its window cache)
/// alive; dropping it releases that pin. `release` exists for callers
/// that want the release to be visible in the code.
#[derive(Debug, Clone)]
pub struct ObjectReader {
    database: Arc<ObjectDatabase>,
    token: CancelToken,
}

impl ObjectReader {
    pub fn new(database: Arc<ObjectDatabase>, token: CancelToken) -> Self {
        ObjectReader { database, token }
    }

    /// Open `id`.
    ///
    /// # Errors
    ///
    /// [`MissingObject`] when no source holds the id; unlike the
    /// resolvers, direct opens treat absence as an error.
    pub fn open(&self, id: &ObjectId) -> anyhow::Result<ObjectLoader> {
        self.database
            .open_object(id, &self.token)?
            .ok_or_else(|| MissingObject(*id).into())
    }

    pub fn has(&self, id: &ObjectId) -> anyhow::Result<bool> {
        Ok(self.database.has(id, &self.token)?)
    }

    pub fn resolve(&self, abbrev: &AbbreviatedObjectId) -> anyhow::Result<Option<ObjectId>> {
        self.database.resolve(abbrev, &self.token)
    }

    /// Open `id` and materialize it, requiring it to be `kind`.
    pub fn open_as(&self, id: &ObjectId, kind: ObjectType) -> anyhow::Result<bytes::Bytes> {
        let loader = self.open(id)?;
        if loader.kind() != kind {
            anyhow::bail!("object {} is a {}, not a {}", id, loader.kind(), kind);
        }
        Ok(loader
            .cached_bytes()
            .with_context(|| format!("object {id} is too large to materialize"))?)
    }

    pub fn release(self) {}
}

/// Writer handle that stores new loose objects.
#[derive(Debug, Clone)]
pub struct ObjectInserter {
    database: Arc<ObjectDatabase>,
}

impl ObjectInserter {
    pub fn new(database: Arc<ObjectDatabase>) -> Self {
        ObjectInserter { database }
    }

    /// Store `payload` as an object of `kind` and return its id.
    pub fn insert(&self, kind: ObjectType, payload: &[u8]) -> anyhow::Result<ObjectId> {
        self.database.insert(kind, payload)
    }
}
