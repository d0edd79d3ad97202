//! Reference updates
//!
//! A `RefUpdate` is the single write path for references: it locks the
//! loose ref file, re-reads the current value under the lock, applies the
//! compare-and-swap and fast-forward rules, commits via rename, and
//! appends the reflog. Failures are reported through
//! [`RefUpdateResult`]; the underlying cause, when there is one, stays
//! available for diagnostics.

use crate::areas::reflog::Reflog;
use crate::areas::refs::{
    read_loose_file, validate_ref_name, LooseValue, RefDatabase, HEAD, HEADS_PREFIX,
};
use crate::artifacts::lock_file::{LockError, LockFile};
use crate::artifacts::objects::commit::Identity;
use crate::artifacts::objects::object_id::ObjectId;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Outcome of [`RefUpdate::update`] or [`RefUpdate::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefUpdateResult {
    /// The ref did not exist and was created.
    New,
    /// The new value descends from the old value.
    FastForward,
    /// A non-fast-forward change applied because force was set.
    Forced,
    /// The ref already had the new value; disk untouched.
    NoChange,
    /// A non-fast-forward change without force.
    Rejected,
    /// Deleting the branch HEAD points at.
    RejectedCurrentBranch,
    /// Another writer holds the lock, or the expected old value did not
    /// match the current one.
    LockFailure,
    /// The underlying storage failed; see [`RefUpdate::error`].
    IoFailure,
}

/// Oracle answering "does `tip` descend from `ancestor`?".
///
/// Injected by the caller; the repository facade wires one backed by a
/// commit-parent walk over its object database.
pub type ReachabilityOracle<'o> =
    Box<dyn Fn(&ObjectId, &ObjectId) -> anyhow::Result<bool> + 'o>;

/// A pending update of one reference.
pub struct RefUpdate<'db> {
    refs: &'db RefDatabase,
    name: String,
    new_value: ObjectId,
    /// `None`: don't check. `Some(None)`: the ref must not exist.
    /// `Some(Some(id))`: the ref must currently resolve to `id`.
    expected_old: Option<Option<ObjectId>>,
    force: bool,
    reflog_message: Option<String>,
    identity: Identity,
    oracle: Option<ReachabilityOracle<'db>>,
    error: Option<anyhow::Error>,
}

impl<'db> RefUpdate<'db> {
    pub fn new(refs: &'db RefDatabase, name: impl Into<String>) -> Self {
        RefUpdate {
            refs,
            name: name.into(),
            new_value: ObjectId::ZERO,
            expected_old: None,
            force: false,
            reflog_message: None,
            identity: Identity::new("grit", "grit@localhost"),
            oracle: None,
            error: None,
        }
    }

    pub fn set_new_object_id(&mut self, id: ObjectId) -> &mut Self {
        self.new_value = id;
        self
    }

    pub fn set_expected_old_object_id(&mut self, id: Option<ObjectId>) -> &mut Self {
        self.expected_old = Some(id);
        self
    }

    pub fn set_force_update(&mut self, force: bool) -> &mut Self {
        self.force = force;
        self
    }

    pub fn set_reflog_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.reflog_message = Some(message.into());
        self
    }

    pub fn set_identity(&mut self, identity: Identity) -> &mut Self {
        self.identity = identity;
        self
    }

    pub fn set_reachability_oracle(&mut self, oracle: ReachabilityOracle<'db>) -> &mut Self {
        self.oracle = Some(oracle);
        self
    }

    /// The error behind an [`IoFailure`](RefUpdateResult::IoFailure) (or
    /// the rejection cause worth logging).
    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    /// Apply the update.
    pub fn update(&mut self) -> RefUpdateResult {
        match self.run(false) {
            Ok(result) => result,
            Err(err) => {
                warn!(name = %self.name, %err, "ref update failed");
                self.error = Some(err);
                RefUpdateResult::IoFailure
            }
        }
    }

    /// Delete the ref (and its packed entry and reflog).
    pub fn delete(&mut self) -> RefUpdateResult {
        match self.run(true) {
            Ok(result) => result,
            Err(err) => {
                warn!(name = %self.name, %err, "ref delete failed");
                self.error = Some(err);
                RefUpdateResult::IoFailure
            }
        }
    }

    fn run(&mut self, deleting: bool) -> anyhow::Result<RefUpdateResult> {
        validate_ref_name(&self.name)?;

        // follow symrefs so updating HEAD moves the current branch
        let leaf = self.refs.update_target(&self.name)?;
        if deleting && leaf != HEAD {
            if let Some(head) = self.refs.exact_ref(HEAD)? {
                if head.symbolic_target() == Some(leaf.as_str()) {
                    return Ok(RefUpdateResult::RejectedCurrentBranch);
                }
            }
        }

        if !self.refs.begin_update(&leaf) {
            return Ok(RefUpdateResult::LockFailure);
        }
        let outcome = self.run_locked(&leaf, deleting);
        self.refs.end_update(&leaf);
        outcome
    }

    fn run_locked(&mut self, leaf: &str, deleting: bool) -> anyhow::Result<RefUpdateResult> {
        let loose_path = self.refs.loose_path(leaf);
        let lock = match LockFile::acquire(&loose_path) {
            Ok(lock) => lock,
            Err(LockError::CannotLock { .. }) => return Ok(RefUpdateResult::LockFailure),
            Err(err) => return Err(err.into()),
        };

        // re-read under the lock: this value is the authoritative
        // before-image for the compare-and-swap
        let current = match read_loose_file(&loose_path)? {
            Some(LooseValue::Id(id)) => Some(id),
            Some(LooseValue::Symbolic(_)) => {
                // the chain was rewritten between resolution and locking
                return Ok(RefUpdateResult::LockFailure);
            }
            None => self
                .refs
                .packed_snapshot()?
                .refs
                .get(leaf)
                .map(|(id, _)| *id),
        };

        if let Some(expected) = &self.expected_old {
            let matches = match expected {
                None => current.is_none(),
                Some(id) => current == Some(*id),
            };
            if !matches {
                debug!(name = %leaf, "expected old value does not match");
                return Ok(RefUpdateResult::LockFailure);
            }
        }

        if deleting {
            return self.finish_delete(leaf, lock, current);
        }

        let result = match current {
            None => RefUpdateResult::New,
            Some(old) if old == self.new_value => {
                lock.unlock();
                return Ok(RefUpdateResult::NoChange);
            }
            Some(old) => {
                if self.is_fast_forward(&old)? {
                    RefUpdateResult::FastForward
                } else if self.force {
                    RefUpdateResult::Forced
                } else {
                    lock.unlock();
                    return Ok(RefUpdateResult::Rejected);
                }
            }
        };

        let mut lock = lock;
        lock.write(format!("{}\n", self.new_value).as_bytes())?;
        lock.commit()?;

        if let Some(message) = self.reflog_message.clone() {
            if self.should_log(leaf) {
                Reflog::for_ref(self.refs.git_dir(), leaf).append(
                    &current.unwrap_or(ObjectId::ZERO),
                    &self.new_value,
                    &self.identity,
                    &message,
                )?;
                // HEAD's own log follows the branch it points at
                if leaf != self.name && self.name == HEAD {
                    Reflog::for_ref(self.refs.git_dir(), HEAD).append(
                        &current.unwrap_or(ObjectId::ZERO),
                        &self.new_value,
                        &self.identity,
                        &message,
                    )?;
                }
            }
        }

        debug!(name = %leaf, new = %self.new_value, ?result, "updated ref");
        Ok(result)
    }

    fn finish_delete(
        &mut self,
        leaf: &str,
        lock: LockFile,
        current: Option<ObjectId>,
    ) -> anyhow::Result<RefUpdateResult> {
        if current.is_none() {
            lock.unlock();
            return Ok(RefUpdateResult::NoChange);
        }

        // drop the packed entry first, while the loose lock still blocks
        // other writers of this name
        let snapshot = self.refs.packed_snapshot()?;
        if snapshot.refs.contains_key(leaf) {
            let mut remaining: BTreeMap<_, _> = snapshot.refs.clone();
            remaining.remove(leaf);
            self.rewrite_packed_refs(&remaining)?;
        }

        match std::fs::remove_file(self.refs.loose_path(leaf)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        lock.unlock();

        Reflog::for_ref(self.refs.git_dir(), leaf).delete()?;
        debug!(name = %leaf, "deleted ref");
        Ok(RefUpdateResult::Forced)
    }

    /// Rewrite the packed-refs snapshot under its own lock.
    fn rewrite_packed_refs(
        &self,
        refs: &BTreeMap<String, (ObjectId, crate::areas::refs::Peeled)>,
    ) -> anyhow::Result<()> {
        use crate::areas::refs::Peeled;

        let mut lock = LockFile::acquire(self.refs.packed_refs_path())?;
        let mut content = String::from("# pack-refs with: peeled fully-peeled sorted \n");
        for (name, (id, peeled)) in refs {
            content.push_str(&format!("{id} {name}\n"));
            if let Peeled::Tag(peel) = peeled {
                content.push_str(&format!("^{peel}\n"));
            }
        }
        lock.write(content.as_bytes())?;
        lock.commit()?;
        Ok(())
    }

    fn is_fast_forward(&self, old: &ObjectId) -> anyhow::Result<bool> {
        match &self.oracle {
            Some(oracle) => oracle(&self.new_value, old),
            // without an oracle the walk cannot be answered; treat the
            // update as non-fast-forward and let force decide
            None => Ok(false),
        }
    }

    /// Reflogs are written for HEAD and local branches by default, and
    /// for any ref whose log file already exists.
    fn should_log(&self, leaf: &str) -> bool {
        leaf == HEAD
            || leaf.starts_with(HEADS_PREFIX)
            || Reflog::for_ref(self.refs.git_dir(), leaf).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    fn id(fill: char) -> ObjectId {
        ObjectId::from_hex(&fill.to_string().repeat(40)).unwrap()
    }

    fn setup(dir: &TempDir) -> RefDatabase {
        std::fs::create_dir_all(dir.path().join("refs").join("heads")).unwrap();
        std::fs::write(dir.path().join("HEAD"), "ref: refs/heads/master\n").unwrap();
        RefDatabase::new(dir.path().to_path_buf())
    }

    #[test]
    fn test_create_new_ref() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);

        let mut update = RefUpdate::new(&refs, "refs/heads/topic");
        update.set_new_object_id(id('a')).set_reflog_message("created");
        assert_eq!(update.update(), RefUpdateResult::New);

        assert_eq!(refs.resolve_name("refs/heads/topic").unwrap(), Some(id('a')));
        let log = Reflog::for_ref(refs.git_dir(), "refs/heads/topic");
        assert_eq!(log.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_no_change_leaves_disk_alone() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);
        std::fs::write(
            dir.path().join("refs/heads/master"),
            format!("{}\n", id('a')),
        )
        .unwrap();

        let mut update = RefUpdate::new(&refs, "refs/heads/master");
        update.set_new_object_id(id('a'));
        assert_eq!(update.update(), RefUpdateResult::NoChange);
    }

    #[test]
    fn test_expected_old_mismatch_is_lock_failure_and_disk_unchanged() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);
        std::fs::write(
            dir.path().join("refs/heads/master"),
            format!("{}\n", id('a')),
        )
        .unwrap();

        let mut update = RefUpdate::new(&refs, "refs/heads/master");
        update
            .set_new_object_id(id('c'))
            .set_expected_old_object_id(Some(id('b')))
            .set_force_update(true);
        assert_eq!(update.update(), RefUpdateResult::LockFailure);
        assert_eq!(
            refs.resolve_name("refs/heads/master").unwrap(),
            Some(id('a'))
        );
        // the lock must have been released
        assert!(!dir.path().join("refs/heads/master.lock").exists());
    }

    #[test]
    fn test_expected_absent_enforced() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);
        std::fs::write(
            dir.path().join("refs/heads/master"),
            format!("{}\n", id('a')),
        )
        .unwrap();

        let mut update = RefUpdate::new(&refs, "refs/heads/master");
        update
            .set_new_object_id(id('b'))
            .set_expected_old_object_id(None)
            .set_force_update(true);
        assert_eq!(update.update(), RefUpdateResult::LockFailure);
    }

    #[test]
    fn test_non_fast_forward_rejected_without_force() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);
        std::fs::write(
            dir.path().join("refs/heads/master"),
            format!("{}\n", id('a')),
        )
        .unwrap();

        let mut update = RefUpdate::new(&refs, "refs/heads/master");
        update
            .set_new_object_id(id('b'))
            .set_reachability_oracle(Box::new(|_, _| Ok(false)));
        assert_eq!(update.update(), RefUpdateResult::Rejected);
        assert_eq!(
            refs.resolve_name("refs/heads/master").unwrap(),
            Some(id('a'))
        );
    }

    #[test]
    fn test_fast_forward_and_forced() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);
        std::fs::write(
            dir.path().join("refs/heads/master"),
            format!("{}\n", id('a')),
        )
        .unwrap();

        let mut ff = RefUpdate::new(&refs, "refs/heads/master");
        ff.set_new_object_id(id('b'))
            .set_reachability_oracle(Box::new(|_, _| Ok(true)));
        assert_eq!(ff.update(), RefUpdateResult::FastForward);

        let mut forced = RefUpdate::new(&refs, "refs/heads/master");
        forced
            .set_new_object_id(id('c'))
            .set_force_update(true)
            .set_reachability_oracle(Box::new(|_, _| Ok(false)));
        assert_eq!(forced.update(), RefUpdateResult::Forced);
    }

    #[test]
    fn test_updating_symbolic_head_moves_branch() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);

        let mut update = RefUpdate::new(&refs, "HEAD");
        update.set_new_object_id(id('a')).set_reflog_message("commit: x");
        assert_eq!(update.update(), RefUpdateResult::New);

        // the branch file carries the value; HEAD stays symbolic
        assert_eq!(
            refs.resolve_name("refs/heads/master").unwrap(),
            Some(id('a'))
        );
        assert!(refs.exact_ref("HEAD").unwrap().unwrap().is_symbolic());
        // both logs recorded the move
        assert_eq!(
            Reflog::for_ref(refs.git_dir(), "refs/heads/master")
                .entries()
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            Reflog::for_ref(refs.git_dir(), "HEAD").entries().unwrap().len(),
            1
        );
    }

    #[test]
    fn test_concurrent_lock_is_lock_failure() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);

        let _held = LockFile::acquire(dir.path().join("refs/heads/master")).unwrap();
        let mut update = RefUpdate::new(&refs, "refs/heads/master");
        update.set_new_object_id(id('a'));
        assert_eq!(update.update(), RefUpdateResult::LockFailure);
    }

    #[test]
    fn test_delete_current_branch_rejected() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);
        std::fs::write(
            dir.path().join("refs/heads/master"),
            format!("{}\n", id('a')),
        )
        .unwrap();

        let mut update = RefUpdate::new(&refs, "refs/heads/master");
        assert_eq!(update.delete(), RefUpdateResult::RejectedCurrentBranch);
        assert!(dir.path().join("refs/heads/master").exists());
    }

    #[test]
    fn test_delete_removes_loose_packed_and_log() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);
        std::fs::write(
            dir.path().join("refs/heads/topic"),
            format!("{}\n", id('a')),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("packed-refs"),
            format!("{} refs/heads/topic\n{} refs/heads/other\n", id('b'), id('c')),
        )
        .unwrap();
        Reflog::for_ref(refs.git_dir(), "refs/heads/topic")
            .append(&ObjectId::ZERO, &id('a'), &Identity::new("t", "t@t"), "m")
            .unwrap();

        let mut update = RefUpdate::new(&refs, "refs/heads/topic");
        assert_eq!(update.delete(), RefUpdateResult::Forced);

        assert!(refs.exact_ref("refs/heads/topic").unwrap().is_none());
        assert!(refs.exact_ref("refs/heads/other").unwrap().is_some());
        assert!(!dir.path().join("logs/refs/heads/topic").exists());
    }

    #[test]
    fn test_invalid_name_is_io_failure_with_cause() {
        let dir = TempDir::new().unwrap();
        let refs = setup(&dir);

        let mut update = RefUpdate::new(&refs, "refs/heads/bad..name");
        update.set_new_object_id(id('a'));
        assert_eq!(update.update(), RefUpdateResult::IoFailure);
        assert!(update.error().is_some());
    }
}
