//! Per-branch cache and lock manager.

use std::collections::HashMap;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::cache::error::{CacheError, CacheResult};
use crate::cache::info::StoreInfo;
use crate::cache::locks::{KeyLockGuard, KeyLockTable};
use crate::extract::lookup_key;
use crate::storage::{
    changed_paths, get_tree_at_commit, CommitId, GitRepository, KeyPath, RefManager, RefName,
    StorageResult, Version, MASTER_METADATA_FILE,
};

/// Cached resolution state of a key. A key that is not in the map has not
/// been resolved yet; `None` means it was resolved and is absent.
type Entries = HashMap<KeyPath, Option<StoreInfo>>;

/// Read-through cache and lock pair for one branch.
///
/// Lock order is key lock, then branch lock, then the repository handle.
/// The branch lock is shared by readers that resolve against the tip and
/// held exclusively, without waiting, by reloads and by the pipeline while
/// it moves the ref.
pub struct RefCacheManager {
    branch: RefName,
    repo: GitRepository,
    branch_lock: RwLock<()>,
    entries: RwLock<Entries>,
    key_locks: KeyLockTable,
}

impl RefCacheManager {
    pub fn new(repo: GitRepository, branch: RefName) -> Self {
        Self {
            branch,
            repo,
            branch_lock: RwLock::new(()),
            entries: RwLock::new(HashMap::new()),
            key_locks: KeyLockTable::default(),
        }
    }

    pub fn branch(&self) -> &RefName {
        &self.branch
    }

    // ==================== Locks ====================

    /// Take the write lock for a key, failing if another thread holds it.
    pub fn lock_key(&self, key: &KeyPath) -> CacheResult<KeyLockGuard<'_>> {
        self.key_locks.try_lock(key.as_str()).ok_or_else(|| {
            tracing::debug!(branch = %self.branch, key = %key, "key lock contended");
            CacheError::KeyLocked {
                key: key.to_string(),
            }
        })
    }

    pub fn is_key_locked(&self, key: &KeyPath) -> bool {
        self.key_locks.is_locked(key.as_str())
    }

    /// Exclusive branch lock, `None` if anyone else holds either side.
    pub fn try_lock_branch(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.branch_lock.try_write()
    }

    // ==================== Reads ====================

    /// Resolve a key, from the cache when possible.
    pub fn get(&self, key: &KeyPath) -> CacheResult<Option<StoreInfo>> {
        if let Some(entry) = self.entries.read().get(key) {
            return Ok(entry.clone());
        }

        let _shared = self.branch_lock.read();
        let tip = self.repo.resolve(&self.branch)?;
        let Some(tip) = tip else {
            // no branch, nothing to remember
            return Ok(None);
        };

        let info = self.resolve_at(tip, key)?;
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_insert(info);
        Ok(entry.clone())
    }

    /// cached state of a key without resolving it
    pub fn cached(&self, key: &KeyPath) -> Option<Option<StoreInfo>> {
        self.entries.read().get(key).cloned()
    }

    /// number of resolved keys, absent ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the current tip with the branch held shared.
    pub fn with_tip<T>(&self, f: impl FnOnce(Option<CommitId>) -> StorageResult<T>) -> CacheResult<T> {
        let _shared = self.branch_lock.read();
        let tip = self.repo.resolve(&self.branch)?;
        Ok(f(tip)?)
    }

    /// Tip and resolved value read together, straight from the repository.
    ///
    /// Writers check their expected version against this rather than the
    /// cache so the commit they build sits on exactly the state they checked.
    pub fn snapshot(&self, key: &KeyPath) -> CacheResult<(Option<CommitId>, Option<StoreInfo>)> {
        let _shared = self.branch_lock.read();
        let Some(tip) = self.repo.resolve(&self.branch)? else {
            return Ok((None, None));
        };
        Ok((Some(tip), self.resolve_at(tip, key)?))
    }

    pub(crate) fn resolve_at(&self, tip: CommitId, key: &KeyPath) -> StorageResult<Option<StoreInfo>> {
        let lookup = self.repo.with_handle(|repo| lookup_key(repo, tip, key))?;
        StoreInfo::from_lookup(lookup)
    }

    // ==================== Refresh ====================

    /// Re-resolve one key at `tip` and store it if the cache still holds
    /// `prior`.
    ///
    /// Returns false when a concurrent refresh already replaced `prior`, in
    /// which case the newer value is left alone.
    pub fn refresh_entry(&self, key: &KeyPath, prior: Option<&StoreInfo>, tip: CommitId) -> CacheResult<bool> {
        let fresh = self.resolve_at(tip, key)?;
        Ok(self.store_if_unchanged(key, prior, fresh))
    }

    /// Compare-and-swap a resolved value into the cache.
    ///
    /// A key that isn't cached is left to read-through: nothing says
    /// `fresh` still matches the tip.
    fn store_if_unchanged(&self, key: &KeyPath, prior: Option<&StoreInfo>, fresh: Option<StoreInfo>) -> bool {
        let mut entries = self.entries.write();
        let swapped = matches!(
            entries.get(key),
            Some(current) if versions(current.as_ref()) == versions(prior)
        );
        if swapped {
            entries.insert(key.clone(), fresh);
        }
        swapped
    }

    /// Cache what a writer resolved at its own `commit`.
    ///
    /// Only stored while `commit` is still the tip, checked with the branch
    /// held shared so no publish lands between the check and the insert.
    /// Returns false when the branch already moved on.
    pub(crate) fn store_written(&self, key: &KeyPath, fresh: Option<StoreInfo>, commit: CommitId) -> CacheResult<bool> {
        let _shared = self.branch_lock.read();
        if self.repo.resolve(&self.branch)? != Some(commit) {
            tracing::debug!(branch = %self.branch, key = %key, commit = %commit.short(), "branch moved past the write");
            return Ok(false);
        }
        self.entries.write().insert(key.clone(), fresh);
        Ok(true)
    }

    /// Re-resolve cached keys touched by a ref move.
    ///
    /// The caller holds the branch exclusively (the pipeline does while it
    /// publishes a commit), so nothing here takes the branch lock.
    pub(crate) fn refresh_changed(&self, old: Option<CommitId>, new: Option<CommitId>) -> StorageResult<usize> {
        let Some(new) = new else {
            let mut entries = self.entries.write();
            let dropped = entries.len();
            entries.clear();
            return Ok(dropped);
        };

        let changed = self.repo.with_handle(|repo| {
            let new_tree = get_tree_at_commit(repo, new)?;
            match old {
                Some(old) => {
                    let old_tree = get_tree_at_commit(repo, old)?;
                    changed_paths(repo, Some(old_tree.inner()), Some(new_tree.inner()))
                }
                None => changed_paths(repo, None, Some(new_tree.inner())),
            }
        })?;

        let keys: Vec<KeyPath> = self
            .entries
            .read()
            .keys()
            .filter(|key| is_affected(key, &changed))
            .cloned()
            .collect();

        let mut fresh = Vec::with_capacity(keys.len());
        for key in keys {
            let info = self.resolve_at(new, &key)?;
            fresh.push((key, info));
        }

        let refreshed = fresh.len();
        self.entries.write().extend(fresh);
        tracing::debug!(branch = %self.branch, changed = changed.len(), refreshed, "refreshed cache");
        Ok(refreshed)
    }

    /// Recompute every cached key against the branch tip.
    ///
    /// Used when the branch moved outside the pipeline, e.g. by a fetch. If
    /// every key comes back absent the old map is kept: that looks like a
    /// broken fetch rather than a branch that lost all its keys.
    pub fn reload(&self) -> CacheResult<usize> {
        let _exclusive = self.try_lock_branch().ok_or_else(|| CacheError::BranchLocked {
            branch: self.branch.to_string(),
        })?;

        let tip = self.repo.with_repo(|repo| RefManager::resolve(repo, &self.branch))?;
        let keys: Vec<KeyPath> = self.entries.read().keys().cloned().collect();
        let Some(tip) = tip else {
            tracing::warn!(branch = %self.branch, "branch vanished, keeping cached entries");
            return Ok(0);
        };

        let mut fresh = HashMap::with_capacity(keys.len());
        for key in keys {
            let info = self.resolve_at(tip, &key)?;
            fresh.insert(key, info);
        }

        if fresh.values().all(Option::is_none) {
            if !fresh.is_empty() {
                tracing::warn!(branch = %self.branch, keys = fresh.len(), "reload resolved nothing, keeping cached entries");
            }
            return Ok(0);
        }

        let reloaded = fresh.len();
        *self.entries.write() = fresh;
        tracing::info!(branch = %self.branch, tip = %tip.short(), reloaded, "reloaded cache");
        Ok(reloaded)
    }

    // ==================== Invariants ====================

    /// A directory's master metadata can't be created while a plain key
    /// of the same name exists.
    pub fn check_master_metadata_allowed(&self, dir: &KeyPath) -> CacheResult<()> {
        let plain = dir.as_plain();
        if self.get(&plain)?.is_some() {
            return Err(CacheError::DirectoryCollision {
                key: plain.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for RefCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCacheManager")
            .field("branch", &self.branch)
            .field("entries", &self.len())
            .finish()
    }
}

fn versions(info: Option<&StoreInfo>) -> Option<(Option<&Version>, &Version)> {
    info.map(|i| (i.data_version.as_ref(), &i.metadata_version))
}

/// check if a changed path can alter what a key resolves to
fn is_affected(key: &KeyPath, changed: &[String]) -> bool {
    let own_metadata = key.metadata_path();
    changed.iter().any(|path| {
        if path == key.as_str() || *path == own_metadata {
            return true;
        }
        match path.strip_suffix(MASTER_METADATA_FILE) {
            Some(dir) if dir.is_empty() || dir.ends_with('/') => key.as_str().starts_with(dir),
            _ => false,
        }
    })
}
