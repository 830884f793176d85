//!  Branch and reference management.
//!
//!  Git refs are pointers to commits.  This module handles:
//! - Default branch management
//! - Staging branch lifecycle (create, delete, crash cleanup)
//! - Ref resolution and compare-and-swap updates
//! - Atomic multi-ref updates through a git ref transaction
//!
//! Staging branches use a namespaced pattern: `_staging/{ulid}`
//! This makes them easy to identify, hide and clean up.

use git2::{ErrorCode, Repository};
use ulid::Ulid;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{CommitId, GitSignature, RefName};

/// One ref change inside an atomic update.
///
/// `expected` is the tip the caller last observed (`None` = must not exist);
/// `new` is the target (`None` = delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: RefName,
    pub expected: Option<CommitId>,
    pub new: Option<CommitId>,
}

/// Manages Git references (branches and tags).
pub struct RefManager;

impl RefManager {
    /// Resolve a ref to its current commit ID, `None` if it doesn't exist.
    pub fn resolve(repo: &Repository, name: &RefName) -> StorageResult<Option<CommitId>> {
        let reference = match repo.find_reference(name.as_str()) {
            Ok(reference) => reference,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Git(e)),
        };

        let commit = reference.peel_to_commit()?;
        Ok(Some(CommitId::new(commit.id())))
    }

    /// Resolve a ref that must exist.
    pub fn resolve_required(repo: &Repository, name: &RefName) -> StorageResult<CommitId> {
        Self::resolve(repo, name)?.ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Check if a ref exists.
    pub fn exists(repo: &Repository, name: &RefName) -> bool {
        repo.find_reference(name.as_str()).is_ok()
    }

    /// Create a new ref pointing to the given commit.
    pub fn create(repo: &Repository, name: &RefName, target: CommitId) -> StorageResult<()> {
        if Self::exists(repo, name) {
            return Err(StorageError::BranchAlreadyExists(name.to_string()));
        }

        repo.reference(
            name.as_str(),
            target.raw(),
            false,
            &format!("create at {}", target.short()),
        )?;

        Ok(())
    }

    /// Point a ref at a new commit.
    ///
    /// This is a force update; moves that must not lose a race go through
    /// [`RefManager::apply_atomic`].
    pub fn force_update(repo: &Repository, name: &RefName, target: CommitId) -> StorageResult<()> {
        repo.reference(
            name.as_str(),
            target.raw(),
            true,
            &format!("update to {}", target.short()),
        )?;

        Ok(())
    }

    /// Delete a ref.
    pub fn delete(repo: &Repository, name: &RefName) -> StorageResult<()> {
        let mut reference = repo
            .find_reference(name.as_str())
            .map_err(|_| StorageError::RefNotFound(name.to_string()))?;

        reference.delete()?;

        Ok(())
    }

    /// List all refs that peel to a commit, with an optional prefix filter.
    pub fn list(repo: &Repository, prefix: Option<&str>) -> StorageResult<Vec<(RefName, CommitId)>> {
        let mut result = Vec::new();
        for reference in repo.references()? {
            let reference = reference?;
            let name = match reference.name() {
                Some(name) => name,
                None => continue,
            };
            if let Some(p) = prefix {
                if !name.starts_with(p) {
                    continue;
                }
            }
            let ref_name = match RefName::new(name) {
                Ok(ref_name) => ref_name,
                Err(_) => continue,
            };
            // refs to non-commit objects are not part of the key space
            if let Ok(commit) = reference.peel_to_commit() {
                result.push((ref_name, CommitId::new(commit.id())));
            }
        }

        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    /// List all staging branches.
    pub fn list_staging(repo: &Repository) -> StorageResult<Vec<RefName>> {
        Ok(Self::list(repo, Some(RefName::STAGING_PREFIX))?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Create a uniquely named staging branch at `base`.
    pub fn create_staging(repo: &Repository, base: CommitId) -> StorageResult<RefName> {
        let name = RefName::staging(&Ulid::new().to_string().to_lowercase());
        Self::create(repo, &name, base)?;
        Ok(name)
    }

    /// Clean up staging branches left behind (for recovery after crashes).
    ///
    /// Only call this when no push is in flight.
    pub fn cleanup_abandoned_staging(repo: &Repository) -> StorageResult<usize> {
        let mut deleted = 0;
        for name in Self::list_staging(repo)? {
            if Self::delete(repo, &name).is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Apply a set of ref updates atomically.
    ///
    /// All refs are locked first, then every expected tip is re-checked; only
    /// if all of them still hold is any ref written.
    pub fn apply_atomic(
        repo: &Repository,
        updates: &[RefUpdate],
        signature: &GitSignature,
        reflog_message: &str,
    ) -> StorageResult<()> {
        let sig = signature.to_git2_signature()?;
        let mut tx = repo.transaction()?;

        for update in updates {
            tx.lock_ref(update.name.as_str()).map_err(|e| match e.code() {
                ErrorCode::Locked => StorageError::ConcurrentModification {
                    branch: update.name.to_string(),
                },
                _ => StorageError::Git(e),
            })?;
        }

        for update in updates {
            let current = Self::resolve(repo, &update.name)?;
            if current != update.expected {
                return Err(StorageError::ConcurrentModification {
                    branch: update.name.to_string(),
                });
            }
        }

        for update in updates {
            match update.new {
                Some(target) => {
                    tx.set_target(update.name.as_str(), target.raw(), Some(&sig), reflog_message)?
                }
                None => tx.remove(update.name.as_str())?,
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Initialize the default branch if it doesn't exist.
    ///
    /// Also ensures HEAD points to it.
    pub fn init_default_branch(
        repo: &Repository,
        branch: &RefName,
        initial_commit: CommitId,
    ) -> StorageResult<()> {
        if !Self::exists(repo, branch) {
            Self::create(repo, branch, initial_commit)?;
        }

        repo.set_head(branch.as_str())?;

        Ok(())
    }
}
