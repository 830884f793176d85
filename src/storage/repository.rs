//!   Core Git repository wrapper.
//!
//!  This wraps a bare `git2::Repository` with thread-safe access and gives the
//!  rest of the system a handful of ref-level operations. Key semantics live
//!  above this layer (extract, pipeline, cache); nothing here knows about
//!  metadata or credentials.
//!
//! All other modules use this for Git access.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::Mutex;

use crate::storage::commit::{self, CommitInfo};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::types::{CommitId, GitSignature, RefName};

/// The main Git repository wrapper.
///
/// `git2::Repository` is `Send` but not `Sync`, so the shared handle sits
/// behind a mutex. It is kept for ref updates. Object work (tree walks,
/// validation, commit building) runs on pooled private handles through
/// [`GitRepository::with_handle`], and upload workers own a handle each.
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct GitRepository {
    inner: Arc<GitRepositoryInner>,
}

struct GitRepositoryInner {
    repo: Mutex<Repository>,
    /// idle private handles
    handles: Mutex<Vec<Repository>>,
    path: PathBuf,
}

/// idle private handles kept around for reuse
const MAX_IDLE_HANDLES: usize = 8;

impl GitRepository {
    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open_bare(path)
            .or_else(|_| Repository::open(path))
            .map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;

        Ok(Self::from_repo(repo, path))
    }

    /// Initialize a new bare repository with an empty first commit on
    /// `default_branch`.
    pub fn init(path: impl AsRef<Path>, default_branch: &RefName) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init_bare(path)?;
        let storage = Self::from_repo(repo, path);

        storage.with_repo(|repo| {
            let commit_id = commit::create_initial_commit(repo, &GitSignature::gitkv())?;
            RefManager::init_default_branch(repo, default_branch, commit_id)?;
            Ok(())
        })?;

        tracing::info!(path = %path.display(), branch = %default_branch, "initialized repository");
        Ok(storage)
    }

    /// Open or initialize a repository.
    pub fn open_or_init(path: impl AsRef<Path>, default_branch: &RefName) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join("HEAD").exists() || path.join(".git").exists() {
            Self::open(path)
        } else {
            Self::init(path, default_branch)
        }
    }

    fn from_repo(repo: Repository, path: &Path) -> Self {
        Self {
            inner: Arc::new(GitRepositoryInner {
                repo: Mutex::new(repo),
                handles: Mutex::new(Vec::new()),
                path: path.to_path_buf(),
            }),
        }
    }

    /// Get the repository path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Execute a function with the shared repository handle.
    ///
    /// Do not call back into `with_repo` from inside `f`.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Execute a function with a private handle from the pool.
    ///
    /// Nothing here touches the shared handle, so concurrent calls don't
    /// wait on each other or on ref updates.
    pub fn with_handle<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let pooled = self.inner.handles.lock().pop();
        let repo = match pooled {
            Some(repo) => repo,
            None => self.open_handle()?,
        };

        let result = f(&repo);

        let mut idle = self.inner.handles.lock();
        if idle.len() < MAX_IDLE_HANDLES {
            idle.push(repo);
        }
        result
    }

    /// Open a private handle on the same repository.
    pub fn open_handle(&self) -> StorageResult<Repository> {
        Ok(Repository::open(&self.inner.path)?)
    }

    // ==================== Ref Operations ====================

    /// Resolve a ref to its tip, `None` if it doesn't exist.
    pub fn resolve(&self, name: &RefName) -> StorageResult<Option<CommitId>> {
        self.with_repo(|repo| RefManager::resolve(repo, name))
    }

    /// Resolve a ref that must exist.
    pub fn resolve_required(&self, name: &RefName) -> StorageResult<CommitId> {
        self.with_repo(|repo| RefManager::resolve_required(repo, name))
    }

    /// List all refs with their tips.
    pub fn list_refs(&self) -> StorageResult<Vec<(RefName, CommitId)>> {
        self.with_repo(|repo| RefManager::list(repo, None))
    }

    /// Get information about a commit.
    pub fn get_commit(&self, id: CommitId) -> StorageResult<CommitInfo> {
        self.with_repo(|repo| commit::get_commit(repo, id))
    }

    /// Check if a commit object is present.
    pub fn commit_exists(&self, id: CommitId) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(commit::commit_exists(repo, id)))
    }

    /// Get commit history.
    pub fn history(&self, from: CommitId, limit: Option<usize>) -> StorageResult<Vec<CommitInfo>> {
        self.with_handle(|repo| commit::history(repo, from, limit))
    }

    /// Write a received pack into the object database.
    ///
    /// Objects land in the store but stay unreachable until a ref is moved.
    pub fn ingest_pack(&self, pack: &[u8]) -> StorageResult<()> {
        self.with_handle(|repo| {
            let odb = repo.odb()?;
            let mut writer = odb.packwriter()?;
            writer.write_all(pack)?;
            writer.commit()?;
            Ok(())
        })
    }

    /// Remove staging branches left over from a previous process.
    pub fn cleanup_abandoned_staging(&self) -> StorageResult<usize> {
        self.with_repo(RefManager::cleanup_abandoned_staging)
    }
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("path", &self.inner.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn main_ref() -> RefName {
        RefName::branch("main").unwrap()
    }

    #[test]
    fn test_init_and_open() {
        let dir = TempDir::new().unwrap();

        let repo = GitRepository::init(dir.path(), &main_ref()).unwrap();
        let head1 = repo.resolve_required(&main_ref()).unwrap();

        drop(repo);
        let repo = GitRepository::open(dir.path()).unwrap();
        let head2 = repo.resolve_required(&main_ref()).unwrap();

        assert_eq!(head1, head2);
    }

    #[test]
    fn test_open_or_init() {
        let dir = TempDir::new().unwrap();

        let repo1 = GitRepository::open_or_init(dir.path(), &main_ref()).unwrap();
        let head1 = repo1.resolve_required(&main_ref()).unwrap();

        drop(repo1);
        let repo2 = GitRepository::open_or_init(dir.path(), &main_ref()).unwrap();
        let head2 = repo2.resolve_required(&main_ref()).unwrap();

        assert_eq!(head1, head2);
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = TempDir::new().unwrap();
        let result = GitRepository::open(dir.path().join("nothing"));
        assert!(matches!(result, Err(StorageError::NotInitialized(_))));
    }

    #[test]
    fn test_private_handle_sees_refs() {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path(), &main_ref()).unwrap();
        let head = repo.resolve_required(&main_ref()).unwrap();

        let handle = repo.open_handle().unwrap();
        let other = RefManager::resolve(&handle, &main_ref()).unwrap();
        assert_eq!(other, Some(head));
    }

    #[test]
    fn test_history() {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path(), &main_ref()).unwrap();
        let head = repo.resolve_required(&main_ref()).unwrap();

        let history = repo.history(head, Some(10)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, head);
    }

    #[test]
    fn test_handles_work_while_shared_handle_is_held() {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path(), &main_ref()).unwrap();
        let head = repo.resolve_required(&main_ref()).unwrap();

        let seen = repo
            .with_repo(|_shared| repo.with_handle(|private| RefManager::resolve(private, &main_ref())))
            .unwrap();
        assert_eq!(seen, Some(head));
        assert_eq!(repo.inner.handles.lock().len(), 1);

        // the pooled handle is reused rather than a second one opened
        repo.with_handle(|_| Ok(())).unwrap();
        assert_eq!(repo.inner.handles.lock().len(), 1);
    }
}
