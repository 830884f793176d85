//! Commits: building them, reading them back, walking branch history.
//!
//! Every accepted key write is one commit. Pushed commits arrive ready-made
//! and are only read here.

use chrono::{DateTime, TimeZone, Utc};
use git2::{Repository, Sort};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::{create_initial_tree, TreeHandle};
use crate::storage::types::{CommitId, GitSignature, TreeId};

/// A commit as the store reports it.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub author: GitSignature,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl CommitInfo {
    pub(crate) fn from_git2(commit: &git2::Commit<'_>) -> Self {
        let author = commit.author();
        Self {
            id: CommitId::new(commit.id()),
            parents: commit.parent_ids().map(CommitId::new).collect(),
            author: GitSignature::new(
                String::from_utf8_lossy(author.name_bytes()),
                String::from_utf8_lossy(author.email_bytes()),
            ),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
            time: Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    /// first line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// Builds one commit object without moving any ref.
///
/// Publishing a commit is the pipeline's job; everything built here stays
/// unreachable until a ref update names it.
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    signature: GitSignature,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::gitkv(),
        }
    }

    pub fn tree(mut self, tree: TreeId) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// author and committer
    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn commit(self) -> StorageResult<CommitId> {
        let Some(tree) = self.tree else {
            return Err(StorageError::Internal("commit requires a tree".to_string()));
        };
        let tree = self.repo.find_tree(tree.raw())?;
        let signature = self.signature.to_git2_signature()?;

        let mut parents = Vec::with_capacity(self.parents.len());
        for parent in &self.parents {
            parents.push(find_commit(self.repo, *parent)?);
        }
        let parents: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let oid = self
            .repo
            .commit(None, &signature, &signature, &self.message, &tree, &parents)?;
        Ok(CommitId::new(oid))
    }
}

fn find_commit(repo: &Repository, id: CommitId) -> StorageResult<git2::Commit<'_>> {
    repo.find_commit(id.raw())
        .map_err(|_| StorageError::CommitNotFound(id.to_string()))
}

pub fn get_commit(repo: &Repository, id: CommitId) -> StorageResult<CommitInfo> {
    Ok(CommitInfo::from_git2(&find_commit(repo, id)?))
}

/// The tree a commit points at.
pub fn get_tree_at_commit(repo: &Repository, id: CommitId) -> StorageResult<TreeHandle<'_>> {
    Ok(TreeHandle::new(find_commit(repo, id)?.tree()?))
}

/// Root commit with an empty tree, written when a repository is created.
pub fn create_initial_commit(repo: &Repository, signature: &GitSignature) -> StorageResult<CommitId> {
    CommitBuilder::new(repo)
        .tree(create_initial_tree(repo)?)
        .message("[INIT] empty key space")
        .signature(signature.clone())
        .commit()
}

/// true if `ancestor` is `commit` or reachable from it
pub fn is_descendant(repo: &Repository, commit: CommitId, ancestor: CommitId) -> StorageResult<bool> {
    Ok(commit == ancestor || repo.graph_descendant_of(commit.raw(), ancestor.raw())?)
}

pub fn commit_exists(repo: &Repository, id: CommitId) -> bool {
    repo.find_commit(id.raw()).is_ok()
}

/// Walk first-parent history from `start`, newest first.
pub fn history(repo: &Repository, start: CommitId, limit: Option<usize>) -> StorageResult<Vec<CommitInfo>> {
    let mut walk = repo.revwalk()?;
    walk.push(start.raw())?;
    walk.simplify_first_parent()?;
    walk.set_sorting(Sort::TOPOLOGICAL)?;

    let mut commits = Vec::new();
    for oid in walk.take(limit.unwrap_or(usize::MAX)) {
        commits.push(CommitInfo::from_git2(&repo.find_commit(oid?)?));
    }
    Ok(commits)
}

/// Messages of commits the store writes itself.
pub struct CommitMessage;

impl CommitMessage {
    pub fn put(key: &str) -> String {
        format!("[PUT] {key}")
    }

    pub fn delete(key: &str) -> String {
        format!("[DELETE] {key}")
    }

    pub fn metadata(key: &str) -> String {
        format!("[METADATA] {key}")
    }

    /// credential change; `action` is e.g. `ADD`
    pub fn user(realm: &str, username: &str, action: &str) -> String {
        format!("[USER {action}] {realm}/{username}")
    }
}
