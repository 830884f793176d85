//! Storage errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::InvalidNameError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// a path expected in a tree is absent
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// an object that should decode doesn't
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    #[error("no repository at {0}")]
    NotInitialized(PathBuf),

    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),

    /// a ref was not where the update expected it
    #[error("concurrent modification: {branch} was updated by another writer")]
    ConcurrentModification { branch: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::KeyNotFound(_) | StorageError::RefNotFound(_) | StorageError::CommitNotFound(_)
        )
    }

    /// Another writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::BranchAlreadyExists(_) | StorageError::ConcurrentModification { .. }
        )
    }

    /// Worth trying again as is: a lost ref race or a git lock file in
    /// the way.
    pub fn is_retriable(&self) -> bool {
        match self {
            StorageError::ConcurrentModification { .. } => true,
            StorageError::Git(e) => e.code() == git2::ErrorCode::Locked,
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
