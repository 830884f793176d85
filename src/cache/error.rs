//! Cache and lock errors.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Another writer holds the key.
    #[error("key {key} is locked by another writer")]
    KeyLocked { key: String },

    /// A reload or commit already holds the branch exclusively.
    #[error("branch {branch} is locked")]
    BranchLocked { branch: String },

    /// A plain key already exists where a directory is being created.
    #[error("{key} exists as a plain key, it cannot also become a directory")]
    DirectoryCollision { key: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CacheError {
    /// lock contention, worth retrying as is
    pub fn is_locked(&self) -> bool {
        matches!(self, CacheError::KeyLocked { .. } | CacheError::BranchLocked { .. })
    }
}
