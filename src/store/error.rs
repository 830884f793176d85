//! Store errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::storage::{InvalidNameError, StorageError};
use crate::transport::TransportError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("repository not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
