//! Transport errors.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no repository is served at {0:?}")]
    UnknownRepository(String),

    #[error("{user} lacks the {role:?} role")]
    Forbidden { user: String, role: &'static str },

    #[error("{0} is not an advertised tip")]
    InvalidWant(String),

    #[error("upload pool is shut down")]
    PoolClosed,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}
