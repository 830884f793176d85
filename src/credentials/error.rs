//! Credential store errors.

use thiserror::Error;

use crate::cache::CacheError;
use crate::pipeline::PipelineError;
use crate::storage::StorageError;

pub type CredentialResult<T> = Result<T, CredentialError>;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid username {0:?}")]
    InvalidUsername(String),

    #[error("user {realm}/{username} already exists")]
    UserExists { realm: String, username: String },

    #[error("user {realm}/{username} not found")]
    UserNotFound { realm: String, username: String },

    /// Roles outside the vocabulary of a strict realm.
    #[error("roles {roles:?} are not known in realm {realm}")]
    UnknownRoles { realm: String, roles: Vec<String> },

    #[error("credential record at {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
