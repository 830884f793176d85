//! Pipeline errors for internal writers.

use thiserror::Error;

use crate::pipeline::command::CommandResult;
use crate::storage::StorageError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The pipeline turned the write down.
    #[error("write rejected: {0}")]
    Rejected(CommandResult),
}

impl PipelineError {
    /// lost a branch lock or raced another writer
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, PipelineError::Rejected(CommandResult::LockFailure))
    }
}
