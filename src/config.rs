//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::storage::{GitSignature, RefName};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be a branch, got {value}")]
    NotABranch { field: &'static str, value: String },

    #[error("the secrets branch cannot be the default branch")]
    SecretsOnDefaultBranch,

    #[error("the secrets branch cannot live under the staging namespace")]
    SecretsUnderStaging,

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("endpoint name must be a single non-empty path segment")]
    InvalidEndpoint,
}

/// Store configuration options.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the bare repository.
    pub path: PathBuf,
    /// Create if doesn't exist.
    pub create_if_missing: bool,
    /// Branch served when a request names none; it can never be deleted.
    pub default_branch: RefName,
    /// Branch holding credential records, hidden from protocol listings.
    pub secrets_branch: RefName,
    /// Accept pushes that are not fast-forwards of the current tip.
    pub allow_non_fast_forward: bool,
    /// How many times an internal write retries after losing a branch lock.
    pub commit_retries: u32,
    /// Pause between internal write retries.
    pub retry_backoff: Duration,
    /// Worker threads serving uploads; `None` sizes to available parallelism.
    pub upload_workers: Option<usize>,
    /// Name under which the repository is exposed to the git protocol.
    pub endpoint_name: String,
    /// Identity used for commits created by the store itself.
    pub signature: GitSignature,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".gitkv"),
            create_if_missing: true,
            default_branch: RefName::known_branch("main"),
            secrets_branch: RefName::known_branch("secrets"),
            allow_non_fast_forward: true,
            commit_retries: 3,
            retry_backoff: Duration::from_millis(25),
            upload_workers: None,
            endpoint_name: "repository.git".to_string(),
            signature: GitSignature::gitkv(),
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn default_branch(mut self, branch: RefName) -> Self {
        self.default_branch = branch;
        self
    }

    pub fn secrets_branch(mut self, branch: RefName) -> Self {
        self.secrets_branch = branch;
        self
    }

    pub fn allow_non_fast_forward(mut self, value: bool) -> Self {
        self.allow_non_fast_forward = value;
        self
    }

    pub fn commit_retries(mut self, retries: u32) -> Self {
        self.commit_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = Some(workers);
        self
    }

    pub fn endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = name.into();
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// number of upload workers to start
    pub fn effective_upload_workers(&self) -> usize {
        self.upload_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Check the options are consistent with each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, branch) in [
            ("default_branch", &self.default_branch),
            ("secrets_branch", &self.secrets_branch),
        ] {
            if !branch.is_branch() {
                return Err(ConfigError::NotABranch {
                    field,
                    value: branch.to_string(),
                });
            }
        }
        if self.default_branch.is_staging() {
            return Err(ConfigError::NotABranch {
                field: "default_branch",
                value: self.default_branch.to_string(),
            });
        }
        if self.secrets_branch == self.default_branch {
            return Err(ConfigError::SecretsOnDefaultBranch);
        }
        if self.secrets_branch.is_staging() {
            return Err(ConfigError::SecretsUnderStaging);
        }
        if self.upload_workers == Some(0) {
            return Err(ConfigError::Zero("upload_workers"));
        }
        if self.endpoint_name.is_empty() || self.endpoint_name.contains('/') {
            return Err(ConfigError::InvalidEndpoint);
        }
        Ok(())
    }
}
