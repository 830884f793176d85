//! Maps protocol request paths onto the one served repository.

use crate::storage::GitRepository;
use crate::transport::error::{TransportError, TransportResult};

/// Serves a single repository under a fixed endpoint name.
#[derive(Debug, Clone)]
pub struct RepositoryResolver {
    endpoint: String,
    repo: GitRepository,
}

impl RepositoryResolver {
    pub fn new(endpoint: impl Into<String>, repo: GitRepository) -> Self {
        Self {
            endpoint: endpoint.into(),
            repo,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Resolve a request path like `/repository.git`.
    pub fn resolve(&self, name: &str) -> TransportResult<&GitRepository> {
        let name = name.trim_start_matches('/').trim_end_matches('/');
        if name == self.endpoint {
            Ok(&self.repo)
        } else {
            tracing::debug!(requested = name, endpoint = %self.endpoint, "unknown repository requested");
            Err(TransportError::UnknownRepository(name.to_string()))
        }
    }
}
