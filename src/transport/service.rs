//! Protocol entry points, wired from the store configuration.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::StoreConfig;
use crate::credentials::Principal;
use crate::pipeline::{Push, PushOutcome, WritePipeline};
use crate::storage::{CommitId, RefName};
use crate::transport::error::TransportResult;
use crate::transport::{RefFilter, ReceivePack, RepositoryResolver, UploadPool};

/// Everything an embedding protocol server needs for one repository.
///
/// Every request names the repository it addresses; anything but the
/// configured endpoint is refused before any other work happens.
pub struct TransportService {
    resolver: RepositoryResolver,
    filter: RefFilter,
    receive: ReceivePack,
    uploads: UploadPool,
}

impl TransportService {
    pub fn new(pipeline: Arc<WritePipeline>, config: &StoreConfig) -> TransportResult<Self> {
        let repo = pipeline.repo().clone();
        let uploads = UploadPool::new(&repo, config.effective_upload_workers())?;
        tracing::info!(endpoint = %config.endpoint_name, workers = uploads.workers(), "transport ready");

        Ok(Self {
            resolver: RepositoryResolver::new(config.endpoint_name.clone(), repo),
            filter: RefFilter::new(config.secrets_branch.clone()),
            receive: ReceivePack::new(pipeline, config.secrets_branch.clone()),
            uploads,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.resolver.endpoint()
    }

    pub fn upload_workers(&self) -> usize {
        self.uploads.workers()
    }

    /// Refs `principal` may see in the named repository.
    pub fn advertise(&self, repository: &str, principal: &Principal) -> TransportResult<Vec<(RefName, CommitId)>> {
        let repo = self.resolver.resolve(repository)?;
        self.filter.advertise(repo, principal)
    }

    /// Ingest a pushed pack and run its commands through the pipeline.
    pub fn receive_pack(
        &self,
        repository: &str,
        principal: &Principal,
        pack: &[u8],
        push: Push,
    ) -> TransportResult<PushOutcome> {
        self.resolver.resolve(repository)?;
        self.receive.receive_push(principal, pack, push)
    }

    /// Build the pack for a fetch. Wants must be tips `principal` was
    /// advertised.
    pub fn upload_pack(
        &self,
        repository: &str,
        principal: &Principal,
        wants: &[CommitId],
        haves: &[CommitId],
    ) -> TransportResult<Bytes> {
        let advertised = self.advertise(repository, principal)?;
        self.filter.check_wants(&advertised, wants)?;
        self.uploads.upload(wants, haves)
    }
}

impl std::fmt::Debug for TransportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportService")
            .field("endpoint", &self.resolver.endpoint())
            .field("upload_workers", &self.uploads.workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ReceiveCommand;
    use crate::testing::{client_repo, commit_files, main_ref, pack_between, pipeline, principal};
    use crate::transport::TransportError;

    fn service(workers: usize) -> (tempfile::TempDir, TransportService) {
        let (dir, harness) = pipeline();
        let config = StoreConfig::new(dir.path())
            .upload_workers(workers)
            .endpoint_name("kv.git");
        let service = TransportService::new(Arc::new(harness.pipeline), &config).unwrap();
        (dir, service)
    }

    #[test]
    fn test_wired_from_config() {
        let (_dir, service) = service(3);
        assert_eq!(service.endpoint(), "kv.git");
        assert_eq!(service.upload_workers(), 3);
    }

    #[test]
    fn test_unknown_repository_is_refused() {
        let (_dir, service) = service(1);
        let reader = principal(&["read", "write"]);
        assert!(matches!(
            service.advertise("other.git", &reader),
            Err(TransportError::UnknownRepository(_))
        ));
        assert!(matches!(
            service.receive_pack("other.git", &reader, &[], Push::atomic(Vec::new())),
            Err(TransportError::UnknownRepository(_))
        ));
    }

    #[test]
    fn test_upload_checks_wants_against_advertisement() {
        let (_dir, service) = service(1);
        let reader = principal(&["read"]);
        let advertised = service.advertise("kv.git", &reader).unwrap();
        let (_, tip) = advertised.iter().find(|(name, _)| *name == main_ref()).unwrap().clone();

        assert!(!service.upload_pack("kv.git", &reader, &[tip], &[]).unwrap().is_empty());

        let repo = service.resolver.resolve("kv.git").unwrap().clone();
        let unreachable = repo
            .with_repo(|r| Ok(commit_files(r, tip, &[("x", Some(b"1".as_slice()))])))
            .unwrap();
        assert!(matches!(
            service.upload_pack("kv.git", &reader, &[unreachable], &[]),
            Err(TransportError::InvalidWant(_))
        ));
        assert!(matches!(
            service.upload_pack("kv.git", &principal(&["write"]), &[tip], &[]),
            Err(TransportError::Forbidden { role: "read", .. })
        ));
    }

    #[test]
    fn test_push_through_the_endpoint() {
        let (_dir, service) = service(1);
        let repo = service.resolver.resolve("kv.git").unwrap().clone();
        let base = repo.resolve_required(&main_ref()).unwrap();
        let (_client_dir, client) = client_repo(&repo);

        let head = commit_files(&client, base, &[("a", Some(b"1".as_slice())), ("a.metadata", Some(b"{}"))]);
        let outcome = service
            .receive_pack(
                "/kv.git",
                &principal(&["write"]),
                &pack_between(&client, head, Some(base)),
                Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), head)]),
            )
            .unwrap();
        assert!(outcome.all_ok(), "{outcome:?}");
        assert_eq!(repo.resolve(&main_ref()).unwrap(), Some(head));
    }
}
