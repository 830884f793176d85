//! The key storage contract.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use crate::bus::{FaultRegister, HealthStatus, NotificationBus};
use crate::cache::{CacheError, LockRegistry, RefCacheManager, StoreInfo};
use crate::config::StoreConfig;
use crate::credentials::CredentialStore;
use crate::metadata::Metadata;
use crate::pipeline::{Change, CommandResult, PipelineError, Updater, WritePipeline};
use crate::storage::{
    get_tree_at_commit, CommitId, CommitInfo, CommitMessage, CommitMeta, GitRepository, KeyPath, RefName,
    Version, WalkEntry, CREDENTIALS_DIR, METADATA_SUFFIX,
};
use crate::store::error::{StoreError, StoreResult};
use crate::store::outcome::KeyOutcome;
use crate::transport::TransportService;

/// Value before and after a successful write.
type Written = (Option<StoreInfo>, Option<StoreInfo>);

/// Key/value access over the repository.
///
/// Reads are served by the per-branch caches. Every write takes the key's
/// lock, checks the caller's version against the branch tip and then
/// commits through the pipeline, retrying a few times if the branch moved
/// underneath it.
pub struct KeyStore {
    config: StoreConfig,
    repo: GitRepository,
    locks: Arc<LockRegistry>,
    faults: Arc<FaultRegister>,
    pipeline: Arc<WritePipeline>,
    credentials: CredentialStore,
}

impl KeyStore {
    /// Open or create the repository named by the configuration.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let repo = if config.create_if_missing {
            GitRepository::open_or_init(&config.path, &config.default_branch)?
        } else if config.path.exists() {
            GitRepository::open(&config.path)?
        } else {
            return Err(StoreError::NotFound(config.path.clone()));
        };
        Self::with_repository(repo, config)
    }

    /// Wire a store around an already opened repository.
    pub fn with_repository(repo: GitRepository, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;

        let faults = Arc::new(FaultRegister::new());
        let bus = Arc::new(NotificationBus::new(faults.clone()));
        let locks = Arc::new(LockRegistry::new(repo.clone()));
        bus.subscribe(locks.clone());

        let pipeline = Arc::new(WritePipeline::new(repo.clone(), locks.clone(), bus, &config));
        pipeline.cleanup_abandoned_staging();
        let credentials = CredentialStore::new(pipeline.clone(), locks.clone(), config.secrets_branch.clone());

        Ok(Self {
            config,
            repo,
            locks,
            faults,
            pipeline,
            credentials,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn repo(&self) -> &GitRepository {
        &self.repo
    }

    pub fn pipeline(&self) -> &Arc<WritePipeline> {
        &self.pipeline
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Protocol entry points for this store, with an upload pool sized by
    /// the configuration. Dropping the service stops its workers.
    pub fn transport(&self) -> StoreResult<TransportService> {
        Ok(TransportService::new(self.pipeline.clone(), &self.config)?)
    }

    /// Turn a user supplied ref into a ref name; `None` is the default branch.
    pub fn resolve_ref(&self, name: Option<&str>) -> StoreResult<RefName> {
        match name {
            None => Ok(self.config.default_branch.clone()),
            Some(name) => Ok(RefName::parse(name)?),
        }
    }

    // ==================== Reads ====================

    /// Data and metadata of a key, `None` if absent or hidden.
    pub fn get_source_info(&self, key: &KeyPath, branch: &RefName) -> StoreResult<Option<StoreInfo>> {
        let info = self.locks.manager(branch).get(key)?;
        Ok(info.filter(|info| !info.metadata.hidden))
    }

    /// List keys under a prefix, sorted.
    ///
    /// Metadata companions and credential records are never listed, nor are
    /// hidden entries. Without `recursive`, deeper keys are summarized by
    /// their first directory below the prefix (`dir/`).
    pub fn get_list(&self, prefix: &str, branch: &RefName, recursive: bool) -> StoreResult<Vec<String>> {
        let manager = self.locks.manager(branch);
        let paths = manager.with_tip(|tip| {
            let Some(tip) = tip else {
                return Ok(Vec::new());
            };
            self.repo.with_handle(|repo| {
                let tree = get_tree_at_commit(repo, tip)?;
                Ok(tree
                    .walk(repo)
                    .into_iter()
                    .filter_map(|entry| match entry {
                        WalkEntry::Blob { path, .. } => Some(path),
                        WalkEntry::Unreadable { path, error } => {
                            tracing::warn!(%path, %error, "skipping unreadable tree in listing");
                            None
                        }
                    })
                    .collect::<Vec<_>>())
            })
        })?;

        let credentials = format!("{CREDENTIALS_DIR}/");
        let mut listed = BTreeSet::new();
        for path in paths {
            if path.ends_with(METADATA_SUFFIX) || path.starts_with(&credentials) {
                continue;
            }
            let Some(rest) = path.strip_prefix(prefix) else {
                continue;
            };
            match rest.find('/') {
                Some(slash) if !recursive => {
                    listed.insert(format!("{prefix}{}", &rest[..=slash]));
                }
                _ => {
                    listed.insert(path);
                }
            }
        }

        let mut keys = Vec::with_capacity(listed.len());
        for entry in listed {
            let Ok(key) = KeyPath::new(entry.as_str()) else {
                continue;
            };
            let visible = match manager.get(&key)? {
                Some(info) => !info.metadata.hidden,
                // directories without a master are still listed
                None => key.is_directory(),
            };
            if visible {
                keys.push(entry);
            }
        }
        Ok(keys)
    }

    /// Commit history of a branch, newest first.
    pub fn history(&self, branch: &RefName, limit: Option<usize>) -> StoreResult<Vec<CommitInfo>> {
        match self.repo.resolve_required(branch) {
            Ok(tip) => Ok(self.repo.history(tip, limit)?),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    // ==================== Writes ====================

    /// Create a key. Without `metadata` it relies on a directory master.
    pub fn add_key(
        &self,
        key: &KeyPath,
        branch: &RefName,
        data: &[u8],
        metadata: Option<&Metadata>,
        meta: &CommitMeta,
    ) -> KeyOutcome {
        if key.is_directory() {
            return KeyOutcome::Rejected("directory keys only carry metadata".to_string());
        }
        let metadata = match metadata.map(Metadata::to_bytes).transpose() {
            Ok(metadata) => metadata,
            Err(e) => return KeyOutcome::Rejected(e.to_string()),
        };

        let written = self.write_key(key, branch, meta, &CommitMessage::put(key.as_str()), |current| {
            if let Some(info) = current {
                return Err(KeyOutcome::Conflict(Some(info.version().clone())));
            }
            let mut changes = vec![Change::upsert(key.as_str(), data)];
            if let Some(metadata) = &metadata {
                changes.push(Change::upsert(key.metadata_path(), metadata.clone()));
            }
            Ok(changes)
        });
        self.data_version(written)
    }

    /// Replace the data of an existing key.
    pub fn update_key(
        &self,
        key: &KeyPath,
        branch: &RefName,
        data: &[u8],
        meta: &CommitMeta,
        expected: &Version,
    ) -> KeyOutcome {
        if key.is_directory() {
            return KeyOutcome::Rejected("directory keys only carry metadata".to_string());
        }

        let written = self.write_key(key, branch, meta, &CommitMessage::put(key.as_str()), |current| {
            let info = current.ok_or(KeyOutcome::NotFound)?;
            if info.data_version.as_ref() != Some(expected) {
                return Err(KeyOutcome::Conflict(info.data_version.clone()));
            }
            Ok(vec![Change::upsert(key.as_str(), data)])
        });
        self.data_version(written)
    }

    /// Delete a key and its own metadata, or a directory's master.
    ///
    /// Succeeds with the version that was deleted.
    pub fn delete_key(&self, key: &KeyPath, branch: &RefName, meta: &CommitMeta, expected: &Version) -> KeyOutcome {
        let written = self.write_key(key, branch, meta, &CommitMessage::delete(key.as_str()), |current| {
            let info = current.ok_or(KeyOutcome::NotFound)?;
            if info.version() != expected {
                return Err(KeyOutcome::Conflict(Some(info.version().clone())));
            }

            let own_metadata = key.metadata_path();
            let mut changes = Vec::new();
            if !key.is_directory() {
                changes.push(Change::remove(key.as_str()));
            }
            if info.metadata_path == own_metadata {
                changes.push(Change::remove(own_metadata));
            }
            Ok(changes)
        });

        match written {
            Ok(_) => KeyOutcome::Ok(expected.clone()),
            Err(outcome) => outcome,
        }
    }

    /// Write a key's own metadata, or a directory's master metadata.
    ///
    /// `expected` is the metadata version the caller saw, `None` when it
    /// is creating a directory master.
    pub fn update_metadata(
        &self,
        key: &KeyPath,
        branch: &RefName,
        metadata: &Metadata,
        meta: &CommitMeta,
        expected: Option<&Version>,
    ) -> KeyOutcome {
        let bytes = match metadata.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return KeyOutcome::Rejected(e.to_string()),
        };
        let manager = self.locks.manager(branch);

        let written = self.write_key(key, branch, meta, &CommitMessage::metadata(key.as_str()), |current| {
            if key.is_directory() {
                match manager.check_master_metadata_allowed(key) {
                    Ok(()) => {}
                    Err(e @ CacheError::DirectoryCollision { .. }) => return Err(KeyOutcome::Rejected(e.to_string())),
                    Err(e) => return Err(self.fault("collision check", e)),
                }
            } else if current.is_none() {
                return Err(KeyOutcome::NotFound);
            }

            let seen = current.map(|info| &info.metadata_version);
            if seen != expected {
                return Err(KeyOutcome::Conflict(seen.cloned()));
            }
            Ok(vec![Change::upsert(key.metadata_path(), bytes.clone())])
        });

        match written {
            Ok((_, Some(fresh))) => KeyOutcome::Ok(fresh.metadata_version),
            Ok((_, None)) => self.fault("update metadata", "entry vanished after commit"),
            Err(outcome) => outcome,
        }
    }

    // ==================== Maintenance ====================

    /// Reload a branch's cache after it moved outside the pipeline.
    pub fn on_branch_moved(&self, branch: &RefName) -> StoreResult<usize> {
        match self.locks.existing(branch) {
            Some(manager) => Ok(manager.reload()?),
            None => Ok(0),
        }
    }

    /// Read and clear the fault register.
    pub fn health(&self) -> HealthStatus {
        self.faults.check()
    }

    // ==================== Internals ====================

    fn write_key<F>(&self, key: &KeyPath, branch: &RefName, meta: &CommitMeta, message: &str, plan: F) -> Result<Written, KeyOutcome>
    where
        F: Fn(Option<&StoreInfo>) -> Result<Vec<Change>, KeyOutcome>,
    {
        if branch.is_tag() {
            return Err(KeyOutcome::Rejected(format!("{branch} is a tag and tags are read-only")));
        }

        let manager = self.locks.manager(branch);
        let Ok(_guard) = manager.lock_key(key) else {
            return Err(KeyOutcome::Locked);
        };

        let updater = Updater::new(&self.pipeline);
        let mut attempt = 0;
        loop {
            let (tip, current) = manager
                .snapshot(key)
                .map_err(|e| self.fault("read", e))?;
            let changes = plan(current.as_ref())?;

            match updater.commit_on(branch, tip, &changes, meta, message) {
                Ok(commit) => return self.finish(&manager, key, current, commit),
                Err(e) if e.is_lock_failure() && attempt < self.config.commit_retries => {
                    attempt += 1;
                    tracing::debug!(%key, %branch, attempt, "branch busy, retrying write");
                    thread::sleep(self.config.retry_backoff);
                }
                Err(PipelineError::Storage(e)) if e.is_retriable() && attempt < self.config.commit_retries => {
                    attempt += 1;
                    tracing::debug!(%key, %branch, attempt, error = %e, "repository busy, retrying write");
                    thread::sleep(self.config.retry_backoff);
                }
                Err(PipelineError::Rejected(CommandResult::LockFailure)) => return Err(KeyOutcome::Locked),
                Err(PipelineError::Rejected(CommandResult::RejectedValidation(message))) => {
                    return Err(KeyOutcome::Rejected(message))
                }
                Err(PipelineError::Rejected(result)) => return Err(KeyOutcome::Rejected(result.to_string())),
                Err(PipelineError::Storage(e)) => return Err(self.fault("commit", e)),
            }
        }
    }

    /// Put the committed value into the cache unless the branch moved on.
    fn finish(
        &self,
        manager: &RefCacheManager,
        key: &KeyPath,
        prior: Option<StoreInfo>,
        commit: CommitId,
    ) -> Result<Written, KeyOutcome> {
        let fresh = manager
            .resolve_at(commit, key)
            .map_err(|e| self.fault("refresh", e))?;
        manager
            .store_written(key, fresh.clone(), commit)
            .map_err(|e| self.fault("refresh", e))?;
        tracing::debug!(%key, branch = %manager.branch(), commit = %commit.short(), "key written");
        Ok((prior, fresh))
    }

    fn data_version(&self, written: Result<Written, KeyOutcome>) -> KeyOutcome {
        match written {
            Ok((_, Some(StoreInfo { data_version: Some(version), .. }))) => KeyOutcome::Ok(version),
            Ok(_) => self.fault("write", "entry vanished after commit"),
            Err(outcome) => outcome,
        }
    }

    fn fault(&self, phase: &str, error: impl std::fmt::Display) -> KeyOutcome {
        let message = format!("{phase} failed: {error}");
        self.faults.record("store", message.clone());
        KeyOutcome::Fault(message)
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("repo", &self.repo)
            .field("default_branch", &self.config.default_branch)
            .finish()
    }
}
