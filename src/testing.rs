//! Shared fixtures for unit tests.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use git2::{Oid, Repository};
use tempfile::TempDir;

use crate::bus::{FaultRegister, NotificationBus};
use crate::cache::LockRegistry;
use crate::config::StoreConfig;
use crate::credentials::{Principal, Realm};
use crate::pipeline::WritePipeline;
use crate::storage::{
    get_tree_at_commit, write_blob, CommitBuilder, CommitId, GitRepository, RefName, TreeMutator,
};

/// fresh bare repository with an initialized `main`, plus its tip
pub(crate) fn init_repo() -> (TempDir, GitRepository, CommitId) {
    let dir = TempDir::new().unwrap();
    let repo = GitRepository::init(dir.path(), &main_ref()).unwrap();
    let tip = repo.resolve_required(&main_ref()).unwrap();
    (dir, repo, tip)
}

pub(crate) fn main_ref() -> RefName {
    RefName::branch("main").unwrap()
}

/// Commit a set of changes on top of `parent`; `None` removes the path.
pub(crate) fn commit_files(repo: &Repository, parent: CommitId, files: &[(&str, Option<&[u8]>)]) -> CommitId {
    let base = get_tree_at_commit(repo, parent).unwrap();
    let mut mutator = TreeMutator::from_tree(repo, &base);
    for (path, content) in files {
        match content {
            Some(bytes) => mutator.upsert(path, write_blob(repo, bytes).unwrap()),
            None => mutator.remove(path),
        }
    }
    let tree = mutator.write().unwrap();

    CommitBuilder::new(repo)
        .tree(tree)
        .parent(parent)
        .message("test commit")
        .commit()
        .unwrap()
}

/// delete a loose object to simulate a damaged object store
pub(crate) fn remove_loose_object(git_dir: &Path, oid: Oid) {
    let hex = oid.to_string();
    let path = git_dir.join("objects").join(&hex[..2]).join(&hex[2..]);
    std::fs::remove_file(path).unwrap();
}

/// A pipeline wired to its registry and bus, the way the store wires it.
pub(crate) struct PipelineHarness {
    pub(crate) pipeline: WritePipeline,
    pub(crate) locks: Arc<LockRegistry>,
    pub(crate) bus: Arc<NotificationBus>,
    pub(crate) faults: Arc<FaultRegister>,
}

pub(crate) fn pipeline() -> (TempDir, PipelineHarness) {
    pipeline_with(|config| config)
}

pub(crate) fn pipeline_with(configure: impl FnOnce(StoreConfig) -> StoreConfig) -> (TempDir, PipelineHarness) {
    let (dir, repo, _) = init_repo();
    let config = configure(StoreConfig::new(dir.path()));
    let faults = Arc::new(FaultRegister::new());
    let bus = Arc::new(NotificationBus::new(faults.clone()));
    let locks = Arc::new(LockRegistry::new(repo.clone()));
    bus.subscribe(locks.clone());
    let pipeline = WritePipeline::new(repo, locks.clone(), bus.clone(), &config);
    (
        dir,
        PipelineHarness {
            pipeline,
            locks,
            bus,
            faults,
        },
    )
}

/// transport principal holding `roles`
pub(crate) fn principal(roles: &[&str]) -> Principal {
    Principal {
        realm: Realm::Transport,
        username: "pusher".to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
    }
}

/// Pack of everything reachable from `new` but not from `base`.
pub(crate) fn pack_between(repo: &Repository, new: CommitId, base: Option<CommitId>) -> Vec<u8> {
    let mut walk = repo.revwalk().unwrap();
    walk.push(new.raw()).unwrap();
    if let Some(base) = base {
        walk.hide(base.raw()).unwrap();
    }
    let mut builder = repo.packbuilder().unwrap();
    builder.insert_walk(&mut walk).unwrap();
    let mut buf = git2::Buf::new();
    builder.write_buf(&mut buf).unwrap();
    buf.to_vec()
}

/// A separate bare repository holding the server's `main` history, the
/// way a client would after a clone.
pub(crate) fn client_repo(server: &GitRepository) -> (TempDir, Repository) {
    let tip = server.resolve_required(&main_ref()).unwrap();
    let pack = server.with_repo(|repo| Ok(pack_between(repo, tip, None))).unwrap();

    let dir = TempDir::new().unwrap();
    let client = Repository::init_bare(dir.path()).unwrap();
    {
        let odb = client.odb().unwrap();
        let mut writer = odb.packwriter().unwrap();
        writer.write_all(&pack).unwrap();
        writer.commit().unwrap();
    }
    (dir, client)
}
