#![allow(dead_code)]

use git2::build::TreeUpdateBuilder;
use git2::{FileMode, Oid, Repository, Signature};
use tempfile::TempDir;

use gitkv::config::StoreConfig;
use gitkv::credentials::{Principal, Realm};
use gitkv::metadata::Metadata;
use gitkv::storage::{CommitId, CommitMeta, GitSignature, KeyPath, RefName, Version};
use gitkv::store::KeyStore;
use gitkv::transport::ReceivePack;

pub fn open_store() -> (TempDir, KeyStore) {
    let dir = TempDir::new().unwrap();
    let store = KeyStore::open(StoreConfig::new(dir.path())).unwrap();
    (dir, store)
}

pub fn main_ref() -> RefName {
    RefName::branch("main").unwrap()
}

pub fn key(name: &str) -> KeyPath {
    KeyPath::new(name).unwrap()
}

pub fn meta() -> CommitMeta {
    CommitMeta::new(GitSignature::new("tester", "tester@example.com"), "test write")
}

pub fn put(store: &KeyStore, name: &str, data: &[u8]) -> Version {
    let outcome = store.add_key(&key(name), &main_ref(), data, Some(&Metadata::default()), &meta());
    outcome.version().cloned().unwrap_or_else(|| panic!("add {name}: {outcome}"))
}

pub fn pusher(roles: &[&str]) -> Principal {
    Principal {
        realm: Realm::Transport,
        username: "pusher".to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
    }
}

pub fn receiver(store: &KeyStore) -> ReceivePack {
    ReceivePack::new(store.pipeline().clone(), store.config().secrets_branch.clone())
}

pub fn tip(store: &KeyStore, name: &RefName) -> Option<CommitId> {
    store.repo().resolve(name).unwrap()
}

fn oid(id: CommitId) -> Oid {
    Oid::from_str(&id.to_string()).unwrap()
}

/// A client repository holding the store's `main` history, fetched through
/// the store's transport the way a clone would get it.
pub fn clone_main(store: &KeyStore) -> (TempDir, Repository) {
    let head = tip(store, &main_ref()).unwrap();
    let transport = store.transport().unwrap();
    let pack = transport
        .upload_pack(&store.config().endpoint_name, &pusher(&["read"]), &[head], &[])
        .unwrap();

    let dir = TempDir::new().unwrap();
    let client = Repository::init_bare(dir.path()).unwrap();
    ingest(&client, &pack);
    (dir, client)
}

/// Write a fetched pack into a client's object database.
pub fn ingest(client: &Repository, pack: &[u8]) {
    let odb = client.odb().unwrap();
    let mut writer = odb.packwriter().unwrap();
    std::io::Write::write_all(&mut writer, pack).unwrap();
    writer.commit().unwrap();
}

/// Commit on top of `parent`; `None` removes the path.
pub fn commit(repo: &Repository, parent: CommitId, files: &[(&str, Option<&[u8]>)]) -> CommitId {
    let parent = repo.find_commit(oid(parent)).unwrap();
    let base = parent.tree().unwrap();

    let mut update = TreeUpdateBuilder::new();
    for (path, content) in files {
        match content {
            Some(bytes) => {
                let blob = repo.blob(bytes).unwrap();
                update.upsert(*path, blob, FileMode::Blob);
            }
            None => {
                update.remove(*path);
            }
        }
    }
    let tree = repo.find_tree(update.create_updated(repo, &base).unwrap()).unwrap();

    let signature = Signature::now("client", "client@example.com").unwrap();
    let id = repo
        .commit(None, &signature, &signature, "client commit", &tree, &[&parent])
        .unwrap();
    CommitId::from_hex(&id.to_string()).unwrap()
}

/// Pack of what `new` adds on top of `base`.
pub fn pack(repo: &Repository, new: CommitId, base: CommitId) -> Vec<u8> {
    pack_all(repo, &[new], base)
}

pub fn pack_all(repo: &Repository, news: &[CommitId], base: CommitId) -> Vec<u8> {
    let mut walk = repo.revwalk().unwrap();
    for new in news {
        walk.push(oid(*new)).unwrap();
    }
    walk.hide(oid(base)).unwrap();
    let mut builder = repo.packbuilder().unwrap();
    builder.insert_walk(&mut walk).unwrap();
    let mut buf = git2::Buf::new();
    builder.write_buf(&mut buf).unwrap();
    buf.to_vec()
}
