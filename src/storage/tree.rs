//!  tree operations for key layout.
//!
//! in Git, a tree is a directory.  In gitkv:
//! - every key is a blob at its path
//! - a key's metadata is a sibling blob at `<path>.metadata`
//! - a directory's master metadata is a `.metadata` blob inside it
//! - credential records live under the reserved `.credentials/` directory
//!
//! A plain key `foo` and a directory `foo/` can both exist, so one tree may
//! hold a blob and a subtree under the same name. `git2::TreeBuilder` keys
//! entries by name alone, so trees are serialized here directly and lookups
//! always match on name *and* kind.
//!
//! Such a tree carries two entries with the same name. `git fsck` reports it
//! as `duplicateEntries`, so clients that fetch with `transfer.fsckObjects`
//! (or `fetch.fsckObjects`) refuse the pack unless they skip that check with
//! `fsck.duplicateEntries=ignore`. Repositories that never pair a key with a
//! directory of the same name produce ordinary trees.

use std::collections::BTreeMap;

use git2::{ObjectType, Oid, Repository, Tree};

use crate::storage::blob::BlobId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::TreeId;

const MODE_BLOB: i32 = 0o100644;
const MODE_TREE: i32 = 0o040000;

/// A read only handle to a git tree at a specific commit
///
/// this provides safe, immutable access to the tree structure.
/// think of it as a snapshot - it won't change even if new commits are made.
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    /// create a TreeHandle from a git2::Tree
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    /// get the tree ID
    pub fn id(&self) -> TreeId {
        TreeId::new(self.tree.id())
    }

    /// get the underlying git2::Tree (for internal use)
    pub(crate) fn inner(&self) -> &Tree<'repo> {
        &self.tree
    }

    /// Resolve a directory path (`a/b` or `a/b/`) to its subtree.
    ///
    /// Returns `Ok(None)` when some component does not exist. A subtree
    /// object that exists in the listing but cannot be read is an error.
    pub fn subtree(&self, repo: &'repo Repository, dir: &str) -> StorageResult<Option<Tree<'repo>>> {
        let mut current = self.tree.clone();
        for component in dir.split('/').filter(|c| !c.is_empty()) {
            let next = match find_child(&current, component, true) {
                Some(oid) => oid,
                None => return Ok(None),
            };
            current = repo.find_tree(next)?;
        }
        Ok(Some(current))
    }

    /// get the blob ID at a path
    pub fn find_blob(&self, repo: &'repo Repository, path: &str) -> StorageResult<Option<BlobId>> {
        let (dir, name) = match path.rfind('/') {
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => ("", path),
        };

        let parent = match self.subtree(repo, dir)? {
            Some(tree) => tree,
            None => return Ok(None),
        };

        Ok(find_child(&parent, name, false).map(BlobId::new))
    }

    /// Walk every blob reachable from this tree.
    ///
    /// Subtrees that cannot be loaded are reported as `Unreadable` entries
    /// instead of aborting the walk.
    pub fn walk(&self, repo: &'repo Repository) -> Vec<WalkEntry> {
        let mut out = Vec::new();
        walk_into(repo, &self.tree, "", &mut out);
        out
    }
}

/// one result of a tree walk
#[derive(Debug)]
pub enum WalkEntry {
    Blob { path: String, id: BlobId },
    Unreadable { path: String, error: git2::Error },
}

fn walk_into(repo: &Repository, tree: &Tree<'_>, prefix: &str, out: &mut Vec<WalkEntry>) {
    for entry in tree.iter() {
        let name = match entry.name() {
            Some(name) => name,
            None => continue,
        };
        let path = format!("{}{}", prefix, name);
        match entry.kind() {
            Some(ObjectType::Blob) => out.push(WalkEntry::Blob {
                path,
                id: BlobId::new(entry.id()),
            }),
            Some(ObjectType::Tree) => match repo.find_tree(entry.id()) {
                Ok(subtree) => walk_into(repo, &subtree, &format!("{}/", path), out),
                Err(error) => out.push(WalkEntry::Unreadable { path, error }),
            },
            // gitlinks and anything else are not part of the key layout
            _ => {}
        }
    }
}

/// find a child by name, matching trees or blobs only
fn find_child(tree: &Tree<'_>, name: &str, want_tree: bool) -> Option<Oid> {
    let want = if want_tree {
        ObjectType::Tree
    } else {
        ObjectType::Blob
    };
    tree.iter()
        .find(|entry| entry.name() == Some(name) && entry.kind() == Some(want))
        .map(|entry| entry.id())
}

/// A raw tree entry, as it is serialized into a tree object.
#[derive(Debug, Clone)]
struct RawEntry {
    name: String,
    mode: i32,
    oid: Oid,
}

impl RawEntry {
    fn blob(name: &str, oid: Oid) -> Self {
        Self {
            name: name.to_string(),
            mode: MODE_BLOB,
            oid,
        }
    }

    fn tree(name: &str, oid: Oid) -> Self {
        Self {
            name: name.to_string(),
            mode: MODE_TREE,
            oid,
        }
    }

    fn is_tree(&self) -> bool {
        self.mode == MODE_TREE
    }

    /// git orders entries as if tree names carried a trailing `/`
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.is_tree() {
            key.push(b'/');
        }
        key
    }
}

/// Serialize entries into a tree object.
///
/// A blob and a tree may share a name; see the module docs for what that
/// means to strict clients.
fn write_raw_tree(repo: &Repository, mut entries: Vec<RawEntry>) -> StorageResult<Oid> {
    entries.sort_by_key(|e| e.sort_key());

    let mut buf = Vec::new();
    for entry in &entries {
        buf.extend_from_slice(format!("{:o} {}\0", entry.mode, entry.name).as_bytes());
        buf.extend_from_slice(entry.oid.as_bytes());
    }

    let oid = repo.odb()?.write(ObjectType::Tree, &buf)?;
    Ok(oid)
}

#[derive(Debug, Clone, Copy)]
enum PendingChange {
    Upsert(BlobId),
    Remove,
}

/// a mutable tree builder for making changes
///
/// this adds up changes and produces a new tree when its final
/// the original tree is not modified
///
/// # Usage Pattern
///
/// ```ignore
/// let mut builder = TreeMutator::from_tree(repo, &tree);
/// builder.upsert("apps/web/config", blob_id);
/// builder.remove("apps/old");
/// let new_tree_id = builder.write()?;
/// ```
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    /// the root tree we're modifying
    base: Option<Tree<'repo>>,
    /// pending changes keyed by full path
    changes: BTreeMap<String, PendingChange>,
}

impl<'repo> TreeMutator<'repo> {
    /// create a new TreeMutator from an existing tree
    pub fn from_tree(repo: &'repo Repository, tree: &TreeHandle<'repo>) -> Self {
        Self {
            repo,
            base: Some(tree.inner().clone()),
            changes: BTreeMap::new(),
        }
    }

    /// create a new TreeMutator for an empty tree
    pub fn empty(repo: &'repo Repository) -> Self {
        Self {
            repo,
            base: None,
            changes: BTreeMap::new(),
        }
    }

    /// insert or replace the blob at a path
    pub fn upsert(&mut self, path: &str, blob_id: BlobId) {
        self.changes
            .insert(path.to_string(), PendingChange::Upsert(blob_id));
    }

    /// remove the blob at a path; writing fails if it does not exist
    pub fn remove(&mut self, path: &str) {
        self.changes.insert(path.to_string(), PendingChange::Remove);
    }

    /// check if any change is pending
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// write all changes and return the new root tree ID
    ///
    /// directories left empty by removals are dropped, as git would
    pub fn write(self) -> StorageResult<TreeId> {
        let split: Vec<(Vec<&str>, PendingChange)> = self
            .changes
            .iter()
            .map(|(path, change)| (path.split('/').collect(), *change))
            .collect();
        let changes: Vec<(&[&str], PendingChange)> = split
            .iter()
            .map(|(components, change)| (components.as_slice(), *change))
            .collect();

        let root = build_level(self.repo, self.base.as_ref(), &changes, "")?;
        match root {
            Some(oid) => Ok(TreeId::new(oid)),
            None => Ok(TreeId::new(write_raw_tree(self.repo, Vec::new())?)),
        }
    }
}

fn build_level(
    repo: &Repository,
    base: Option<&Tree<'_>>,
    changes: &[(&[&str], PendingChange)],
    prefix: &str,
) -> StorageResult<Option<Oid>> {
    let mut entries: Vec<RawEntry> = match base {
        Some(tree) => tree
            .iter()
            .filter_map(|entry| {
                Some(RawEntry {
                    name: entry.name()?.to_string(),
                    mode: entry.filemode(),
                    oid: entry.id(),
                })
            })
            .collect(),
        None => Vec::new(),
    };

    let mut nested: BTreeMap<&str, Vec<(&[&str], PendingChange)>> = BTreeMap::new();
    for (components, change) in changes {
        match components.split_first() {
            Some((name, [])) => {
                let before = entries.len();
                entries.retain(|e| !(e.name == *name && !e.is_tree()));
                match change {
                    PendingChange::Upsert(id) => entries.push(RawEntry::blob(name, id.raw())),
                    PendingChange::Remove if entries.len() == before => {
                        return Err(StorageError::KeyNotFound(format!("{}{}", prefix, name)));
                    }
                    PendingChange::Remove => {}
                }
            }
            Some((name, rest)) => nested.entry(*name).or_default().push((rest, *change)),
            None => return Err(StorageError::Internal("empty path in tree change".to_string())),
        }
    }

    for (name, sub_changes) in nested {
        let existing = entries.iter().position(|e| e.name == name && e.is_tree());
        let subtree = match existing {
            Some(idx) => Some(repo.find_tree(entries[idx].oid)?),
            None => None,
        };
        let sub_prefix = format!("{}{}/", prefix, name);
        let written = build_level(repo, subtree.as_ref(), &sub_changes, &sub_prefix)?;

        if let Some(idx) = existing {
            entries.remove(idx);
        }
        if let Some(oid) = written {
            entries.push(RawEntry::tree(name, oid));
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }
    write_raw_tree(repo, entries).map(Some)
}

/// List blob paths that differ between two trees.
///
/// Paths present on only one side are included. A plain key and a directory
/// of the same name are compared independently.
pub fn changed_paths(
    repo: &Repository,
    old: Option<&Tree<'_>>,
    new: Option<&Tree<'_>>,
) -> StorageResult<Vec<String>> {
    let mut out = Vec::new();
    diff_level(repo, old, new, "", &mut out)?;
    Ok(out)
}

fn diff_level(
    repo: &Repository,
    old: Option<&Tree<'_>>,
    new: Option<&Tree<'_>>,
    prefix: &str,
    out: &mut Vec<String>,
) -> StorageResult<()> {
    fn index(tree: Option<&Tree<'_>>) -> BTreeMap<(String, bool), Oid> {
        let mut map = BTreeMap::new();
        if let Some(tree) = tree {
            for entry in tree.iter() {
                let is_tree = match entry.kind() {
                    Some(ObjectType::Tree) => true,
                    Some(ObjectType::Blob) => false,
                    _ => continue,
                };
                if let Some(name) = entry.name() {
                    map.insert((name.to_string(), is_tree), entry.id());
                }
            }
        }
        map
    }

    let old_map = index(old);
    let new_map = index(new);

    let mut names: Vec<&(String, bool)> = old_map.keys().chain(new_map.keys()).collect();
    names.sort();
    names.dedup();

    for key in names {
        let (name, is_tree) = key;
        let before = old_map.get(key);
        let after = new_map.get(key);
        if before == after {
            continue;
        }

        let path = format!("{}{}", prefix, name);
        if *is_tree {
            let before_tree = before.map(|oid| repo.find_tree(*oid)).transpose()?;
            let after_tree = after.map(|oid| repo.find_tree(*oid)).transpose()?;
            diff_level(
                repo,
                before_tree.as_ref(),
                after_tree.as_ref(),
                &format!("{}/", path),
                out,
            )?;
        } else {
            out.push(path);
        }
    }

    Ok(())
}

/// helper function to create an initial empty tree
pub fn create_initial_tree(repo: &Repository) -> StorageResult<TreeId> {
    TreeMutator::empty(repo).write()
}
