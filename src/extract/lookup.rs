//! Single-key resolution against a commit tip.

use bytes::Bytes;
use git2::Repository;

use crate::storage::{
    get_tree_at_commit, read_blob, BlobId, CommitId, KeyPath, StorageResult, TreeHandle,
};

/// Outcome of looking up one file in a tree.
///
/// A missing path is a normal answer, not an error. An object that is listed
/// in the tree but can't be read means the repository is damaged, so it is
/// reported as `Unreadable` rather than folded into `Missing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    Present {
        path: String,
        id: BlobId,
        content: Bytes,
    },
    Missing,
    Unreadable {
        path: String,
        error: String,
    },
}

impl FileLookup {
    pub fn is_present(&self) -> bool {
        matches!(self, FileLookup::Present { .. })
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, FileLookup::Missing)
    }

    /// path of the file, if it was found at all
    pub fn path(&self) -> Option<&str> {
        match self {
            FileLookup::Present { path, .. } | FileLookup::Unreadable { path, .. } => Some(path),
            FileLookup::Missing => None,
        }
    }
}

/// Data blob and effective metadata companion of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLookup {
    pub key: KeyPath,
    /// always `Missing` for directory keys
    pub data: FileLookup,
    /// the most specific metadata found on the key's path
    pub metadata: FileLookup,
}

impl KeyLookup {
    /// check if the metadata in effect is the key's own companion
    pub fn has_own_metadata(&self) -> bool {
        self.metadata.path() == Some(self.key.metadata_path().as_str())
    }
}

/// read one path out of a tree
pub(crate) fn locate<'repo>(repo: &'repo Repository, tree: &TreeHandle<'repo>, path: &str) -> FileLookup {
    let id = match tree.find_blob(repo, path) {
        Ok(Some(id)) => id,
        Ok(None) => return FileLookup::Missing,
        Err(e) => {
            return FileLookup::Unreadable {
                path: path.to_string(),
                error: e.to_string(),
            }
        }
    };

    match read_blob(repo, id) {
        Ok(content) => FileLookup::Present {
            path: path.to_string(),
            id,
            content: Bytes::from(content),
        },
        Err(e) => FileLookup::Unreadable {
            path: path.to_string(),
            error: e.to_string(),
        },
    }
}

/// Resolve a key and its metadata at a tip.
///
/// Metadata is searched from the most specific location outwards: the key's
/// own `<key>.metadata`, then `.metadata` in each enclosing directory. The
/// first file that exists wins, even if it can't be read. A directory key
/// only ever resolves its own master metadata.
pub fn lookup_key(repo: &Repository, tip: CommitId, key: &KeyPath) -> StorageResult<KeyLookup> {
    let tree = get_tree_at_commit(repo, tip)?;

    if key.is_directory() {
        return Ok(KeyLookup {
            key: key.clone(),
            data: FileLookup::Missing,
            metadata: locate(repo, &tree, &key.metadata_path()),
        });
    }

    let data = locate(repo, &tree, key.as_str());

    let mut metadata = locate(repo, &tree, &key.metadata_path());
    if metadata.is_missing() {
        for path in key.ancestor_metadata_paths() {
            metadata = locate(repo, &tree, &path);
            if !metadata.is_missing() {
                break;
            }
        }
    }

    Ok(KeyLookup {
        key: key.clone(),
        data,
        metadata,
    })
}

/// Resolve a single path at a tip.
pub fn lookup_path(repo: &Repository, tip: CommitId, path: &str) -> StorageResult<FileLookup> {
    let tree = get_tree_at_commit(repo, tip)?;
    Ok(locate(repo, &tree, path))
}
