//! Bulk extraction over many tips.

use std::collections::BTreeMap;

use bytes::Bytes;
use git2::Repository;

use crate::extract::lookup::FileLookup;
use crate::storage::{
    get_tree_at_commit, read_blob, CommitId, RefName, WalkEntry, CREDENTIALS_DIR, METADATA_SUFFIX,
};

/// Every file reachable from one tip, bucketed by what it is.
#[derive(Debug, Clone, Default)]
pub struct TipFiles {
    /// all refs pointing at this tip
    pub refs: Vec<RefName>,
    pub tip: Option<CommitId>,
    pub keys: BTreeMap<String, FileLookup>,
    /// `<key>.metadata` companions and `.metadata` masters
    pub metadata: BTreeMap<String, FileLookup>,
    /// files under the credentials directory, paths kept in full
    pub credentials: BTreeMap<String, FileLookup>,
    /// trees (or the root commit) that could not be read; `""` is the root
    pub unreadable_trees: Vec<(String, String)>,
}

impl TipFiles {
    fn new(refs: Vec<RefName>, tip: CommitId) -> Self {
        Self {
            refs,
            tip: Some(tip),
            ..Self::default()
        }
    }

    fn insert(&mut self, path: String, lookup: FileLookup) {
        let bucket = if path.starts_with(&format!("{CREDENTIALS_DIR}/")) {
            &mut self.credentials
        } else if path.ends_with(METADATA_SUFFIX) {
            &mut self.metadata
        } else {
            &mut self.keys
        };
        bucket.insert(path, lookup);
    }

    /// number of files seen, readable or not
    pub fn len(&self) -> usize {
        self.keys.len() + self.metadata.len() + self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Walk every distinct tip once and bucket its files.
///
/// Refs that share a tip are grouped so the tree is only read once. Results
/// follow the order in which tips first appear in `tips`.
pub fn walk_tips(repo: &Repository, tips: &[(RefName, CommitId)]) -> Vec<TipFiles> {
    let mut groups: Vec<(CommitId, Vec<RefName>)> = Vec::new();
    for (name, tip) in tips {
        match groups.iter_mut().find(|(id, _)| id == tip) {
            Some((_, refs)) => refs.push(name.clone()),
            None => groups.push((*tip, vec![name.clone()])),
        }
    }

    groups
        .into_iter()
        .map(|(tip, refs)| walk_tip(repo, refs, tip))
        .collect()
}

fn walk_tip(repo: &Repository, refs: Vec<RefName>, tip: CommitId) -> TipFiles {
    let mut files = TipFiles::new(refs, tip);

    let tree = match get_tree_at_commit(repo, tip) {
        Ok(tree) => tree,
        Err(e) => {
            files.unreadable_trees.push((String::new(), e.to_string()));
            return files;
        }
    };

    for entry in tree.walk(repo) {
        match entry {
            WalkEntry::Blob { path, id } => {
                let lookup = match read_blob(repo, id) {
                    Ok(content) => FileLookup::Present {
                        path: path.clone(),
                        id,
                        content: Bytes::from(content),
                    },
                    Err(e) => FileLookup::Unreadable {
                        path: path.clone(),
                        error: e.to_string(),
                    },
                };
                files.insert(path, lookup);
            }
            WalkEntry::Unreadable { path, error } => {
                files.unreadable_trees.push((path, error.to_string()));
            }
        }
    }

    tracing::debug!(tip = %tip.short(), files = files.len(), "walked tip");
    files
}
