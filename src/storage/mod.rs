//! Git plumbing for the key store.
//!
//! Everything above this module (extractor, pipeline, caches) talks in
//! keys, refs and versions; only this module builds trees, writes objects
//! and moves refs through git2.
//!
//! ```text
//!   GitRepository ── shared handle behind a mutex, pack ingest, init
//!        │
//!        ├── refs    branch/tag/staging names, atomic multi-ref updates
//!        ├── tree    nested path edits, walks, changed-path diffs
//!        ├── blob    values, metadata and credential records
//!        └── commit  building commits, first-parent history
//! ```

mod blob;
mod commit;
mod error;
mod refs;
mod repository;
mod tree;
mod types;

pub use commit::{CommitInfo, CommitMessage};
pub use error::{StorageError, StorageResult};
pub use refs::{RefManager, RefUpdate};
pub use repository::GitRepository;
pub use tree::{TreeHandle, TreeMutator, WalkEntry};
pub use types::{
    BlobId, CommitId, CommitMeta, GitSignature, InvalidNameError, KeyPath, RefName, TreeId,
    Version, CREDENTIALS_DIR, MASTER_METADATA_FILE, METADATA_SUFFIX,
};

pub(crate) use blob::{read_blob, write_blob};
pub(crate) use commit::{get_tree_at_commit, is_descendant, CommitBuilder};
pub(crate) use tree::changed_paths;
