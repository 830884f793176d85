//! gitkv - a key/value store on top of a Git repository
//!
//! Keys are files in a branch's tree, every change is a commit, and every
//! branch or tag is a separately addressable view of the whole store. Each
//! data key carries a JSON metadata document (its own `<key>.metadata` or a
//! directory-wide `.metadata` master), and nothing reaches a branch without
//! passing structural validation first, whether it comes from a git push or
//! from the key API.
//!
//! # Example
//!
//! ```no_run
//! use gitkv::config::StoreConfig;
//! use gitkv::metadata::Metadata;
//! use gitkv::storage::{CommitMeta, GitSignature, KeyPath};
//! use gitkv::store::KeyStore;
//!
//! let store = KeyStore::open(StoreConfig::new("./data.git")).unwrap();
//! let main = store.resolve_ref(None).unwrap();
//! let key = KeyPath::new("config/app").unwrap();
//! let meta = CommitMeta::new(GitSignature::new("ops", "ops@example.com"), "initial config");
//!
//! let outcome = store.add_key(&key, &main, b"{}", Some(&Metadata::default()), &meta);
//! println!("{outcome}");
//! ```

pub mod bus;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod extract;
pub mod metadata;
pub mod pipeline;
pub mod storage;
pub mod store;
pub mod transport;
pub mod validate;

#[cfg(test)]
mod testing;
