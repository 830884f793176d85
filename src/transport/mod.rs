//! Seams for the git smart protocol.
//!
//! The wire protocol itself is served by an embedding layer; this module
//! decides which repository a request addresses, which refs a caller sees,
//! what happens to a pushed pack and where fetch packs get built.

mod error;
mod filter;
mod receive;
mod resolver;
mod service;
mod upload;

pub use error::{TransportError, TransportResult};
pub use filter::RefFilter;
pub use receive::ReceivePack;
pub use resolver::RepositoryResolver;
pub use service::TransportService;
pub use upload::UploadPool;

pub const ROLE_READ: &str = "read";
pub const ROLE_WRITE: &str = "write";
pub const ROLE_CREATE_BRANCH: &str = "create-branch";
pub const ROLE_SECRETS: &str = "secrets";
