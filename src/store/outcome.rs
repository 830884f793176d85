use std::fmt;

use crate::storage::Version;

/// Result of a key write, as the HTTP layer sees it.
///
/// `Conflict` means the presented version is stale and the client should
/// re-read; `Locked` means another writer is busy with the key and an
/// immediate retry may work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Ok(Version),
    /// the current version, if the key exists
    Conflict(Option<Version>),
    NotFound,
    Locked,
    Rejected(String),
    Fault(String),
}

impl KeyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, KeyOutcome::Ok(_))
    }

    pub fn version(&self) -> Option<&Version> {
        match self {
            KeyOutcome::Ok(version) => Some(version),
            _ => None,
        }
    }
}

impl fmt::Display for KeyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOutcome::Ok(version) => write!(f, "ok {version}"),
            KeyOutcome::Conflict(Some(current)) => write!(f, "conflict, current version is {current}"),
            KeyOutcome::Conflict(None) => f.write_str("conflict, key does not exist"),
            KeyOutcome::NotFound => f.write_str("not found"),
            KeyOutcome::Locked => f.write_str("locked by another writer"),
            KeyOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            KeyOutcome::Fault(reason) => write!(f, "fault: {reason}"),
        }
    }
}
