//! Credential records on the secrets branch.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::LockRegistry;
use crate::credentials::error::{CredentialError, CredentialResult};
use crate::credentials::record::{is_valid_username, CredentialRecord, PasswordSecret, Realm};
use crate::extract::{lookup_path, FileLookup};
use crate::pipeline::{Change, Updater, WritePipeline};
use crate::storage::{
    get_tree_at_commit, CommitMessage, CommitMeta, GitRepository, KeyPath, RefName, WalkEntry,
};

/// Roles granted to a user who authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub realm: Realm,
    pub username: String,
    pub roles: BTreeSet<String>,
}

/// Reads and writes credential records.
///
/// Writes go through the pipeline like any other commit, so a bad record
/// can't reach the branch. The branch is created by the first write.
pub struct CredentialStore {
    repo: GitRepository,
    locks: Arc<LockRegistry>,
    pipeline: Arc<WritePipeline>,
    branch: RefName,
}

impl CredentialStore {
    pub fn new(pipeline: Arc<WritePipeline>, locks: Arc<LockRegistry>, branch: RefName) -> Self {
        Self {
            repo: pipeline.repo().clone(),
            locks,
            pipeline,
            branch,
        }
    }

    pub fn branch(&self) -> &RefName {
        &self.branch
    }

    /// Read one record.
    ///
    /// Roles the realm doesn't know are dropped from the result.
    pub fn get_user(&self, realm: Realm, username: &str) -> CredentialResult<Option<CredentialRecord>> {
        check_username(username)?;
        let Some(tip) = self.repo.resolve(&self.branch)? else {
            return Ok(None);
        };

        let path = realm.user_path(username);
        match self.repo.with_handle(|repo| lookup_path(repo, tip, &path))? {
            FileLookup::Missing => Ok(None),
            FileLookup::Unreadable { path, error } => Err(CredentialError::Malformed { path, reason: error }),
            FileLookup::Present { content, .. } => {
                let mut record = CredentialRecord::parse(&content).map_err(|e| CredentialError::Malformed {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                let stripped = record.strip_unknown_roles(realm);
                if !stripped.is_empty() {
                    tracing::warn!(%realm, username, roles = ?stripped, "ignoring unknown roles");
                }
                Ok(Some(record))
            }
        }
    }

    /// List usernames in a realm, sorted.
    pub fn list_users(&self, realm: Realm) -> CredentialResult<Vec<String>> {
        let Some(tip) = self.repo.resolve(&self.branch)? else {
            return Ok(Vec::new());
        };
        let dir = format!("{}/", realm.directory());

        let users = self.repo.with_handle(|repo| {
            let tree = get_tree_at_commit(repo, tip)?;
            Ok(tree
                .walk(repo)
                .into_iter()
                .filter_map(|entry| match entry {
                    WalkEntry::Blob { path, .. } => path.strip_prefix(&dir).map(str::to_string),
                    WalkEntry::Unreadable { .. } => None,
                })
                .filter(|name| !name.contains('/'))
                .collect::<Vec<_>>())
        })?;
        Ok(users)
    }

    /// Create a user with a hashed password.
    pub fn add_user(
        &self,
        realm: Realm,
        username: &str,
        password: &str,
        roles: &[&str],
        meta: &CommitMeta,
    ) -> CredentialResult<()> {
        check_username(username)?;
        let record = CredentialRecord::new(roles.iter().copied(), PasswordSecret::hash(password));
        let record = checked_roles(realm, record)?;

        let manager = self.locks.manager(&self.branch);
        let key = record_key(realm, username)?;
        let _guard = manager.lock_key(&key)?;

        if self.get_user(realm, username)?.is_some() {
            return Err(CredentialError::UserExists {
                realm: realm.to_string(),
                username: username.to_string(),
            });
        }
        self.write(realm, username, &record, meta, "ADD")
    }

    /// Change a user's password and/or roles.
    pub fn update_user(
        &self,
        realm: Realm,
        username: &str,
        password: Option<&str>,
        roles: Option<&[&str]>,
        meta: &CommitMeta,
    ) -> CredentialResult<()> {
        check_username(username)?;
        let manager = self.locks.manager(&self.branch);
        let key = record_key(realm, username)?;
        let _guard = manager.lock_key(&key)?;

        let mut record = self
            .get_user(realm, username)?
            .ok_or_else(|| CredentialError::UserNotFound {
                realm: realm.to_string(),
                username: username.to_string(),
            })?;
        if let Some(password) = password {
            record.secret = PasswordSecret::hash(password);
        }
        if let Some(roles) = roles {
            record.roles = roles.iter().map(|r| r.to_string()).collect();
        }
        let record = checked_roles(realm, record)?;
        self.write(realm, username, &record, meta, "UPDATE")
    }

    pub fn delete_user(&self, realm: Realm, username: &str, meta: &CommitMeta) -> CredentialResult<()> {
        check_username(username)?;
        let manager = self.locks.manager(&self.branch);
        let key = record_key(realm, username)?;
        let _guard = manager.lock_key(&key)?;

        if self.get_user(realm, username)?.is_none() {
            return Err(CredentialError::UserNotFound {
                realm: realm.to_string(),
                username: username.to_string(),
            });
        }

        let message = CommitMessage::user(realm.as_str(), username, "DELETE");
        Updater::new(&self.pipeline).commit(
            &self.branch,
            &[Change::remove(realm.user_path(username))],
            meta,
            &message,
        )?;
        tracing::info!(%realm, username, "deleted user");
        Ok(())
    }

    /// Check a password and return the user's roles.
    pub fn authenticate(&self, realm: Realm, username: &str, password: &str) -> CredentialResult<Option<Principal>> {
        if !is_valid_username(username) {
            return Ok(None);
        }
        let Some(record) = self.get_user(realm, username)? else {
            return Ok(None);
        };
        if !record.secret.verify(password) {
            tracing::debug!(%realm, username, "password mismatch");
            return Ok(None);
        }
        Ok(Some(Principal {
            realm,
            username: username.to_string(),
            roles: record.roles,
        }))
    }

    fn write(
        &self,
        realm: Realm,
        username: &str,
        record: &CredentialRecord,
        meta: &CommitMeta,
        action: &str,
    ) -> CredentialResult<()> {
        let message = CommitMessage::user(realm.as_str(), username, action);
        Updater::new(&self.pipeline).commit(
            &self.branch,
            &[Change::upsert(realm.user_path(username), record.to_bytes()?)],
            meta,
            &message,
        )?;
        tracing::info!(%realm, username, action, "wrote user");
        Ok(())
    }
}

fn check_username(username: &str) -> CredentialResult<()> {
    if is_valid_username(username) {
        Ok(())
    } else {
        Err(CredentialError::InvalidUsername(username.to_string()))
    }
}

/// Lock key for one record; credentials paths are never valid data keys.
fn record_key(realm: Realm, username: &str) -> CredentialResult<KeyPath> {
    KeyPath::new(format!("{}/{}", realm.as_str(), username))
        .map_err(|_| CredentialError::InvalidUsername(username.to_string()))
}

/// Strict realms refuse unknown roles, the others drop them.
fn checked_roles(realm: Realm, mut record: CredentialRecord) -> CredentialResult<CredentialRecord> {
    if realm.is_strict() {
        let unknown = record.unknown_roles(realm);
        if !unknown.is_empty() {
            return Err(CredentialError::UnknownRoles {
                realm: realm.to_string(),
                roles: unknown,
            });
        }
    } else {
        let stripped = record.strip_unknown_roles(realm);
        if !stripped.is_empty() {
            tracing::warn!(%realm, roles = ?stripped, "dropping unknown roles");
        }
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GitSignature;
    use crate::testing::pipeline;

    fn meta() -> CommitMeta {
        CommitMeta::new(GitSignature::new("admin", "admin@example.com"), "user change")
    }

    fn store() -> (tempfile::TempDir, CredentialStore) {
        let (dir, harness) = pipeline();
        let store = CredentialStore::new(
            Arc::new(harness.pipeline),
            harness.locks,
            RefName::branch("secrets").unwrap(),
        );
        (dir, store)
    }

    #[test]
    fn test_add_and_authenticate() {
        let (_dir, store) = store();
        assert!(store.get_user(Realm::User, "bob").unwrap().is_none());

        store
            .add_user(Realm::User, "bob", "pw", &["read", "write"], &meta())
            .unwrap();

        let principal = store.authenticate(Realm::User, "bob", "pw").unwrap().unwrap();
        assert!(principal.roles.contains("write"));
        assert!(store.authenticate(Realm::User, "bob", "wrong").unwrap().is_none());
        assert!(store.authenticate(Realm::Admin, "bob", "pw").unwrap().is_none());
        assert_eq!(store.list_users(Realm::User).unwrap(), vec!["bob".to_string()]);
        assert!(store.list_users(Realm::Admin).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_and_missing_users() {
        let (_dir, store) = store();
        store.add_user(Realm::Admin, "root", "pw", &["admin"], &meta()).unwrap();

        let err = store.add_user(Realm::Admin, "root", "pw", &["admin"], &meta()).unwrap_err();
        assert!(matches!(err, CredentialError::UserExists { .. }));

        let err = store.delete_user(Realm::Admin, "nobody", &meta()).unwrap_err();
        assert!(matches!(err, CredentialError::UserNotFound { .. }));
    }

    #[test]
    fn test_role_vocabularies() {
        let (_dir, store) = store();

        store
            .add_user(Realm::User, "lax", "pw", &["read", "superpower"], &meta())
            .unwrap();
        let record = store.get_user(Realm::User, "lax").unwrap().unwrap();
        assert_eq!(record.roles.iter().collect::<Vec<_>>(), vec!["read"]);

        let err = store
            .add_user(Realm::Transport, "ci", "pw", &["write", "superpower"], &meta())
            .unwrap_err();
        assert!(matches!(err, CredentialError::UnknownRoles { ref roles, .. } if roles == &["superpower"]));
        assert!(store.get_user(Realm::Transport, "ci").unwrap().is_none());
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, store) = store();
        store.add_user(Realm::Transport, "ci", "old", &["read"], &meta()).unwrap();

        store
            .update_user(Realm::Transport, "ci", Some("new"), Some(&["read", "create-branch"]), &meta())
            .unwrap();
        let principal = store.authenticate(Realm::Transport, "ci", "new").unwrap().unwrap();
        assert!(principal.roles.contains("create-branch"));
        assert!(store.authenticate(Realm::Transport, "ci", "old").unwrap().is_none());

        store.delete_user(Realm::Transport, "ci", &meta()).unwrap();
        assert!(store.get_user(Realm::Transport, "ci").unwrap().is_none());
    }

    #[test]
    fn test_invalid_username() {
        let (_dir, store) = store();
        let err = store.add_user(Realm::User, "../x", "pw", &[], &meta()).unwrap_err();
        assert!(matches!(err, CredentialError::InvalidUsername(_)));
    }
}
