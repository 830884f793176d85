//! Credential records and password secrets.

use std::collections::BTreeSet;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::storage::CREDENTIALS_DIR;

const HASH_SCHEME: &str = "blake3";
const SALT_LEN: usize = 16;

/// Namespace for credential records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Realm {
    Admin,
    User,
    Transport,
}

impl Realm {
    pub const ALL: [Realm; 3] = [Realm::Admin, Realm::User, Realm::Transport];

    pub fn as_str(&self) -> &'static str {
        match self {
            Realm::Admin => "admin",
            Realm::User => "user",
            Realm::Transport => "transport",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|realm| realm.as_str() == name)
    }

    /// the fixed role vocabulary of the realm
    pub fn roles(&self) -> &'static [&'static str] {
        match self {
            Realm::Admin => &["admin", "user-admin"],
            Realm::User => &["read", "write"],
            Realm::Transport => &["read", "write", "create-branch", "secrets"],
        }
    }

    /// unknown roles are errors here, not warnings
    ///
    /// The transport realm gates branch creation and secrets visibility.
    pub fn is_strict(&self) -> bool {
        matches!(self, Realm::Transport)
    }

    /// directory holding this realm's records
    pub fn directory(&self) -> String {
        format!("{}/{}", CREDENTIALS_DIR, self.as_str())
    }

    /// path of one user's record
    pub fn user_path(&self, username: &str) -> String {
        format!("{}/{}", self.directory(), username)
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a username is usable as a single path component.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

/// Stored password material.
///
/// Either a plain value or a salted digest of the form
/// `blake3$<salt hex>$<digest hex>`. Both shapes are checked through
/// [`PasswordSecret::verify`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PasswordSecret {
    #[serde(rename = "password")]
    Plain(String),
    #[serde(rename = "passwordHash")]
    Hashed(String),
}

impl PasswordSecret {
    /// Hash a password with a fresh random salt.
    pub fn hash(password: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = digest(&salt, password);
        PasswordSecret::Hashed(format!("{}${}${}", HASH_SCHEME, hex::encode(salt), digest.to_hex()))
    }

    /// Compare a candidate password against the stored secret.
    pub fn verify(&self, candidate: &str) -> bool {
        match self {
            // hash both sides so the comparison runs in constant time
            PasswordSecret::Plain(stored) => blake3::hash(stored.as_bytes()) == blake3::hash(candidate.as_bytes()),
            PasswordSecret::Hashed(encoded) => match parse_hash(encoded) {
                Some((salt, expected)) => digest(&salt, candidate) == expected,
                None => false,
            },
        }
    }

    /// check a hashed secret can be decoded at all
    pub fn is_well_formed(&self) -> bool {
        match self {
            PasswordSecret::Plain(_) => true,
            PasswordSecret::Hashed(encoded) => parse_hash(encoded).is_some(),
        }
    }
}

impl fmt::Debug for PasswordSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordSecret::Plain(_) => f.write_str("PasswordSecret::Plain(..)"),
            PasswordSecret::Hashed(_) => f.write_str("PasswordSecret::Hashed(..)"),
        }
    }
}

fn digest(salt: &[u8], password: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize()
}

fn parse_hash(encoded: &str) -> Option<(Vec<u8>, blake3::Hash)> {
    let mut parts = encoded.splitn(3, '$');
    if parts.next()? != HASH_SCHEME {
        return None;
    }
    let salt = hex::decode(parts.next()?).ok()?;
    let digest = blake3::Hash::from_hex(parts.next()?).ok()?;
    Some((salt, digest))
}

/// One user's record, stored as JSON at `.credentials/<realm>/<username>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(flatten)]
    pub secret: PasswordSecret,
}

impl CredentialRecord {
    pub fn new(roles: impl IntoIterator<Item = impl Into<String>>, secret: PasswordSecret) -> Self {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            secret,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// roles outside the realm's vocabulary
    pub fn unknown_roles(&self, realm: Realm) -> Vec<String> {
        let known = realm.roles();
        self.roles
            .iter()
            .filter(|role| !known.contains(&role.as_str()))
            .cloned()
            .collect()
    }

    /// Drop roles the realm doesn't know and return what was dropped.
    pub fn strip_unknown_roles(&mut self, realm: Realm) -> Vec<String> {
        let unknown = self.unknown_roles(realm);
        self.roles.retain(|role| !unknown.contains(role));
        unknown
    }
}
