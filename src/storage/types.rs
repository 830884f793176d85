//! core type-safe wrappers around git primitives for the storage layer.

use std::fmt;
use std::fmt::Formatter;

use git2::Oid;
use serde::{Deserialize, Serialize};

/// This makes sure we don't accidentally pass a blob ID where a commit ID
/// is expected. The inner Oid is only accessible within the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// parse CommitId from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(CommitId)
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git blob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub(crate) Oid);

impl BlobId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Git tree identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque version token handed to clients for optimistic concurrency.
///
/// A version is the hex id of the blob holding the content, so identical
/// content yields the same token and any change yields a different one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    /// parse a version token received from a client
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().trim_matches('"');
        Oid::from_str(token).ok().map(|oid| Self(oid.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<BlobId> for Version {
    fn from(id: BlobId) -> Self {
        Self(id.0.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Suffix of a key's metadata companion file.
pub const METADATA_SUFFIX: &str = ".metadata";

/// Name of a directory's master-metadata marker.
pub const MASTER_METADATA_FILE: &str = ".metadata";

/// Reserved top-level directory holding credential records.
pub const CREDENTIALS_DIR: &str = ".credentials";

/// A validated key.
///
/// Keys are `/`-separated paths. A trailing `/` marks a directory key, which
/// can only carry master metadata.
///
/// Valid keys:
/// - non-empty, no leading `/`, no empty, `.` or `..` components
/// - no component ending in `.metadata` (reserved for companions)
/// - not under the reserved credentials directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPath(String);

impl KeyPath {
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    fn validate(key: &str) -> Result<(), InvalidNameError> {
        if key.is_empty() || key == "/" {
            return Err(InvalidNameError::Empty);
        }

        if key.len() > 1024 {
            return Err(InvalidNameError::TooLong(key.len()));
        }

        if key.starts_with('/') {
            return Err(InvalidNameError::InvalidStart('/'));
        }

        let body = key.strip_suffix('/').unwrap_or(key);
        for (i, component) in body.split('/').enumerate() {
            if component.is_empty() || component == "." || component == ".." {
                return Err(InvalidNameError::InvalidPath(key.to_string()));
            }
            if component.ends_with(METADATA_SUFFIX) {
                return Err(InvalidNameError::Reserved(component.to_string()));
            }
            if i == 0 && component == CREDENTIALS_DIR {
                return Err(InvalidNameError::Reserved(component.to_string()));
            }
            if let Some((position, char)) = component
                .char_indices()
                .find(|(_, c)| c.is_control() || *c == '\\')
            {
                return Err(InvalidNameError::InvalidCharacter { char, position });
            }
        }

        Ok(())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// check if this key names a directory (trailing `/`)
    pub fn is_directory(&self) -> bool {
        self.0.ends_with('/')
    }

    /// Path of the metadata companion owned by this key itself.
    ///
    /// `a/b` owns `a/b.metadata`; the directory `a/b/` owns `a/b/.metadata`.
    pub fn metadata_path(&self) -> String {
        if self.is_directory() {
            format!("{}{}", self.0, MASTER_METADATA_FILE)
        } else {
            format!("{}{}", self.0, METADATA_SUFFIX)
        }
    }

    /// Master-metadata paths of every ancestor directory, nearest first.
    ///
    /// For `a/b/c` this is `a/b/.metadata`, `a/.metadata`, `.metadata`.
    pub fn ancestor_metadata_paths(&self) -> Vec<String> {
        let body = self.0.strip_suffix('/').unwrap_or(&self.0);
        let mut paths = Vec::new();
        let mut rest = body;
        while let Some(idx) = rest.rfind('/') {
            rest = &rest[..idx];
            paths.push(format!("{}/{}", rest, MASTER_METADATA_FILE));
        }
        paths.push(MASTER_METADATA_FILE.to_string());
        paths
    }

    /// the plain key with the same name (`foo/` -> `foo`)
    pub fn as_plain(&self) -> KeyPath {
        match self.0.strip_suffix('/') {
            Some(plain) => KeyPath(plain.to_string()),
            None => self.clone(),
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for KeyPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A fully qualified ref name (`refs/heads/...` or `refs/tags/...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    pub const HEADS: &'static str = "refs/heads/";
    pub const TAGS: &'static str = "refs/tags/";

    /// prefix for throwaway staging branches
    pub const STAGING_PREFIX: &'static str = "refs/heads/_staging/";

    /// create a RefName from a full ref path
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if !name.starts_with("refs/")
            || name.contains("..")
            || name.ends_with('/')
            || name.contains("//")
            || !git2::Reference::is_valid_name(&name)
        {
            return Err(InvalidNameError::InvalidPath(name));
        }
        Ok(Self(name))
    }

    /// Parse a user-supplied ref: full names are kept, short names are
    /// taken to be branches.
    pub fn parse(name: &str) -> Result<Self, InvalidNameError> {
        if name.starts_with("refs/") {
            Self::new(name)
        } else {
            Self::branch(name)
        }
    }

    /// create a branch ref (`refs/heads/{name}`)
    pub fn branch(name: &str) -> Result<Self, InvalidNameError> {
        Self::new(format!("{}{}", Self::HEADS, name))
    }

    /// create a tag ref (`refs/tags/{name}`)
    pub fn tag(name: &str) -> Result<Self, InvalidNameError> {
        Self::new(format!("{}{}", Self::TAGS, name))
    }

    /// branch from a literal name known to be valid
    pub(crate) fn known_branch(name: &'static str) -> Self {
        Self(format!("{}{}", Self::HEADS, name))
    }

    /// create a staging branch name
    pub fn staging(id: &str) -> Self {
        Self(format!("{}{}", Self::STAGING_PREFIX, id))
    }

    pub fn is_branch(&self) -> bool {
        self.0.starts_with(Self::HEADS)
    }

    pub fn is_tag(&self) -> bool {
        self.0.starts_with(Self::TAGS)
    }

    /// check if this is a staging branch
    pub fn is_staging(&self) -> bool {
        self.0.starts_with(Self::STAGING_PREFIX)
    }

    /// get the full ref path
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// git signature (author/committer info)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    /// create a new signature
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default signature for internal commits
    pub fn gitkv() -> Self {
        Self::new("gitkv", "gitkv@localhost")
    }

    /// convert to git2::Signature
    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::gitkv()
    }
}

/// Author and message for a commit produced on behalf of a client.
#[derive(Debug, Clone, Default)]
pub struct CommitMeta {
    pub author: GitSignature,
    pub message: Option<String>,
}

impl CommitMeta {
    pub fn new(author: GitSignature, message: impl Into<String>) -> Self {
        Self {
            author,
            message: Some(message.into()),
        }
    }
}

/// error type for invalid names (keys, refs, users)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character {:?} at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_valid() {
        assert!(KeyPath::new("config").is_ok());
        assert!(KeyPath::new("apps/web/settings.json").is_ok());
        assert!(KeyPath::new("apps/web/").is_ok());
        assert!(KeyPath::new("with space").is_ok());
    }

    #[test]
    fn test_key_invalid() {
        assert!(KeyPath::new("").is_err());
        assert!(KeyPath::new("/abs").is_err());
        assert!(KeyPath::new("a//b").is_err());
        assert!(KeyPath::new("a/../b").is_err());
        assert!(KeyPath::new("a/b.metadata").is_err());
        assert!(KeyPath::new(".credentials/admin/root").is_err());
        assert!(KeyPath::new("a\nb").is_err());
    }

    #[test]
    fn test_metadata_paths() {
        let key = KeyPath::new("a/b/c").unwrap();
        assert_eq!(key.metadata_path(), "a/b/c.metadata");
        assert_eq!(
            key.ancestor_metadata_paths(),
            vec!["a/b/.metadata", "a/.metadata", ".metadata"]
        );

        let dir = KeyPath::new("a/b/").unwrap();
        assert!(dir.is_directory());
        assert_eq!(dir.metadata_path(), "a/b/.metadata");
        assert_eq!(dir.ancestor_metadata_paths(), vec!["a/.metadata", ".metadata"]);

        let top = KeyPath::new("top").unwrap();
        assert_eq!(top.ancestor_metadata_paths(), vec![".metadata"]);
    }

    #[test]
    fn test_directory_conversion() {
        let key = KeyPath::new("foo").unwrap();
        let dir = KeyPath::new("foo/").unwrap();
        assert!(dir.is_directory());
        assert_eq!(dir.as_plain(), key);
        assert_eq!(key.as_plain(), key);
    }

    #[test]
    fn test_ref_names() {
        let main = RefName::parse("main").unwrap();
        assert_eq!(main.as_str(), "refs/heads/main");
        assert!(main.is_branch());

        let tag = RefName::tag("v1").unwrap();
        assert!(tag.is_tag());
        assert!(!tag.is_branch());

        let staging = RefName::staging("01abc");
        assert!(staging.is_staging());
        assert!(staging.is_branch());

        assert!(RefName::new("heads/main").is_err());
        assert!(RefName::new("refs/heads/a..b").is_err());
    }

    #[test]
    fn test_version_parse() {
        let oid = "0123456789abcdef0123456789abcdef01234567";
        let v = Version::parse(&format!("\"{}\"", oid)).unwrap();
        assert_eq!(v.as_str(), oid);
        assert!(Version::parse("nope").is_none());
    }
}
