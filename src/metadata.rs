//! Metadata companions.
//!
//! Every data key has a metadata document somewhere on its path: its own
//! `<key>.metadata`, or the `.metadata` master of an enclosing directory.
//!
//! ```json
//! {
//!   "contentType": "application/json",
//!   "hidden": false,
//!   "protected": true,
//!   "headers": [{ "name": "Cache-Control", "value": "no-store" }],
//!   "users": ["deploy"],
//!   "readRoles": ["read"],
//!   "writeRoles": ["write"]
//! }
//! ```
//!
//! Unknown fields are ignored so newer writers don't break older readers.
//!
//! [`Metadata::authorizes`] is the access check for the HTTP layer that
//! serves keys; the store itself never enforces it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors for a metadata document that doesn't have the required shape.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata is not valid JSON: {0}")]
    Syntax(serde_json::Error),

    #[error("metadata must be a JSON object")]
    NotAnObject,

    #[error("metadata has the wrong shape: {0}")]
    Shape(serde_json::Error),

    #[error("header {index} has an invalid name {name:?}")]
    InvalidHeader { index: usize, name: String },
}

/// An extra response header served with the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Parsed metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// entry exists in history but is not servable
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub headers: Vec<Header>,
    /// legacy per-user access list
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default)]
    pub read_roles: BTreeSet<String>,
    #[serde(default)]
    pub write_roles: BTreeSet<String>,
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            content_type: default_content_type(),
            hidden: false,
            protected: false,
            headers: Vec::new(),
            users: BTreeSet::new(),
            read_roles: BTreeSet::new(),
            write_roles: BTreeSet::new(),
        }
    }
}

/// Kind of access being authorized against a metadata document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Metadata {
    /// metadata with just a content type
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..Self::default()
        }
    }

    /// Parse and check a metadata document.
    pub fn parse(bytes: &[u8]) -> Result<Self, MetadataError> {
        let value: serde_json::Value = serde_json::from_slice(bytes).map_err(MetadataError::Syntax)?;
        if !value.is_object() {
            return Err(MetadataError::NotAnObject);
        }

        let metadata: Metadata = serde_json::from_value(value).map_err(MetadataError::Shape)?;
        for (index, header) in metadata.headers.iter().enumerate() {
            let valid = !header.name.is_empty()
                && header
                    .name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
            if !valid {
                return Err(MetadataError::InvalidHeader {
                    index,
                    name: header.name.clone(),
                });
            }
        }

        Ok(metadata)
    }

    /// serialize as the blob stored in the repository
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Decide whether a caller may access the entry.
    ///
    /// With no user list and no role set for the access kind, the entry is
    /// open, unless it is `protected`, in which case any authenticated
    /// caller passes. Otherwise the caller needs to be listed by name or
    /// hold one of the roles.
    pub fn authorizes(&self, access: Access, user: Option<&str>, roles: &BTreeSet<String>) -> bool {
        let required = match access {
            Access::Read => &self.read_roles,
            Access::Write => &self.write_roles,
        };

        if required.is_empty() && self.users.is_empty() {
            return !self.protected || user.is_some();
        }

        let listed = user.map(|u| self.users.contains(u)).unwrap_or(false);
        listed || !required.is_disjoint(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults_and_unknown_fields() {
        let metadata = Metadata::parse(br#"{"hidden": true, "futureField": 1}"#).unwrap();
        assert!(metadata.hidden);
        assert_eq!(metadata.content_type, DEFAULT_CONTENT_TYPE);
        assert!(metadata.headers.is_empty());
    }

    #[test]
    fn test_parse_full_document() {
        let doc = br#"{
            "contentType": "application/json",
            "protected": true,
            "headers": [{"name": "Cache-Control", "value": "no-store"}],
            "users": ["deploy"],
            "readRoles": ["read"],
            "writeRoles": ["write"]
        }"#;
        let metadata = Metadata::parse(doc).unwrap();
        assert_eq!(metadata.content_type, "application/json");
        assert_eq!(metadata.headers[0].value, "no-store");
        assert!(metadata.users.contains("deploy"));
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(matches!(Metadata::parse(b"{oops"), Err(MetadataError::Syntax(_))));
        assert!(matches!(Metadata::parse(b"[]"), Err(MetadataError::NotAnObject)));
        assert!(matches!(
            Metadata::parse(br#"{"hidden": "yes"}"#),
            Err(MetadataError::Shape(_))
        ));
        assert!(matches!(
            Metadata::parse(br#"{"headers": [{"name": "bad name", "value": ""}]}"#),
            Err(MetadataError::InvalidHeader { index: 0, .. })
        ));
    }

    #[test]
    fn test_serialized_form_parses_back() {
        let metadata = Metadata::with_content_type("text/plain");
        let bytes = metadata.to_bytes().unwrap();
        assert_eq!(Metadata::parse(&bytes).unwrap(), metadata);
    }

    #[test]
    fn test_authorization() {
        let open = Metadata::default();
        assert!(open.authorizes(Access::Read, None, &roles(&[])));

        let protected = Metadata {
            protected: true,
            ..Metadata::default()
        };
        assert!(!protected.authorizes(Access::Read, None, &roles(&[])));
        assert!(protected.authorizes(Access::Read, Some("bob"), &roles(&[])));

        let restricted = Metadata {
            users: roles(&["deploy"]),
            write_roles: roles(&["write"]),
            ..Metadata::default()
        };
        assert!(restricted.authorizes(Access::Write, Some("deploy"), &roles(&[])));
        assert!(restricted.authorizes(Access::Write, Some("bob"), &roles(&["write"])));
        assert!(!restricted.authorizes(Access::Write, Some("bob"), &roles(&["read"])));
    }
}
