//! Per-realm checks over a walked tip.

use crate::credentials::{CredentialRecord, Realm};
use crate::extract::{FileLookup, TipFiles};
use crate::metadata::Metadata;
use crate::storage::{CREDENTIALS_DIR, MASTER_METADATA_FILE, METADATA_SUFFIX};
use crate::validate::finding::{Finding, FindingKind, Severity};

struct Collector<'a> {
    files: &'a TipFiles,
    findings: Vec<Finding>,
}

impl<'a> Collector<'a> {
    fn push(&mut self, path: &str, kind: FindingKind, severity: Severity, message: impl Into<String>) {
        self.findings.push(Finding {
            refs: self.files.refs.clone(),
            path: path.to_string(),
            kind,
            severity,
            message: message.into(),
        });
    }

    fn error(&mut self, path: &str, kind: FindingKind, message: impl Into<String>) {
        self.push(path, kind, Severity::Error, message);
    }

    /// returns the content of readable files, recording unreadable ones
    fn readable<'f>(&mut self, lookup: &'f FileLookup) -> Option<&'f [u8]> {
        match lookup {
            FileLookup::Present { content, .. } => Some(content.as_ref()),
            FileLookup::Unreadable { path, error } => {
                self.error(path, FindingKind::UnreadableObject, format!("unreadable object: {error}"));
                None
            }
            FileLookup::Missing => None,
        }
    }
}

/// Run every check against one walked tip.
pub(crate) fn check_tip(files: &TipFiles) -> Vec<Finding> {
    let mut collector = Collector {
        files,
        findings: Vec::new(),
    };

    for (path, error) in &files.unreadable_trees {
        let shown = if path.is_empty() { "/" } else { path.as_str() };
        collector.error(shown, FindingKind::UnreadableObject, format!("unreadable tree: {error}"));
    }

    check_keys(&mut collector);
    check_metadata(&mut collector);
    check_credentials(&mut collector);
    collector.findings
}

fn check_keys(c: &mut Collector<'_>) {
    let files = c.files;
    for (path, lookup) in &files.keys {
        c.readable(lookup);
        if !has_metadata(files, path) {
            c.error(path, FindingKind::MissingMetadata, "source file missing metadata");
        }
    }
}

/// check for `<key>.metadata` or a master in any enclosing directory
fn has_metadata(files: &TipFiles, key: &str) -> bool {
    if files.metadata.contains_key(&format!("{key}{METADATA_SUFFIX}")) {
        return true;
    }
    if files.metadata.contains_key(MASTER_METADATA_FILE) {
        return true;
    }
    key.match_indices('/').any(|(i, _)| {
        let master = format!("{}{}", &key[..=i], MASTER_METADATA_FILE);
        files.metadata.contains_key(&master)
    })
}

fn check_metadata(c: &mut Collector<'_>) {
    let files = c.files;
    for (path, lookup) in &files.metadata {
        if let Some(content) = c.readable(lookup) {
            if let Err(e) = Metadata::parse(content) {
                c.error(path, FindingKind::MalformedMetadata, e.to_string());
            }
        }

        let file_name = path.rsplit('/').next().unwrap_or(path);
        if file_name == MASTER_METADATA_FILE {
            continue;
        }
        let source = &path[..path.len() - METADATA_SUFFIX.len()];
        if !files.keys.contains_key(source) {
            c.error(path, FindingKind::OrphanedMetadata, "metadata orphaned from source");
        }
    }
}

fn check_credentials(c: &mut Collector<'_>) {
    let files = c.files;
    let prefix = format!("{CREDENTIALS_DIR}/");

    for (path, lookup) in &files.credentials {
        let relative = &path[prefix.len()..];
        let (realm_name, username) = match relative.split_once('/') {
            Some(parts) if !parts.1.contains('/') => parts,
            _ => {
                c.error(
                    path,
                    FindingKind::MalformedCredential,
                    "credential records live at <realm>/<username>",
                );
                continue;
            }
        };
        let Some(realm) = Realm::parse(realm_name) else {
            c.error(path, FindingKind::UnknownRealm, format!("unknown realm {realm_name:?}"));
            continue;
        };

        let Some(content) = c.readable(lookup) else {
            continue;
        };
        let record = match CredentialRecord::parse(content) {
            Ok(record) => record,
            Err(e) => {
                c.error(path, FindingKind::MalformedCredential, e.to_string());
                continue;
            }
        };
        if !record.secret.is_well_formed() {
            c.error(path, FindingKind::MalformedCredential, "password hash cannot be decoded");
        }

        for role in record.unknown_roles(realm) {
            let severity = if realm.is_strict() {
                Severity::Error
            } else {
                Severity::Warning
            };
            let message = if realm.is_strict() {
                format!("user {username} has role {role:?} unknown to realm {realm}")
            } else {
                format!("user {username} has role {role:?} unknown to realm {realm}; it is ignored")
            };
            c.push(path, FindingKind::UnknownRole, severity, message);
        }
    }
}
