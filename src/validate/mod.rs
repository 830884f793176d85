//! Structural validation.
//!
//! Walks candidate tips and reports everything that would break the storage
//! layout: metadata that doesn't parse, data without metadata, metadata
//! without data, damaged objects and bad credential records. A report with no
//! error-severity findings is valid; warnings never block a push.

mod finding;
mod rules;

use git2::Repository;

use crate::extract::walk_tips;
use crate::storage::{CommitId, RefName};

pub use finding::{Finding, FindingKind, Severity, ValidationReport};

/// Validate the trees at a set of tips.
pub fn validate_tips(repo: &Repository, tips: &[(RefName, CommitId)]) -> ValidationReport {
    let mut report = ValidationReport {
        refs: tips.iter().map(|(name, _)| name.clone()).collect(),
        findings: Vec::new(),
    };

    for files in walk_tips(repo, tips) {
        report.findings.extend(rules::check_tip(&files));
    }

    if !report.is_valid() {
        tracing::debug!(refs = report.refs.len(), errors = report.errors().count(), "validation failed");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialRecord, PasswordSecret};
    use crate::testing::{commit_files, init_repo, main_ref, remove_loose_object};

    fn validate(files: &[(&str, Option<&[u8]>)]) -> ValidationReport {
        let (_dir, repo, base) = init_repo();
        repo.with_repo(|r| {
            let tip = commit_files(r, base, files);
            Ok(validate_tips(r, &[(main_ref(), tip)]))
        })
        .unwrap()
    }

    fn kinds(report: &ValidationReport) -> Vec<(String, FindingKind)> {
        report
            .findings
            .iter()
            .map(|f| (f.path.clone(), f.kind))
            .collect()
    }

    #[test]
    fn test_valid_layout() {
        let report = validate(&[
            ("keyA", Some(b"hello".as_slice())),
            ("keyA.metadata", Some(br#"{"contentType":"text/plain"}"#)),
            ("dir/.metadata", Some(b"{}")),
            ("dir/nested/x", Some(b"1")),
        ]);
        assert!(report.is_valid(), "{}", report.message());
        assert!(report.findings.is_empty());
        assert_eq!(report.message(), "refs/heads/main: validation passed");
    }

    #[test]
    fn test_empty_tree_is_valid() {
        let report = validate(&[]);
        assert!(report.is_valid());
    }

    #[test]
    fn test_missing_metadata_names_file() {
        let report = validate(&[("lonely", Some(b"v".as_slice()))]);
        assert!(!report.is_valid());
        assert_eq!(kinds(&report), vec![("lonely".to_string(), FindingKind::MissingMetadata)]);
        assert!(report.message().contains("lonely: source file missing metadata"));
    }

    #[test]
    fn test_orphaned_metadata() {
        let report = validate(&[("gone.metadata", Some(b"{}".as_slice()))]);
        assert_eq!(
            kinds(&report),
            vec![("gone.metadata".to_string(), FindingKind::OrphanedMetadata)]
        );
    }

    #[test]
    fn test_master_is_never_orphaned() {
        let report = validate(&[("empty/.metadata", Some(b"{}".as_slice()))]);
        assert!(report.is_valid());
    }

    #[test]
    fn test_malformed_metadata() {
        let report = validate(&[
            ("k", Some(b"v".as_slice())),
            ("k.metadata", Some(b"{not json")),
        ]);
        assert_eq!(kinds(&report), vec![("k.metadata".to_string(), FindingKind::MalformedMetadata)]);
        let first = report.message().lines().next().unwrap().to_string();
        assert_eq!(first, "refs/heads/main: validation failed with 1 error(s)");
    }

    #[test]
    fn test_credentials_realms_and_roles() {
        let user = CredentialRecord::new(["read", "fly"], PasswordSecret::Plain("pw".into()))
            .to_bytes()
            .unwrap();
        let transport = CredentialRecord::new(["fly"], PasswordSecret::Plain("pw".into()))
            .to_bytes()
            .unwrap();

        let report = validate(&[
            (".credentials/user/bob", Some(user.as_slice())),
            (".credentials/transport/ci", Some(transport.as_slice())),
            (".credentials/wizards/merlin", Some(b"{}")),
            (".credentials/admin/eve", Some(b"[]")),
        ]);

        let user_finding = report
            .findings
            .iter()
            .find(|f| f.path == ".credentials/user/bob")
            .unwrap();
        assert_eq!(user_finding.severity, Severity::Warning);

        let errors: Vec<_> = report.errors().map(|f| (f.path.as_str(), f.kind)).collect();
        assert!(errors.contains(&(".credentials/transport/ci", FindingKind::UnknownRole)));
        assert!(errors.contains(&(".credentials/wizards/merlin", FindingKind::UnknownRealm)));
        assert!(errors.contains(&(".credentials/admin/eve", FindingKind::MalformedCredential)));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_unreadable_object() {
        let (dir, repo, base) = init_repo();
        let tip = repo
            .with_repo(|r| {
                Ok(commit_files(
                    r,
                    base,
                    &[("k", Some(b"vanishing".as_slice())), ("k.metadata", Some(b"{}"))],
                ))
            })
            .unwrap();
        let oid = repo.with_repo(|r| Ok(r.blob(b"vanishing").unwrap())).unwrap();
        remove_loose_object(dir.path(), oid);

        let report = repo
            .with_repo(|r| Ok(validate_tips(r, &[(main_ref(), tip)])))
            .unwrap();
        assert_eq!(kinds(&report), vec![("k".to_string(), FindingKind::UnreadableObject)]);
    }
}
