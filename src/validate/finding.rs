use std::fmt;

use crate::storage::RefName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    MalformedMetadata,
    OrphanedMetadata,
    MissingMetadata,
    UnreadableObject,
    MalformedCredential,
    UnknownRealm,
    UnknownRole,
}

/// One problem found in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// refs whose tip contains the file
    pub refs: Vec<RefName>,
    pub path: String,
    pub kind: FindingKind,
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.path, self.message)
    }
}

/// Aggregated verdict for a set of refs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub refs: Vec<RefName>,
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    /// valid when nothing of error severity was found
    pub fn is_valid(&self) -> bool {
        !self.findings.iter().any(Finding::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.is_error())
    }

    /// Human readable summary.
    ///
    /// The first line names the refs that were validated; each following
    /// line is one finding.
    pub fn message(&self) -> String {
        let refs = self
            .refs
            .iter()
            .map(RefName::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let errors = self.errors().count();

        let mut out = if errors == 0 {
            format!("{refs}: validation passed")
        } else {
            format!("{refs}: validation failed with {errors} error(s)")
        };
        for finding in &self.findings {
            out.push('\n');
            out.push_str(&finding.to_string());
        }
        out
    }
}
