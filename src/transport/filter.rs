//! Which refs a protocol client may see.

use crate::credentials::{Principal, Realm};
use crate::storage::{CommitId, GitRepository, RefName};
use crate::transport::error::{TransportError, TransportResult};
use crate::transport::{ROLE_READ, ROLE_SECRETS};

/// Hides the secrets branch and staging refs from callers without the
/// `secrets` role. Staging refs are hidden from everyone.
#[derive(Debug, Clone)]
pub struct RefFilter {
    secrets_branch: RefName,
}

impl RefFilter {
    pub fn new(secrets_branch: RefName) -> Self {
        Self { secrets_branch }
    }

    pub fn is_visible(&self, name: &RefName, principal: &Principal) -> bool {
        if name.is_staging() {
            return false;
        }
        *name != self.secrets_branch || principal.roles.contains(ROLE_SECRETS)
    }

    /// Refs to advertise to `principal`, who needs the `read` role.
    pub fn advertise(&self, repo: &GitRepository, principal: &Principal) -> TransportResult<Vec<(RefName, CommitId)>> {
        require(principal, ROLE_READ)?;
        let refs = repo.list_refs()?;
        Ok(refs
            .into_iter()
            .filter(|(name, _)| self.is_visible(name, principal))
            .collect())
    }

    /// Every want has to be the tip of an advertised ref.
    pub fn check_wants(&self, advertised: &[(RefName, CommitId)], wants: &[CommitId]) -> TransportResult<()> {
        for want in wants {
            if !advertised.iter().any(|(_, tip)| tip == want) {
                return Err(TransportError::InvalidWant(want.to_string()));
            }
        }
        Ok(())
    }
}

/// Transport callers must come from the transport realm and hold `role`.
pub(crate) fn require(principal: &Principal, role: &'static str) -> TransportResult<()> {
    if principal.realm == Realm::Transport && principal.roles.contains(role) {
        Ok(())
    } else {
        Err(TransportError::Forbidden {
            user: principal.username.clone(),
            role,
        })
    }
}
