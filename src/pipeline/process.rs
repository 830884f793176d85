//! Staged, validated ref updates.

use std::collections::HashSet;
use std::sync::Arc;

use crate::bus::{FaultRegister, NotificationBus, RefChange, RefsChanged};
use crate::cache::{LockRegistry, RefCacheManager};
use crate::config::StoreConfig;
use crate::pipeline::command::{CommandOutcome, CommandResult, Push, PushOutcome, UpdateState};
use crate::storage::{
    is_descendant, GitRepository, GitSignature, RefManager, RefName, RefUpdate, StorageError,
};
use crate::validate::validate_tips;

const REFLOG_MESSAGE: &str = "gitkv: push";

/// The gatekeeper every ref update goes through.
///
/// Each proposed tip is parked on a hidden staging branch and validated
/// there. Only when validation passes is the real branch moved, under its
/// exclusive lock, with a stale-base check. Readers therefore only ever see
/// the previous tip or a validated new one.
pub struct WritePipeline {
    repo: GitRepository,
    locks: Arc<LockRegistry>,
    bus: Arc<NotificationBus>,
    default_branch: RefName,
    allow_non_fast_forward: bool,
    signature: GitSignature,
}

impl WritePipeline {
    pub fn new(
        repo: GitRepository,
        locks: Arc<LockRegistry>,
        bus: Arc<NotificationBus>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            repo,
            locks,
            bus,
            default_branch: config.default_branch.clone(),
            allow_non_fast_forward: config.allow_non_fast_forward,
            signature: config.signature.clone(),
        }
    }

    pub fn repo(&self) -> &GitRepository {
        &self.repo
    }

    pub fn default_branch(&self) -> &RefName {
        &self.default_branch
    }

    pub fn faults(&self) -> &Arc<FaultRegister> {
        self.bus.faults()
    }

    pub(crate) fn signature(&self) -> &GitSignature {
        &self.signature
    }

    /// Run a push through precheck, staging, validation and commit.
    pub fn process(&self, push: &Push) -> PushOutcome {
        let mut outcomes: Vec<CommandOutcome> = push
            .commands
            .iter()
            .cloned()
            .map(CommandOutcome::new)
            .collect();

        self.precheck(&mut outcomes);

        let mut staged = Vec::new();
        self.stage_and_validate(&mut outcomes, &mut staged);

        if push.atomic && outcomes.iter().any(|o| o.result.is_rejected()) {
            for outcome in outcomes.iter_mut().filter(|o| o.is_pending()) {
                outcome.reject(CommandResult::RejectedOtherReason(
                    "atomic push failed".to_string(),
                ));
            }
        }

        let pending: Vec<usize> = (0..outcomes.len()).filter(|&i| outcomes[i].is_pending()).collect();
        if push.atomic {
            if !pending.is_empty() {
                self.commit_group(&mut outcomes, &pending);
            }
        } else {
            for i in pending {
                self.commit_group(&mut outcomes, &[i]);
            }
        }

        self.cleanup(&staged);

        for outcome in &mut outcomes {
            if !outcome.state.is_final() {
                outcome.state = UpdateState::RolledBack;
            }
        }

        let accepted = outcomes.iter().filter(|o| o.result.is_ok()).count();
        tracing::info!(
            commands = outcomes.len(),
            accepted,
            rejected = outcomes.len() - accepted,
            atomic = push.atomic,
            "push processed"
        );
        PushOutcome { commands: outcomes }
    }

    /// Delete staging branches left behind by a previous process.
    pub fn cleanup_abandoned_staging(&self) -> usize {
        match self.repo.cleanup_abandoned_staging() {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "removed abandoned staging branches");
                }
                removed
            }
            Err(e) => {
                self.bus.faults().record("pipeline", format!("staging cleanup failed: {e}"));
                0
            }
        }
    }

    // ==================== Phases ====================

    /// Reject what can be rejected without looking at content.
    fn precheck(&self, outcomes: &mut [CommandOutcome]) {
        let mut seen = HashSet::new();

        for outcome in outcomes.iter_mut() {
            let command = outcome.command.clone();
            let name = &command.name;

            if name.is_tag() {
                outcome.reject(CommandResult::RejectedTagUpdate);
            } else if !name.is_branch() || name.is_staging() {
                outcome.reject(CommandResult::RejectedOtherReason(format!(
                    "{name} is not a writable branch"
                )));
            } else if !seen.insert(name.clone()) {
                outcome.reject(CommandResult::RejectedOtherReason(format!(
                    "more than one command for {name}"
                )));
            } else if command.is_delete() && *name == self.default_branch {
                outcome.reject(CommandResult::RejectedNoDelete);
            } else if command.is_delete() && command.old.is_none() {
                outcome.reject(CommandResult::RejectedOtherReason(format!(
                    "deleting {name} requires its current tip"
                )));
            } else if let Some(new) = command.new {
                match self.repo.commit_exists(new) {
                    Ok(true) => {}
                    Ok(false) => {
                        outcome.reject(CommandResult::RejectedMissingObject(new));
                        continue;
                    }
                    Err(e) => {
                        self.fault(outcome, "lookup", e);
                        continue;
                    }
                }

                if let (false, Some(old)) = (self.allow_non_fast_forward, command.old) {
                    match self.repo.with_handle(|repo| is_descendant(repo, new, old)) {
                        Ok(true) => {}
                        Ok(false) => outcome.reject(CommandResult::RejectedNonFastForward),
                        Err(e) => self.fault(outcome, "ancestry check", e),
                    }
                }
            }
        }
    }

    /// Park each new tip on a staging branch and validate it there.
    fn stage_and_validate(&self, outcomes: &mut [CommandOutcome], staged: &mut Vec<RefName>) {
        for outcome in outcomes.iter_mut().filter(|o| o.is_pending()) {
            let Some(new) = outcome.command.new else {
                // deletions have nothing to validate
                outcome.state = UpdateState::ValidatedOk;
                continue;
            };
            let base = outcome.command.old.unwrap_or(new);

            let staging = match self.repo.with_repo(|repo| RefManager::create_staging(repo, base)) {
                Ok(staging) => staging,
                Err(e) => {
                    self.fault(outcome, "staging", e);
                    continue;
                }
            };
            staged.push(staging.clone());

            if let Err(e) = self.repo.with_repo(|repo| RefManager::force_update(repo, &staging, new)) {
                self.fault(outcome, "staging", e);
                continue;
            }
            outcome.state = UpdateState::Staged;

            let tips = [(staging.clone(), new)];
            let report = match self.repo.with_handle(|repo| Ok(validate_tips(repo, &tips))) {
                Ok(report) => report,
                Err(e) => {
                    self.fault(outcome, "validation", e);
                    continue;
                }
            };

            for warning in report.warnings() {
                tracing::warn!(branch = %outcome.command.name, path = %warning.path, "{}", warning.message);
            }

            if report.is_valid() {
                outcome.state = UpdateState::ValidatedOk;
            } else {
                let message = rewrite_first_line(&report.message(), &staging, &outcome.command.name);
                tracing::info!(branch = %outcome.command.name, errors = report.errors().count(), "push failed validation");
                outcome.state = UpdateState::ValidatedFailed;
                outcome.result = CommandResult::RejectedValidation(message);
            }
        }
    }

    /// Move the real refs for a group of commands, all or nothing.
    fn commit_group(&self, outcomes: &mut [CommandOutcome], group: &[usize]) {
        let managers: Vec<Arc<RefCacheManager>> = group
            .iter()
            .map(|&i| self.locks.manager(&outcomes[i].command.name))
            .collect();

        let mut guards = Vec::with_capacity(managers.len());
        for manager in &managers {
            match manager.try_lock_branch() {
                Some(guard) => guards.push(guard),
                None => {
                    tracing::debug!(branch = %manager.branch(), "branch busy, rejecting update");
                    for &i in group {
                        outcomes[i].reject(CommandResult::LockFailure);
                    }
                    return;
                }
            }
        }

        let updates: Vec<RefUpdate> = group
            .iter()
            .map(|&i| RefUpdate {
                name: outcomes[i].command.name.clone(),
                expected: outcomes[i].command.old,
                new: outcomes[i].command.new,
            })
            .collect();

        let applied = self
            .repo
            .with_repo(|repo| RefManager::apply_atomic(repo, &updates, &self.signature, REFLOG_MESSAGE));

        match applied {
            Ok(()) => {
                for &i in group {
                    outcomes[i].state = UpdateState::Committed;
                    outcomes[i].result = CommandResult::Ok;
                }
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(error = %e, "stale base, rejecting update");
                for &i in group {
                    outcomes[i].reject(CommandResult::LockFailure);
                }
                return;
            }
            Err(e) => {
                self.bus.faults().record("pipeline", format!("ref update failed: {e}"));
                for &i in group {
                    outcomes[i].reject(CommandResult::RejectedOtherReason(format!("ref update failed: {e}")));
                }
                return;
            }
        }

        // caches refresh while the branches are still held
        let event = RefsChanged {
            changes: group
                .iter()
                .map(|&i| RefChange {
                    name: outcomes[i].command.name.clone(),
                    old: outcomes[i].command.old,
                    new: outcomes[i].command.new,
                })
                .collect(),
        };
        self.bus.notify(&event);
        drop(guards);
    }

    /// Best-effort removal of staging branches.
    fn cleanup(&self, staged: &[RefName]) {
        for staging in staged {
            if let Err(e) = self.repo.with_repo(|repo| RefManager::delete(repo, staging)) {
                tracing::warn!(%staging, error = %e, "failed to delete staging branch");
                self.bus
                    .faults()
                    .record("pipeline", format!("failed to delete staging branch {staging}: {e}"));
            }
        }
    }

    /// Reject one command for a repository error and record the fault.
    fn fault(&self, outcome: &mut CommandOutcome, phase: &str, error: StorageError) {
        self.bus
            .faults()
            .record("pipeline", format!("{phase} of {} failed: {error}", outcome.command.name));
        outcome.reject(CommandResult::RejectedOtherReason(format!("{phase} failed: {error}")));
    }
}

impl std::fmt::Debug for WritePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePipeline")
            .field("repo", &self.repo)
            .field("default_branch", &self.default_branch)
            .finish()
    }
}

/// Point the first line of a validation message at the real branch.
fn rewrite_first_line(message: &str, staging: &RefName, real: &RefName) -> String {
    match message.split_once('\n') {
        Some((first, rest)) => format!("{}\n{}", first.replace(staging.as_str(), real.as_str()), rest),
        None => message.replace(staging.as_str(), real.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RefListener;
    use crate::pipeline::command::ReceiveCommand;
    use crate::storage::{CommitId, KeyPath, StorageResult};
    use crate::testing::{commit_files, main_ref, pipeline, pipeline_with};

    fn dev() -> RefName {
        RefName::branch("dev").unwrap()
    }

    fn tip(harness: &crate::testing::PipelineHarness, name: &RefName) -> Option<CommitId> {
        harness.pipeline.repo().resolve(name).unwrap()
    }

    fn commit(harness: &crate::testing::PipelineHarness, parent: CommitId, files: &[(&str, Option<&[u8]>)]) -> CommitId {
        harness
            .pipeline
            .repo()
            .with_repo(|r| Ok(commit_files(r, parent, files)))
            .unwrap()
    }

    /// Leaves a `.lock` file on every staging branch once the real refs
    /// moved, so deleting them fails.
    struct StagingLocker {
        repo: GitRepository,
    }

    impl RefListener for StagingLocker {
        fn refs_changed(&self, _event: &RefsChanged) -> StorageResult<()> {
            for staging in self.repo.with_handle(RefManager::list_staging)? {
                std::fs::write(self.repo.path().join(format!("{}.lock", staging.as_str())), b"")?;
            }
            Ok(())
        }
    }

    const VALID: &[(&str, Option<&[u8]>)] = &[("keyA", Some(b"a")), ("keyA.metadata", Some(b"{}"))];
    const INVALID: &[(&str, Option<&[u8]>)] = &[("keyB", Some(b"b"))];

    #[test]
    fn test_valid_update_commits() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let new = commit(&h, base, VALID);

        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), new)]));

        assert!(outcome.all_ok());
        assert_eq!(outcome.commands[0].state, UpdateState::Committed);
        assert_eq!(tip(&h, &main_ref()), Some(new));
        assert!(h.faults.is_empty());
    }

    #[test]
    fn test_staging_failure_rejects_and_records_fault() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let new = commit(&h, base, VALID);
        // a plain ref where the staging namespace should be a directory
        h.pipeline
            .repo()
            .with_repo(|r| {
                r.reference("refs/heads/_staging", base.raw(), true, "block staging")?;
                Ok(())
            })
            .unwrap();

        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), new)]));

        match outcome.result_for(&main_ref()) {
            Some(CommandResult::RejectedOtherReason(reason)) => {
                assert!(reason.starts_with("staging failed"), "{reason}")
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(tip(&h, &main_ref()), Some(base));
        assert!(!h.faults.check().is_healthy());
        assert!(h.faults.check().is_healthy());
    }

    #[test]
    fn test_cleanup_failure_is_a_fault_not_a_rejection() {
        let (_dir, h) = pipeline();
        h.bus.subscribe(Arc::new(StagingLocker {
            repo: h.pipeline.repo().clone(),
        }));
        let base = tip(&h, &main_ref()).unwrap();
        let new = commit(&h, base, VALID);

        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), new)]));

        assert_eq!(outcome.result_for(&main_ref()), Some(&CommandResult::Ok));
        assert_eq!(outcome.commands[0].state, UpdateState::Committed);
        assert_eq!(tip(&h, &main_ref()), Some(new));

        let fault = h.faults.take().expect("cleanup failure was not recorded");
        assert!(fault.message.contains("failed to delete staging branch"), "{}", fault.message);
        assert!(h.faults.check().is_healthy());

        // the leftover goes once nothing holds it
        let leftover = h.pipeline.repo().with_handle(RefManager::list_staging).unwrap();
        assert_eq!(leftover.len(), 1);
        std::fs::remove_file(h.pipeline.repo().path().join(format!("{}.lock", leftover[0].as_str()))).unwrap();
        assert_eq!(h.pipeline.cleanup_abandoned_staging(), 1);
    }

    #[test]
    fn test_validation_failure_names_real_branch() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let bad = commit(&h, base, INVALID);

        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), bad)]));

        let command = &outcome.commands[0];
        assert_eq!(command.state, UpdateState::RolledBack);
        let CommandResult::RejectedValidation(message) = &command.result else {
            panic!("unexpected result {:?}", command.result);
        };
        let first = message.lines().next().unwrap();
        assert!(first.starts_with("refs/heads/main:"), "{first}");
        assert!(!first.contains("_staging"));
        assert!(message.contains("keyB: source file missing metadata"));
        assert_eq!(tip(&h, &main_ref()), Some(base));
    }

    #[test]
    fn test_atomic_push_rejects_every_command() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let good = commit(&h, base, VALID);
        let bad = commit(&h, base, INVALID);

        let outcome = h.pipeline.process(&Push::atomic(vec![
            ReceiveCommand::update(main_ref(), Some(base), good),
            ReceiveCommand::update(dev(), None, bad),
        ]));

        assert!(matches!(
            outcome.result_for(&main_ref()),
            Some(CommandResult::RejectedOtherReason(_))
        ));
        assert!(matches!(outcome.result_for(&dev()), Some(CommandResult::RejectedValidation(_))));
        assert!(outcome.commands.iter().all(|c| c.state == UpdateState::RolledBack));
        assert_eq!(tip(&h, &main_ref()), Some(base));
        assert_eq!(tip(&h, &dev()), None);
    }

    #[test]
    fn test_relaxed_push_commits_siblings() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let good = commit(&h, base, VALID);
        let bad = commit(&h, base, INVALID);

        let outcome = h.pipeline.process(&Push::relaxed(vec![
            ReceiveCommand::update(main_ref(), Some(base), good),
            ReceiveCommand::update(dev(), None, bad),
        ]));

        assert_eq!(outcome.result_for(&main_ref()), Some(&CommandResult::Ok));
        assert!(matches!(outcome.result_for(&dev()), Some(CommandResult::RejectedValidation(_))));
        assert_eq!(tip(&h, &main_ref()), Some(good));
        assert_eq!(tip(&h, &dev()), None);
    }

    #[test]
    fn test_default_branch_cannot_be_deleted() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let good = commit(&h, base, VALID);

        let outcome = h.pipeline.process(&Push::relaxed(vec![
            ReceiveCommand::delete(main_ref(), Some(base)),
            ReceiveCommand::update(dev(), None, good),
        ]));

        assert_eq!(outcome.result_for(&main_ref()), Some(&CommandResult::RejectedNoDelete));
        assert_eq!(outcome.result_for(&dev()), Some(&CommandResult::Ok));
        assert_eq!(tip(&h, &main_ref()), Some(base));
    }

    #[test]
    fn test_other_branches_can_be_deleted() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        h.pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(dev(), None, base)]));
        assert_eq!(tip(&h, &dev()), Some(base));

        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::delete(dev(), Some(base))]));
        assert!(outcome.all_ok());
        assert_eq!(tip(&h, &dev()), None);
    }

    #[test]
    fn test_tags_rejected_before_staging() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let tag = RefName::tag("v1").unwrap();

        let outcome = h.pipeline.process(&Push::atomic(vec![
            ReceiveCommand::update(tag.clone(), None, base),
            ReceiveCommand::delete(RefName::tag("v0").unwrap(), Some(base)),
        ]));

        assert!(outcome
            .commands
            .iter()
            .all(|c| c.result == CommandResult::RejectedTagUpdate));
        assert_eq!(tip(&h, &tag), None);
        let staging = h.pipeline.repo().with_repo(RefManager::list_staging).unwrap();
        assert!(staging.is_empty());
    }

    #[test]
    fn test_missing_object() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let ghost = CommitId::from_hex("1234567890123456789012345678901234567890").unwrap();

        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), ghost)]));
        assert_eq!(outcome.commands[0].result, CommandResult::RejectedMissingObject(ghost));
    }

    #[test]
    fn test_non_fast_forward_when_disallowed() {
        let (_dir, h) = pipeline_with(|c| c.allow_non_fast_forward(false));
        let base = tip(&h, &main_ref()).unwrap();
        let first = commit(&h, base, VALID);
        assert!(h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), first)]))
            .all_ok());

        // sibling of `first`, not a descendant
        let sibling = commit(&h, base, &[(".metadata", Some(b"{}"))]);
        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(first), sibling)]));
        assert_eq!(outcome.commands[0].result, CommandResult::RejectedNonFastForward);
    }

    #[test]
    fn test_force_push_allowed_by_default() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let first = commit(&h, base, VALID);
        h.pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), first)]));

        let sibling = commit(&h, base, &[(".metadata", Some(b"{}"))]);
        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(first), sibling)]));
        assert!(outcome.all_ok());
    }

    #[test]
    fn test_stale_base_is_lock_failure() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let first = commit(&h, base, VALID);
        h.pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), first)]));

        let late = commit(&h, base, &[(".metadata", Some(b"{}"))]);
        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), late)]));
        assert_eq!(outcome.commands[0].result, CommandResult::LockFailure);
        assert_eq!(tip(&h, &main_ref()), Some(first));
    }

    #[test]
    fn test_busy_branch_is_lock_failure() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let new = commit(&h, base, VALID);

        let manager = h.locks.manager(&main_ref());
        let guard = manager.try_lock_branch().unwrap();
        let outcome = h
            .pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), new)]));
        drop(guard);

        assert_eq!(outcome.commands[0].result, CommandResult::LockFailure);
        assert_eq!(tip(&h, &main_ref()), Some(base));
    }

    #[test]
    fn test_staging_branches_are_removed() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let good = commit(&h, base, VALID);
        let bad = commit(&h, base, INVALID);

        h.pipeline.process(&Push::relaxed(vec![
            ReceiveCommand::update(main_ref(), Some(base), good),
            ReceiveCommand::update(dev(), None, bad),
        ]));

        let staging = h.pipeline.repo().with_repo(RefManager::list_staging).unwrap();
        assert!(staging.is_empty());
    }

    #[test]
    fn test_commit_refreshes_cached_entries() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        let manager = h.locks.manager(&main_ref());
        let key = KeyPath::new("keyA").unwrap();
        assert!(manager.get(&key).unwrap().is_none());

        let new = commit(&h, base, VALID);
        h.pipeline
            .process(&Push::atomic(vec![ReceiveCommand::update(main_ref(), Some(base), new)]));

        let cached = manager.cached(&key).unwrap().unwrap();
        assert_eq!(cached.data.as_deref(), Some(b"a".as_slice()));
    }

    #[test]
    fn test_abandoned_staging_cleanup() {
        let (_dir, h) = pipeline();
        let base = tip(&h, &main_ref()).unwrap();
        h.pipeline
            .repo()
            .with_repo(|r| RefManager::create_staging(r, base))
            .unwrap();
        assert_eq!(h.pipeline.cleanup_abandoned_staging(), 1);
    }

    #[test]
    fn test_rewrite_first_line_only() {
        let staging = RefName::staging("01abc");
        let real = main_ref();
        let message = format!("{staging}: failed\nerror: {staging} mentioned again");
        let rewritten = rewrite_first_line(&message, &staging, &real);
        assert_eq!(
            rewritten,
            format!("refs/heads/main: failed\nerror: {staging} mentioned again")
        );
    }
}
