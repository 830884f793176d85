//! Receive-pack: pushed objects plus ref updates.

use std::sync::Arc;

use crate::credentials::Principal;
use crate::pipeline::{CommandOutcome, CommandResult, Push, PushOutcome, ReceiveCommand, WritePipeline};
use crate::storage::RefName;
use crate::transport::error::TransportResult;
use crate::transport::filter::require;
use crate::transport::{ROLE_CREATE_BRANCH, ROLE_SECRETS, ROLE_WRITE};

/// Takes a pushed pack into the object database and hands the commands
/// to the write pipeline.
///
/// Objects from the pack are unreachable until the pipeline moves a ref,
/// so a rejected push leaves nothing visible behind.
pub struct ReceivePack {
    pipeline: Arc<WritePipeline>,
    secrets_branch: RefName,
}

impl ReceivePack {
    pub fn new(pipeline: Arc<WritePipeline>, secrets_branch: RefName) -> Self {
        Self {
            pipeline,
            secrets_branch,
        }
    }

    /// Receive a push. Pushes are atomic unless the client opts out with
    /// [`ReceivePack::receive_push`].
    pub fn receive(&self, principal: &Principal, pack: &[u8], commands: Vec<ReceiveCommand>) -> TransportResult<PushOutcome> {
        self.receive_push(principal, pack, Push::atomic(commands))
    }

    pub fn receive_push(&self, principal: &Principal, pack: &[u8], push: Push) -> TransportResult<PushOutcome> {
        require(principal, ROLE_WRITE)?;

        let denials: Vec<Option<&'static str>> = push
            .commands
            .iter()
            .map(|command| self.missing_role(command, principal))
            .collect();
        let any_denied = denials.iter().any(Option::is_some);

        if any_denied && push.atomic {
            let commands = push
                .commands
                .into_iter()
                .zip(denials)
                .map(|(command, denied)| {
                    let reason = match denied {
                        Some(role) => denial(principal, role),
                        None => "atomic push failed".to_string(),
                    };
                    rejected(command, reason)
                })
                .collect();
            return Ok(PushOutcome { commands });
        }

        let allowed: Vec<ReceiveCommand> = push
            .commands
            .iter()
            .zip(&denials)
            .filter(|(_, denied)| denied.is_none())
            .map(|(command, _)| command.clone())
            .collect();

        let processed = if allowed.is_empty() {
            PushOutcome::default()
        } else if let Err(e) = self.ingest(pack) {
            let reason = format!("pack ingest failed: {e}");
            PushOutcome {
                commands: allowed.into_iter().map(|c| rejected(c, reason.clone())).collect(),
            }
        } else {
            self.pipeline.process(&Push {
                commands: allowed,
                atomic: push.atomic,
            })
        };

        if !any_denied {
            return Ok(processed);
        }

        // splice the denied commands back in, in push order
        let mut processed = processed.commands.into_iter();
        let mut commands = Vec::with_capacity(push.commands.len());
        for (command, denied) in push.commands.into_iter().zip(denials) {
            match denied {
                Some(role) => commands.push(rejected(command, denial(principal, role))),
                None => commands.extend(processed.next()),
            }
        }
        Ok(PushOutcome { commands })
    }

    fn ingest(&self, pack: &[u8]) -> TransportResult<()> {
        if pack.is_empty() {
            return Ok(());
        }
        match self.pipeline.repo().ingest_pack(pack) {
            Ok(()) => {
                tracing::debug!(bytes = pack.len(), "pack ingested");
                Ok(())
            }
            Err(e) => {
                self.pipeline.faults().record("receive-pack", format!("pack ingest failed: {e}"));
                Err(e.into())
            }
        }
    }

    fn missing_role(&self, command: &ReceiveCommand, principal: &Principal) -> Option<&'static str> {
        let needed = if command.name == self.secrets_branch {
            Some(ROLE_SECRETS)
        } else if command.is_create() {
            Some(ROLE_CREATE_BRANCH)
        } else {
            None
        };
        needed.filter(|role| !principal.roles.contains(*role))
    }
}

fn denial(principal: &Principal, role: &str) -> String {
    format!("{} lacks the {role:?} role", principal.username)
}

fn rejected(command: ReceiveCommand, reason: String) -> CommandOutcome {
    let mut outcome = CommandOutcome::new(command);
    outcome.reject(CommandResult::RejectedOtherReason(reason));
    outcome
}
