//! Push commands, their lifecycle and their results.

use std::fmt;

use crate::storage::{CommitId, RefName};

/// One ref update requested by a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveCommand {
    pub name: RefName,
    /// tip the client saw, `None` for a branch it is creating
    pub old: Option<CommitId>,
    /// tip to move to, `None` to delete the ref
    pub new: Option<CommitId>,
}

impl ReceiveCommand {
    pub fn update(name: RefName, old: Option<CommitId>, new: CommitId) -> Self {
        Self {
            name,
            old,
            new: Some(new),
        }
    }

    pub fn delete(name: RefName, old: Option<CommitId>) -> Self {
        Self { name, old, new: None }
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }

    pub fn is_create(&self) -> bool {
        self.old.is_none() && self.new.is_some()
    }
}

/// A set of commands received together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub commands: Vec<ReceiveCommand>,
    /// reject every command if any one fails
    pub atomic: bool,
}

impl Push {
    pub fn atomic(commands: Vec<ReceiveCommand>) -> Self {
        Self { commands, atomic: true }
    }

    pub fn relaxed(commands: Vec<ReceiveCommand>) -> Self {
        Self {
            commands,
            atomic: false,
        }
    }
}

/// Lifecycle of one command inside the pipeline.
///
/// `NotAttempted -> Staged -> ValidatedOk | ValidatedFailed -> Committed | RolledBack`.
/// Deletions skip staging, and commands rejected up front go straight to
/// `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    NotAttempted,
    Staged,
    ValidatedOk,
    ValidatedFailed,
    Committed,
    RolledBack,
}

impl UpdateState {
    pub fn is_final(&self) -> bool {
        matches!(self, UpdateState::Committed | UpdateState::RolledBack)
    }
}

/// Result reported to the client for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    NotAttempted,
    Ok,
    RejectedNoDelete,
    RejectedTagUpdate,
    RejectedNonFastForward,
    RejectedValidation(String),
    LockFailure,
    RejectedMissingObject(CommitId),
    RejectedOtherReason(String),
}

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandResult::Ok)
    }

    pub fn is_rejected(&self) -> bool {
        !matches!(self, CommandResult::Ok | CommandResult::NotAttempted)
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::NotAttempted => f.write_str("not attempted"),
            CommandResult::Ok => f.write_str("ok"),
            CommandResult::RejectedNoDelete => f.write_str("deleting the default branch is not allowed"),
            CommandResult::RejectedTagUpdate => f.write_str("tags are read-only"),
            CommandResult::RejectedNonFastForward => f.write_str("non-fast-forward"),
            CommandResult::RejectedValidation(message) => write!(f, "validation failed: {message}"),
            CommandResult::LockFailure => f.write_str("failed to lock"),
            CommandResult::RejectedMissingObject(id) => write!(f, "missing object {id}"),
            CommandResult::RejectedOtherReason(reason) => f.write_str(reason),
        }
    }
}

/// Final state and result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: ReceiveCommand,
    pub state: UpdateState,
    pub result: CommandResult,
}

impl CommandOutcome {
    pub(crate) fn new(command: ReceiveCommand) -> Self {
        Self {
            command,
            state: UpdateState::NotAttempted,
            result: CommandResult::NotAttempted,
        }
    }

    pub(crate) fn reject(&mut self, result: CommandResult) {
        self.state = UpdateState::RolledBack;
        self.result = result;
    }

    /// still in the running for the commit phase
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self.result, CommandResult::NotAttempted)
    }
}

/// Outcome of a whole push, in command order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub commands: Vec<CommandOutcome>,
}

impl PushOutcome {
    pub fn all_ok(&self) -> bool {
        self.commands.iter().all(|c| c.result.is_ok())
    }

    pub fn result_for(&self, name: &RefName) -> Option<&CommandResult> {
        self.commands
            .iter()
            .find(|c| &c.command.name == name)
            .map(|c| &c.result)
    }
}
