//! Internal writes.
//!
//! Key and credential writes don't touch refs themselves. They build one
//! commit on top of the branch tip and push it through the same pipeline
//! a client push goes through.

use git2::Repository;

use crate::pipeline::command::{CommandResult, Push, ReceiveCommand};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::process::WritePipeline;
use crate::storage::{
    get_tree_at_commit, write_blob, CommitBuilder, CommitId, CommitMeta, RefName, StorageResult,
    TreeMutator,
};

/// One path-level change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert { path: String, content: Vec<u8> },
    Remove { path: String },
}

impl Change {
    pub fn upsert(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Change::Upsert {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Change::Remove { path: path.into() }
    }
}

pub struct Updater<'p> {
    pipeline: &'p WritePipeline,
}

impl<'p> Updater<'p> {
    pub fn new(pipeline: &'p WritePipeline) -> Self {
        Self { pipeline }
    }

    /// Commit changes on the current tip of `branch`.
    pub fn commit(
        &self,
        branch: &RefName,
        changes: &[Change],
        meta: &CommitMeta,
        fallback_message: &str,
    ) -> PipelineResult<CommitId> {
        let tip = self.pipeline.repo().resolve(branch)?;
        self.commit_on(branch, tip, changes, meta, fallback_message)
    }

    /// Commit changes on a known tip, `None` creating the branch.
    ///
    /// If the branch moved away from `tip` in the meantime the pipeline
    /// answers with a lock failure.
    pub fn commit_on(
        &self,
        branch: &RefName,
        tip: Option<CommitId>,
        changes: &[Change],
        meta: &CommitMeta,
        fallback_message: &str,
    ) -> PipelineResult<CommitId> {
        let message = meta.message.as_deref().unwrap_or(fallback_message);
        let commit = self
            .pipeline
            .repo()
            .with_handle(|repo| build_commit(repo, tip, changes, meta, message))?;

        let push = Push::atomic(vec![ReceiveCommand {
            name: branch.clone(),
            old: tip,
            new: Some(commit),
        }]);
        let outcome = self.pipeline.process(&push);

        match outcome.commands.into_iter().next().map(|c| c.result) {
            Some(CommandResult::Ok) => Ok(commit),
            Some(result) => Err(PipelineError::Rejected(result)),
            None => Err(PipelineError::Rejected(CommandResult::NotAttempted)),
        }
    }
}

fn build_commit(
    repo: &Repository,
    tip: Option<CommitId>,
    changes: &[Change],
    meta: &CommitMeta,
    message: &str,
) -> StorageResult<CommitId> {
    let mut mutator = match tip {
        Some(tip) => {
            let base = get_tree_at_commit(repo, tip)?;
            TreeMutator::from_tree(repo, &base)
        }
        None => TreeMutator::empty(repo),
    };

    for change in changes {
        match change {
            Change::Upsert { path, content } => mutator.upsert(path, write_blob(repo, content)?),
            Change::Remove { path } => mutator.remove(path),
        }
    }
    let tree = mutator.write()?;

    let mut builder = CommitBuilder::new(repo)
        .tree(tree)
        .message(message)
        .signature(meta.author.clone());
    if let Some(tip) = tip {
        builder = builder.parent(tip);
    }
    builder.commit()
}
