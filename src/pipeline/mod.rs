//! Transactional write pipeline.
//!
//! Every change to a branch, whether a client push or an internal key
//! write, goes through [`WritePipeline::process`]:
//!
//! 1. precheck: tags, default branch deletion, missing objects, fast-forward
//! 2. stage each new tip on `refs/heads/_staging/<ulid>` and validate it
//! 3. in an atomic push, one rejection rejects the rest
//! 4. take each branch's lock without waiting, re-check the base, move refs
//! 5. delete staging branches, notify caches
//!
//! Repository errors along the way reject the command and are recorded as
//! faults for the health check.

mod command;
mod error;
mod process;
mod updater;

pub use command::{
    CommandOutcome, CommandResult, Push, PushOutcome, ReceiveCommand, UpdateState,
};
pub use error::{PipelineError, PipelineResult};
pub use process::WritePipeline;
pub use updater::{Change, Updater};
