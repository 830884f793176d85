//! Upload-pack work on a small pool of threads.

use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use git2::Repository;

use crate::storage::{CommitId, GitRepository};
use crate::transport::error::{TransportError, TransportResult};

struct UploadJob {
    wants: Vec<CommitId>,
    haves: Vec<CommitId>,
    reply: Sender<TransportResult<Bytes>>,
}

/// Builds packs for fetches off the caller's thread.
///
/// Every worker opens its own repository handle, so pack building never
/// contends with the shared handle used by reads and the pipeline.
pub struct UploadPool {
    jobs: Option<Sender<UploadJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl UploadPool {
    pub fn new(repo: &GitRepository, workers: usize) -> TransportResult<Self> {
        let count = workers.max(1);
        let (jobs, queue) = crossbeam_channel::bounded::<UploadJob>(count * 2);

        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let handle = repo.open_handle()?;
            let queue = queue.clone();
            let worker = thread::Builder::new()
                .name(format!("gitkv-upload-{index}"))
                .spawn(move || run_worker(handle, queue))?;
            handles.push(worker);
        }
        tracing::debug!(workers = count, "upload pool started");

        Ok(Self {
            jobs: Some(jobs),
            workers: handles,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Pack everything reachable from `wants` that isn't reachable from
    /// `haves`. Haves the repository doesn't know are ignored.
    pub fn upload(&self, wants: &[CommitId], haves: &[CommitId]) -> TransportResult<Bytes> {
        let jobs = self.jobs.as_ref().ok_or(TransportError::PoolClosed)?;
        let (reply, response) = crossbeam_channel::bounded(1);
        jobs.send(UploadJob {
            wants: wants.to_vec(),
            haves: haves.to_vec(),
            reply,
        })
        .map_err(|_| TransportError::PoolClosed)?;
        response.recv().map_err(|_| TransportError::PoolClosed)?
    }
}

impl Drop for UploadPool {
    fn drop(&mut self) {
        // closing the queue ends every worker loop
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("upload worker panicked");
            }
        }
    }
}

fn run_worker(repo: Repository, queue: Receiver<UploadJob>) {
    for job in queue.iter() {
        let result = build_pack(&repo, &job.wants, &job.haves).map_err(TransportError::from);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "failed to build upload pack");
        }
        // the requester may have gone away
        let _ = job.reply.send(result);
    }
}

fn build_pack(repo: &Repository, wants: &[CommitId], haves: &[CommitId]) -> Result<Bytes, git2::Error> {
    let mut walk = repo.revwalk()?;
    for want in wants {
        walk.push(want.raw())?;
    }
    for have in haves {
        if repo.find_commit(have.raw()).is_ok() {
            walk.hide(have.raw())?;
        }
    }

    let mut builder = repo.packbuilder()?;
    builder.insert_walk(&mut walk)?;
    let mut buf = git2::Buf::new();
    builder.write_buf(&mut buf)?;
    Ok(Bytes::copy_from_slice(&buf))
}
