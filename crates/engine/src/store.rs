//! Single-writer access to a job's persisted record.
//!
//! The pipeline monitor and the thumbnail side-job both modify the same
//! `metadata.json`. Instead of each doing its own read-modify-write, every
//! change is sent to one task per job that owns the record, applies updates
//! in arrival order and persists after each one. Staged updates are applied
//! in memory only and reach disk with the next persisted one.

use std::path::PathBuf;
use anyhow::{Context, Result};
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use crate::error::EngineError;
use crate::job::{load_job, save_job, Job};

type UpdateFn = Box<dyn FnOnce(&mut Job) + Send>;

struct Request {
    update: UpdateFn,
    persist: bool,
    reply: oneshot::Sender<Result<Job>>,
}

/// Handle to the task that owns one job's record
#[derive(Clone)]
pub struct JobWriter {
    job_id: String,
    tx: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<Job>,
}

impl JobWriter {
    /// Start the owning task; it stops once every handle is dropped
    pub fn spawn(job: Job, jobs_root: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(job.clone());
        let job_id = job.id.clone();
        let handle = tokio::spawn(run_writer(job, jobs_root, rx, snapshot_tx));
        (Self { job_id, tx, snapshot }, handle)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Apply `f` to the current record, persist, and return the stored result
    pub async fn update<F>(&self, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) + Send + 'static,
    {
        self.send(Box::new(f), true).await
    }

    /// Apply `f` in memory only; it is written with the next `update`
    pub async fn stage<F>(&self, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) + Send + 'static,
    {
        self.send(Box::new(f), false).await
    }

    async fn send(&self, update: UpdateFn, persist: bool) -> Result<Job> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { update, persist, reply })
            .map_err(|_| EngineError::WriterClosed(self.job_id.clone()))?;
        rx.await
            .map_err(|_| EngineError::WriterClosed(self.job_id.clone()))?
    }

    /// Latest persisted record
    pub fn snapshot(&self) -> Job {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified after every persisted update
    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.snapshot.clone()
    }
}

async fn run_writer(
    mut current: Job,
    jobs_root: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Request>,
    snapshot: watch::Sender<Job>,
) {
    while let Some(Request { update, persist, reply }) = rx.recv().await {
        if persist && !current.status.is_terminal() {
            // another process (recovery, shutdown) may have finished the record
            if let Ok(on_disk) = load_job(&jobs_root, &current.id) {
                if on_disk.status.is_terminal() {
                    warn!("Job {}: finished elsewhere as {}, keeping persisted state", current.id, on_disk.status);
                    current = on_disk;
                }
            }
        }

        let mut next = current.clone();
        update(&mut next);
        let next = enforce_invariants(&current, next);

        if !persist {
            current = next;
            let _ = reply.send(Ok(current.clone()));
            continue;
        }

        let result = save_job(&next, &jobs_root)
            .with_context(|| format!("Failed to persist job {}", current.id));
        match result {
            Ok(()) => {
                current = next;
                snapshot.send_replace(current.clone());
                let _ = reply.send(Ok(current.clone()));
            }
            Err(e) => {
                error!("Job {}: {:#}", current.id, e);
                let _ = reply.send(Err(e));
            }
        }
    }
    debug!("Job {}: writer stopped", current.id);
}

/// Keep an update within the rules every persisted record must follow
fn enforce_invariants(previous: &Job, mut next: Job) -> Job {
    if previous.status.is_terminal() {
        // finished records only take thumbnail results
        let mut frozen = previous.clone();
        frozen.thumbnail = next.thumbnail;
        return frozen;
    }

    next.id = previous.id.clone();
    next.tracking.progress = next.tracking.progress.max(previous.tracking.progress);
    if previous.tracking.total_chunks.is_some() {
        next.tracking.total_chunks = previous.tracking.total_chunks;
    }
    next.tracking.transcribed_chunks = next.tracking.transcribed_chunk_names.len();
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{load_job, JobStatus};

    fn job() -> Job {
        Job::new("w1", PathBuf::from("a.mp4"), PathBuf::from("a.pdf"))
    }

    #[tokio::test]
    async fn test_updates_are_persisted_in_order() {
        let root = tempfile::tempdir().unwrap();
        let (writer, _task) = JobWriter::spawn(job(), root.path().to_path_buf());

        for p in [5u8, 20, 40] {
            writer.update(move |j| j.tracking.progress = p).await.unwrap();
        }
        let stored = load_job(root.path(), "w1").unwrap();
        assert_eq!(stored.tracking.progress, 40);
        assert_eq!(writer.snapshot().tracking.progress, 40);
    }

    #[tokio::test]
    async fn test_progress_cannot_decrease() {
        let root = tempfile::tempdir().unwrap();
        let (writer, _task) = JobWriter::spawn(job(), root.path().to_path_buf());
        writer.update(|j| j.tracking.progress = 60).await.unwrap();
        let after = writer.update(|j| j.tracking.progress = 10).await.unwrap();
        assert_eq!(after.tracking.progress, 60);
    }

    #[tokio::test]
    async fn test_total_chunks_fixed_once_set() {
        let root = tempfile::tempdir().unwrap();
        let (writer, _task) = JobWriter::spawn(job(), root.path().to_path_buf());
        writer.update(|j| j.tracking.total_chunks = Some(4)).await.unwrap();
        let after = writer.update(|j| j.tracking.total_chunks = Some(9)).await.unwrap();
        assert_eq!(after.tracking.total_chunks, Some(4));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_updates() {
        let root = tempfile::tempdir().unwrap();
        let (writer, _task) = JobWriter::spawn(job(), root.path().to_path_buf());

        let pipeline = {
            let writer = writer.clone();
            tokio::spawn(async move {
                for i in 0..50u8 {
                    writer
                        .update(move |j| {
                            j.tracking.progress = i;
                            j.stdout.push('.');
                        })
                        .await
                        .unwrap();
                }
            })
        };
        let thumbnail = {
            let writer = writer.clone();
            tokio::spawn(async move {
                writer.update(|j| j.thumbnail.thumbnail_exists = true).await.unwrap();
            })
        };
        pipeline.await.unwrap();
        thumbnail.await.unwrap();

        let stored = load_job(root.path(), "w1").unwrap();
        assert_eq!(stored.stdout.len(), 50);
        assert!(stored.thumbnail.thumbnail_exists);
    }

    #[tokio::test]
    async fn test_terminal_record_only_accepts_thumbnail() {
        let root = tempfile::tempdir().unwrap();
        let (writer, _task) = JobWriter::spawn(job(), root.path().to_path_buf());
        writer
            .update(|j| {
                j.status = JobStatus::Done;
                j.tracking.progress = 100;
            })
            .await
            .unwrap();

        let after = writer
            .update(|j| {
                j.status = JobStatus::Running;
                j.stdout = "late".to_string();
                j.thumbnail.thumbnail_error = Some("ffmpeg exit 1".to_string());
            })
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Done);
        assert!(after.stdout.is_empty());
        assert_eq!(after.thumbnail.thumbnail_error.as_deref(), Some("ffmpeg exit 1"));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_previous_state() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let (writer, _task) = JobWriter::spawn(job(), blocker);

        assert!(writer.update(|j| j.tracking.progress = 50).await.is_err());
        assert_eq!(writer.snapshot().tracking.progress, 0);
    }

    #[tokio::test]
    async fn test_record_finished_elsewhere_is_not_overwritten() {
        let root = tempfile::tempdir().unwrap();
        let (writer, _task) = JobWriter::spawn(job(), root.path().to_path_buf());
        writer.update(|j| j.status = JobStatus::Running).await.unwrap();

        let mut recovered = load_job(root.path(), "w1").unwrap();
        recovered.status = JobStatus::Error;
        recovered.error = Some("interrupted".to_string());
        save_job(&recovered, root.path()).unwrap();

        let after = writer
            .update(|j| {
                j.status = JobStatus::Done;
                j.tracking.progress = 100;
            })
            .await
            .unwrap();
        assert_eq!(after.status, JobStatus::Error);
        let stored = load_job(root.path(), "w1").unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn test_staged_update_is_written_with_next_update() {
        let root = tempfile::tempdir().unwrap();
        let (writer, _task) = JobWriter::spawn(job(), root.path().to_path_buf());
        writer.update(|j| j.status = JobStatus::Running).await.unwrap();

        let staged = writer.stage(|j| j.stderr.push_str("warn\n")).await.unwrap();
        assert_eq!(staged.stderr, "warn\n");
        assert!(load_job(root.path(), "w1").unwrap().stderr.is_empty());
        assert!(writer.snapshot().stderr.is_empty());

        writer.update(|j| j.stdout.push_str("out\n")).await.unwrap();
        let stored = load_job(root.path(), "w1").unwrap();
        assert_eq!(stored.stderr, "warn\n");
        assert_eq!(stored.stdout, "out\n");
    }
}
