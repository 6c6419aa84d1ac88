//! Runs the external pipeline for one job and turns its output into
//! persisted state and live events.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::chunks::ChunkDir;
use crate::config::EngineConfig;
use crate::job::{Job, JobStatus};
use crate::layout::JobLayout;
use crate::live::{LiveEvent, LiveSender};
use crate::progress::{advance, DONE_PROGRESS};
use crate::store::JobWriter;

/// Exit code recorded when the process ended without one (killed by a signal)
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputLine {
    stream: Stream,
    text: String,
}

/// Spawns the pipeline and monitors it until exit
#[derive(Debug, Clone)]
pub struct JobController {
    program: PathBuf,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    jobs_root: PathBuf,
}

impl JobController {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            program: cfg.pipeline_program.clone(),
            args: cfg.pipeline_args.clone(),
            workdir: cfg.pipeline_workdir.clone(),
            jobs_root: cfg.jobs_root.clone(),
        }
    }

    fn command(&self, job: &Job) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&job.media)
            .arg(&job.presentation)
            .arg(&job.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run the pipeline to completion and return the final record.
    ///
    /// A spawn failure is recorded on the job (status `error`) rather than
    /// returned; `Err` means the job state could not be persisted.
    pub async fn run(&self, writer: &JobWriter, live: Option<LiveSender>) -> Result<Job> {
        let job = writer.snapshot();
        let job_id = job.id.clone();
        debug!(
            "Job {}: executing {} {} {} {} {}",
            job_id,
            self.program.display(),
            self.args.join(" "),
            job.media.display(),
            job.presentation.display(),
            job_id
        );

        let mut child = match self.command(&job).spawn() {
            Ok(child) => child,
            Err(e) => return self.on_spawn_error(writer, live.as_ref(), e).await,
        };

        writer
            .update(|job| {
                job.status = JobStatus::Running;
                job.owner_pid = Some(std::process::id());
                job.started_at = Some(Utc::now());
                job.tracking.progress_message = Some("started".to_string());
            })
            .await
            .with_context(|| format!("Failed to mark job {} as running", job_id))?;
        info!("Job {}: pipeline started (pid {:?})", job_id, child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture pipeline stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture pipeline stderr"))?;

        // both pipes feed one queue so updates apply in arrival order
        let (tx, mut rx) = mpsc::unbounded_channel();
        let readers = [
            pump(stdout, Stream::Stdout, tx.clone()),
            pump(stderr, Stream::Stderr, tx),
        ];

        let chunks_dir = JobLayout::new(&self.jobs_root, &job_id).chunks_dir();
        while let Some(line) = rx.recv().await {
            self.on_output(writer, live.as_ref(), &chunks_dir, line).await;
        }
        for reader in readers {
            if let Err(e) = reader.await {
                warn!("Job {}: output reader failed: {}", job_id, e);
            }
        }

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!("Job {}: failed to wait for pipeline: {}", job_id, e);
                None
            }
        };
        self.on_exit(writer, live.as_ref(), code).await
    }

    async fn on_spawn_error(
        &self,
        writer: &JobWriter,
        live: Option<&LiveSender>,
        e: std::io::Error,
    ) -> Result<Job> {
        let message = e.to_string();
        error!(
            "Job {}: failed to spawn pipeline {}: {}",
            writer.job_id(),
            self.program.display(),
            message
        );

        let recorded = message.clone();
        let job = writer
            .update(move |job| {
                job.status = JobStatus::Error;
                job.error = Some(recorded);
                job.finished_at = Some(Utc::now());
            })
            .await
            .with_context(|| format!("Failed to record spawn error for job {}", writer.job_id()))?;

        if let Some(live) = live {
            live.send(LiveEvent::Error { message });
        }
        Ok(job)
    }

    async fn on_output(&self, writer: &JobWriter, live: Option<&LiveSender>, chunks_dir: &Path, line: OutputLine) {
        let OutputLine { stream, text } = line;
        if let Some(live) = live {
            if !live.send(LiveEvent::Output { text: text.clone() }) {
                debug!("Job {}: live subscriber gone", writer.job_id());
            }
        }

        // stderr carries no progress; it is written with the next stdout line or at exit
        let update = match stream {
            Stream::Stdout => {
                let chunks = ChunkDir::new(chunks_dir.to_path_buf());
                writer
                    .update(move |job| {
                        job.tracking = advance(&job.tracking, &text, &chunks);
                        job.stdout.push_str(&text);
                    })
                    .await
            }
            Stream::Stderr => writer.stage(move |job| job.stderr.push_str(&text)).await,
        };

        match update {
            Ok(job) if stream == Stream::Stdout => {
                debug!(
                    "Job {}: progress {}% ({})",
                    job.id,
                    job.tracking.progress,
                    job.tracking.progress_message.as_deref().unwrap_or("-")
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Job {}: output not persisted: {:#}", writer.job_id(), e),
        }
    }

    async fn on_exit(&self, writer: &JobWriter, live: Option<&LiveSender>, code: Option<i32>) -> Result<Job> {
        let exit_code = code.unwrap_or(NO_EXIT_CODE);
        let job = writer
            .update(move |job| {
                job.finished_at = Some(Utc::now());
                job.exit_code = Some(exit_code);
                if exit_code == 0 {
                    job.status = JobStatus::Done;
                    job.tracking.progress = DONE_PROGRESS;
                    job.tracking.progress_message = Some("finished".to_string());
                } else {
                    job.status = JobStatus::Failed;
                    if job.tracking.progress_message.as_deref().map_or(true, |m| m == "started") {
                        job.tracking.progress_message = Some("failed".to_string());
                    }
                }
            })
            .await
            .with_context(|| format!("Failed to record exit of job {}", writer.job_id()))?;

        if job.status == JobStatus::Done {
            info!("Job {}: pipeline finished", job.id);
        } else {
            warn!("Job {}: pipeline failed with exit code {}", job.id, exit_code);
        }

        if let Some(live) = live {
            live.send(LiveEvent::Done {
                job_id: job.id.clone(),
                code: exit_code,
                stdout: job.stdout.clone(),
                stderr: job.stderr.clone(),
            });
        }
        Ok(job)
    }
}

/// Forward `reader` line by line; invalid UTF-8 is replaced, not fatal
fn pump<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read pipeline {:?}: {}", stream, e);
                    break;
                }
            }
        }
    })
}
