//! Engine context: configuration, duration prober and the set of jobs
//! currently being driven by this process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};
use crate::config::EngineConfig;
use crate::controller::JobController;
use crate::error::EngineError;
use crate::job::{load_all_jobs, load_job, new_job_id, save_job, Job, JobStatus};
use crate::layout::JobLayout;
use crate::live::LiveSender;
use crate::probe::{DurationProbe, FfprobeDuration};
use crate::store::JobWriter;
use crate::thumbnail::ThumbnailJob;
use crate::timeline::{MediaUrls, Reconstructor, Timeline, TimelineSource};

/// Message recorded on jobs that never reached a terminal state
pub const INTERRUPTED: &str = "interrupted";

/// Inputs for a new job
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub media: PathBuf,
    pub presentation: PathBuf,
    pub workspace_id: Option<String>,
}

pub struct Engine {
    config: EngineConfig,
    probe: Arc<dyn DurationProbe>,
    active: Mutex<HashMap<String, JobWriter>>,
}

impl Engine {
    /// Create an engine probing durations with ffprobe
    pub fn new(config: EngineConfig) -> Result<Self> {
        let probe = Arc::new(FfprobeDuration::new(&config));
        Self::with_probe(config, probe)
    }

    pub fn with_probe(config: EngineConfig, probe: Arc<dyn DurationProbe>) -> Result<Self> {
        fs::create_dir_all(&config.jobs_root)
            .with_context(|| format!("Failed to create jobs root: {}", config.jobs_root.display()))?;
        Ok(Self {
            config,
            probe,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self, job_id: &str) -> JobLayout {
        JobLayout::new(&self.config.jobs_root, job_id)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, JobWriter>> {
        // entries are plain handles, a poisoned map is still consistent
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ids of jobs currently running in this process
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a queued job, copying both inputs into its directory
    pub fn create_job(&self, request: &JobRequest) -> Result<Job> {
        let job_id = new_job_id();
        let layout = self.layout(&job_id);
        fs::create_dir_all(layout.dir())
            .with_context(|| format!("Failed to create job directory: {}", layout.dir().display()))?;

        let media = copy_input(&request.media, layout.dir())?;
        let presentation = copy_input(&request.presentation, layout.dir())?;

        let mut job = Job::new(job_id, media, presentation);
        job.workspace_id = request.workspace_id.clone();
        job.owner_pid = Some(std::process::id());
        save_job(&job, &self.config.jobs_root)?;
        info!("Job {}: created for {}", job.id, request.media.display());
        Ok(job)
    }

    /// Drive a queued job: thumbnail and pipeline run concurrently, both
    /// report through the same writer. Returns the final record once both end.
    pub async fn run_job(&self, job: Job, live: Option<LiveSender>) -> Result<Job> {
        let job_id = job.id.clone();
        let (writer, writer_task) = JobWriter::spawn(job, self.config.jobs_root.clone());
        let active = self.track(&writer)?;

        let snapshot = writer.snapshot();
        let thumbnail = ThumbnailJob::new(&self.config).spawn(
            writer.clone(),
            snapshot.media.clone(),
            self.layout(&job_id).thumbnail_path(),
        );

        let outcome = JobController::new(&self.config).run(&writer, live).await;
        if let Err(e) = thumbnail.await {
            warn!("Job {}: thumbnail task failed: {}", job_id, e);
        }

        let last = writer.snapshot();
        drop(writer);
        drop(active);
        if let Err(e) = writer_task.await {
            warn!("Job {}: writer task failed: {}", job_id, e);
        }

        outcome?;
        Ok(last)
    }

    /// Create and run a job in one call
    pub async fn submit(&self, request: &JobRequest, live: Option<LiveSender>) -> Result<Job> {
        let job = self.create_job(request)?;
        self.run_job(job, live).await
    }

    fn track(&self, writer: &JobWriter) -> Result<ActiveJob<'_>, EngineError> {
        let mut active = self.registry();
        let job_id = writer.job_id().to_string();
        if active.contains_key(&job_id) {
            return Err(EngineError::AlreadyActive { job_id });
        }
        active.insert(job_id.clone(), writer.clone());
        Ok(ActiveJob { engine: self, job_id })
    }

    /// Persisted record of one job
    pub fn job(&self, job_id: &str) -> Result<Job, EngineError> {
        load_job(&self.config.jobs_root, job_id).map_err(|e| {
            if e.is_not_found() {
                EngineError::JobNotFound(job_id.to_string())
            } else {
                EngineError::State(e)
            }
        })
    }

    /// Every readable job, newest first
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = load_all_jobs(&self.config.jobs_root)?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Rebuild the transcript timeline of a job
    pub async fn timeline(&self, job_id: &str) -> Result<Timeline> {
        let job = self.job(job_id)?;
        let layout = self.layout(job_id);
        let source = TimelineSource::resolve(&layout, self.config.legacy_scope.as_ref(), &job.stdout);
        let urls = MediaUrls::for_job(&self.config.public_base_url, job_id);
        Reconstructor::new(self.probe.as_ref())
            .build(job_id, urls, source)
            .await
            .with_context(|| format!("Failed to build timeline for job {}", job_id))
    }

    /// Mark jobs left `queued`/`running` by a previous process as `error`.
    ///
    /// Only jobs older than `stale_job_secs` whose owning process is gone
    /// are touched; a job still driven by a live process is never timed out.
    pub fn recover_stale_jobs(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let max_age = Duration::seconds(self.config.stale_job_secs.min(u64::from(u32::MAX)) as i64);
        let active = self.active_jobs();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All);
        let mut recovered = Vec::new();

        for mut job in load_all_jobs(&self.config.jobs_root)? {
            if job.status.is_terminal() || active.contains(&job.id) {
                continue;
            }
            if let Some(pid) = job.owner_pid {
                if system.process(Pid::from_u32(pid)).is_some() {
                    debug!("Job {}: owner process {} still alive, leaving it", job.id, pid);
                    continue;
                }
            }
            let since = job.started_at.unwrap_or(job.created_at);
            if now.signed_duration_since(since) < max_age {
                continue;
            }

            warn!("Job {}: stuck in {} since {}, marking as error", job.id, job.status, since);
            job.status = JobStatus::Error;
            job.error = Some(INTERRUPTED.to_string());
            job.finished_at = Some(now);
            save_job(&job, &self.config.jobs_root)?;
            recovered.push(job.id);
        }
        Ok(recovered)
    }

    /// Record every job still running here as interrupted.
    ///
    /// Once terminal the records ignore further pipeline output, so this is
    /// safe to call while the run futures are still alive.
    pub async fn shutdown(&self) -> Result<()> {
        let writers: Vec<JobWriter> = self.registry().values().cloned().collect();
        for writer in writers {
            let now = Utc::now();
            writer
                .update(move |job| {
                    job.status = JobStatus::Error;
                    job.error = Some(INTERRUPTED.to_string());
                    job.finished_at = Some(now);
                })
                .await
                .with_context(|| format!("Failed to mark job {} as interrupted", writer.job_id()))?;
            info!("Job {}: interrupted by shutdown", writer.job_id());
        }
        Ok(())
    }
}

/// Registry entry removed when the run ends, however it ends
struct ActiveJob<'a> {
    engine: &'a Engine,
    job_id: String,
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.engine.registry().remove(&self.job_id);
    }
}

fn copy_input(source: &Path, job_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("Input has no file name: {}", source.display()))?;
    let target = job_dir.join(name);
    fs::copy(source, &target)
        .with_context(|| format!("Failed to copy {} into {}", source.display(), job_dir.display()))?;
    Ok(target)
}
